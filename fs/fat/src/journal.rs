// Copyright 2024 Kevin Ludwig
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Write-ahead journal for metadata mutations.
//!
//! A top-level metadata operation logs what it is about to change, commits
//! the log to stable storage, performs the change through the buffer pool,
//! flushes, then clears the log. Replay on mount discards transactions
//! without a commit record and drives committed ones to an all-or-nothing
//! outcome; every replay step is idempotent, so replaying twice equals
//! replaying once.

use log::{info, warn};
use tapir_err::{EntryError, Error, JournalError, Result};
use tapir_fs::{
    buf::SecKind,
    clock::DateTime,
    entry::attrib,
    file::EntrySlotRef,
};
use zerocopy::{
    little_endian::U32,
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
};

use crate::{dir::RawDirEntry, name, table, FatVolume};

/// Fixed name of the journal file in the root directory.
pub const JOURNAL_NAME: &str = "TAPIR.JNL";
pub(crate) const JOURNAL_SFN: [u8; 11] = *b"TAPIR   JNL";

/// Journal file capacity. The file is allocated contiguously at start time.
pub const JOURNAL_BYTES: u32 = 8192;

const MAGIC: u32 = 0x4C4E_4A54;
const HDR_LEN: u32 = 8;

const KIND_ENTRY_CREATE: u8 = 1;
const KIND_ENTRY_UPDATE: u8 = 2;
const KIND_ENTRY_DELETE: u8 = 3;
const KIND_CHAIN_ALLOC: u8 = 4;
const KIND_CHAIN_DEL: u8 = 5;
const KIND_COMMIT: u8 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JournalState {
    Stopped,
    Started,
    Replaying,
}

#[derive(Debug, Clone, Copy)]
struct JournalFile {
    first_cluster: u32,
    entry: EntrySlotRef,
}

#[derive(Debug, Default)]
pub(crate) struct Journal {
    state: Option<JournalState>,
    file: Option<JournalFile>,
    txn: Vec<Record>,
}

impl Journal {
    pub fn state(&self) -> JournalState {
        self.state.unwrap_or(JournalState::Stopped)
    }

    pub fn started(&self) -> bool {
        self.state() == JournalState::Started
    }
}

/// One logged metadata mutation. Slot runs are addressed by directory first
/// cluster (0 for the root) plus slot index, which stays meaningful on
/// replay because directory chains are never mutated before commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Record {
    /// About to place a new entry run.
    EntryCreate { parent: u32, first_index: u32, count: u8 },
    /// About to write an entry run at a new position and erase the old one.
    EntryUpdate {
        old_parent: u32,
        old_first: u32,
        old_count: u8,
        new_parent: u32,
        new_first: u32,
        new_count: u8,
    },
    /// About to erase an entry run and free its cluster chain.
    EntryDelete { parent: u32, first_index: u32, count: u8, chain_first: u32 },
    /// About to link `count` fresh clusters starting at `first` onto
    /// `prev` (0 for a new chain).
    ChainAlloc { prev: u32, first: u32, count: u32 },
    /// About to free `count` clusters starting at `first`, terminating the
    /// chain at `prev` (0 when the whole chain goes).
    ChainDel { prev: u32, first: u32, count: u32 },
}

#[repr(C)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
struct RecEntryCreate {
    parent: U32,
    first_index: U32,
    count: u8,
    marker: U32,
}

#[repr(C)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
struct RecEntryUpdate {
    old_parent: U32,
    old_first: U32,
    old_count: u8,
    new_parent: U32,
    new_first: U32,
    new_count: u8,
    marker: U32,
}

#[repr(C)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
struct RecEntryDelete {
    parent: U32,
    first_index: U32,
    count: u8,
    chain_first: U32,
    marker: U32,
}

#[repr(C)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
struct RecChain {
    prev: U32,
    first: U32,
    count: U32,
    marker: U32,
}

#[repr(C)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
struct RecCommit {
    record_count: U32,
    marker: U32,
}

fn encode(records: &[Record]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut marker = 0u32;
    for record in records {
        match *record {
            Record::EntryCreate { parent, first_index, count } => {
                out.push(KIND_ENTRY_CREATE);
                out.extend_from_slice(
                    RecEntryCreate {
                        parent: U32::new(parent),
                        first_index: U32::new(first_index),
                        count,
                        marker: U32::new(marker),
                    }
                    .as_bytes(),
                );
            }
            Record::EntryUpdate {
                old_parent,
                old_first,
                old_count,
                new_parent,
                new_first,
                new_count,
            } => {
                out.push(KIND_ENTRY_UPDATE);
                out.extend_from_slice(
                    RecEntryUpdate {
                        old_parent: U32::new(old_parent),
                        old_first: U32::new(old_first),
                        old_count,
                        new_parent: U32::new(new_parent),
                        new_first: U32::new(new_first),
                        new_count,
                        marker: U32::new(marker),
                    }
                    .as_bytes(),
                );
            }
            Record::EntryDelete { parent, first_index, count, chain_first } => {
                out.push(KIND_ENTRY_DELETE);
                out.extend_from_slice(
                    RecEntryDelete {
                        parent: U32::new(parent),
                        first_index: U32::new(first_index),
                        count,
                        chain_first: U32::new(chain_first),
                        marker: U32::new(marker),
                    }
                    .as_bytes(),
                );
            }
            Record::ChainAlloc { prev, first, count } => {
                out.push(KIND_CHAIN_ALLOC);
                out.extend_from_slice(
                    RecChain {
                        prev: U32::new(prev),
                        first: U32::new(first),
                        count: U32::new(count),
                        marker: U32::new(marker),
                    }
                    .as_bytes(),
                );
            }
            Record::ChainDel { prev, first, count } => {
                out.push(KIND_CHAIN_DEL);
                out.extend_from_slice(
                    RecChain {
                        prev: U32::new(prev),
                        first: U32::new(first),
                        count: U32::new(count),
                        marker: U32::new(marker),
                    }
                    .as_bytes(),
                );
            }
        }
        marker += 1;
    }
    out.push(KIND_COMMIT);
    out.extend_from_slice(
        RecCommit { record_count: U32::new(records.len() as u32), marker: U32::new(marker) }
            .as_bytes(),
    );
    out
}

/// Decodes a record stream. Returns the records only when a commit record
/// with a consistent count and monotonic markers terminates them.
fn decode(bytes: &[u8]) -> Option<Vec<Record>> {
    let mut records = Vec::new();
    let mut at = 0usize;
    let mut marker = 0u32;
    loop {
        let kind = *bytes.get(at)?;
        at += 1;
        macro_rules! take {
            ($ty:ty) => {{
                let rec = <$ty>::read_from_bytes(bytes.get(at..at + size_of::<$ty>())?).ok()?;
                at += size_of::<$ty>();
                if rec.marker.get() != marker {
                    return None;
                }
                marker += 1;
                rec
            }};
        }
        match kind {
            KIND_ENTRY_CREATE => {
                let rec = take!(RecEntryCreate);
                records.push(Record::EntryCreate {
                    parent: rec.parent.get(),
                    first_index: rec.first_index.get(),
                    count: rec.count,
                });
            }
            KIND_ENTRY_UPDATE => {
                let rec = take!(RecEntryUpdate);
                records.push(Record::EntryUpdate {
                    old_parent: rec.old_parent.get(),
                    old_first: rec.old_first.get(),
                    old_count: rec.old_count,
                    new_parent: rec.new_parent.get(),
                    new_first: rec.new_first.get(),
                    new_count: rec.new_count,
                });
            }
            KIND_ENTRY_DELETE => {
                let rec = take!(RecEntryDelete);
                records.push(Record::EntryDelete {
                    parent: rec.parent.get(),
                    first_index: rec.first_index.get(),
                    count: rec.count,
                    chain_first: rec.chain_first.get(),
                });
            }
            KIND_CHAIN_ALLOC => {
                let rec = take!(RecChain);
                records.push(Record::ChainAlloc {
                    prev: rec.prev.get(),
                    first: rec.first.get(),
                    count: rec.count.get(),
                });
            }
            KIND_CHAIN_DEL => {
                let rec = take!(RecChain);
                records.push(Record::ChainDel {
                    prev: rec.prev.get(),
                    first: rec.first.get(),
                    count: rec.count.get(),
                });
            }
            KIND_COMMIT => {
                let rec = take!(RecCommit);
                if rec.record_count.get() as usize != records.len() {
                    return None;
                }
                return Some(records);
            }
            _ => return None,
        }
    }
}

impl FatVolume {
    fn jnl_sector_span(&self, file: &JournalFile) -> u64 {
        self.layout.clus_to_sector(file.first_cluster)
    }

    /// Writes journal bytes through to the device immediately.
    fn jnl_write(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        let Some(file) = self.journal.file else {
            return Err(Error::Journal(JournalError::NotStarted));
        };
        if offset + data.len() as u32 > JOURNAL_BYTES {
            return Err(Error::Journal(JournalError::Full));
        }
        let bps = self.layout.bytes_per_sec;
        let base = self.jnl_sector_span(&file);
        let mut done = 0usize;
        while done < data.len() {
            let at = offset as usize + done;
            let sector = base + (at as u64 / bps as u64);
            let in_sec = at % bps as usize;
            let len = (bps as usize - in_sec).min(data.len() - done);
            let mut buf = self.buf(sector, SecKind::Mgmt, true)?;
            buf.bytes_mut()[in_sec..in_sec + len].copy_from_slice(&data[done..done + len]);
            buf.mark_dirty();
            let flushed = buf.flush();
            self.put(buf);
            flushed?;
            done += len;
        }
        Ok(())
    }

    fn jnl_read(&mut self, offset: u32, data: &mut [u8]) -> Result<()> {
        let Some(file) = self.journal.file else {
            return Err(Error::Journal(JournalError::NotStarted));
        };
        let bps = self.layout.bytes_per_sec;
        let base = self.jnl_sector_span(&file);
        let mut done = 0usize;
        while done < data.len() {
            let at = offset as usize + done;
            let sector = base + (at as u64 / bps as u64);
            let in_sec = at % bps as usize;
            let len = (bps as usize - in_sec).min(data.len() - done);
            let buf = self.buf(sector, SecKind::Mgmt, true)?;
            data[done..done + len].copy_from_slice(&buf.bytes()[in_sec..in_sec + len]);
            self.put(buf);
            done += len;
        }
        Ok(())
    }

    /// Opens a new transaction. A no-op while the journal is stopped.
    pub(crate) fn jnl_begin(&mut self) -> Result<()> {
        if self.journal.started() {
            self.journal.txn.clear();
        }
        Ok(())
    }

    /// Logs a record into the open transaction.
    pub(crate) fn jnl_log(&mut self, record: Record) -> Result<()> {
        if self.journal.started() {
            self.journal.txn.push(record);
        }
        Ok(())
    }

    /// Serializes the transaction and its commit record to stable storage.
    /// After this returns, the logged mutations will happen: either the
    /// operation completes in place, or replay finishes the work on the
    /// next mount.
    pub(crate) fn jnl_commit(&mut self) -> Result<()> {
        if !self.journal.started() || self.journal.txn.is_empty() {
            return Ok(());
        }
        let bytes = encode(&self.journal.txn);
        if HDR_LEN + bytes.len() as u32 > JOURNAL_BYTES {
            return Err(Error::Journal(JournalError::Full));
        }
        let mut framed = MAGIC.to_le_bytes().to_vec();
        framed.extend_from_slice(&1u32.to_le_bytes());
        framed.extend_from_slice(&bytes);
        self.jnl_write(0, &framed)
    }

    /// Flushes the performed mutations and clears the log. A failure here
    /// strands the volume between commit and clear, so it degrades to
    /// read-only; the next mount's replay reconciles the on-disk state.
    pub(crate) fn jnl_end(&mut self) -> Result<()> {
        if !self.journal.started() || self.journal.txn.is_empty() {
            return Ok(());
        }
        if self.flush_bufs().and_then(|()| self.jnl_clear()).is_err() {
            warn!("journal clear failed after mutation, volume degrades to read-only");
            self.forced_read_only = true;
            return Err(Error::Dev(tapir_err::DevError::Io));
        }
        self.journal.txn.clear();
        Ok(())
    }

    /// Zeroes the head of the record area, emptying the journal.
    fn jnl_clear(&mut self) -> Result<()> {
        let bps = self.layout.bytes_per_sec;
        let mut head = vec![0u8; bps as usize];
        head[..4].copy_from_slice(&MAGIC.to_le_bytes());
        head[4..8].copy_from_slice(&1u32.to_le_bytes());
        self.jnl_write(0, &head)
    }

    /// Locates the journal file, verifying the contiguity it was created
    /// with still holds.
    fn jnl_locate(&mut self) -> Result<Option<JournalFile>> {
        let Some(entry) = self.dir_find(0, JOURNAL_NAME)? else {
            return Ok(None);
        };
        let first = entry.raw.first_cluster();
        if first == 0 {
            return Err(Error::Journal(JournalError::FileInvalid));
        }
        let clusters = JOURNAL_BYTES.div_ceil(self.layout.cluster_bytes());
        let mut clus = first;
        for _ in 1..clusters {
            match self.clus_next(clus)? {
                Some(next) if next == clus + 1 => clus = next,
                _ => {
                    warn!("journal file is not contiguous, journaling disabled");
                    return Err(Error::Journal(JournalError::FileInvalid));
                }
            }
        }
        Ok(Some(JournalFile { first_cluster: first, entry: entry.slot_ref(0) }))
    }

    /// Finds a run of sequentially numbered free clusters.
    fn clus_find_free_contig(&mut self, count: u32) -> Result<Vec<u32>> {
        let mut run: Vec<u32> = Vec::with_capacity(count as usize);
        for clus in 2..self.layout.cluster_end() {
            if self.fat_entry_read(clus)? == table::FREE {
                if run.last().is_some_and(|&last| last + 1 != clus) {
                    run.clear();
                }
                run.push(clus);
                if run.len() as u32 == count {
                    return Ok(run);
                }
            } else {
                run.clear();
            }
        }
        Err(Error::Dev(tapir_err::DevError::Full))
    }

    /// Starts journaling: creates (or re-opens) the journal file and enables
    /// logging for subsequent metadata operations.
    pub(crate) fn jnl_start(&mut self, now: DateTime) -> Result<()> {
        match self.journal.state() {
            JournalState::Started => return Err(Error::Journal(JournalError::AlreadyOpen)),
            JournalState::Replaying => return Err(Error::Journal(JournalError::Replay)),
            JournalState::Stopped => {}
        }
        let file = match self.jnl_locate()? {
            Some(file) => file,
            None => {
                let clusters = JOURNAL_BYTES.div_ceil(self.layout.cluster_bytes());
                let run = self.clus_find_free_contig(clusters)?;
                let plan = self.place_plan(0, JOURNAL_NAME)?;
                if plan.sfn != JOURNAL_SFN {
                    return Err(Error::Journal(JournalError::FileInvalid));
                }
                self.clus_mark_chain(&run, None)?;
                let raw = RawDirEntry::new(
                    plan.sfn,
                    attrib::HIDDEN | attrib::SYSTEM | attrib::ARCHIVE,
                    run[0],
                    JOURNAL_BYTES,
                    now,
                );
                self.place_commit(&plan, raw)?;
                for &clus in &run {
                    self.clus_zero_file(clus)?;
                }
                self.flush_bufs()?;
                JournalFile { first_cluster: run[0], entry: plan.slot_ref() }
            }
        };
        self.journal.file = Some(file);
        self.journal.state = Some(JournalState::Started);
        self.jnl_clear()?;
        info!("journal started, {JOURNAL_BYTES} bytes at cluster {}", file.first_cluster);
        Ok(())
    }

    /// Stops journaling, leaving the (empty) journal file in place.
    pub(crate) fn jnl_stop(&mut self) -> Result<()> {
        if !self.journal.started() {
            return Err(Error::Journal(JournalError::NotStarted));
        }
        self.flush_bufs()?;
        self.jnl_clear()?;
        self.journal.state = Some(JournalState::Stopped);
        Ok(())
    }

    /// Whether the entry run named by a slot reference is the journal file.
    pub(crate) fn jnl_guards(&self, dir: u32, sfn_index: u32) -> bool {
        self.journal
            .file
            .as_ref()
            .is_some_and(|file| {
                self.journal.started()
                    && file.entry.dir_first_cluster == dir
                    && file.entry.slot == sfn_index
            })
    }

    /// Mount-time replay. Non-empty journal contents are either discarded
    /// (no commit record) or driven to their post-commit state.
    pub(crate) fn jnl_replay(&mut self) -> Result<()> {
        let Some(file) = self.jnl_locate().unwrap_or(None) else {
            return Ok(());
        };
        self.journal.file = Some(file);
        let mut head = [0u8; 8];
        self.jnl_read(0, &mut head)?;
        let mut content = vec![0u8; (JOURNAL_BYTES - HDR_LEN) as usize];
        self.jnl_read(HDR_LEN, &mut content)?;
        if u32::from_le_bytes([head[0], head[1], head[2], head[3]]) != MAGIC || content[0] == 0 {
            self.journal.file = None;
            return Ok(());
        }

        self.journal.state = Some(JournalState::Replaying);
        match decode(&content) {
            None => {
                // A crash before commit leaves no visible change; partial
                // records are discarded.
                info!("discarding uncommitted journal transaction");
            }
            Some(records) => {
                info!("replaying journal transaction of {} records", records.len());
                self.jnl_apply(&records)?;
            }
        }
        self.flush_bufs()?;
        self.jnl_clear()?;
        self.journal.state = Some(JournalState::Stopped);
        self.journal.file = None;
        Ok(())
    }

    /// Drives a committed transaction to an all-or-nothing outcome. The
    /// entry record (at most one per transaction) is the witness: a
    /// complete slot run on disk means the operation finished and old state
    /// is cleaned up; an incomplete run is wiped and chain allocations are
    /// reverted.
    fn jnl_apply(&mut self, records: &[Record]) -> Result<()> {
        let witness = records.iter().find(|record| {
            matches!(
                record,
                Record::EntryCreate { .. } | Record::EntryUpdate { .. } | Record::EntryDelete { .. }
            )
        });
        match witness.copied() {
            Some(Record::EntryDelete { parent, first_index, count, chain_first }) => {
                self.entry_erase(parent, first_index, count as u32)?;
                if chain_first != 0 {
                    self.clus_chain_free(chain_first, None)?;
                }
            }
            Some(Record::EntryCreate { parent, first_index, count }) => {
                if self.jnl_run_valid(parent, first_index, count)? {
                    return Ok(());
                }
                self.entry_erase(parent, first_index, count as u32)?;
                for record in records {
                    if let Record::ChainAlloc { prev, first, count } = *record {
                        self.jnl_revert_alloc(prev, first, count)?;
                    }
                }
            }
            Some(Record::EntryUpdate {
                old_parent,
                old_first,
                old_count,
                new_parent,
                new_first,
                new_count,
            }) => {
                if old_parent == new_parent && old_first == new_first {
                    // In-place rewrite of a single slot; sector writes are
                    // atomic, nothing to fix.
                    return Ok(());
                }
                if self.jnl_run_valid(new_parent, new_first, new_count)? {
                    self.entry_erase(old_parent, old_first, old_count as u32)?;
                } else {
                    self.entry_erase(new_parent, new_first, new_count as u32)?;
                    for record in records {
                        if let Record::ChainAlloc { prev, first, count } = *record {
                            self.jnl_revert_alloc(prev, first, count)?;
                        }
                    }
                }
            }
            _ => {
                for record in records {
                    match *record {
                        Record::ChainAlloc { prev, first, count } => {
                            self.jnl_fix_alloc(prev, first, count)?;
                        }
                        Record::ChainDel { prev, first, count } => {
                            if prev != 0 {
                                self.fat_entry_write(prev, self.layout.eoc())?;
                            }
                            self.clus_chain_free(first, Some(count))?;
                        }
                        _ => {}
                    }
                }
            }
        }
        Ok(())
    }

    /// Whether a logged slot run holds a complete entry set: a non-free
    /// short-name slot at its end and matching checksums on every preceding
    /// long-name slot.
    fn jnl_run_valid(&mut self, dir: u32, first_index: u32, count: u8) -> Result<bool> {
        let sfn_index = first_index + count as u32 - 1;
        let mut cur = crate::dir::DirCursor::at(dir, sfn_index);
        let Some(sfn) = self.dir_slot_read(&mut cur)? else {
            return Ok(false);
        };
        if sfn.is_end() || sfn.is_free() || sfn.is_lfn() {
            return Ok(false);
        }
        let chksum = name::checksum(&sfn.dir_name);
        for index in first_index..sfn_index {
            let mut cur = crate::dir::DirCursor::at(dir, index);
            let Some(raw) = self.dir_slot_read(&mut cur)? else {
                return Ok(false);
            };
            if !raw.is_lfn() {
                return Ok(false);
            }
            let lfn = crate::dir::RawLfnEntry::read_from_bytes(raw.as_bytes())
                .map_err(|_| Error::Entry(EntryError::Corrupt))?;
            if lfn.ldir_chksum != chksum {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Reverts a logged chain allocation: frees whatever was linked and
    /// restores the end-of-chain terminator on the predecessor.
    fn jnl_revert_alloc(&mut self, prev: u32, first: u32, count: u32) -> Result<()> {
        self.clus_chain_free(first, Some(count))?;
        if prev != 0 {
            self.fat_entry_write(prev, self.layout.eoc())?;
        }
        Ok(())
    }

    /// For a bare allocation transaction: keep the chain when it is fully
    /// intact, revert it otherwise.
    fn jnl_fix_alloc(&mut self, prev: u32, first: u32, count: u32) -> Result<()> {
        let mut clus = first;
        let mut walked = 1u32;
        let intact = loop {
            if clus < 2 || clus >= self.layout.cluster_end() {
                break false;
            }
            let entry = self.fat_entry_read(clus)?;
            if entry == table::FREE || entry == self.layout.bad() {
                break false;
            }
            if self.layout.is_eoc(entry) {
                break walked == count;
            }
            if walked >= count {
                break false;
            }
            clus = entry;
            walked += 1;
        };
        let linked = prev == 0 || self.fat_entry_read(prev)? == first;
        if intact && linked {
            return Ok(());
        }
        self.jnl_revert_alloc(prev, first, count)
    }

    /// Zeroes the data sectors of a journal cluster without disturbing the
    /// directory-entry buffer type accounting.
    fn clus_zero_file(&mut self, clus: u32) -> Result<()> {
        let first = self.layout.clus_to_sector(clus);
        for at in 0..self.layout.sec_per_clus as u64 {
            let mut buf = self.buf(first + at, SecKind::Mgmt, false)?;
            buf.mark_dirty();
            self.put(buf);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tapir_fs::{file::ModeFlags, vol::FormatParams};

    use crate::testing::{test_time, vpath, Rig};

    fn wr_create() -> ModeFlags {
        ModeFlags::from_bits(ModeFlags::WR | ModeFlags::RD | ModeFlags::CREATE)
    }

    #[test]
    fn wire_roundtrip() {
        let records = vec![
            Record::ChainAlloc { prev: 7, first: 21, count: 3 },
            Record::EntryCreate { parent: 0, first_index: 4, count: 3 },
        ];
        let bytes = encode(&records);
        assert_eq!(decode(&bytes).unwrap(), records);
        // Without the commit record the transaction does not decode.
        assert!(decode(&bytes[..bytes.len() - 9]).is_none());
    }

    #[test]
    fn start_creates_contiguous_hidden_file() {
        let mut rig = Rig::new(8192, &FormatParams::default());
        let mut vol = rig.mount(true);
        let entry = vol.dir_find(0, JOURNAL_NAME).unwrap().unwrap();
        assert_eq!(entry.raw.dir_attr & attrib::HIDDEN, attrib::HIDDEN);
        assert_eq!(entry.raw.dir_filesize.get(), JOURNAL_BYTES);
        // Deleting the live journal file is refused.
        assert!(vol
            .fat_entry_delete(&vpath("/TAPIR.JNL"), tapir_fs::entry::TypeMask::Any)
            .is_err());
    }

    #[test]
    fn uncommitted_create_is_discarded() {
        let mut rig = Rig::new(8192, &FormatParams::default());
        let mut vol = rig.mount(true);
        let free = vol.free_count;

        // Log the intent to create without a commit record, then lose all
        // unflushed state.
        let plan = vol.place_plan(0, "big").unwrap();
        let records = encode(&[Record::EntryCreate {
            parent: 0,
            first_index: plan.first_index,
            count: plan.slots,
        }]);
        let mut framed = MAGIC.to_le_bytes().to_vec();
        framed.extend_from_slice(&1u32.to_le_bytes());
        framed.extend_from_slice(&records[..records.len() - 9]);
        vol.jnl_write(0, &framed).unwrap();
        drop(vol);

        let mut vol = rig.mount(false);
        assert!(vol.dir_find(0, "big").unwrap().is_none());
        assert_eq!(vol.free_count, free);
    }

    #[test]
    fn committed_create_without_entry_rolls_back() {
        let mut rig = Rig::new(8192, &FormatParams::default());
        let mut vol = rig.mount(true);
        let free = vol.free_count;

        let plan = vol.place_plan(0, "big").unwrap();
        vol.jnl_begin().unwrap();
        vol.jnl_log(Record::EntryCreate {
            parent: 0,
            first_index: plan.first_index,
            count: plan.slots,
        })
        .unwrap();
        vol.jnl_commit().unwrap();
        // Crash: the entry never reaches the directory.
        drop(vol);

        let mut vol = rig.mount(false);
        assert!(vol.dir_find(0, "big").unwrap().is_none());
        assert_eq!(vol.free_count, free);
    }

    #[test]
    fn committed_delete_completes_on_replay() {
        let mut rig = Rig::new(8192, &FormatParams::default());
        let mut vol = rig.mount(true);
        let free_before_create = vol.free_count;

        let path = vpath("/old.txt");
        let mut node = vol.fat_file_open(&path, wr_create(), test_time()).unwrap();
        vol.fat_file_write(&mut node, &[7u8; 2000], test_time()).unwrap();
        vol.fat_file_sync(&mut node).unwrap();
        assert!(vol.free_count < free_before_create);

        let (dir, entry) = vol.locate(&path).unwrap().unwrap();
        let er = entry.slot_ref(dir);
        vol.jnl_begin().unwrap();
        vol.jnl_log(Record::EntryDelete {
            parent: dir,
            first_index: er.run_first(),
            count: er.run_len() as u8,
            chain_first: entry.raw.first_cluster(),
        })
        .unwrap();
        vol.jnl_commit().unwrap();
        // Crash: neither the slot erase nor the chain free happened.
        drop(vol);

        let mut vol = rig.mount(false);
        assert!(vol.dir_find(0, "old.txt").unwrap().is_none());
        assert_eq!(vol.free_count, free_before_create);

        // Replay already cleared the journal; a further remount changes
        // nothing.
        drop(vol);
        let mut vol = rig.mount(false);
        assert!(vol.dir_find(0, "old.txt").unwrap().is_none());
        assert_eq!(vol.free_count, free_before_create);
    }

    #[test]
    fn partial_chain_allocation_reverts() {
        let mut rig = Rig::new(8192, &FormatParams::default());
        let mut vol = rig.mount(true);
        let free = vol.free_count;

        let clusters = vol.clus_find_free(3, &[]).unwrap();
        vol.jnl_begin().unwrap();
        vol.jnl_log(Record::ChainAlloc { prev: 0, first: clusters[0], count: 3 }).unwrap();
        vol.jnl_commit().unwrap();
        // Only part of the chain reaches the device before the crash.
        vol.clus_mark_chain(&clusters[..2], None).unwrap();
        vol.flush_bufs().unwrap();
        drop(vol);

        let vol = rig.mount(false);
        assert_eq!(vol.free_count, free);
    }
}
