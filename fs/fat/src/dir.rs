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

use log::warn;
use tapir_err::{EntryError, Error, Result};
use tapir_fs::{
    buf::SecKind,
    clock::DateTime,
    entry::{attrib, EntryInfo, EntryKind},
    file::{ChainPos, EntrySlotRef},
    path::VPath,
    vol::FsType,
};
use zerocopy::{
    little_endian::{U16, U32},
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
};

use crate::{
    name::{self, LFN_CHARS},
    FatVolume,
};

pub const DIR_ENTRY_SIZE: usize = 32;

/// First name byte of a deleted entry.
pub const ENTRY_DELETED: u8 = 0xE5;
/// First name byte terminating a directory scan.
pub const ENTRY_END: u8 = 0x00;

/// A 32-byte short-name directory entry.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct RawDirEntry {
    /// 8.3 name; `dir_name[0]` doubles as the free/end marker.
    pub dir_name: [u8; 11],
    pub dir_attr: u8,
    /// Reserved for Windows NT, kept as found.
    pub dir_ntres: u8,
    /// Creation time, tenths of a second component, 0..200.
    pub dir_crttimetenth: u8,
    pub dir_crttime: U16,
    pub dir_crtdate: U16,
    pub dir_lstaccdate: U16,
    /// High word of the first cluster; 0 on FAT12/16.
    pub dir_fstclushi: U16,
    pub dir_wrttime: U16,
    pub dir_wrtdate: U16,
    pub dir_fstcluslo: U16,
    pub dir_filesize: U32,
}

impl RawDirEntry {
    pub fn new(sfn: [u8; 11], attr: u8, first_cluster: u32, size: u32, now: DateTime) -> Self {
        let date = U16::new(now.pack_date());
        let time = U16::new(now.pack_time());
        let mut raw = Self {
            dir_name: sfn,
            dir_attr: attr,
            dir_ntres: 0,
            dir_crttimetenth: 0,
            dir_crttime: time,
            dir_crtdate: date,
            dir_lstaccdate: date,
            dir_fstclushi: U16::new(0),
            dir_wrttime: time,
            dir_wrtdate: date,
            dir_fstcluslo: U16::new(0),
            dir_filesize: U32::new(size),
        };
        raw.set_first_cluster(first_cluster);
        raw
    }

    pub fn is_end(&self) -> bool {
        self.dir_name[0] == ENTRY_END
    }

    pub fn is_free(&self) -> bool {
        self.dir_name[0] == ENTRY_DELETED
    }

    pub fn is_lfn(&self) -> bool {
        self.dir_attr & attrib::LONG_NAME == attrib::LONG_NAME
    }

    pub fn is_volume_id(&self) -> bool {
        !self.is_lfn() && self.dir_attr & attrib::VOLUME_ID != 0
    }

    pub fn is_dir(&self) -> bool {
        self.dir_attr & attrib::DIRECTORY != 0
    }

    pub fn first_cluster(&self) -> u32 {
        (self.dir_fstclushi.get() as u32) << 16 | self.dir_fstcluslo.get() as u32
    }

    pub fn set_first_cluster(&mut self, clus: u32) {
        self.dir_fstclushi = U16::new((clus >> 16) as u16);
        self.dir_fstcluslo = U16::new(clus as u16);
    }
}

/// A 32-byte long-name slot carrying up to 13 UCS-2 characters.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct RawLfnEntry {
    /// Sequence number 1..20, masked with 0x40 on the last entry of the set.
    pub ldir_ord: u8,
    pub ldir_name1: [U16; 5],
    /// Always `ATTR_LONG_NAME`.
    pub ldir_attr: u8,
    pub ldir_type: u8,
    /// Checksum of the companion short name.
    pub ldir_chksum: u8,
    pub ldir_name2: [U16; 6],
    /// Must be 0.
    pub ldir_fstcluslo: U16,
    pub ldir_name3: [U16; 2],
}

pub const LFN_LAST: u8 = 0x40;
pub const LFN_SEQ_MASK: u8 = 0x1F;

impl RawLfnEntry {
    pub fn new(seq: u8, last: bool, chksum: u8, fragment: &[u16]) -> Self {
        let mut units = [0xFFFFu16; LFN_CHARS];
        units[..fragment.len()].copy_from_slice(fragment);
        if fragment.len() < LFN_CHARS {
            units[fragment.len()] = 0;
        }
        let unit = |at: usize| U16::new(units[at]);
        Self {
            ldir_ord: seq | if last { LFN_LAST } else { 0 },
            ldir_name1: [unit(0), unit(1), unit(2), unit(3), unit(4)],
            ldir_attr: attrib::LONG_NAME,
            ldir_type: 0,
            ldir_chksum: chksum,
            ldir_name2: [unit(5), unit(6), unit(7), unit(8), unit(9), unit(10)],
            ldir_fstcluslo: U16::new(0),
            ldir_name3: [unit(11), unit(12)],
        }
    }

    pub fn fragment(&self) -> [u16; LFN_CHARS] {
        let mut units = [0u16; LFN_CHARS];
        for (at, unit) in self
            .ldir_name1
            .iter()
            .chain(self.ldir_name2.iter())
            .chain(self.ldir_name3.iter())
            .enumerate()
        {
            units[at] = unit.get();
        }
        units
    }
}

/// A scan position within one directory, caching the chain walk.
#[derive(Debug, Clone)]
pub(crate) struct DirCursor {
    pub dir: u32,
    pub index: u32,
    chain: Option<ChainPos>,
}

impl DirCursor {
    pub fn new(dir: u32) -> Self {
        Self { dir, index: 0, chain: None }
    }

    pub fn at(dir: u32, index: u32) -> Self {
        Self { dir, index, chain: None }
    }
}

/// A short-name entry together with its decoded name and slot run.
#[derive(Debug, Clone)]
pub(crate) struct ParsedEntry {
    pub raw: RawDirEntry,
    pub name: String,
    pub sfn_index: u32,
    pub lfn_count: u8,
}

impl ParsedEntry {
    pub fn slot_ref(&self, dir: u32) -> EntrySlotRef {
        EntrySlotRef { dir_first_cluster: dir, slot: self.sfn_index, lfn_count: self.lfn_count }
    }

    pub fn kind(&self) -> EntryKind {
        if self.raw.is_dir() {
            EntryKind::Dir
        } else {
            EntryKind::File
        }
    }
}

/// Where and how a new entry's slot run will be written.
#[derive(Debug, Clone)]
pub(crate) struct PlacePlan {
    pub dir: u32,
    pub first_index: u32,
    pub slots: u8,
    pub sfn: [u8; 11],
    pub lfn: Option<Vec<u16>>,
    /// Directory extension: chain tail to link from, clusters to take.
    pub extend: Option<(u32, Vec<u32>)>,
}

impl PlacePlan {
    pub fn slot_ref(&self) -> EntrySlotRef {
        EntrySlotRef {
            dir_first_cluster: self.dir,
            slot: self.first_index + self.slots as u32 - 1,
            lfn_count: self.slots - 1,
        }
    }
}

struct LfnAccum {
    units: Vec<u16>,
    next_seq: u8,
    chksum: u8,
    count: u8,
}

impl FatVolume {
    fn dir_is_fixed_root(&self, dir: u32) -> bool {
        dir == 0 && self.layout.fs_type != FsType::Fat32
    }

    /// First cluster of a directory's chain; the FAT32 root resolves to its
    /// boot-sector cluster.
    pub(crate) fn dir_chain_first(&self, dir: u32) -> u32 {
        if dir == 0 {
            self.layout.root_clus
        } else {
            dir
        }
    }

    /// Locates slot `cur.index`, `None` past the end of the directory's
    /// region or chain.
    fn dir_slot_locate(&mut self, cur: &mut DirCursor) -> Result<Option<(u64, usize)>> {
        let bps = self.layout.bytes_per_sec as u64;
        let byte = cur.index as u64 * DIR_ENTRY_SIZE as u64;
        if self.dir_is_fixed_root(cur.dir) {
            if cur.index >= self.layout.root_ent_cnt {
                return Ok(None);
            }
            let sector = self.layout.root_dir_start as u64 + byte / bps;
            return Ok(Some((sector, (byte % bps) as usize)));
        }
        let cluster_bytes = self.layout.cluster_bytes() as u64;
        let target = (byte / cluster_bytes) as u32;
        let (mut index, mut cluster) = match cur.chain {
            Some(ChainPos { index, cluster }) if index <= target => (index, cluster),
            _ => (0, self.dir_chain_first(cur.dir)),
        };
        while index < target {
            match self.clus_next(cluster)? {
                Some(next) => {
                    cluster = next;
                    index += 1;
                }
                None => return Ok(None),
            }
        }
        cur.chain = Some(ChainPos { index, cluster });
        let in_clus = byte % cluster_bytes;
        let sector = self.layout.clus_to_sector(cluster) + in_clus / bps;
        Ok(Some((sector, (in_clus % bps) as usize)))
    }

    pub(crate) fn dir_slot_read(&mut self, cur: &mut DirCursor) -> Result<Option<RawDirEntry>> {
        let Some((sector, off)) = self.dir_slot_locate(cur)? else {
            return Ok(None);
        };
        let buf = self.buf(sector, SecKind::DirEntry, true)?;
        let raw = RawDirEntry::read_from_bytes(&buf.bytes()[off..off + DIR_ENTRY_SIZE])
            .map_err(|_| Error::Entry(EntryError::Corrupt));
        self.put(buf);
        raw.map(Some)
    }

    pub(crate) fn dir_slot_write(&mut self, dir: u32, index: u32, bytes: &[u8]) -> Result<()> {
        let mut cur = DirCursor::at(dir, index);
        let Some((sector, off)) = self.dir_slot_locate(&mut cur)? else {
            return Err(self.corrupt());
        };
        let mut buf = self.buf(sector, SecKind::DirEntry, true)?;
        buf.bytes_mut()[off..off + DIR_ENTRY_SIZE].copy_from_slice(bytes);
        buf.mark_dirty();
        self.put(buf);
        Ok(())
    }

    /// Reads the next short-name entry at or after `cur`, composing any
    /// preceding long-name chain. The cursor advances past the entry; it
    /// stays on the terminator when the scan ends.
    pub(crate) fn dir_next_entry(&mut self, cur: &mut DirCursor) -> Result<Option<ParsedEntry>> {
        let mut lfn: Option<LfnAccum> = None;
        loop {
            let Some(raw) = self.dir_slot_read(cur)? else {
                return Ok(None);
            };
            if raw.is_end() {
                return Ok(None);
            }
            let index = cur.index;
            cur.index += 1;
            if raw.is_free() {
                lfn = None;
                continue;
            }
            if raw.is_lfn() {
                let entry = RawLfnEntry::read_from_bytes(raw.as_bytes())
                    .map_err(|_| Error::Entry(EntryError::Corrupt))?;
                let seq = entry.ldir_ord & LFN_SEQ_MASK;
                if entry.ldir_ord & LFN_LAST != 0 {
                    if seq == 0 || seq as usize > 255usize.div_ceil(LFN_CHARS) {
                        warn!("orphaned long-name fragment at slot {index} ignored");
                        lfn = None;
                        continue;
                    }
                    let mut accum = LfnAccum {
                        units: vec![0xFFFF; seq as usize * LFN_CHARS],
                        next_seq: seq,
                        chksum: entry.ldir_chksum,
                        count: seq,
                    };
                    let at = (seq as usize - 1) * LFN_CHARS;
                    accum.units[at..at + LFN_CHARS].copy_from_slice(&entry.fragment());
                    accum.next_seq -= 1;
                    lfn = Some(accum);
                } else {
                    match lfn.as_mut() {
                        Some(accum)
                            if accum.next_seq == seq
                                && seq != 0
                                && accum.chksum == entry.ldir_chksum =>
                        {
                            let at = (seq as usize - 1) * LFN_CHARS;
                            accum.units[at..at + LFN_CHARS].copy_from_slice(&entry.fragment());
                            accum.next_seq -= 1;
                        }
                        _ => {
                            warn!("orphaned long-name fragment at slot {index} ignored");
                            lfn = None;
                        }
                    }
                }
                continue;
            }
            if raw.is_volume_id() {
                lfn = None;
                continue;
            }

            let (long_name, lfn_count) = match lfn.take() {
                Some(accum)
                    if accum.next_seq == 0 && accum.chksum == name::checksum(&raw.dir_name) =>
                {
                    let end = accum
                        .units
                        .iter()
                        .position(|&unit| unit == 0)
                        .unwrap_or(accum.units.len());
                    (Some(String::from_utf16_lossy(&accum.units[..end])), accum.count)
                }
                Some(_) => {
                    warn!("long-name chain with stale checksum before slot {index} ignored");
                    (None, 0)
                }
                None => (None, 0),
            };
            let name = long_name.unwrap_or_else(|| name::sfn_display(&raw.dir_name));
            return Ok(Some(ParsedEntry { raw, name, sfn_index: index, lfn_count }));
        }
    }

    /// Finds `name` in a directory, matching the long name or the 8.3
    /// representation, case-insensitively.
    pub(crate) fn dir_find(&mut self, dir: u32, needle: &str) -> Result<Option<ParsedEntry>> {
        let mut cur = DirCursor::new(dir);
        while let Some(entry) = self.dir_next_entry(&mut cur)? {
            if entry.name == "." || entry.name == ".." {
                continue;
            }
            if name::name_eq(&entry.name, needle)
                || name::name_eq(&name::sfn_display(&entry.raw.dir_name), needle)
            {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    /// Walks all but the last component of `path`, returning the containing
    /// directory and the final component.
    pub(crate) fn locate_parent<'p>(&mut self, path: &'p VPath) -> Result<(u32, &'p str)> {
        let comps = path.components();
        let (last, parents) = comps.split_last().ok_or(Error::Entry(EntryError::RootDir))?;
        let mut dir = 0u32;
        for comp in parents {
            let entry = self
                .dir_find(dir, comp)?
                .ok_or(Error::Entry(EntryError::ParentNotFound))?;
            if !entry.raw.is_dir() {
                return Err(Error::Entry(EntryError::NotDir));
            }
            dir = entry.raw.first_cluster();
        }
        Ok((dir, last))
    }

    /// Finds the entry `path` names, with its containing directory. `None`
    /// when only the final component is missing.
    pub(crate) fn locate(&mut self, path: &VPath) -> Result<Option<(u32, ParsedEntry)>> {
        let (dir, last) = self.locate_parent(path)?;
        Ok(self.dir_find(dir, last)?.map(|entry| (dir, entry)))
    }

    fn sfn_exists(&mut self, dir: u32, sfn: &[u8; 11]) -> Result<bool> {
        let mut cur = DirCursor::new(dir);
        loop {
            let Some(raw) = self.dir_slot_read(&mut cur)? else {
                return Ok(false);
            };
            if raw.is_end() {
                return Ok(false);
            }
            cur.index += 1;
            if !raw.is_free() && !raw.is_lfn() && &raw.dir_name == sfn {
                return Ok(true);
            }
        }
    }

    /// Generates a short name unique within `dir`: the plain basis when it
    /// is clean and free, `~1`..`~4` tails on collision, then hashed tails
    /// derived from the long name.
    fn sfn_unique(&mut self, dir: u32, needle: &str) -> Result<([u8; 11], bool)> {
        let (basis, needs_tilde, needs_lfn) = name::sfn_basis(needle);
        if !needs_tilde && !self.sfn_exists(dir, &basis)? {
            return Ok((basis, needs_lfn));
        }
        for n in 1..=4 {
            let candidate = name::sfn_with_tail(&basis, n, None);
            if !self.sfn_exists(dir, &candidate)? {
                return Ok((candidate, true));
            }
        }
        let hash = name::name_hash(needle);
        for bump in 0..=u16::MAX - hash {
            for n in 1..=9 {
                let candidate = name::sfn_with_tail(&basis, n, Some(hash + bump));
                if !self.sfn_exists(dir, &candidate)? {
                    return Ok((candidate, true));
                }
            }
        }
        Err(Error::Entry(EntryError::Exists))
    }

    /// Plans the slot run for a new entry named `needle` in `dir`: the
    /// unique short name, the long-name requirement, the first free run
    /// large enough, and any directory extension that takes.
    pub(crate) fn place_plan(&mut self, dir: u32, needle: &str) -> Result<PlacePlan> {
        let (sfn, needs_lfn) = self.sfn_unique(dir, needle)?;
        let lfn = needs_lfn.then(|| name::ucs2(needle));
        let slots = match &lfn {
            Some(units) => name::lfn_slot_count(units.len()) as u8 + 1,
            None => 1,
        };

        let mut cur = DirCursor::new(dir);
        let mut run_start = 0u32;
        let mut run_len = 0u32;
        let stop = loop {
            match self.dir_slot_read(&mut cur)? {
                None => break cur.index,
                Some(raw) if raw.is_end() => break cur.index,
                Some(raw) if raw.is_free() => {
                    if run_len == 0 {
                        run_start = cur.index;
                    }
                    run_len += 1;
                    cur.index += 1;
                    if run_len == slots as u32 {
                        return Ok(PlacePlan {
                            dir,
                            first_index: run_start,
                            slots,
                            sfn,
                            lfn,
                            extend: None,
                        });
                    }
                }
                Some(_) => {
                    run_len = 0;
                    cur.index += 1;
                }
            }
        };

        // The run continues into virgin space after the terminator (or the
        // trailing deleted slots reach the end of the region).
        let first_index = if run_len > 0 { run_start } else { stop };
        let needed = first_index + slots as u32;
        if self.dir_is_fixed_root(dir) {
            if needed > self.layout.root_ent_cnt {
                return Err(Error::Entry(EntryError::DirFull));
            }
            return Ok(PlacePlan { dir, first_index, slots, sfn, lfn, extend: None });
        }

        let slots_per_clus = self.layout.cluster_bytes() / DIR_ENTRY_SIZE as u32;
        let (last, len) = self.clus_chain_last(self.dir_chain_first(dir))?;
        let capacity = len * slots_per_clus;
        let extend = if needed > capacity {
            let clusters = (needed - capacity).div_ceil(slots_per_clus);
            Some((last, self.clus_find_free(clusters, &[])?))
        } else {
            None
        };
        Ok(PlacePlan { dir, first_index, slots, sfn, lfn, extend })
    }

    /// Writes the slot run of a plan: extension clusters first, long-name
    /// slots in reverse order, the short-name slot last.
    pub(crate) fn place_commit(&mut self, plan: &PlacePlan, raw: RawDirEntry) -> Result<()> {
        if let Some((last, clusters)) = &plan.extend {
            self.clus_mark_chain(clusters, Some(*last))?;
            for &clus in clusters {
                self.clus_zero(clus)?;
            }
        }
        let lfn_count = plan.slots - 1;
        if let Some(units) = &plan.lfn {
            let chksum = name::checksum(&plan.sfn);
            for at in 0..lfn_count {
                let seq = lfn_count - at;
                let from = (seq as usize - 1) * LFN_CHARS;
                let fragment = &units[from..units.len().min(from + LFN_CHARS)];
                let slot = RawLfnEntry::new(seq, at == 0, chksum, fragment);
                self.dir_slot_write(plan.dir, plan.first_index + at as u32, slot.as_bytes())?;
            }
        }
        self.dir_slot_write(plan.dir, plan.first_index + lfn_count as u32, raw.as_bytes())
    }

    /// Marks a slot run deleted. Virgin slots are left untouched so the
    /// terminator stays in place, which also keeps replay idempotent.
    pub(crate) fn entry_erase(&mut self, dir: u32, first_index: u32, count: u32) -> Result<()> {
        for index in first_index..first_index + count {
            let mut cur = DirCursor::at(dir, index);
            let Some(raw) = self.dir_slot_read(&mut cur)? else {
                break;
            };
            if raw.is_end() {
                continue;
            }
            let mut bytes = [0u8; DIR_ENTRY_SIZE];
            bytes.copy_from_slice(raw.as_bytes());
            bytes[0] = ENTRY_DELETED;
            self.dir_slot_write(dir, index, &bytes)?;
        }
        Ok(())
    }

    /// Rewrites just the short-name slot of an entry.
    pub(crate) fn entry_update(
        &mut self,
        er: &EntrySlotRef,
        f: impl FnOnce(&mut RawDirEntry),
    ) -> Result<()> {
        let mut cur = DirCursor::at(er.dir_first_cluster, er.slot);
        let Some(mut raw) = self.dir_slot_read(&mut cur)? else {
            return Err(self.corrupt());
        };
        f(&mut raw);
        self.entry_update_raw(er, &raw)
    }

    pub(crate) fn entry_update_raw(&mut self, er: &EntrySlotRef, raw: &RawDirEntry) -> Result<()> {
        self.dir_slot_write(er.dir_first_cluster, er.slot, raw.as_bytes())
    }

    /// Zeroes every sector of a cluster; used for fresh directory clusters.
    pub(crate) fn clus_zero(&mut self, clus: u32) -> Result<()> {
        let first = self.layout.clus_to_sector(clus);
        for at in 0..self.layout.sec_per_clus as u64 {
            let mut buf = self.buf(first + at, SecKind::DirEntry, false)?;
            buf.mark_dirty();
            self.put(buf);
        }
        Ok(())
    }

    /// Writes the `.` and `..` entries into the first cluster of a new
    /// directory. `parent` 0 encodes the root, as the on-disk format wants.
    pub(crate) fn dir_init_dots(&mut self, clus: u32, parent: u32, now: DateTime) -> Result<()> {
        let dot = RawDirEntry::new(*b".          ", attrib::DIRECTORY, clus, 0, now);
        let dotdot = RawDirEntry::new(*b"..         ", attrib::DIRECTORY, parent, 0, now);
        self.dir_slot_write(clus, 0, dot.as_bytes())?;
        self.dir_slot_write(clus, 1, dotdot.as_bytes())
    }

    /// Whether a directory holds nothing but `.` and `..`.
    pub(crate) fn dir_is_empty(&mut self, dir: u32) -> Result<bool> {
        let mut cur = DirCursor::new(dir);
        while let Some(entry) = self.dir_next_entry(&mut cur)? {
            if entry.name != "." && entry.name != ".." {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub(crate) fn entry_info(&self, entry: &ParsedEntry) -> EntryInfo {
        let raw = &entry.raw;
        EntryInfo {
            name: entry.name.clone(),
            kind: entry.kind(),
            attrib: raw.dir_attr,
            size: raw.dir_filesize.get(),
            first_cluster: raw.first_cluster(),
            create: DateTime::unpack(raw.dir_crtdate.get(), raw.dir_crttime.get()),
            write: DateTime::unpack(raw.dir_wrtdate.get(), raw.dir_wrttime.get()),
            access: DateTime::unpack(raw.dir_lstaccdate.get(), 0),
        }
    }

    /// Finds the volume-label entry in the root directory.
    pub(crate) fn label_find(&mut self) -> Result<Option<(u32, RawDirEntry)>> {
        let mut cur = DirCursor::new(0);
        loop {
            let Some(raw) = self.dir_slot_read(&mut cur)? else {
                return Ok(None);
            };
            if raw.is_end() {
                return Ok(None);
            }
            let index = cur.index;
            cur.index += 1;
            if !raw.is_free() && raw.is_volume_id() {
                return Ok(Some((index, raw)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tapir_fs::vol::FormatParams;

    use crate::testing::{test_time, Rig};

    #[test]
    fn long_name_slots_round_trip() {
        let mut rig = Rig::new(8192, &FormatParams::default());
        let mut vol = rig.mount(false);
        let long = "A name long enough to need several fragments.txt";
        let plan = vol.place_plan(0, long).unwrap();
        assert!(plan.slots > 2);
        let raw = RawDirEntry::new(plan.sfn, attrib::ARCHIVE, 0, 0, test_time());
        vol.place_commit(&plan, raw).unwrap();

        let entry = vol.dir_find(0, long).unwrap().unwrap();
        assert_eq!(entry.name, long);
        assert_eq!(entry.lfn_count, plan.slots - 1);
        // Case-insensitive and 8.3-companion lookups resolve too.
        assert!(vol.dir_find(0, &long.to_uppercase()).unwrap().is_some());
        let sfn = crate::name::sfn_display(&plan.sfn);
        assert!(vol.dir_find(0, &sfn).unwrap().is_some());
    }

    #[test]
    fn stale_checksum_orphans_long_name() {
        let mut rig = Rig::new(8192, &FormatParams::default());
        let mut vol = rig.mount(false);
        let long = "orphaned long name.bin";
        let plan = vol.place_plan(0, long).unwrap();
        let raw = RawDirEntry::new(plan.sfn, attrib::ARCHIVE, 0, 0, test_time());
        vol.place_commit(&plan, raw).unwrap();

        // Corrupt the checksum of the leading long-name slot.
        let mut cur = DirCursor::at(0, plan.first_index);
        let slot = vol.dir_slot_read(&mut cur).unwrap().unwrap();
        let mut lfn = RawLfnEntry::read_from_bytes(slot.as_bytes()).unwrap();
        lfn.ldir_chksum ^= 0xFF;
        vol.dir_slot_write(0, plan.first_index, lfn.as_bytes()).unwrap();

        // The long name is dropped; the short name still resolves.
        assert!(vol.dir_find(0, long).unwrap().is_none());
        let sfn = crate::name::sfn_display(&plan.sfn);
        let entry = vol.dir_find(0, &sfn).unwrap().unwrap();
        assert_eq!(entry.name, sfn);
        assert_eq!(entry.lfn_count, 0);
    }
}
