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

use log::{error, trace};
use tapir_err::{DevError, Error, Result};
use tapir_fs::{buf::SecKind, vol::FsType};

use crate::FatVolume;

pub const FREE: u32 = 0;

impl FatVolume {
    pub(crate) fn check_clus(&mut self, clus: u32) -> Result<u32> {
        if clus < 2 || clus >= self.layout.cluster_end() {
            error!("Cluster {clus} shall be within [2, {})", self.layout.cluster_end());
            return Err(self.corrupt());
        }
        Ok(clus)
    }

    /// Updates one byte of the FAT, in every mirrored copy.
    fn fat_byte_update(&mut self, byte_off: u64, f: impl Fn(u8) -> u8) -> Result<()> {
        let bps = self.layout.bytes_per_sec as u64;
        for copy in 0..self.layout.num_fats {
            let sector = self.layout.rsvd_secs as u64
                + copy as u64 * self.layout.fat_size as u64
                + byte_off / bps;
            let within = (byte_off % bps) as usize;
            let mut buf = self.buf(sector, SecKind::FatTable, true)?;
            let old = buf.bytes()[within];
            buf.bytes_mut()[within] = f(old);
            buf.mark_dirty();
            self.put(buf);
        }
        Ok(())
    }

    fn fat_byte_read(&mut self, byte_off: u64) -> Result<u8> {
        let bps = self.layout.bytes_per_sec as u64;
        let sector = self.layout.rsvd_secs as u64 + byte_off / bps;
        let within = (byte_off % bps) as usize;
        let buf = self.buf(sector, SecKind::FatTable, true)?;
        let byte = buf.bytes()[within];
        self.put(buf);
        Ok(byte)
    }

    /// Reads the FAT entry of `clus` through the first copy.
    pub(crate) fn fat_entry_read(&mut self, clus: u32) -> Result<u32> {
        self.check_clus(clus)?;
        match self.layout.fs_type {
            FsType::Fat12 => {
                let off = clus as u64 + clus as u64 / 2;
                let lo = self.fat_byte_read(off)? as u32;
                let hi = self.fat_byte_read(off + 1)? as u32;
                let raw = lo | hi << 8;
                Ok(if clus & 1 == 1 { raw >> 4 } else { raw & 0xFFF })
            }
            FsType::Fat16 => {
                let off = clus as u64 * 2;
                let lo = self.fat_byte_read(off)? as u32;
                let hi = self.fat_byte_read(off + 1)? as u32;
                Ok(lo | hi << 8)
            }
            FsType::Fat32 => {
                let off = clus as u64 * 4;
                let mut raw = 0u32;
                for i in 0..4 {
                    raw |= (self.fat_byte_read(off + i)? as u32) << (8 * i);
                }
                Ok(raw & 0x0FFF_FFFF)
            }
        }
    }

    /// Writes the FAT entry of `clus` into every mirrored copy. The writes
    /// are buffered; they reach the device at the next flush point.
    pub(crate) fn fat_entry_write(&mut self, clus: u32, val: u32) -> Result<()> {
        self.check_clus(clus)?;
        match self.layout.fs_type {
            FsType::Fat12 => {
                let off = clus as u64 + clus as u64 / 2;
                if clus & 1 == 1 {
                    self.fat_byte_update(off, |old| old & 0x0F | ((val as u8 & 0x0F) << 4))?;
                    self.fat_byte_update(off + 1, |_| (val >> 4) as u8)
                } else {
                    self.fat_byte_update(off, |_| val as u8)?;
                    self.fat_byte_update(off + 1, |old| old & 0xF0 | (val >> 8) as u8 & 0x0F)
                }
            }
            FsType::Fat16 => {
                let off = clus as u64 * 2;
                self.fat_byte_update(off, |_| val as u8)?;
                self.fat_byte_update(off + 1, |_| (val >> 8) as u8)
            }
            FsType::Fat32 => {
                // The upper 4 bits are reserved and preserved.
                let off = clus as u64 * 4;
                for i in 0..3 {
                    self.fat_byte_update(off + i, |_| (val >> (8 * i)) as u8)?;
                }
                self.fat_byte_update(off + 3, |old| old & 0xF0 | (val >> 24) as u8 & 0x0F)
            }
        }
    }

    /// The cluster following `clus`, `None` at end of chain.
    pub(crate) fn clus_next(&mut self, clus: u32) -> Result<Option<u32>> {
        let entry = self.fat_entry_read(clus)?;
        if self.layout.is_eoc(entry) {
            return Ok(None);
        }
        if entry == FREE || entry == self.layout.bad() || entry >= self.layout.cluster_end() {
            error!("Chain through cluster {clus} hits invalid entry {entry:#x}");
            return Err(self.corrupt());
        }
        Ok(Some(entry))
    }

    /// Finds `count` free clusters starting the scan at the allocation hint,
    /// wrapping around the cluster space once. Bad and allocated entries are
    /// skipped, as are clusters in `exclude` (free clusters already promised
    /// to the same operation). Nothing is written.
    pub(crate) fn clus_find_free(&mut self, count: u32, exclude: &[u32]) -> Result<Vec<u32>> {
        let end = self.layout.cluster_end();
        let hint = self.alloc_hint.clamp(2, end - 1);
        let mut found = Vec::with_capacity(count as usize);
        let mut clus = hint;
        loop {
            if !exclude.contains(&clus) && self.fat_entry_read(clus)? == FREE {
                found.push(clus);
                if found.len() as u32 == count {
                    return Ok(found);
                }
            }
            clus += 1;
            if clus >= end {
                clus = 2;
            }
            if clus == hint {
                return Err(Error::Dev(DevError::Full));
            }
        }
    }

    /// Links `clusters` into a chain terminated by end-of-chain, optionally
    /// attaching it to `link_from`, and moves the allocation hint past the
    /// last cluster taken.
    pub(crate) fn clus_mark_chain(&mut self, clusters: &[u32], link_from: Option<u32>) -> Result<()> {
        for pair in clusters.windows(2) {
            self.fat_entry_write(pair[0], pair[1])?;
        }
        if let Some(&last) = clusters.last() {
            self.fat_entry_write(last, self.layout.eoc())?;
            self.alloc_hint = if last + 1 >= self.layout.cluster_end() { 2 } else { last + 1 };
            self.free_count = self.free_count.saturating_sub(clusters.len() as u32);
            trace!("alloc {} clusters, first {}, {} free", clusters.len(), clusters[0], self.free_count);
        }
        if let Some(prev) = link_from {
            if let Some(&first) = clusters.first() {
                self.fat_entry_write(prev, first)?;
            }
        }
        Ok(())
    }

    /// Frees a chain from `first`, up to `max` clusters (or to its end),
    /// returning the count freed. Freeing an already-free head is a no-op,
    /// which keeps journal replay idempotent.
    pub(crate) fn clus_chain_free(&mut self, first: u32, max: Option<u32>) -> Result<u32> {
        let mut clus = first;
        let mut freed = 0u32;
        loop {
            if max.is_some_and(|max| freed >= max) {
                break;
            }
            if clus < 2 || clus >= self.layout.cluster_end() {
                break;
            }
            let entry = self.fat_entry_read(clus)?;
            if entry == FREE || entry == self.layout.bad() {
                break;
            }
            self.fat_entry_write(clus, FREE)?;
            freed += 1;
            if self.layout.is_eoc(entry) {
                break;
            }
            clus = entry;
        }
        self.free_count += freed;
        if freed > 0 {
            trace!("freed {freed} clusters from {first}, {} free", self.free_count);
        }
        Ok(freed)
    }

    /// Walks to the last cluster of a chain, returning it and the chain
    /// length.
    pub(crate) fn clus_chain_last(&mut self, first: u32) -> Result<(u32, u32)> {
        let mut clus = self.check_clus(first)?;
        let mut len = 1;
        while let Some(next) = self.clus_next(clus)? {
            clus = next;
            len += 1;
            if len > self.layout.cluster_count {
                error!("Chain from {first} shall not exceed the cluster count");
                return Err(self.corrupt());
            }
        }
        Ok((clus, len))
    }

    /// Counts free and bad clusters by scanning the whole table.
    pub(crate) fn fat_scan(&mut self) -> Result<(u32, u32)> {
        let mut free = 0;
        let mut bad = 0;
        for clus in 2..self.layout.cluster_end() {
            let entry = self.fat_entry_read(clus)?;
            if entry == FREE {
                free += 1;
            } else if entry == self.layout.bad() {
                bad += 1;
            }
        }
        Ok((free, bad))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tapir_fs::vol::FormatParams;

    use crate::testing::Rig;

    #[test]
    fn fat12_entries_straddle_sectors() {
        // 1.44 MB floppy geometry formats as FAT12 with one sector per
        // cluster; entry 341 spans the first FAT sector boundary.
        let mut rig = Rig::new(2880, &FormatParams::default());
        let mut vol = rig.mount(false);
        for (clus, val) in [(340, 0x123), (341, 0xABC), (342, 0x456)] {
            vol.fat_entry_write(clus, val).unwrap();
        }
        assert_eq!(vol.fat_entry_read(340).unwrap(), 0x123);
        assert_eq!(vol.fat_entry_read(341).unwrap(), 0xABC);
        assert_eq!(vol.fat_entry_read(342).unwrap(), 0x456);
    }

    #[test]
    fn fat12_wraparound_allocation() {
        let mut rig = Rig::new(2880, &FormatParams::default());
        let mut vol = rig.mount(false);
        let end = vol.layout.cluster_end();

        // Fill the table, then free five clusters scattered across the
        // low and high ends.
        for clus in 2..end {
            vol.fat_entry_write(clus, vol.layout.eoc()).unwrap();
        }
        let scattered = [end - 2, end - 1, 3, 5, 9];
        for &clus in &scattered {
            vol.fat_entry_write(clus, FREE).unwrap();
        }
        vol.free_count = scattered.len() as u32;
        vol.alloc_hint = end - 3;

        let found = vol.clus_find_free(5, &[]).unwrap();
        assert_eq!(found, scattered);
        vol.clus_mark_chain(&found, None).unwrap();
        assert_eq!(vol.fat_entry_read(end - 2).unwrap(), end - 1);
        assert_eq!(vol.fat_entry_read(end - 1).unwrap(), 3);
        assert_eq!(vol.fat_entry_read(3).unwrap(), 5);
        assert_eq!(vol.fat_entry_read(5).unwrap(), 9);
        let entry9 = vol.fat_entry_read(9).unwrap();
        assert!(vol.layout.is_eoc(entry9));
        assert_eq!(vol.free_count, 0);
    }

    #[test]
    fn exhaustion_reports_device_full() {
        let mut rig = Rig::new(2880, &FormatParams::default());
        let mut vol = rig.mount(false);
        let free = vol.free_count;
        assert!(matches!(
            vol.clus_find_free(free + 1, &[]),
            Err(Error::Dev(DevError::Full))
        ));
    }

    #[test]
    fn mirrored_copies_stay_identical() {
        let mut rig = Rig::new(2880, &FormatParams::default());
        let mut vol = rig.mount(false);
        let run = vol.clus_find_free(3, &[]).unwrap();
        vol.clus_mark_chain(&run, None).unwrap();
        vol.clus_chain_free(run[0], None).unwrap();
        let run = vol.clus_find_free(4, &[]).unwrap();
        vol.clus_mark_chain(&run, None).unwrap();
        vol.flush_bufs().unwrap();

        let fat_size = vol.layout.fat_size;
        let rsvd = vol.layout.rsvd_secs as u64;
        let mut first = vec![0u8; fat_size as usize * 512];
        let mut second = vec![0u8; fat_size as usize * 512];
        rig.dev.read(rsvd, fat_size, &mut first).unwrap();
        rig.dev.read(rsvd + fat_size as u64, fat_size, &mut second).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn chain_free_restores_count() {
        let mut rig = Rig::new(2880, &FormatParams::default());
        let mut vol = rig.mount(false);
        let free = vol.free_count;
        let run = vol.clus_find_free(5, &[]).unwrap();
        vol.clus_mark_chain(&run, None).unwrap();
        assert_eq!(vol.free_count, free - 5);
        assert_eq!(vol.clus_chain_free(run[0], None).unwrap(), 5);
        assert_eq!(vol.free_count, free);
        // Freeing an already-free chain head is a no-op.
        assert_eq!(vol.clus_chain_free(run[0], None).unwrap(), 0);
        assert_eq!(vol.free_count, free);
    }
}
