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

pub mod boot_sector;
mod chain;
mod dir;
mod file;
pub mod format;
mod journal;
mod name;
mod ops;
mod table;
#[cfg(test)]
mod testing;

use std::sync::Arc;

use log::{error, info, warn};
use tapir_ds::Device;
use tapir_err::{EntryError, Error, JournalError, Result, VolError};
use tapir_fs::{
    buf::{BufPool, SecKind, SectorBuf},
    clock::DateTime,
    dir::DirNode,
    entry::{attrib, EntryInfo, EntryKind, TimeKind, TypeMask},
    file::{FileNode, ModeFlags},
    path::VPath,
    vol::{FormatParams, FsDriver, FsType, MountCtx, SysVolume, VolumeUsage},
};
use zerocopy::{FromBytes, IntoBytes};

use crate::{
    boot_sector::{FatLayout, FsInfo, FSINFO_LEAD_SIG, FSINFO_STRUC_SIG, FSINFO_UNKNOWN},
    dir::{DirCursor, RawDirEntry},
    journal::Journal,
};

pub use journal::{JOURNAL_BYTES, JOURNAL_NAME};

/// Characters legal in a volume label besides letters and digits.
const LABEL_SPECIALS: &[u8] = b" $%'-_@~`!(){}^#&";

/// A mounted FAT12/16/32 volume over a sector span of one device.
pub struct FatVolume {
    vol_id: u64,
    dev: Arc<Device>,
    pool: Arc<BufPool>,
    base: u64,
    layout: FatLayout,
    mode_read_only: bool,
    forced_read_only: bool,
    free_count: u32,
    bad_count: u32,
    alloc_hint: u32,
    journal: Journal,
}

impl FatVolume {
    /// Acquires the buffer for a volume-relative sector.
    pub(crate) fn buf(&self, sector: u64, kind: SecKind, must_read: bool) -> Result<SectorBuf> {
        self.pool.acquire(self.vol_id, &self.dev, self.base + sector, kind, must_read)
    }

    pub(crate) fn put(&self, buf: SectorBuf) {
        self.pool.release(buf)
    }

    pub(crate) fn flush_bufs(&self) -> Result<()> {
        self.pool.flush_vol(self.vol_id)
    }

    /// Structural corruption: the volume degrades to read-only and the
    /// caller's operation fails.
    pub(crate) fn corrupt(&mut self) -> Error {
        if !self.forced_read_only {
            error!("structural corruption, volume degrades to read-only");
            self.forced_read_only = true;
        }
        Error::Entry(EntryError::Corrupt)
    }

    fn wr_check(&self) -> Result<()> {
        if self.read_only() {
            return Err(Error::Vol(VolError::InvalidOp));
        }
        Ok(())
    }

    pub(crate) fn mount(ctx: MountCtx) -> Result<Self> {
        let dev_info = ctx.dev.info()?;
        let layout = {
            let buf = ctx
                .pool
                .acquire(ctx.vol_id, &ctx.dev, ctx.base, SecKind::Mgmt, true)?;
            let layout = boot_sector::parse(buf.bytes(), dev_info.sector_size, ctx.sectors);
            ctx.pool.release(buf);
            layout?
        };

        let mut vol = Self {
            vol_id: ctx.vol_id,
            dev: ctx.dev,
            pool: ctx.pool,
            base: ctx.base,
            layout,
            mode_read_only: ctx.read_only,
            forced_read_only: false,
            free_count: 0,
            bad_count: 0,
            alloc_hint: 2,
            journal: Journal::default(),
        };

        // A non-empty journal holds a half-done metadata operation; replay
        // before anything else looks at the volume.
        if !ctx.read_only {
            vol.jnl_replay().map_err(|err| {
                error!("journal replay failed: {err}");
                Error::Journal(JournalError::Replay)
            })?;
        }

        let (free, bad) = vol.fat_scan()?;
        vol.free_count = free;
        vol.bad_count = bad;

        if layout.fs_type == FsType::Fat32 && layout.fsinfo_sec != 0 {
            vol.fsinfo_load()?;
        }
        if ctx.journaled && !ctx.read_only {
            vol.jnl_start(ctx.now)?;
        }
        info!(
            "mounted {} volume: {} clusters of {} sectors, {} free",
            layout.fs_type, layout.cluster_count, layout.sec_per_clus, vol.free_count
        );
        Ok(vol)
    }

    /// Cross-checks the FSINFO hints against the scanned counts and adopts
    /// the allocation hint.
    fn fsinfo_load(&mut self) -> Result<()> {
        let buf = self.buf(self.layout.fsinfo_sec as u64, SecKind::Mgmt, true)?;
        let info = FsInfo::read_from_bytes(&buf.bytes()[..size_of::<FsInfo>()])
            .map_err(|_| Error::Entry(EntryError::Corrupt));
        self.put(buf);
        let info = info?;
        if info.fsi_leadsig.get() != FSINFO_LEAD_SIG || info.fsi_strucsig.get() != FSINFO_STRUC_SIG
        {
            warn!("FSINFO signatures invalid, hints ignored");
            return Ok(());
        }
        let free = info.fsi_free_count.get();
        if free != FSINFO_UNKNOWN && free != self.free_count {
            warn!("FSINFO free count {free} disagrees with scan {}", self.free_count);
        }
        let next = info.fsi_nxt_free.get();
        if next >= 2 && next < self.layout.cluster_end() {
            self.alloc_hint = next;
        }
        Ok(())
    }

    fn fsinfo_store(&mut self) -> Result<()> {
        if self.layout.fs_type != FsType::Fat32 || self.layout.fsinfo_sec == 0 {
            return Ok(());
        }
        let free_count = self.free_count;
        let alloc_hint = self.alloc_hint;
        let mut buf = self.buf(self.layout.fsinfo_sec as u64, SecKind::Mgmt, true)?;
        if let Ok(info) = FsInfo::mut_from_bytes(&mut buf.bytes_mut()[..size_of::<FsInfo>()]) {
            info.fsi_free_count.set(free_count);
            info.fsi_nxt_free.set(alloc_hint);
            buf.mark_dirty();
        }
        self.put(buf);
        Ok(())
    }

    fn fat_label(&mut self) -> Result<String> {
        match self.label_find()? {
            Some((_, raw)) => {
                Ok(String::from_utf8_lossy(&raw.dir_name).trim_end().to_string())
            }
            None => Ok("NO NAME".to_string()),
        }
    }

    fn fat_label_set(&mut self, text: &str, now: DateTime) -> Result<()> {
        let text = text.to_uppercase();
        if text.is_empty() || text.len() > 11 {
            return Err(Error::Vol(VolError::LabelInvalid));
        }
        let mut label = [b' '; 11];
        for (at, &byte) in text.as_bytes().iter().enumerate() {
            if !byte.is_ascii_uppercase()
                && !byte.is_ascii_digit()
                && !LABEL_SPECIALS.contains(&byte)
            {
                return Err(Error::Vol(VolError::LabelInvalid));
            }
            label[at] = byte;
        }

        match self.label_find()? {
            Some((index, mut raw)) => {
                raw.dir_name = label;
                raw.dir_wrtdate = now.pack_date().into();
                raw.dir_wrttime = now.pack_time().into();
                self.dir_slot_write(0, index, raw.as_bytes())?;
            }
            None => {
                // First free or virgin slot of the root directory.
                let mut cur = DirCursor::new(0);
                let index = loop {
                    match self.dir_slot_read(&mut cur)? {
                        None => return Err(Error::Entry(EntryError::DirFull)),
                        Some(raw) if raw.is_end() || raw.is_free() => break cur.index,
                        Some(_) => cur.index += 1,
                    }
                };
                let raw = RawDirEntry::new(label, attrib::VOLUME_ID, 0, 0, now);
                self.dir_slot_write(0, index, raw.as_bytes())?;
            }
        }
        self.bpb_label_store(&label)
    }

    /// Mirrors the label into the boot-sector BS_VolLab field.
    fn bpb_label_store(&mut self, label: &[u8; 11]) -> Result<()> {
        let at = match self.layout.fs_type {
            FsType::Fat32 => 71,
            _ => 43,
        };
        let mut buf = self.buf(0, SecKind::Mgmt, true)?;
        buf.bytes_mut()[at..at + 11].copy_from_slice(label);
        buf.mark_dirty();
        self.put(buf);
        Ok(())
    }

    fn fat_query(&mut self) -> Result<VolumeUsage> {
        let spc = self.layout.sec_per_clus as u64;
        let used = self.layout.cluster_count - self.free_count - self.bad_count;
        Ok(VolumeUsage {
            total_sectors: self.layout.total_sectors,
            free_sectors: self.free_count as u64 * spc,
            used_sectors: used as u64 * spc,
            bad_sectors: self.bad_count as u64 * spc,
            cluster_sectors: self.layout.sec_per_clus,
        })
    }

    fn fat_sync(&mut self) -> Result<()> {
        self.fsinfo_store()?;
        self.flush_bufs()
    }
}

impl SysVolume for FatVolume {
    fn fs_type(&self) -> FsType {
        self.layout.fs_type
    }

    fn query(&mut self) -> Result<VolumeUsage> {
        self.fat_query()
    }

    fn label(&mut self) -> Result<String> {
        self.fat_label()
    }

    fn label_set(&mut self, label: &str, now: DateTime) -> Result<()> {
        self.wr_check()?;
        self.fat_label_set(label, now)
    }

    fn sync(&mut self) -> Result<()> {
        self.fat_sync()
    }

    fn read_only(&self) -> bool {
        self.mode_read_only || self.forced_read_only
    }

    fn journal_start(&mut self, now: DateTime) -> Result<()> {
        self.wr_check()?;
        self.jnl_start(now)
    }

    fn journal_stop(&mut self) -> Result<()> {
        self.jnl_stop()
    }

    fn entry_query(&mut self, path: &VPath) -> Result<EntryInfo> {
        self.fat_entry_query(path)
    }

    fn entry_create(
        &mut self,
        path: &VPath,
        kind: EntryKind,
        exclusive: bool,
        now: DateTime,
    ) -> Result<()> {
        self.wr_check()?;
        self.fat_entry_create(path, kind, exclusive, now)
    }

    fn entry_delete(&mut self, path: &VPath, mask: TypeMask) -> Result<()> {
        self.wr_check()?;
        self.fat_entry_delete(path, mask)
    }

    fn entry_rename(
        &mut self,
        old: &VPath,
        new: &VPath,
        exclusive: bool,
        now: DateTime,
    ) -> Result<()> {
        self.wr_check()?;
        self.fat_entry_rename(old, new, exclusive, now)
    }

    fn entry_attrib_set(&mut self, path: &VPath, bits: u8) -> Result<()> {
        self.wr_check()?;
        self.fat_entry_attrib_set(path, bits)
    }

    fn entry_time_set(&mut self, path: &VPath, time: DateTime, which: TimeKind) -> Result<()> {
        self.wr_check()?;
        self.fat_entry_time_set(path, time, which)
    }

    fn file_open(&mut self, path: &VPath, flags: ModeFlags, now: DateTime) -> Result<FileNode> {
        if flags.wr() {
            self.wr_check()?;
        }
        self.fat_file_open(path, flags, now)
    }

    fn file_read(&mut self, node: &mut FileNode, buf: &mut [u8]) -> Result<usize> {
        self.chain_read(node, buf)
    }

    fn file_write(&mut self, node: &mut FileNode, buf: &[u8], now: DateTime) -> Result<usize> {
        self.wr_check()?;
        self.fat_file_write(node, buf, now)
    }

    fn file_truncate(&mut self, node: &mut FileNode, new_size: u32, now: DateTime) -> Result<()> {
        self.wr_check()?;
        self.fat_file_truncate(node, new_size, now)
    }

    fn file_sync(&mut self, node: &mut FileNode) -> Result<()> {
        self.fat_file_sync(node)
    }

    fn file_close(&mut self, node: &mut FileNode) -> Result<()> {
        self.fat_file_sync(node)
    }

    fn dir_open(&mut self, path: &VPath) -> Result<DirNode> {
        self.fat_dir_open(path)
    }

    fn dir_read(&mut self, node: &mut DirNode) -> Result<Option<EntryInfo>> {
        self.fat_dir_read(node)
    }
}

/// The FAT file system driver; register with
/// `FileSystem::register_fs(tapir_fs_fat::driver())`.
pub struct FatDriver;

impl FsDriver for FatDriver {
    fn name(&self) -> &'static str {
        "fat"
    }

    fn mount(&self, ctx: MountCtx) -> Result<Box<dyn SysVolume>> {
        Ok(Box::new(FatVolume::mount(ctx)?))
    }

    fn format(
        &self,
        dev: &Arc<Device>,
        base: u64,
        sectors: u64,
        params: &FormatParams,
    ) -> Result<()> {
        format::format(dev, base, sectors, params)
    }
}

pub fn driver() -> Arc<dyn FsDriver> {
    Arc::new(FatDriver)
}
