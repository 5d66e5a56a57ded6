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

pub use tapir_err::*;

pub mod buf;
pub mod clock;
pub mod dir;
pub mod entry;
pub mod file;
pub mod partition;
pub mod path;
pub mod vol;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    thread::ThreadId,
};

use log::{error, info};
use tapir_ds::{Device, DeviceDriver, DeviceState};

use crate::{
    buf::BufPool,
    clock::{Clock, DateTime},
    dir::{DirHandle, DirNode},
    entry::{EntryInfo, EntryKind, TimeKind, TypeMask},
    file::{FileHandle, FileInfo, FileNode, ModeFlags, Origin},
    path::FullPath,
    vol::{AccessMode, FormatParams, FsDriver, MountCtx, SysVolume, VolumeSlot, VolumeUsage},
};

/// Sizing constants fixed at initialization, the run-time analogue of the
/// configuration header of classic embedded file systems.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of shared sector buffers; must stay at least twice the number
    /// of simultaneously mounted volumes.
    pub buf_count: usize,
    /// Largest device sector size that will be attached, in bytes.
    pub max_sector_size: u32,
    pub max_files: usize,
    pub max_dirs: usize,
    /// Maximum entry-name length in UCS-2 code units.
    pub max_name_len: usize,
    /// Maximum full-path length in UCS-2 code units, volume prefix excluded.
    pub max_path_len: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            buf_count: 8,
            max_sector_size: 4096,
            max_files: 16,
            max_dirs: 8,
            max_name_len: 255,
            max_path_len: 260,
        }
    }
}

impl Config {
    fn validate(&self) -> Result<()> {
        if self.buf_count < 2
            || !matches!(self.max_sector_size, 512 | 1024 | 2048 | 4096)
            || self.max_files == 0
            || self.max_dirs == 0
            || self.max_name_len == 0
            || self.max_path_len < self.max_name_len
        {
            return Err(Error::InvalidConfig);
        }
        Ok(())
    }
}

struct OpenFile {
    gen: u32,
    vol: Arc<VolumeSlot>,
    /// Case-folded full path, for open-entry conflict checks.
    path_key: String,
    /// Taken while an operation is in flight; per-handle operations are
    /// serialized by the caller, a concurrent call observes `Lock`.
    node: Option<FileNode>,
    eof: bool,
    err: bool,
}

struct OpenDir {
    gen: u32,
    vol: Arc<VolumeSlot>,
    path_key: String,
    node: Option<DirNode>,
}

/// The file system context: device and volume registries, the shared sector
/// buffer pool, open-handle tables and per-task working directories.
///
/// Constructed once and shared; all methods take `&self` and synchronize
/// internally following the lock hierarchy registry → volume → device.
pub struct FileSystem {
    cfg: Config,
    clock: Box<dyn Clock>,
    pool: Arc<BufPool>,
    devices: Mutex<HashMap<String, Arc<Device>>>,
    fs_drivers: Mutex<Vec<Arc<dyn FsDriver>>>,
    volumes: Mutex<HashMap<String, Arc<VolumeSlot>>>,
    default_vol: Mutex<Option<String>>,
    files: Mutex<Vec<Option<OpenFile>>>,
    dirs: Mutex<Vec<Option<OpenDir>>>,
    cwds: Mutex<HashMap<ThreadId, FullPath>>,
    next_vol_id: AtomicU64,
    next_gen: AtomicU32,
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex.lock().map_err(|_| Error::Lock)
}

impl FileSystem {
    pub fn new(cfg: Config, clock: Box<dyn Clock>) -> Result<Self> {
        cfg.validate()?;
        let pool = Arc::new(BufPool::new(cfg.buf_count, cfg.max_sector_size as usize));
        let files = (0..cfg.max_files).map(|_| None).collect();
        let dirs = (0..cfg.max_dirs).map(|_| None).collect();
        Ok(Self {
            cfg,
            clock,
            pool,
            devices: Mutex::new(HashMap::new()),
            fs_drivers: Mutex::new(Vec::new()),
            volumes: Mutex::new(HashMap::new()),
            default_vol: Mutex::new(None),
            files: Mutex::new(files),
            dirs: Mutex::new(dirs),
            cwds: Mutex::new(HashMap::new()),
            next_vol_id: AtomicU64::new(1),
            next_gen: AtomicU32::new(1),
        })
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// Registers a mountable file system type.
    pub fn register_fs(&self, driver: Arc<dyn FsDriver>) -> Result<()> {
        lock(&self.fs_drivers)?.push(driver);
        Ok(())
    }

    // ------------------------------------------------------------------ dev

    /// Adds a `(driver, unit)` device and attempts to open it. Returns the
    /// device name (`"ram:0:"`).
    pub fn device_add(&self, driver: Arc<dyn DeviceDriver>, unit: u8) -> Result<String> {
        let dev = Arc::new(Device::new(driver, unit));
        let name = dev.name().to_string();
        let mut devices = lock(&self.devices)?;
        if devices.contains_key(&name) {
            return Err(Error::Dev(DevError::InvalidName));
        }
        if let Err(err) = dev.open() {
            // Removable media may be absent now and refreshed later.
            if err != Error::Dev(DevError::NotPresent) {
                return Err(err);
            }
        }
        devices.insert(name.clone(), dev);
        Ok(name)
    }

    /// Re-probes a device. On media change all dependent volumes become
    /// invalid until remounted and their buffered sectors are dropped.
    pub fn device_refresh(&self, dev_name: &str) -> Result<bool> {
        let dev = self.device(dev_name)?;
        let changed = dev.refresh()?;
        if changed {
            for slot in lock(&self.volumes)?.values() {
                if Arc::ptr_eq(&slot.dev, &dev) {
                    self.pool.discard_vol(slot.vol_id)?;
                }
            }
        }
        Ok(changed)
    }

    fn device(&self, dev_name: &str) -> Result<Arc<Device>> {
        lock(&self.devices)?
            .get(dev_name)
            .cloned()
            .ok_or(Error::Dev(DevError::InvalidName))
    }

    // ------------------------------------------------------------------ vol

    /// Mounts partition `partition_nbr` of `dev_name` and registers the
    /// volume under the device name. Returns the volume name.
    pub fn mount(
        &self,
        dev_name: &str,
        partition_nbr: u8,
        mode: AccessMode,
        journaled: bool,
    ) -> Result<String> {
        let dev = self.device(dev_name)?;
        let mut volumes = lock(&self.volumes)?;
        if volumes.contains_key(dev_name) {
            return Err(Error::Vol(VolError::InvalidOp));
        }
        if (volumes.len() + 1) * 2 > self.pool.count()? {
            error!("{dev_name}: buffer pool too small for another volume");
            return Err(Error::InvalidConfig);
        }
        if dev.state()? == DeviceState::Closed {
            dev.open()?;
        }
        let info = dev.info()?;
        if mode == AccessMode::ReadWrite && info.write_protected {
            return Err(Error::Dev(DevError::WriteProtected));
        }
        let span = partition::find(&dev, partition_nbr)?;
        let vol_id = self.next_vol_id.fetch_add(1, Ordering::Relaxed);
        let media_seq = dev.media_seq()?;

        let drivers = lock(&self.fs_drivers)?.clone();
        let mut sys = None;
        for driver in &drivers {
            let ctx = MountCtx {
                vol_id,
                dev: dev.clone(),
                pool: self.pool.clone(),
                base: span.start,
                sectors: span.sectors,
                read_only: mode == AccessMode::ReadOnly,
                journaled,
                now: self.clock.now(),
            };
            match driver.mount(ctx) {
                Ok(mounted) => {
                    sys = Some(mounted);
                    break;
                }
                Err(Error::Vol(VolError::InvalidSys)) => continue,
                Err(err) => return Err(err),
            }
        }
        let sys = sys.ok_or(Error::Vol(VolError::InvalidSys))?;

        dev.mark_mounted()?;
        info!("{dev_name}: mounted {}", sys.fs_type());
        volumes.insert(
            dev_name.to_string(),
            Arc::new(VolumeSlot { vol_id, dev, mode, media_seq, sys: Mutex::new(sys) }),
        );
        let mut default_vol = lock(&self.default_vol)?;
        if default_vol.is_none() {
            *default_vol = Some(dev_name.to_string());
        }
        Ok(dev_name.to_string())
    }

    /// Unmounts a volume, flushing all pending state first. Fails while any
    /// file or directory handle on the volume is open.
    pub fn unmount(&self, vol_name: &str) -> Result<()> {
        let mut volumes = lock(&self.volumes)?;
        let slot = volumes.get(vol_name).ok_or(Error::Vol(VolError::NotOpen))?.clone();
        if lock(&self.files)?
            .iter()
            .flatten()
            .any(|file| file.vol.vol_id == slot.vol_id)
        {
            return Err(Error::Vol(VolError::FilesOpen));
        }
        if lock(&self.dirs)?
            .iter()
            .flatten()
            .any(|dir| dir.vol.vol_id == slot.vol_id)
        {
            return Err(Error::Vol(VolError::DirsOpen));
        }
        if slot.dev.media_seq()? == slot.media_seq {
            lock(&slot.sys)?.sync()?;
            self.pool.flush_vol(slot.vol_id)?;
        }
        self.pool.discard_vol(slot.vol_id)?;
        slot.dev.mark_unmounted()?;
        volumes.remove(vol_name);
        let mut default_vol = lock(&self.default_vol)?;
        if default_vol.as_deref() == Some(vol_name) {
            *default_vol = volumes.keys().next().cloned();
        }
        Ok(())
    }

    /// Creates a file system on partition `partition_nbr` of `dev_name`.
    /// The device must not have a mounted volume.
    pub fn format(&self, dev_name: &str, partition_nbr: u8, params: &FormatParams) -> Result<()> {
        let dev = self.device(dev_name)?;
        if lock(&self.volumes)?.contains_key(dev_name) {
            return Err(Error::Vol(VolError::InvalidOp));
        }
        if dev.state()? == DeviceState::Closed {
            dev.open()?;
        }
        let span = partition::find(&dev, partition_nbr)?;
        let drivers = lock(&self.fs_drivers)?;
        let driver = drivers.first().ok_or(Error::Vol(VolError::InvalidSys))?;
        driver.format(&dev, span.start, span.sectors, params)
    }

    fn vol(&self, vol_name: &str) -> Result<Arc<VolumeSlot>> {
        let slot = lock(&self.volumes)?
            .get(vol_name)
            .cloned()
            .ok_or(Error::Vol(VolError::NotOpen))?;
        if slot.dev.media_seq()? != slot.media_seq {
            return Err(Error::Dev(DevError::Changed));
        }
        Ok(slot)
    }

    fn with_vol<R>(
        &self,
        vol_name: &str,
        write: bool,
        f: impl FnOnce(&mut dyn SysVolume) -> Result<R>,
    ) -> Result<R> {
        let slot = self.vol(vol_name)?;
        if write && slot.mode != AccessMode::ReadWrite {
            return Err(Error::Vol(VolError::InvalidOp));
        }
        let mut sys = lock(&slot.sys)?;
        if write && sys.read_only() {
            return Err(Error::Vol(VolError::InvalidOp));
        }
        f(sys.as_mut())
    }

    pub fn vol_query(&self, vol_name: &str) -> Result<VolumeUsage> {
        self.with_vol(vol_name, false, |sys| sys.query())
    }

    pub fn label_get(&self, vol_name: &str) -> Result<String> {
        self.with_vol(vol_name, false, |sys| sys.label())
    }

    pub fn label_set(&self, vol_name: &str, label: &str) -> Result<()> {
        let now = self.clock.now();
        self.with_vol(vol_name, true, |sys| sys.label_set(label, now))
    }

    pub fn vol_sync(&self, vol_name: &str) -> Result<()> {
        let slot = self.vol(vol_name)?;
        lock(&slot.sys)?.sync()?;
        self.pool.flush_vol(slot.vol_id)
    }

    pub fn journal_start(&self, vol_name: &str) -> Result<()> {
        let now = self.clock.now();
        self.with_vol(vol_name, true, |sys| sys.journal_start(now))
    }

    pub fn journal_stop(&self, vol_name: &str) -> Result<()> {
        self.with_vol(vol_name, true, |sys| sys.journal_stop())
    }

    // ----------------------------------------------------------------- path

    fn resolve(&self, path: &str) -> Result<FullPath> {
        let cwds = lock(&self.cwds)?;
        let cwd = cwds.get(&std::thread::current().id());
        let default_vol = lock(&self.default_vol)?;
        path::resolve(
            path,
            cwd,
            default_vol.as_deref(),
            self.cfg.max_name_len,
            self.cfg.max_path_len,
        )
    }

    fn path_key(full: &FullPath) -> String {
        full.join().to_lowercase()
    }

    /// Whether any open handle refers to `full`.
    fn entry_open(&self, full: &FullPath) -> Result<bool> {
        let key = Self::path_key(full);
        if lock(&self.files)?.iter().flatten().any(|file| file.path_key == key) {
            return Ok(true);
        }
        Ok(lock(&self.dirs)?.iter().flatten().any(|dir| dir.path_key == key))
    }

    /// Whether any open file handle on `full` has write access.
    fn entry_open_wr(&self, full: &FullPath) -> Result<bool> {
        let key = Self::path_key(full);
        Ok(lock(&self.files)?
            .iter()
            .flatten()
            .any(|file| file.path_key == key && file.node.as_ref().is_some_and(|node| node.flags.wr())))
    }

    // ---------------------------------------------------------------- entry

    pub fn entry_create(&self, path: &str, kind: EntryKind, exclusive: bool) -> Result<()> {
        let full = self.resolve(path)?;
        let now = self.clock.now();
        self.with_vol(&full.vol, true, |sys| {
            sys.entry_create(&full.path, kind, exclusive, now)
        })
    }

    pub fn entry_delete(&self, path: &str, mask: TypeMask) -> Result<()> {
        let full = self.resolve(path)?;
        if self.entry_open(&full)? {
            return Err(Error::Entry(EntryError::Open));
        }
        self.with_vol(&full.vol, true, |sys| sys.entry_delete(&full.path, mask))
    }

    /// Renames `old` to `new`. Across volumes this degrades to copy and
    /// delete, for files only.
    pub fn entry_rename(&self, old: &str, new: &str, exclusive: bool) -> Result<()> {
        let old_full = self.resolve(old)?;
        let new_full = self.resolve(new)?;
        if self.entry_open(&old_full)? || self.entry_open(&new_full)? {
            return Err(Error::Entry(EntryError::Open));
        }
        if old_full.vol == new_full.vol {
            let now = self.clock.now();
            return self.with_vol(&old_full.vol, true, |sys| {
                sys.entry_rename(&old_full.path, &new_full.path, exclusive, now)
            });
        }

        // Cross-volume: copy + delete, within one call but not atomically.
        let info = self.with_vol(&old_full.vol, false, |sys| sys.entry_query(&old_full.path))?;
        if info.is_dir() {
            return Err(Error::Entry(EntryError::VolsDiff));
        }
        let src = self.file_open(old, "r")?;
        let dst = match self.file_open(new, if exclusive { "wx" } else { "w" }) {
            Ok(dst) => dst,
            Err(err) => {
                self.file_close(src)?;
                return Err(err);
            }
        };
        let mut chunk = vec![0u8; 4096];
        let result = loop {
            match self.file_read(src, &mut chunk) {
                Ok(0) => break Ok(()),
                Ok(n) => {
                    if let Err(err) = self.file_write(dst, &chunk[..n]) {
                        break Err(err);
                    }
                }
                Err(err) => break Err(err),
            }
        };
        self.file_close(src)?;
        self.file_close(dst)?;
        result?;
        self.entry_delete(old, TypeMask::File)
    }

    pub fn entry_attrib_set(&self, path: &str, attrib: u8) -> Result<()> {
        let full = self.resolve(path)?;
        self.with_vol(&full.vol, true, |sys| sys.entry_attrib_set(&full.path, attrib))
    }

    pub fn entry_time_set(&self, path: &str, time: DateTime, which: TimeKind) -> Result<()> {
        let full = self.resolve(path)?;
        self.with_vol(&full.vol, true, |sys| sys.entry_time_set(&full.path, time, which))
    }

    pub fn entry_query(&self, path: &str) -> Result<EntryInfo> {
        let full = self.resolve(path)?;
        self.with_vol(&full.vol, false, |sys| sys.entry_query(&full.path))
    }

    // ----------------------------------------------------------------- file

    pub fn file_open(&self, path: &str, mode: &str) -> Result<FileHandle> {
        let flags = ModeFlags::parse(mode).ok_or(Error::InvalidConfig)?;
        self.file_open_flags(path, flags)
    }

    pub fn file_open_flags(&self, path: &str, flags: ModeFlags) -> Result<FileHandle> {
        if !flags.rd() && !flags.wr() {
            return Err(Error::InvalidConfig);
        }
        let full = self.resolve(path)?;
        // One writer or any number of readers per path.
        if flags.wr() && self.entry_open(&full)? {
            return Err(Error::Entry(EntryError::Open));
        }
        if !flags.wr() && self.entry_open_wr(&full)? {
            return Err(Error::Entry(EntryError::Open));
        }
        let now = self.clock.now();
        let slot = self.vol(&full.vol)?;
        if flags.wr() && slot.mode != AccessMode::ReadWrite {
            return Err(Error::Vol(VolError::InvalidOp));
        }
        let node = {
            let mut sys = lock(&slot.sys)?;
            if flags.wr() && sys.read_only() {
                return Err(Error::Vol(VolError::InvalidOp));
            }
            sys.file_open(&full.path, flags, now)?
        };

        let mut files = lock(&self.files)?;
        let Some(idx) = files.iter().position(Option::is_none) else {
            // Undo the open; the node holds no volume-side resources beyond
            // its entry reference.
            return Err(Error::NoHandleAvailable);
        };
        let gen = self.next_gen.fetch_add(1, Ordering::Relaxed);
        files[idx] = Some(OpenFile {
            gen,
            vol: slot,
            path_key: Self::path_key(&full),
            node: Some(node),
            eof: false,
            err: false,
        });
        Ok(FileHandle { slot: idx as u32, gen })
    }

    fn take_file(&self, handle: FileHandle) -> Result<(Arc<VolumeSlot>, FileNode)> {
        let mut files = lock(&self.files)?;
        let file = files
            .get_mut(handle.slot as usize)
            .and_then(Option::as_mut)
            .filter(|file| file.gen == handle.gen)
            .ok_or(Error::Vol(VolError::NotOpen))?;
        let node = file.node.take().ok_or(Error::Lock)?;
        Ok((file.vol.clone(), node))
    }

    fn put_file(
        &self,
        handle: FileHandle,
        node: FileNode,
        eof: Option<bool>,
        err: Option<bool>,
    ) -> Result<()> {
        let mut files = lock(&self.files)?;
        let file = files
            .get_mut(handle.slot as usize)
            .and_then(Option::as_mut)
            .filter(|file| file.gen == handle.gen)
            .ok_or(Error::Vol(VolError::NotOpen))?;
        file.node = Some(node);
        if let Some(eof) = eof {
            file.eof = eof;
        }
        if let Some(err) = err {
            file.err = err;
        }
        Ok(())
    }

    pub fn file_close(&self, handle: FileHandle) -> Result<()> {
        let (vol, mut node) = self.take_file(handle)?;
        let result = match lock(&vol.sys) {
            Ok(mut sys) => sys.file_close(&mut node),
            Err(err) => Err(err),
        };
        let mut files = lock(&self.files)?;
        if let Some(file) = files.get_mut(handle.slot as usize) {
            *file = None;
        }
        result
    }

    pub fn file_read(&self, handle: FileHandle, buf: &mut [u8]) -> Result<usize> {
        let (vol, mut node) = self.take_file(handle)?;
        if !node.flags.rd() {
            self.put_file(handle, node, None, Some(true))?;
            return Err(Error::Vol(VolError::InvalidOp));
        }
        let result = lock(&vol.sys).and_then(|mut sys| sys.file_read(&mut node, buf));
        match result {
            Ok(count) => {
                let eof = count < buf.len();
                self.put_file(handle, node, Some(eof), None)?;
                Ok(count)
            }
            Err(err) => {
                self.put_file(handle, node, None, Some(true))?;
                Err(err)
            }
        }
    }

    pub fn file_write(&self, handle: FileHandle, buf: &[u8]) -> Result<usize> {
        let (vol, mut node) = self.take_file(handle)?;
        if !node.flags.wr() {
            self.put_file(handle, node, None, Some(true))?;
            return Err(Error::Vol(VolError::InvalidOp));
        }
        let now = self.clock.now();
        let result = lock(&vol.sys).and_then(|mut sys| sys.file_write(&mut node, buf, now));
        match result {
            Ok(count) => {
                self.put_file(handle, node, None, None)?;
                Ok(count)
            }
            Err(err) => {
                self.put_file(handle, node, None, Some(true))?;
                Err(err)
            }
        }
    }

    /// Moves the file position. Positions beyond end-of-file are legal:
    /// reads there return zero bytes and writes zero-fill the gap. Clears
    /// the EOF indicator.
    pub fn file_seek(&self, handle: FileHandle, offset: i64, origin: Origin) -> Result<u64> {
        let (_, mut node) = self.take_file(handle)?;
        let base = match origin {
            Origin::Start => 0,
            Origin::Current => node.pos as i64,
            Origin::End => node.size as i64,
        };
        let Some(pos) = base.checked_add(offset).filter(|&pos| pos >= 0) else {
            self.put_file(handle, node, None, None)?;
            return Err(Error::InvalidConfig);
        };
        node.pos = pos as u64;
        let pos = node.pos;
        self.put_file(handle, node, Some(false), None)?;
        Ok(pos)
    }

    pub fn file_tell(&self, handle: FileHandle) -> Result<u64> {
        let files = lock(&self.files)?;
        let file = files
            .get(handle.slot as usize)
            .and_then(Option::as_ref)
            .filter(|file| file.gen == handle.gen)
            .ok_or(Error::Vol(VolError::NotOpen))?;
        Ok(file.node.as_ref().ok_or(Error::Lock)?.pos)
    }

    pub fn file_truncate(&self, handle: FileHandle, new_size: u32) -> Result<()> {
        let (vol, mut node) = self.take_file(handle)?;
        if !node.flags.wr() {
            self.put_file(handle, node, None, Some(true))?;
            return Err(Error::Vol(VolError::InvalidOp));
        }
        let now = self.clock.now();
        let result = lock(&vol.sys).and_then(|mut sys| sys.file_truncate(&mut node, new_size, now));
        self.put_file(handle, node, None, Some(result.is_err()))?;
        result
    }

    pub fn file_flush(&self, handle: FileHandle) -> Result<()> {
        let (vol, mut node) = self.take_file(handle)?;
        let result = lock(&vol.sys).and_then(|mut sys| sys.file_sync(&mut node));
        self.put_file(handle, node, None, None)?;
        result?;
        self.pool.flush_vol(vol.vol_id)
    }

    pub fn file_query(&self, handle: FileHandle) -> Result<FileInfo> {
        let files = lock(&self.files)?;
        let file = files
            .get(handle.slot as usize)
            .and_then(Option::as_ref)
            .filter(|file| file.gen == handle.gen)
            .ok_or(Error::Vol(VolError::NotOpen))?;
        let node = file.node.as_ref().ok_or(Error::Lock)?;
        Ok(FileInfo {
            size: node.size,
            pos: node.pos,
            eof: file.eof,
            err: file.err,
            attrib: node.attrib,
            write_time: node.write_time,
        })
    }

    /// Clears the sticky error and EOF indicators.
    pub fn file_clear_err(&self, handle: FileHandle) -> Result<()> {
        let mut files = lock(&self.files)?;
        let file = files
            .get_mut(handle.slot as usize)
            .and_then(Option::as_mut)
            .filter(|file| file.gen == handle.gen)
            .ok_or(Error::Vol(VolError::NotOpen))?;
        file.eof = false;
        file.err = false;
        Ok(())
    }

    // ------------------------------------------------------------------ dir

    pub fn dir_open(&self, path: &str) -> Result<DirHandle> {
        let full = self.resolve(path)?;
        let slot = self.vol(&full.vol)?;
        let node = lock(&slot.sys)?.dir_open(&full.path)?;
        let mut dirs = lock(&self.dirs)?;
        let Some(idx) = dirs.iter().position(Option::is_none) else {
            return Err(Error::NoHandleAvailable);
        };
        let gen = self.next_gen.fetch_add(1, Ordering::Relaxed);
        dirs[idx] = Some(OpenDir {
            gen,
            vol: slot,
            path_key: Self::path_key(&full),
            node: Some(node),
        });
        Ok(DirHandle { slot: idx as u32, gen })
    }

    pub fn dir_close(&self, handle: DirHandle) -> Result<()> {
        let mut dirs = lock(&self.dirs)?;
        dirs.get(handle.slot as usize)
            .and_then(Option::as_ref)
            .filter(|dir| dir.gen == handle.gen)
            .ok_or(Error::Vol(VolError::NotOpen))?;
        dirs[handle.slot as usize] = None;
        Ok(())
    }

    /// Reads the next entry of an open directory, `None` at the end.
    pub fn dir_read(&self, handle: DirHandle) -> Result<Option<EntryInfo>> {
        let (vol, mut node) = {
            let mut dirs = lock(&self.dirs)?;
            let dir = dirs
                .get_mut(handle.slot as usize)
                .and_then(Option::as_mut)
                .filter(|dir| dir.gen == handle.gen)
                .ok_or(Error::Vol(VolError::NotOpen))?;
            (dir.vol.clone(), dir.node.take().ok_or(Error::Lock)?)
        };
        let result = lock(&vol.sys).and_then(|mut sys| sys.dir_read(&mut node));
        let mut dirs = lock(&self.dirs)?;
        if let Some(dir) = dirs
            .get_mut(handle.slot as usize)
            .and_then(Option::as_mut)
            .filter(|dir| dir.gen == handle.gen)
        {
            dir.node = Some(node);
        }
        result
    }

    // ------------------------------------------------------------------ cwd

    /// Sets the calling task's working directory; the path must name an
    /// existing directory.
    pub fn cwd_set(&self, path: &str) -> Result<()> {
        let full = self.resolve(path)?;
        if !full.path.is_root() {
            let info = self.with_vol(&full.vol, false, |sys| sys.entry_query(&full.path))?;
            if !info.is_dir() {
                return Err(Error::Entry(EntryError::NotDir));
            }
        } else {
            // The volume must at least be mounted.
            self.vol(&full.vol)?;
        }
        lock(&self.cwds)?.insert(std::thread::current().id(), full);
        Ok(())
    }

    pub fn cwd_get(&self) -> Result<String> {
        if let Some(cwd) = lock(&self.cwds)?.get(&std::thread::current().id()) {
            return Ok(cwd.join());
        }
        let default_vol = lock(&self.default_vol)?;
        let vol = default_vol.as_deref().ok_or(Error::Vol(VolError::NotOpen))?;
        Ok(format!("{vol}/"))
    }

    /// Drops the calling task's working directory; called at task teardown.
    pub fn cwd_clear(&self) -> Result<()> {
        lock(&self.cwds)?.remove(&std::thread::current().id());
        Ok(())
    }
}
