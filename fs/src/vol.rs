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

use std::sync::{Arc, Mutex};

use tapir_ds::Device;
use tapir_err::Result;

use crate::{
    buf::BufPool,
    clock::DateTime,
    dir::DirNode,
    entry::{EntryInfo, EntryKind, TimeKind, TypeMask},
    file::{FileNode, ModeFlags},
    path::VPath,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsType {
    Fat12,
    Fat16,
    Fat32,
}

impl std::fmt::Display for FsType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            FsType::Fat12 => "FAT12",
            FsType::Fat16 => "FAT16",
            FsType::Fat32 => "FAT32",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

/// Sector accounting reported by `vol_query`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeUsage {
    pub total_sectors: u64,
    pub free_sectors: u64,
    pub used_sectors: u64,
    pub bad_sectors: u64,
    pub cluster_sectors: u32,
}

/// Parameters for `fmt`. `None` fields are derived from the medium size.
#[derive(Debug, Clone, Default)]
pub struct FormatParams {
    pub fs_type: Option<FsType>,
    pub sec_per_clus: Option<u8>,
    pub num_fats: Option<u8>,
    pub root_entries: Option<u16>,
    pub label: Option<String>,
}

/// Everything a file system implementation needs to mount over a sector
/// span of a device.
pub struct MountCtx {
    pub vol_id: u64,
    pub dev: Arc<Device>,
    pub pool: Arc<BufPool>,
    /// First sector of the volume on the device.
    pub base: u64,
    /// Sector count of the volume.
    pub sectors: u64,
    pub read_only: bool,
    pub journaled: bool,
    /// Mount timestamp, for journal-file creation and replay bookkeeping.
    pub now: DateTime,
}

/// A mounted file system instance. One exists per mounted volume, guarded by
/// the per-volume lock; every method runs with that lock held, which makes
/// metadata operations on a volume linearizable.
pub trait SysVolume: Send {
    fn fs_type(&self) -> FsType;
    fn query(&mut self) -> Result<VolumeUsage>;
    fn label(&mut self) -> Result<String>;
    fn label_set(&mut self, label: &str, now: DateTime) -> Result<()>;
    /// Flushes all pending table, directory and data state to the device.
    fn sync(&mut self) -> Result<()>;
    /// Whether the volume rejects writes (mounted read-only, write-protected
    /// media, or forced read-only after structural corruption).
    fn read_only(&self) -> bool;

    fn journal_start(&mut self, now: DateTime) -> Result<()>;
    fn journal_stop(&mut self) -> Result<()>;

    fn entry_query(&mut self, path: &VPath) -> Result<EntryInfo>;
    fn entry_create(
        &mut self,
        path: &VPath,
        kind: EntryKind,
        exclusive: bool,
        now: DateTime,
    ) -> Result<()>;
    fn entry_delete(&mut self, path: &VPath, mask: TypeMask) -> Result<()>;
    fn entry_rename(
        &mut self,
        old: &VPath,
        new: &VPath,
        exclusive: bool,
        now: DateTime,
    ) -> Result<()>;
    fn entry_attrib_set(&mut self, path: &VPath, attrib: u8) -> Result<()>;
    fn entry_time_set(&mut self, path: &VPath, time: DateTime, which: TimeKind) -> Result<()>;

    fn file_open(&mut self, path: &VPath, flags: ModeFlags, now: DateTime) -> Result<FileNode>;
    fn file_read(&mut self, node: &mut FileNode, buf: &mut [u8]) -> Result<usize>;
    fn file_write(&mut self, node: &mut FileNode, buf: &[u8], now: DateTime) -> Result<usize>;
    fn file_truncate(&mut self, node: &mut FileNode, new_size: u32, now: DateTime) -> Result<()>;
    /// Rewrites the directory entry if the handle's metadata is dirty and
    /// flushes the file's sectors.
    fn file_sync(&mut self, node: &mut FileNode) -> Result<()>;
    fn file_close(&mut self, node: &mut FileNode) -> Result<()>;

    fn dir_open(&mut self, path: &VPath) -> Result<DirNode>;
    fn dir_read(&mut self, node: &mut DirNode) -> Result<Option<EntryInfo>>;
}

/// A mountable file system type. Implementations probe the on-disk format
/// and produce a `SysVolume` on success.
pub trait FsDriver: Send + Sync {
    fn name(&self) -> &'static str;
    fn mount(&self, ctx: MountCtx) -> Result<Box<dyn SysVolume>>;
    fn format(
        &self,
        dev: &Arc<Device>,
        base: u64,
        sectors: u64,
        params: &FormatParams,
    ) -> Result<()>;
}

/// A mounted volume as tracked by the registry.
pub(crate) struct VolumeSlot {
    pub vol_id: u64,
    pub dev: Arc<Device>,
    pub mode: AccessMode,
    /// Device media sequence at mount time; a mismatch means the media
    /// changed under the volume.
    pub media_seq: u64,
    pub sys: Mutex<Box<dyn SysVolume>>,
}
