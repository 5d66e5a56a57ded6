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

use std::sync::Arc;

use tapir_ds::DeviceDriver;
use tapir_ds_ram::RamDisk;
use tapir_fs::{
    clock::{DateTime, FixedClock},
    vol::{AccessMode, FormatParams, FsType},
    Config, DevError, Error, FileSystem, VolError,
};

fn now() -> DateTime {
    DateTime { year: 2024, month: 3, day: 9, hour: 10, minute: 30, second: 24 }
}

fn new_fs() -> FileSystem {
    let fs = FileSystem::new(Config::default(), Box::new(FixedClock(now()))).unwrap();
    fs.register_fs(tapir_fs_fat::driver()).unwrap();
    fs
}

fn setup(
    sectors: u64,
    params: &FormatParams,
    mode: AccessMode,
    journaled: bool,
) -> (FileSystem, Arc<RamDisk>, String) {
    let fs = new_fs();
    let disk = Arc::new(RamDisk::new(0, 512, sectors));
    let name = fs.device_add(disk.clone(), 0).unwrap();
    fs.format(&name, 0, params).unwrap();
    let vol = fs.mount(&name, 0, mode, journaled).unwrap();
    (fs, disk, vol)
}

#[test]
fn format_and_mount_fat16() {
    let params = FormatParams {
        fs_type: Some(FsType::Fat16),
        sec_per_clus: Some(4),
        ..Default::default()
    };
    let (fs, _, vol) = setup(131_072, &params, AccessMode::ReadWrite, false);

    // A fresh volume holds exactly the root directory.
    let dir = fs.dir_open(&format!("{vol}/")).unwrap();
    assert!(fs.dir_read(dir).unwrap().is_none());
    fs.dir_close(dir).unwrap();

    let usage = fs.vol_query(&vol).unwrap();
    assert_eq!(usage.total_sectors, 131_072);
    assert_eq!(usage.cluster_sectors, 4);
    assert_eq!(usage.used_sectors, 0);
    assert_eq!(usage.bad_sectors, 0);
    assert!(usage.free_sectors > 0);
}

#[test]
fn fresh_format_and_create() {
    // 64 MiB, FAT16, four sectors per cluster.
    let params = FormatParams {
        fs_type: Some(FsType::Fat16),
        sec_per_clus: Some(4),
        ..Default::default()
    };
    let (fs, disk, vol) = setup(131_072, &params, AccessMode::ReadWrite, false);
    let path = format!("{vol}/hello.txt");

    let handle = fs.file_open(&path, "w").unwrap();
    assert_eq!(fs.file_write(handle, b"Hello").unwrap(), 5);
    fs.file_close(handle).unwrap();

    fs.unmount(&vol).unwrap();
    let vol = fs.mount(&vol, 0, AccessMode::ReadWrite, false).unwrap();

    let handle = fs.file_open(&path, "r").unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(fs.file_read(handle, &mut buf).unwrap(), 5);
    assert_eq!(&buf[..5], b"Hello");
    let info = fs.file_query(handle).unwrap();
    assert_eq!(info.size, 5);
    assert!(info.eof);
    fs.file_close(handle).unwrap();

    // The single-cluster chain terminates in end-of-chain on disk.
    let first_cluster = fs.entry_query(&path).unwrap().first_cluster;
    assert!(first_cluster >= 2);
    let off = first_cluster as usize * 2;
    let mut sector = [0u8; 512];
    disk.read(0, 1 + (off / 512) as u64, 1, &mut sector).unwrap();
    let entry = u16::from_le_bytes([sector[off % 512], sector[off % 512 + 1]]);
    assert!(entry >= 0xFFF8);
}

#[test]
fn free_count_tracks_allocation() {
    let params = FormatParams {
        fs_type: Some(FsType::Fat16),
        sec_per_clus: Some(4),
        ..Default::default()
    };
    let (fs, _, vol) = setup(131_072, &params, AccessMode::ReadWrite, false);
    let free_before = fs.vol_query(&vol).unwrap().free_sectors;

    let handle = fs.file_open(&format!("{vol}/five.bin"), "w").unwrap();
    fs.file_write(handle, &[1u8; 5]).unwrap();
    fs.file_close(handle).unwrap();

    let usage = fs.vol_query(&vol).unwrap();
    assert_eq!(usage.free_sectors, free_before - 4);
    assert_eq!(usage.used_sectors, 4);

    fs.entry_delete(&format!("{vol}/five.bin"), tapir_fs::entry::TypeMask::File).unwrap();
    assert_eq!(fs.vol_query(&vol).unwrap().free_sectors, free_before);
}

#[test]
fn label_roundtrip() {
    let (fs, _, vol) = setup(8192, &FormatParams::default(), AccessMode::ReadWrite, false);
    assert_eq!(fs.label_get(&vol).unwrap(), "NO NAME");
    fs.label_set(&vol, "myvol").unwrap();
    assert_eq!(fs.label_get(&vol).unwrap(), "MYVOL");
    assert!(matches!(
        fs.label_set(&vol, "way too long label"),
        Err(Error::Vol(VolError::LabelInvalid))
    ));

    fs.unmount(&vol).unwrap();
    let vol = fs.mount(&vol, 0, AccessMode::ReadWrite, false).unwrap();
    assert_eq!(fs.label_get(&vol).unwrap(), "MYVOL");
}

#[test]
fn read_only_mount_refuses_writes() {
    let (fs, _, vol) = setup(8192, &FormatParams::default(), AccessMode::ReadWrite, false);
    let handle = fs.file_open(&format!("{vol}/data"), "w").unwrap();
    fs.file_write(handle, &[0u8; 32]).unwrap();
    fs.file_close(handle).unwrap();
    fs.unmount(&vol).unwrap();

    let vol = fs.mount(&vol, 0, AccessMode::ReadOnly, false).unwrap();
    assert!(matches!(
        fs.file_open(&format!("{vol}/data"), "w"),
        Err(Error::Vol(VolError::InvalidOp))
    ));
    assert!(matches!(
        fs.entry_create(&format!("{vol}/new"), tapir_fs::entry::EntryKind::File, false),
        Err(Error::Vol(VolError::InvalidOp))
    ));
    // Reading still works.
    let handle = fs.file_open(&format!("{vol}/data"), "r").unwrap();
    let mut buf = [0u8; 32];
    assert_eq!(fs.file_read(handle, &mut buf).unwrap(), 32);
    fs.file_close(handle).unwrap();
}

#[test]
fn write_protected_device_refuses_rdwr_mount() {
    let fs = new_fs();
    let disk = Arc::new(RamDisk::new(0, 512, 8192));
    let name = fs.device_add(disk.clone(), 0).unwrap();
    fs.format(&name, 0, &FormatParams::default()).unwrap();
    disk.set_write_protected(true);
    assert!(matches!(
        fs.mount(&name, 0, AccessMode::ReadWrite, false),
        Err(Error::Dev(DevError::WriteProtected))
    ));
    fs.mount(&name, 0, AccessMode::ReadOnly, false).unwrap();
}

#[test]
fn unmount_refuses_open_handles() {
    let (fs, _, vol) = setup(8192, &FormatParams::default(), AccessMode::ReadWrite, false);
    let handle = fs.file_open(&format!("{vol}/open.bin"), "w").unwrap();
    assert!(matches!(fs.unmount(&vol), Err(Error::Vol(VolError::FilesOpen))));
    fs.file_close(handle).unwrap();

    let dir = fs.dir_open(&format!("{vol}/")).unwrap();
    assert!(matches!(fs.unmount(&vol), Err(Error::Vol(VolError::DirsOpen))));
    fs.dir_close(dir).unwrap();
    fs.unmount(&vol).unwrap();
}

#[test]
fn mount_rejects_garbage() {
    let fs = new_fs();
    let disk = Arc::new(RamDisk::new(0, 512, 1024));
    let name = fs.device_add(disk, 0).unwrap();
    assert!(matches!(
        fs.mount(&name, 0, AccessMode::ReadWrite, false),
        Err(Error::Vol(VolError::InvalidSys))
    ));
}

#[test]
fn fat12_and_fat32_volumes_operate() {
    // FAT12: floppy-sized.
    let (fs, _, vol) = setup(2880, &FormatParams::default(), AccessMode::ReadWrite, false);
    let handle = fs.file_open(&format!("{vol}/floppy.txt"), "w+").unwrap();
    fs.file_write(handle, &[0xAB; 1500]).unwrap();
    fs.file_seek(handle, 0, tapir_fs::file::Origin::Start).unwrap();
    let mut buf = vec![0u8; 1500];
    assert_eq!(fs.file_read(handle, &mut buf).unwrap(), 1500);
    assert!(buf.iter().all(|&byte| byte == 0xAB));
    fs.file_close(handle).unwrap();

    // FAT32: past the FAT16 cluster threshold.
    let params = FormatParams {
        fs_type: Some(FsType::Fat32),
        sec_per_clus: Some(1),
        ..Default::default()
    };
    let (fs, _, vol) = setup(70_000, &params, AccessMode::ReadWrite, false);
    fs.entry_create(&format!("{vol}/nest"), tapir_fs::entry::EntryKind::Dir, false).unwrap();
    let handle = fs.file_open(&format!("{vol}/nest/deep.bin"), "w").unwrap();
    fs.file_write(handle, &[0x5A; 4096]).unwrap();
    fs.file_close(handle).unwrap();
    fs.unmount(&vol).unwrap();
    let vol = fs.mount(&vol, 0, AccessMode::ReadWrite, false).unwrap();
    let info = fs.entry_query(&format!("{vol}/nest/deep.bin")).unwrap();
    assert_eq!(info.size, 4096);
}

#[test]
fn journaled_volume_survives_remount() {
    let (fs, _, vol) = setup(16_384, &FormatParams::default(), AccessMode::ReadWrite, true);

    // The journal lives as a hidden file in the root directory.
    let info = fs.entry_query(&format!("{vol}/{}", tapir_fs_fat::JOURNAL_NAME)).unwrap();
    assert_eq!(info.size, tapir_fs_fat::JOURNAL_BYTES);

    // It cannot be deleted while journaling is active.
    assert!(fs
        .entry_delete(
            &format!("{vol}/{}", tapir_fs_fat::JOURNAL_NAME),
            tapir_fs::entry::TypeMask::Any
        )
        .is_err());

    let handle = fs.file_open(&format!("{vol}/logged.txt"), "w").unwrap();
    fs.file_write(handle, b"journaled write").unwrap();
    fs.file_close(handle).unwrap();
    fs.entry_create(&format!("{vol}/logged-dir"), tapir_fs::entry::EntryKind::Dir, false)
        .unwrap();

    fs.unmount(&vol).unwrap();
    let vol = fs.mount(&vol, 0, AccessMode::ReadWrite, true).unwrap();
    assert_eq!(fs.entry_query(&format!("{vol}/logged.txt")).unwrap().size, 15);
    assert!(fs.entry_query(&format!("{vol}/logged-dir")).unwrap().is_dir());

    fs.journal_stop(&vol).unwrap();
    fs.journal_start(&vol).unwrap();
    fs.unmount(&vol).unwrap();
}
