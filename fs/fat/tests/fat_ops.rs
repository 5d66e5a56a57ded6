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

use tapir_ds_ram::RamDisk;
use tapir_fs::{
    clock::{DateTime, FixedClock},
    entry::{attrib, EntryKind, TimeKind, TypeMask},
    file::Origin,
    vol::{AccessMode, FormatParams, FsType},
    Config, EntryError, Error, FileSystem, NameError,
};

fn now() -> DateTime {
    DateTime { year: 2024, month: 3, day: 9, hour: 10, minute: 30, second: 24 }
}

fn new_fs() -> FileSystem {
    let fs = FileSystem::new(Config::default(), Box::new(FixedClock(now()))).unwrap();
    fs.register_fs(tapir_fs_fat::driver()).unwrap();
    fs
}

fn setup(sectors: u64, params: &FormatParams) -> (FileSystem, String) {
    let fs = new_fs();
    let name = fs.device_add(Arc::new(RamDisk::new(0, 512, sectors)), 0).unwrap();
    fs.format(&name, 0, params).unwrap();
    let vol = fs.mount(&name, 0, AccessMode::ReadWrite, false).unwrap();
    (fs, vol)
}

fn write_file(fs: &FileSystem, path: &str, data: &[u8]) {
    let handle = fs.file_open(path, "w").unwrap();
    assert_eq!(fs.file_write(handle, data).unwrap(), data.len());
    fs.file_close(handle).unwrap();
}

fn read_file(fs: &FileSystem, path: &str) -> Vec<u8> {
    let handle = fs.file_open(path, "r").unwrap();
    let size = fs.file_query(handle).unwrap().size as usize;
    let mut data = vec![0u8; size];
    assert_eq!(fs.file_read(handle, &mut data).unwrap(), size);
    fs.file_close(handle).unwrap();
    data
}

#[test]
fn write_close_reopen_reads_back() {
    let (fs, vol) = setup(16_384, &FormatParams::default());
    let path = format!("{vol}/roundtrip.bin");
    let data: Vec<u8> = (0..10_000u32).map(|at| at as u8).collect();
    write_file(&fs, &path, &data);
    assert_eq!(read_file(&fs, &path), data);
}

#[test]
fn long_name_round_trips_with_short_companion() {
    let (fs, vol) = setup(16_384, &FormatParams::default());
    let path = format!("{vol}/document with spaces.bin");
    write_file(&fs, &path, b"payload");

    // The listing yields the long name.
    let dir = fs.dir_open(&format!("{vol}/")).unwrap();
    let mut names = Vec::new();
    while let Some(info) = fs.dir_read(dir).unwrap() {
        names.push(info.name);
    }
    fs.dir_close(dir).unwrap();
    assert!(names.iter().any(|name| name == "document with spaces.bin"));

    // The uniquified 8.3 companion resolves too.
    let info = fs.entry_query(&format!("{vol}/DOCUME~1.BIN")).unwrap();
    assert_eq!(info.name, "document with spaces.bin");
    assert_eq!(info.size, 7);
}

#[test]
fn short_name_uniquification_escalates() {
    let (fs, vol) = setup(16_384, &FormatParams::default());
    // All collide on the DOCUME basis; the first four get ~1..~4, the next
    // ones hashed tails.
    for at in 0..6 {
        write_file(&fs, &format!("{vol}/document number {at}.txt"), &[at as u8]);
    }
    for at in 0..6 {
        let info = fs.entry_query(&format!("{vol}/document number {at}.txt")).unwrap();
        assert_eq!(info.size, 1);
    }
    assert_eq!(fs.entry_query(&format!("{vol}/DOCUME~1.TXT")).unwrap().size, 1);
    assert_eq!(fs.entry_query(&format!("{vol}/DOCUME~4.TXT")).unwrap().size, 1);
}

#[test]
fn rename_preserves_content_and_cluster() {
    let (fs, vol) = setup(16_384, &FormatParams::default());
    let old = format!("{vol}/document with spaces.bin");
    let new = format!("{vol}/renamed.bin");
    write_file(&fs, &old, b"payload");
    let first_cluster = fs.entry_query(&old).unwrap().first_cluster;

    fs.entry_rename(&old, &new, false).unwrap();
    assert!(matches!(fs.entry_query(&old), Err(Error::Entry(EntryError::NotFound))));
    let info = fs.entry_query(&new).unwrap();
    assert_eq!(info.first_cluster, first_cluster);
    assert_eq!(read_file(&fs, &new), b"payload");
}

#[test]
fn rename_back_and_forth_is_identity() {
    let (fs, vol) = setup(16_384, &FormatParams::default());
    let a = format!("{vol}/a.txt");
    let b = format!("{vol}/b.txt");
    write_file(&fs, &a, b"identity");
    fs.entry_rename(&a, &b, false).unwrap();
    fs.entry_rename(&b, &a, false).unwrap();
    assert_eq!(read_file(&fs, &a), b"identity");
    assert!(fs.entry_query(&b).is_err());
}

#[test]
fn rename_moves_directories_and_fixes_dotdot() {
    let (fs, vol) = setup(16_384, &FormatParams::default());
    fs.entry_create(&format!("{vol}/src"), EntryKind::Dir, false).unwrap();
    fs.entry_create(&format!("{vol}/dst"), EntryKind::Dir, false).unwrap();
    fs.entry_create(&format!("{vol}/src/inner"), EntryKind::Dir, false).unwrap();
    write_file(&fs, &format!("{vol}/src/inner/file.txt"), b"moved");

    fs.entry_rename(&format!("{vol}/src/inner"), &format!("{vol}/dst/inner"), false).unwrap();
    assert_eq!(read_file(&fs, &format!("{vol}/dst/inner/file.txt")), b"moved");
    // The on-disk `..` of the moved directory points at the new parent.
    let dst_cluster = fs.entry_query(&format!("{vol}/dst")).unwrap().first_cluster;
    let dir = fs.dir_open(&format!("{vol}/dst/inner")).unwrap();
    let _dot = fs.dir_read(dir).unwrap().unwrap();
    let dotdot = fs.dir_read(dir).unwrap().unwrap();
    assert_eq!(dotdot.name, "..");
    assert_eq!(dotdot.first_cluster, dst_cluster);
    fs.dir_close(dir).unwrap();

    // A directory cannot move into its own subtree.
    assert!(fs
        .entry_rename(&format!("{vol}/dst"), &format!("{vol}/dst/inner/loop"), false)
        .is_err());
}

#[test]
fn exclusive_flags_reject_existing() {
    let (fs, vol) = setup(16_384, &FormatParams::default());
    let path = format!("{vol}/once.txt");
    write_file(&fs, &path, b"first");
    assert!(matches!(
        fs.file_open(&path, "wx"),
        Err(Error::Entry(EntryError::Exists))
    ));
    assert!(matches!(
        fs.entry_create(&path, EntryKind::File, true),
        Err(Error::Entry(EntryError::Exists))
    ));
    assert!(matches!(
        fs.entry_rename(&format!("{vol}/other"), &path, true),
        Err(Error::Entry(EntryError::NotFound))
    ));
    write_file(&fs, &format!("{vol}/other"), b"x");
    assert!(matches!(
        fs.entry_rename(&format!("{vol}/other"), &path, true),
        Err(Error::Entry(EntryError::Exists))
    ));
}

#[test]
fn open_entry_conflicts() {
    let (fs, vol) = setup(16_384, &FormatParams::default());
    let path = format!("{vol}/busy.txt");
    write_file(&fs, &path, b"busy");

    let reader = fs.file_open(&path, "r").unwrap();
    // A second reader is fine, a writer is not.
    let reader2 = fs.file_open(&path, "r").unwrap();
    assert!(matches!(fs.file_open(&path, "r+"), Err(Error::Entry(EntryError::Open))));
    assert!(matches!(
        fs.entry_delete(&path, TypeMask::File),
        Err(Error::Entry(EntryError::Open))
    ));
    assert!(matches!(
        fs.entry_rename(&path, &format!("{vol}/elsewhere"), false),
        Err(Error::Entry(EntryError::Open))
    ));
    fs.file_close(reader).unwrap();
    fs.file_close(reader2).unwrap();
    fs.entry_delete(&path, TypeMask::File).unwrap();
}

#[test]
fn directory_lifecycle() {
    let (fs, vol) = setup(16_384, &FormatParams::default());
    fs.entry_create(&format!("{vol}/d"), EntryKind::Dir, false).unwrap();

    // A new directory carries the dot entries.
    let dir = fs.dir_open(&format!("{vol}/d")).unwrap();
    let dot = fs.dir_read(dir).unwrap().unwrap();
    let dotdot = fs.dir_read(dir).unwrap().unwrap();
    assert_eq!(dot.name, ".");
    assert_eq!(dotdot.name, "..");
    assert!(dot.is_dir() && dotdot.is_dir());
    assert!(fs.dir_read(dir).unwrap().is_none());
    fs.dir_close(dir).unwrap();

    write_file(&fs, &format!("{vol}/d/inside.txt"), b"x");
    assert!(matches!(
        fs.entry_delete(&format!("{vol}/d"), TypeMask::Dir),
        Err(Error::Entry(EntryError::NotEmpty))
    ));
    assert!(matches!(
        fs.entry_delete(&format!("{vol}/d/inside.txt"), TypeMask::Dir),
        Err(Error::Entry(EntryError::NotDir))
    ));
    fs.entry_delete(&format!("{vol}/d/inside.txt"), TypeMask::File).unwrap();
    fs.entry_delete(&format!("{vol}/d"), TypeMask::Dir).unwrap();
    assert!(fs.entry_query(&format!("{vol}/d")).is_err());
}

#[test]
fn directory_extends_past_one_cluster() {
    let (fs, vol) = setup(16_384, &FormatParams::default());
    fs.entry_create(&format!("{vol}/many"), EntryKind::Dir, false).unwrap();
    // Far more 8.3 entries than one cluster holds.
    for at in 0..200 {
        fs.entry_create(&format!("{vol}/many/F{at}"), EntryKind::File, false).unwrap();
    }
    let dir = fs.dir_open(&format!("{vol}/many")).unwrap();
    let mut count = 0;
    while let Some(info) = fs.dir_read(dir).unwrap() {
        if info.name != "." && info.name != ".." {
            count += 1;
        }
    }
    fs.dir_close(dir).unwrap();
    assert_eq!(count, 200);
}

#[test]
fn fixed_root_reports_full() {
    let params = FormatParams {
        fs_type: Some(FsType::Fat12),
        root_entries: Some(16),
        ..Default::default()
    };
    let (fs, vol) = setup(2880, &params);
    for at in 0..16 {
        fs.entry_create(&format!("{vol}/R{at}"), EntryKind::File, false).unwrap();
    }
    assert!(matches!(
        fs.entry_create(&format!("{vol}/R16"), EntryKind::File, false),
        Err(Error::Entry(EntryError::DirFull))
    ));
}

#[test]
fn concurrent_directory_scans_are_independent() {
    let (fs, vol) = setup(16_384, &FormatParams::default());
    for at in 0..10 {
        write_file(&fs, &format!("{vol}/file{at}.txt"), &[at as u8]);
    }
    let first = fs.dir_open(&format!("{vol}/")).unwrap();
    let second = fs.dir_open(&format!("{vol}/")).unwrap();
    let mut seen_first = Vec::new();
    let mut seen_second = Vec::new();
    // Interleave the two scans.
    loop {
        let a = fs.dir_read(first).unwrap();
        let b = fs.dir_read(second).unwrap();
        if let Some(info) = a {
            seen_first.push(info.name);
        }
        if let Some(info) = b {
            seen_second.push(info.name);
        } else if seen_first.len() == seen_second.len() {
            break;
        }
    }
    fs.dir_close(first).unwrap();
    fs.dir_close(second).unwrap();
    assert_eq!(seen_first, seen_second);
    assert_eq!(seen_first.len(), 10);
}

#[test]
fn name_length_boundaries() {
    let (fs, vol) = setup(16_384, &FormatParams::default());
    let name_255: String = "x".repeat(255);
    write_file(&fs, &format!("{vol}/{name_255}"), b"long");
    assert_eq!(read_file(&fs, &format!("{vol}/{name_255}")), b"long");

    let name_256: String = "x".repeat(256);
    assert!(matches!(
        fs.file_open(&format!("{vol}/{name_256}"), "w"),
        Err(Error::Name(NameError::BaseTooLong))
    ));
    assert!(matches!(
        fs.file_open(&format!("{vol}/bad?.txt"), "w"),
        Err(Error::Name(NameError::Invalid))
    ));
}

#[test]
fn seek_past_end_zero_fills() {
    let (fs, vol) = setup(16_384, &FormatParams::default());
    let handle = fs.file_open(&format!("{vol}/sparse.bin"), "w+").unwrap();
    fs.file_write(handle, b"head").unwrap();
    fs.file_seek(handle, 100, Origin::Start).unwrap();
    // Reads past the end yield nothing and set EOF.
    let mut probe = [1u8; 4];
    assert_eq!(fs.file_read(handle, &mut probe).unwrap(), 0);
    assert!(fs.file_query(handle).unwrap().eof);

    fs.file_write(handle, &[0xFF]).unwrap();
    assert_eq!(fs.file_query(handle).unwrap().size, 101);
    fs.file_seek(handle, 0, Origin::Start).unwrap();
    let mut data = vec![0xEEu8; 101];
    assert_eq!(fs.file_read(handle, &mut data).unwrap(), 101);
    assert_eq!(&data[..4], b"head");
    assert!(data[4..100].iter().all(|&byte| byte == 0));
    assert_eq!(data[100], 0xFF);
    fs.file_close(handle).unwrap();
}

#[test]
fn seek_to_end_reports_size() {
    let (fs, vol) = setup(16_384, &FormatParams::default());
    let handle = fs.file_open(&format!("{vol}/sized.bin"), "w").unwrap();
    fs.file_write(handle, &[0u8; 1234]).unwrap();
    let end = fs.file_seek(handle, 0, Origin::End).unwrap();
    assert_eq!(end, 1234);
    assert_eq!(fs.file_tell(handle).unwrap(), 1234);
    fs.file_seek(handle, -234, Origin::Current).unwrap();
    assert_eq!(fs.file_tell(handle).unwrap(), 1000);
    fs.file_close(handle).unwrap();
}

#[test]
fn truncate_shrinks_and_grows() {
    let (fs, vol) = setup(16_384, &FormatParams::default());
    let path = format!("{vol}/resize.bin");
    let handle = fs.file_open(&path, "w+").unwrap();
    fs.file_write(handle, &[0x77u8; 5000]).unwrap();

    fs.file_truncate(handle, 1000).unwrap();
    assert_eq!(fs.file_query(handle).unwrap().size, 1000);

    fs.file_truncate(handle, 3000).unwrap();
    fs.file_seek(handle, 0, Origin::Start).unwrap();
    let mut data = vec![0xEEu8; 3000];
    assert_eq!(fs.file_read(handle, &mut data).unwrap(), 3000);
    assert!(data[..1000].iter().all(|&byte| byte == 0x77));
    assert!(data[1000..].iter().all(|&byte| byte == 0));
    fs.file_close(handle).unwrap();
}

#[test]
fn append_mode_writes_at_end() {
    let (fs, vol) = setup(16_384, &FormatParams::default());
    let path = format!("{vol}/log.txt");
    write_file(&fs, &path, b"one ");
    let handle = fs.file_open(&path, "a").unwrap();
    fs.file_write(handle, b"two").unwrap();
    fs.file_close(handle).unwrap();
    assert_eq!(read_file(&fs, &path), b"one two");
}

#[test]
fn write_across_cluster_boundary_with_odd_chunks() {
    let params = FormatParams { sec_per_clus: Some(2), ..Default::default() };
    let (fs, vol) = setup(16_384, &params);
    let path = format!("{vol}/chunks.bin");
    let handle = fs.file_open(&path, "w").unwrap();
    // 700-byte chunks against 512-byte sectors and 1024-byte clusters.
    let mut expected = Vec::new();
    for at in 0..7u8 {
        let chunk = vec![at; 700];
        fs.file_write(handle, &chunk).unwrap();
        expected.extend_from_slice(&chunk);
    }
    fs.file_close(handle).unwrap();
    assert_eq!(read_file(&fs, &path), expected);
}

#[test]
fn attributes_guard_writes_and_deletes() {
    let (fs, vol) = setup(16_384, &FormatParams::default());
    let path = format!("{vol}/locked.txt");
    write_file(&fs, &path, b"guarded");

    fs.entry_attrib_set(&path, attrib::READ_ONLY | attrib::HIDDEN).unwrap();
    let info = fs.entry_query(&path).unwrap();
    assert_eq!(info.attrib & attrib::READ_ONLY, attrib::READ_ONLY);
    assert!(matches!(fs.file_open(&path, "r+"), Err(Error::Entry(EntryError::ReadOnly))));
    assert!(matches!(
        fs.entry_delete(&path, TypeMask::File),
        Err(Error::Entry(EntryError::ReadOnly))
    ));

    fs.entry_attrib_set(&path, 0).unwrap();
    fs.entry_delete(&path, TypeMask::File).unwrap();
}

#[test]
fn time_set_updates_stamps() {
    let (fs, vol) = setup(16_384, &FormatParams::default());
    let path = format!("{vol}/stamped.txt");
    write_file(&fs, &path, b"t");
    let stamp = DateTime { year: 1999, month: 12, day: 31, hour: 23, minute: 59, second: 58 };
    fs.entry_time_set(&path, stamp, TimeKind::Modify).unwrap();
    let info = fs.entry_query(&path).unwrap();
    assert_eq!(info.write.year, 1999);
    assert_eq!(info.write.minute, 59);

    fs.entry_time_set(&path, stamp, TimeKind::All).unwrap();
    let info = fs.entry_query(&path).unwrap();
    assert_eq!(info.create.year, 1999);
    assert_eq!(info.access.year, 1999);
}

#[test]
fn working_directory_composition() {
    let (fs, vol) = setup(16_384, &FormatParams::default());
    fs.entry_create(&format!("{vol}/work"), EntryKind::Dir, false).unwrap();
    fs.cwd_set(&format!("{vol}/work")).unwrap();
    assert_eq!(fs.cwd_get().unwrap(), format!("{vol}/work"));

    write_file(&fs, "notes.txt", b"relative");
    assert_eq!(read_file(&fs, &format!("{vol}/work/notes.txt")), b"relative");
    assert_eq!(read_file(&fs, "../work/notes.txt"), b"relative");

    assert!(matches!(
        fs.cwd_set(&format!("{vol}/work/notes.txt")),
        Err(Error::Entry(EntryError::NotDir))
    ));
    fs.cwd_clear().unwrap();
}

#[test]
fn cross_volume_rename_copies_files_only() {
    let fs = new_fs();
    let first = fs.device_add(Arc::new(RamDisk::new(0, 512, 8192)), 0).unwrap();
    let second = fs.device_add(Arc::new(RamDisk::new(1, 512, 8192)), 1).unwrap();
    fs.format(&first, 0, &FormatParams::default()).unwrap();
    fs.format(&second, 0, &FormatParams::default()).unwrap();
    let first = fs.mount(&first, 0, AccessMode::ReadWrite, false).unwrap();
    let second = fs.mount(&second, 0, AccessMode::ReadWrite, false).unwrap();

    write_file(&fs, &format!("{first}/mover.bin"), &[0x42; 3000]);
    fs.entry_rename(&format!("{first}/mover.bin"), &format!("{second}/mover.bin"), false)
        .unwrap();
    assert!(fs.entry_query(&format!("{first}/mover.bin")).is_err());
    assert_eq!(read_file(&fs, &format!("{second}/mover.bin")), vec![0x42; 3000]);

    fs.entry_create(&format!("{first}/subdir"), EntryKind::Dir, false).unwrap();
    assert!(matches!(
        fs.entry_rename(&format!("{first}/subdir"), &format!("{second}/subdir"), false),
        Err(Error::Entry(EntryError::VolsDiff))
    ));
}

#[test]
fn error_and_eof_indicators_clear() {
    let (fs, vol) = setup(16_384, &FormatParams::default());
    let path = format!("{vol}/flags.txt");
    write_file(&fs, &path, b"abc");
    let handle = fs.file_open(&path, "r").unwrap();

    let mut buf = [0u8; 8];
    assert_eq!(fs.file_read(handle, &mut buf).unwrap(), 3);
    assert!(fs.file_query(handle).unwrap().eof);

    // Writing through a read-only handle trips the error indicator.
    assert!(fs.file_write(handle, b"nope").is_err());
    assert!(fs.file_query(handle).unwrap().err);

    fs.file_clear_err(handle).unwrap();
    let info = fs.file_query(handle).unwrap();
    assert!(!info.eof && !info.err);
    fs.file_close(handle).unwrap();
}
