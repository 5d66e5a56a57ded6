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

use tapir_err::{EntryError, Error, NameError, Result};
use tapir_fs::{
    clock::DateTime,
    dir::DirNode,
    entry::{attrib, EntryInfo, EntryKind, TimeKind, TypeMask},
    file::{EntrySlotRef, ModeFlags},
    path::VPath,
    vol::FsType,
};
use zerocopy::little_endian::U16;

use crate::{
    dir::{DirCursor, ParsedEntry, RawDirEntry},
    journal::Record,
    FatVolume,
};

impl FatVolume {
    fn root_info(&self) -> EntryInfo {
        EntryInfo {
            name: String::new(),
            kind: EntryKind::Dir,
            attrib: attrib::DIRECTORY,
            size: 0,
            first_cluster: if self.layout.fs_type == FsType::Fat32 {
                self.layout.root_clus
            } else {
                0
            },
            create: DateTime::default(),
            write: DateTime::default(),
            access: DateTime::default(),
        }
    }

    pub(crate) fn fat_entry_query(&mut self, path: &VPath) -> Result<EntryInfo> {
        if path.is_root() {
            return Ok(self.root_info());
        }
        let (_, entry) = self.locate(path)?.ok_or(Error::Entry(EntryError::NotFound))?;
        Ok(self.entry_info(&entry))
    }

    pub(crate) fn fat_entry_create(
        &mut self,
        path: &VPath,
        kind: EntryKind,
        exclusive: bool,
        now: DateTime,
    ) -> Result<()> {
        if path.is_root() {
            return Err(Error::Entry(EntryError::Exists));
        }
        if let Some((_, existing)) = self.locate(path)? {
            if exclusive {
                return Err(Error::Entry(EntryError::Exists));
            }
            if existing.kind() != kind {
                return Err(Error::Entry(EntryError::TypeDiff));
            }
            return match kind {
                // Recreating an existing file truncates it.
                EntryKind::File => {
                    let flags = ModeFlags::from_bits(ModeFlags::WR | ModeFlags::TRUNCATE);
                    let mut node = self.fat_file_open(path, flags, now)?;
                    self.fat_file_sync(&mut node)
                }
                EntryKind::Dir => Ok(()),
            };
        }

        let (dir, base) = self.locate_parent(path)?;
        let base = base.to_string();
        let plan = self.place_plan(dir, &base)?;
        let exclude = plan
            .extend
            .as_ref()
            .map(|(_, clusters)| clusters.as_slice())
            .unwrap_or_default();

        self.jnl_begin()?;
        if let Some((last, clusters)) = &plan.extend {
            self.jnl_log(Record::ChainAlloc {
                prev: *last,
                first: clusters[0],
                count: clusters.len() as u32,
            })?;
        }
        let dir_clus = match kind {
            EntryKind::Dir => {
                let run = self.clus_find_free(1, exclude)?;
                self.jnl_log(Record::ChainAlloc { prev: 0, first: run[0], count: 1 })?;
                Some(run[0])
            }
            EntryKind::File => None,
        };
        self.jnl_log(Record::EntryCreate {
            parent: dir,
            first_index: plan.first_index,
            count: plan.slots,
        })?;
        self.jnl_commit()?;

        let (attr, first_cluster) = match dir_clus {
            Some(clus) => {
                self.clus_mark_chain(&[clus], None)?;
                self.clus_zero(clus)?;
                self.dir_init_dots(clus, dir, now)?;
                (attrib::DIRECTORY, clus)
            }
            None => (attrib::ARCHIVE, 0),
        };
        let raw = RawDirEntry::new(plan.sfn, attr, first_cluster, 0, now);
        self.place_commit(&plan, raw)?;
        self.jnl_end()
    }

    pub(crate) fn fat_entry_delete(&mut self, path: &VPath, mask: TypeMask) -> Result<()> {
        if path.is_root() {
            return Err(Error::Entry(EntryError::RootDir));
        }
        let (dir, entry) = self.locate(path)?.ok_or(Error::Entry(EntryError::NotFound))?;
        match (entry.kind(), mask) {
            (EntryKind::Dir, TypeMask::File) => return Err(Error::Entry(EntryError::NotFile)),
            (EntryKind::File, TypeMask::Dir) => return Err(Error::Entry(EntryError::NotDir)),
            _ => {}
        }
        if entry.raw.dir_attr & attrib::READ_ONLY != 0 {
            return Err(Error::Entry(EntryError::ReadOnly));
        }
        if self.jnl_guards(dir, entry.sfn_index) {
            return Err(Error::Entry(EntryError::Open));
        }
        let first_cluster = entry.raw.first_cluster();
        if entry.kind() == EntryKind::Dir {
            if first_cluster == 0 {
                return Err(self.corrupt());
            }
            if !self.dir_is_empty(first_cluster)? {
                return Err(Error::Entry(EntryError::NotEmpty));
            }
        }

        let er = entry.slot_ref(dir);
        self.jnl_begin()?;
        self.jnl_log(Record::EntryDelete {
            parent: dir,
            first_index: er.run_first(),
            count: er.run_len() as u8,
            chain_first: first_cluster,
        })?;
        self.jnl_commit()?;
        self.entry_erase(dir, er.run_first(), er.run_len())?;
        if first_cluster != 0 {
            self.clus_chain_free(first_cluster, None)?;
        }
        self.jnl_end()
    }

    pub(crate) fn fat_entry_rename(
        &mut self,
        old: &VPath,
        new: &VPath,
        exclusive: bool,
        _now: DateTime,
    ) -> Result<()> {
        if old.is_root() || new.is_root() {
            return Err(Error::Entry(EntryError::RootDir));
        }
        let (old_dir, old_entry) =
            self.locate(old)?.ok_or(Error::Entry(EntryError::NotFound))?;
        if self.jnl_guards(old_dir, old_entry.sfn_index) {
            return Err(Error::Entry(EntryError::Open));
        }

        let same_entry = |candidate: &ParsedEntry, dir: u32| {
            dir == old_dir && candidate.sfn_index == old_entry.sfn_index
        };
        if let Some((new_dir, existing)) = self.locate(new)? {
            if same_entry(&existing, new_dir) {
                if existing.name == new.base().unwrap_or_default() {
                    // Identity rename.
                    return Ok(());
                }
                // Case-only rename falls through to the move below.
            } else {
                if exclusive {
                    return Err(Error::Entry(EntryError::Exists));
                }
                if existing.kind() != old_entry.kind() {
                    return Err(Error::Entry(EntryError::TypeDiff));
                }
                // Renaming onto an existing entry replaces it.
                self.fat_entry_delete(
                    new,
                    match existing.kind() {
                        EntryKind::File => TypeMask::File,
                        EntryKind::Dir => TypeMask::Dir,
                    },
                )?;
            }
        }

        let (new_dir, new_base) = self.locate_parent(new)?;
        let new_base = new_base.to_string();
        if old_entry.kind() == EntryKind::Dir && new_dir != old_dir {
            // A directory must not move into its own subtree.
            let moved = old_entry.raw.first_cluster();
            let mut cursor = new_dir;
            let mut depth = 0;
            while cursor != 0 {
                if cursor == moved {
                    return Err(Error::Name(NameError::Invalid));
                }
                let mut cur = DirCursor::at(cursor, 1);
                let dotdot = self
                    .dir_slot_read(&mut cur)?
                    .ok_or(Error::Entry(EntryError::Corrupt))?;
                cursor = dotdot.first_cluster();
                depth += 1;
                if depth > self.layout.cluster_count {
                    return Err(self.corrupt());
                }
            }
        }

        let old_er = old_entry.slot_ref(old_dir);
        let plan = self.place_plan(new_dir, &new_base)?;
        self.jnl_begin()?;
        if let Some((last, clusters)) = &plan.extend {
            self.jnl_log(Record::ChainAlloc {
                prev: *last,
                first: clusters[0],
                count: clusters.len() as u32,
            })?;
        }
        self.jnl_log(Record::EntryUpdate {
            old_parent: old_dir,
            old_first: old_er.run_first(),
            old_count: old_er.run_len() as u8,
            new_parent: new_dir,
            new_first: plan.first_index,
            new_count: plan.slots,
        })?;
        self.jnl_commit()?;

        // The short-name slot moves as-is: attributes, timestamps, first
        // cluster and size survive the rename.
        let mut raw = old_entry.raw;
        raw.dir_name = plan.sfn;
        self.place_commit(&plan, raw)?;
        self.entry_erase(old_dir, old_er.run_first(), old_er.run_len())?;
        if old_entry.kind() == EntryKind::Dir && new_dir != old_dir {
            // The moved directory's `..` follows it to the new parent.
            let moved = old_entry.raw.first_cluster();
            let er = EntrySlotRef { dir_first_cluster: moved, slot: 1, lfn_count: 0 };
            self.entry_update(&er, |dotdot| dotdot.set_first_cluster(new_dir))?;
        }
        self.jnl_end()
    }

    pub(crate) fn fat_entry_attrib_set(&mut self, path: &VPath, bits: u8) -> Result<()> {
        if bits & !attrib::SETTABLE != 0 {
            return Err(Error::InvalidConfig);
        }
        if path.is_root() {
            return Err(Error::Entry(EntryError::RootDir));
        }
        let (dir, entry) = self.locate(path)?.ok_or(Error::Entry(EntryError::NotFound))?;
        let er = entry.slot_ref(dir);
        self.entry_update(&er, |raw| {
            raw.dir_attr = raw.dir_attr & !attrib::SETTABLE | bits;
        })
    }

    pub(crate) fn fat_entry_time_set(
        &mut self,
        path: &VPath,
        time: DateTime,
        which: TimeKind,
    ) -> Result<()> {
        if path.is_root() {
            return Err(Error::Entry(EntryError::RootDir));
        }
        let (dir, entry) = self.locate(path)?.ok_or(Error::Entry(EntryError::NotFound))?;
        let er = entry.slot_ref(dir);
        let date = U16::new(time.pack_date());
        let hms = U16::new(time.pack_time());
        self.entry_update(&er, |raw| match which {
            TimeKind::Create => {
                raw.dir_crtdate = date;
                raw.dir_crttime = hms;
            }
            TimeKind::Modify => {
                raw.dir_wrtdate = date;
                raw.dir_wrttime = hms;
            }
            TimeKind::Access => {
                raw.dir_lstaccdate = date;
            }
            TimeKind::All => {
                raw.dir_crtdate = date;
                raw.dir_crttime = hms;
                raw.dir_wrtdate = date;
                raw.dir_wrttime = hms;
                raw.dir_lstaccdate = date;
            }
        })
    }

    pub(crate) fn fat_dir_open(&mut self, path: &VPath) -> Result<DirNode> {
        if path.is_root() {
            return Ok(DirNode { first_cluster: 0, offset: 0 });
        }
        let (_, entry) = self.locate(path)?.ok_or(Error::Entry(EntryError::NotFound))?;
        if !entry.raw.is_dir() {
            return Err(Error::Entry(EntryError::NotDir));
        }
        Ok(DirNode { first_cluster: entry.raw.first_cluster(), offset: 0 })
    }

    pub(crate) fn fat_dir_read(&mut self, node: &mut DirNode) -> Result<Option<EntryInfo>> {
        let mut cur = DirCursor::at(node.first_cluster, node.offset);
        let entry = self.dir_next_entry(&mut cur)?;
        node.offset = cur.index;
        Ok(entry.map(|entry| self.entry_info(&entry)))
    }
}
