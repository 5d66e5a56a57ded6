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

use tapir_err::{EntryError, Error, Result};
use tapir_fs::{
    clock::DateTime,
    entry::attrib,
    file::{FileNode, ModeFlags},
    path::VPath,
};
use zerocopy::little_endian::U16;

use crate::{dir::RawDirEntry, journal::Record, FatVolume};

impl FatVolume {
    /// Rewrites the directory entry of an open file from its handle state:
    /// size, first cluster, write time. A single-slot rewrite is atomic at
    /// sector granularity and needs no journaling.
    pub(crate) fn node_entry_update(&mut self, node: &mut FileNode) -> Result<()> {
        let entry = node.entry;
        let size = node.size;
        let first_cluster = node.first_cluster;
        let date = node.write_time.pack_date();
        let time = node.write_time.pack_time();
        self.entry_update(&entry, |raw| {
            raw.dir_filesize = size.into();
            raw.set_first_cluster(first_cluster);
            raw.dir_wrtdate = U16::new(date);
            raw.dir_wrttime = U16::new(time);
            raw.dir_lstaccdate = U16::new(date);
            raw.dir_attr |= attrib::ARCHIVE;
        })?;
        node.meta_dirty = false;
        Ok(())
    }

    pub(crate) fn fat_file_open(
        &mut self,
        path: &VPath,
        flags: ModeFlags,
        now: DateTime,
    ) -> Result<FileNode> {
        if path.is_root() {
            return Err(Error::Entry(EntryError::NotFile));
        }
        let located = self.locate(path)?;
        let mut node = match located {
            Some((dir, entry)) => {
                if flags.contains(ModeFlags::EXCL) {
                    return Err(Error::Entry(EntryError::Exists));
                }
                if entry.raw.is_dir() {
                    return Err(Error::Entry(EntryError::NotFile));
                }
                if flags.wr()
                    && (entry.raw.dir_attr & attrib::READ_ONLY != 0
                        || self.jnl_guards(dir, entry.sfn_index))
                {
                    return Err(Error::Entry(EntryError::ReadOnly));
                }
                FileNode {
                    entry: entry.slot_ref(dir),
                    attrib: entry.raw.dir_attr,
                    first_cluster: entry.raw.first_cluster(),
                    size: entry.raw.dir_filesize.get(),
                    pos: 0,
                    flags,
                    chain_pos: None,
                    meta_dirty: false,
                    write_time: DateTime::unpack(
                        entry.raw.dir_wrtdate.get(),
                        entry.raw.dir_wrttime.get(),
                    ),
                }
            }
            None => {
                if !flags.contains(ModeFlags::CREATE) {
                    return Err(Error::Entry(EntryError::NotFound));
                }
                let (dir, base) = self.locate_parent(path)?;
                let base = base.to_string();
                let plan = self.place_plan(dir, &base)?;
                self.jnl_begin()?;
                if let Some((last, clusters)) = &plan.extend {
                    self.jnl_log(Record::ChainAlloc {
                        prev: *last,
                        first: clusters[0],
                        count: clusters.len() as u32,
                    })?;
                }
                self.jnl_log(Record::EntryCreate {
                    parent: dir,
                    first_index: plan.first_index,
                    count: plan.slots,
                })?;
                self.jnl_commit()?;
                let raw = RawDirEntry::new(plan.sfn, attrib::ARCHIVE, 0, 0, now);
                self.place_commit(&plan, raw)?;
                self.jnl_end()?;
                FileNode {
                    entry: plan.slot_ref(),
                    attrib: attrib::ARCHIVE,
                    first_cluster: 0,
                    size: 0,
                    pos: 0,
                    flags,
                    chain_pos: None,
                    meta_dirty: false,
                    write_time: now,
                }
            }
        };
        if flags.contains(ModeFlags::TRUNCATE) && node.size > 0 {
            self.fat_file_truncate(&mut node, 0, now)?;
        }
        Ok(node)
    }

    pub(crate) fn fat_file_write(
        &mut self,
        node: &mut FileNode,
        buf: &[u8],
        now: DateTime,
    ) -> Result<usize> {
        if node.flags.contains(ModeFlags::APPEND) {
            node.pos = node.size as u64;
        }
        let count = self.chain_write(node, buf)?;
        if count > 0 {
            node.write_time = now;
            node.meta_dirty = true;
            if !node.flags.contains(ModeFlags::CACHED) {
                self.node_entry_update(node)?;
            }
        }
        Ok(count)
    }

    pub(crate) fn fat_file_truncate(
        &mut self,
        node: &mut FileNode,
        new_size: u32,
        now: DateTime,
    ) -> Result<()> {
        if new_size != node.size {
            self.chain_resize(node, new_size)?;
        }
        node.write_time = now;
        node.meta_dirty = true;
        self.node_entry_update(node)
    }

    pub(crate) fn fat_file_sync(&mut self, node: &mut FileNode) -> Result<()> {
        if node.meta_dirty {
            self.node_entry_update(node)?;
        }
        self.flush_bufs()
    }
}
