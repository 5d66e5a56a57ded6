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
use tapir_err::{DevError, Error, Result};
use tapir_fs::{
    buf::SecKind,
    file::{ChainPos, FileNode},
};

use crate::{journal::Record, FatVolume};

impl FatVolume {
    /// Resolves `offset` to the cluster holding it, walking the chain from
    /// the handle's cached position when the seek moves forward, from the
    /// chain head otherwise. `None` when the chain is too short.
    pub(crate) fn chain_seek(&mut self, node: &mut FileNode, offset: u64) -> Result<Option<u32>> {
        if node.first_cluster == 0 {
            return Ok(None);
        }
        let target = (offset / self.layout.cluster_bytes() as u64) as u32;
        let (mut index, mut cluster) = match node.chain_pos {
            Some(ChainPos { index, cluster }) if index <= target => (index, cluster),
            _ => (0, node.first_cluster),
        };
        while index < target {
            match self.clus_next(cluster)? {
                Some(next) => {
                    cluster = next;
                    index += 1;
                }
                None => {
                    node.chain_pos = Some(ChainPos { index, cluster });
                    return Ok(None);
                }
            }
        }
        node.chain_pos = Some(ChainPos { index, cluster });
        Ok(Some(cluster))
    }

    /// Reads at the handle position, bounded by the recorded file size.
    /// Returns the byte count read; the handle position advances by it.
    pub(crate) fn chain_read(&mut self, node: &mut FileNode, buf: &mut [u8]) -> Result<usize> {
        let avail = (node.size as u64).saturating_sub(node.pos);
        let want = (buf.len() as u64).min(avail) as usize;
        let bps = self.layout.bytes_per_sec as u64;
        let mut done = 0;
        while done < want {
            let Some(cluster) = self.chain_seek(node, node.pos)? else {
                warn!("chain shorter than recorded size, short read");
                break;
            };
            let in_clus = node.pos % self.layout.cluster_bytes() as u64;
            let sector = self.layout.clus_to_sector(cluster) + in_clus / bps;
            let in_sec = (node.pos % bps) as usize;
            let len = ((bps as usize) - in_sec).min(want - done);
            let sbuf = self.buf(sector, SecKind::File, true)?;
            buf[done..done + len].copy_from_slice(&sbuf.bytes()[in_sec..in_sec + len]);
            self.put(sbuf);
            done += len;
            node.pos += len as u64;
        }
        Ok(done)
    }

    /// Extends the chain so that bytes `[0, end)` are addressable,
    /// allocating clusters under a journal transaction when one is active.
    pub(crate) fn chain_ensure(&mut self, node: &mut FileNode, end: u64) -> Result<()> {
        if end == 0 {
            return Ok(());
        }
        let cluster_bytes = self.layout.cluster_bytes() as u64;
        let needed = end.div_ceil(cluster_bytes) as u32;
        let (prev, have) = if node.first_cluster == 0 {
            (None, 0)
        } else {
            if self.chain_seek(node, end - 1)?.is_some() {
                return Ok(());
            }
            let (last, len) = self.clus_chain_last(node.first_cluster)?;
            (Some(last), len)
        };
        if have >= needed {
            return Ok(());
        }
        let count = needed - have;
        let clusters = self.clus_find_free(count, &[])?;
        self.jnl_begin()?;
        self.jnl_log(Record::ChainAlloc {
            prev: prev.unwrap_or(0),
            first: clusters[0],
            count,
        })?;
        self.jnl_commit()?;
        self.clus_mark_chain(&clusters, prev)?;
        if node.first_cluster == 0 {
            node.first_cluster = clusters[0];
            node.chain_pos = None;
            node.meta_dirty = true;
        }
        self.jnl_end()?;
        Ok(())
    }

    /// Writes `len` bytes at `offset` from `src`, or zeroes when `src` is
    /// `None`. The chain must already cover the range.
    pub(crate) fn chain_copy_in(
        &mut self,
        node: &mut FileNode,
        mut offset: u64,
        src: Option<&[u8]>,
        len: usize,
    ) -> Result<()> {
        let bps = self.layout.bytes_per_sec as u64;
        let mut done = 0;
        while done < len {
            let cluster = self
                .chain_seek(node, offset)?
                .ok_or(Error::Dev(DevError::InvalidSector))?;
            let in_clus = offset % self.layout.cluster_bytes() as u64;
            let sector = self.layout.clus_to_sector(cluster) + in_clus / bps;
            let in_sec = (offset % bps) as usize;
            let chunk = ((bps as usize) - in_sec).min(len - done);
            // A fully covered sector need not be read first.
            let full = in_sec == 0 && chunk == bps as usize;
            let mut sbuf = self.buf(sector, SecKind::File, !full)?;
            match src {
                Some(src) => {
                    sbuf.bytes_mut()[in_sec..in_sec + chunk]
                        .copy_from_slice(&src[done..done + chunk]);
                }
                None => sbuf.bytes_mut()[in_sec..in_sec + chunk].fill(0),
            }
            sbuf.mark_dirty();
            self.put(sbuf);
            done += chunk;
            offset += chunk as u64;
        }
        Ok(())
    }

    /// Writes at the handle position, extending the chain and zero-filling
    /// any gap between the recorded size and the position. Returns the byte
    /// count written; the handle position advances by it.
    pub(crate) fn chain_write(&mut self, node: &mut FileNode, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let end = node
            .pos
            .checked_add(buf.len() as u64)
            .filter(|&end| end <= u32::MAX as u64)
            .ok_or(Error::Dev(DevError::Full))?;
        self.chain_ensure(node, end)?;
        if node.pos > node.size as u64 {
            // Seek past end followed by a write zero-fills the gap.
            let gap = (node.pos - node.size as u64) as usize;
            self.chain_copy_in(node, node.size as u64, None, gap)?;
        }
        self.chain_copy_in(node, node.pos, Some(buf), buf.len())?;
        node.pos = end;
        if end > node.size as u64 {
            node.size = end as u32;
        }
        node.meta_dirty = true;
        Ok(buf.len())
    }

    /// Shrinks or grows the chain for a new recorded size.
    pub(crate) fn chain_resize(&mut self, node: &mut FileNode, new_size: u32) -> Result<()> {
        let cluster_bytes = self.layout.cluster_bytes();
        if (new_size as u64) < node.size as u64 {
            let keep = (new_size as u64).div_ceil(cluster_bytes as u64) as u32;
            if node.first_cluster != 0 {
                let (_, have) = self.clus_chain_last(node.first_cluster)?;
                if keep == 0 {
                    self.jnl_begin()?;
                    self.jnl_log(Record::ChainDel {
                        prev: 0,
                        first: node.first_cluster,
                        count: have,
                    })?;
                    self.jnl_commit()?;
                    let first = node.first_cluster;
                    node.first_cluster = 0;
                    self.clus_chain_free(first, None)?;
                    self.jnl_end()?;
                } else if have > keep {
                    // Walk to the new terminal cluster.
                    let mut last = node.first_cluster;
                    for _ in 1..keep {
                        last = self
                            .clus_next(last)?
                            .ok_or(Error::Entry(tapir_err::EntryError::Corrupt))?;
                    }
                    if let Some(first_freed) = self.clus_next(last)? {
                        self.jnl_begin()?;
                        self.jnl_log(Record::ChainDel {
                            prev: last,
                            first: first_freed,
                            count: have - keep,
                        })?;
                        self.jnl_commit()?;
                        self.fat_entry_write(last, self.layout.eoc())?;
                        self.clus_chain_free(first_freed, None)?;
                        self.jnl_end()?;
                    }
                }
            }
            node.chain_pos = None;
        } else if (new_size as u64) > node.size as u64 {
            self.chain_ensure(node, new_size as u64)?;
            // Zero the grown range so reads of it yield zero bytes.
            let gap = new_size - node.size;
            self.chain_copy_in(node, node.size as u64, None, gap as usize)?;
        }
        node.size = new_size;
        node.meta_dirty = true;
        Ok(())
    }
}
