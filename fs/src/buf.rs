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

use std::sync::{Arc, Mutex, MutexGuard};

use log::error;
use tapir_ds::Device;
use tapir_err::{Error, Result};

/// What a buffered sector holds. Informs eviction preference only; a buffer
/// of any type behaves identically otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecKind {
    /// Boot sector, FSInfo and other volume management sectors.
    Mgmt,
    DirEntry,
    File,
    FatTable,
}

struct Bind {
    vol_id: u64,
    dev: Arc<Device>,
    sector: u64,
    sector_size: usize,
    kind: SecKind,
}

struct Slot {
    /// `None` while the buffer is checked out.
    data: Option<Box<[u8]>>,
    bind: Option<Bind>,
    dirty: bool,
    stamp: u64,
}

/// An exclusively held, sector-sized buffer bound to one on-device sector.
///
/// At most one holder exists per sector at a time; holders release promptly,
/// and any nested acquisition must be released before re-entering the buffer
/// path. Dropping a `SectorBuf` without releasing it loses the slot, so all
/// paths hand buffers back through [`BufPool::release`].
pub struct SectorBuf {
    data: Box<[u8]>,
    slot: usize,
    vol_id: u64,
    dev: Arc<Device>,
    sector: u64,
    sector_size: usize,
    kind: SecKind,
    dirty: bool,
}

impl SectorBuf {
    pub fn sector(&self) -> u64 {
        self.sector
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.sector_size]
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data[..self.sector_size]
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Writes the buffer through to the device if dirty.
    pub fn flush(&mut self) -> Result<()> {
        if self.dirty {
            self.dev.write(self.sector, 1, &self.data[..self.sector_size])?;
            self.dirty = false;
        }
        Ok(())
    }
}

/// Fixed set of sector-sized buffers shared across all mounted volumes.
///
/// The pool never blocks: when every buffer is checked out, acquisition
/// fails with `NoBufferAvailable` and the caller retries at the next
/// operation boundary.
pub struct BufPool {
    max_sector_size: usize,
    inner: Mutex<PoolInner>,
}

struct PoolInner {
    slots: Vec<Slot>,
    stamp: u64,
}

impl BufPool {
    pub fn new(count: usize, max_sector_size: usize) -> Self {
        let slots = (0..count)
            .map(|_| Slot {
                data: Some(vec![0u8; max_sector_size].into_boxed_slice()),
                bind: None,
                dirty: false,
                stamp: 0,
            })
            .collect();
        Self { max_sector_size, inner: Mutex::new(PoolInner { slots, stamp: 0 }) }
    }

    pub fn count(&self) -> Result<usize> {
        Ok(self.lock()?.slots.len())
    }

    fn lock(&self) -> Result<MutexGuard<'_, PoolInner>> {
        self.inner.lock().map_err(|_| Error::Lock)
    }

    /// Acquires the buffer for `(vol_id, sector)`, reading the sector from
    /// the device unless it is already cached or `must_read` is false (in
    /// which case the buffer comes back zeroed for full overwrite).
    pub fn acquire(
        &self,
        vol_id: u64,
        dev: &Arc<Device>,
        sector: u64,
        kind: SecKind,
        must_read: bool,
    ) -> Result<SectorBuf> {
        let sector_size = dev.info()?.sector_size as usize;
        if sector_size > self.max_sector_size {
            return Err(Error::InvalidConfig);
        }
        let mut inner = self.lock()?;
        inner.stamp += 1;
        let stamp = inner.stamp;

        // Cache hit: hand out the resident copy, dirty state included.
        if let Some(idx) = inner.slots.iter().position(|slot| {
            slot.bind.as_ref().is_some_and(|bind| bind.vol_id == vol_id && bind.sector == sector)
        }) {
            let slot = &mut inner.slots[idx];
            let Some(data) = slot.data.take() else {
                // The sector is checked out already; nested acquisition of
                // the same sector is a caller error surfaced as exhaustion.
                return Err(Error::NoBufferAvailable);
            };
            slot.stamp = stamp;
            let dirty = slot.dirty;
            slot.dirty = false;
            return Ok(SectorBuf {
                data,
                slot: idx,
                vol_id,
                dev: dev.clone(),
                sector,
                sector_size,
                kind,
                dirty,
            });
        }

        // Miss: free slot, else the least-recently-used resident slot,
        // preferring clean victims over dirty ones.
        let victim = inner
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.data.is_some())
            .min_by_key(|(_, slot)| (slot.bind.is_some(), slot.dirty, slot.stamp))
            .map(|(idx, _)| idx)
            .ok_or(Error::NoBufferAvailable)?;

        let slot = &mut inner.slots[victim];
        if slot.dirty {
            // A dirty buffer is flushed before it is rebound.
            let bind = slot.bind.as_ref().ok_or(Error::InvalidConfig)?;
            let data = slot.data.as_ref().ok_or(Error::NoBufferAvailable)?;
            bind.dev.write(bind.sector, 1, &data[..bind.sector_size])?;
            slot.dirty = false;
        }
        let mut data = slot.data.take().ok_or(Error::NoBufferAvailable)?;
        slot.bind = None;
        slot.stamp = stamp;

        if must_read {
            if let Err(err) = dev.read(sector, 1, &mut data[..sector_size]) {
                inner.slots[victim].data = Some(data);
                return Err(err);
            }
        } else {
            data[..sector_size].fill(0);
        }
        Ok(SectorBuf {
            data,
            slot: victim,
            vol_id,
            dev: dev.clone(),
            sector,
            sector_size,
            kind,
            dirty: false,
        })
    }

    /// Returns a buffer to the pool. The contents stay resident (and possibly
    /// dirty) until the slot is reused, flushed or discarded.
    pub fn release(&self, buf: SectorBuf) {
        let Ok(mut inner) = self.lock() else {
            error!("buffer pool poisoned, sector {} lost", buf.sector);
            return;
        };
        let slot = &mut inner.slots[buf.slot];
        slot.bind = Some(Bind {
            vol_id: buf.vol_id,
            dev: buf.dev,
            sector: buf.sector,
            sector_size: buf.sector_size,
            kind: buf.kind,
        });
        slot.dirty = buf.dirty;
        slot.data = Some(buf.data);
    }

    /// Writes all dirty resident buffers of `vol_id` through to their device.
    pub fn flush_vol(&self, vol_id: u64) -> Result<()> {
        let mut inner = self.lock()?;
        for slot in &mut inner.slots {
            let Some(bind) = slot.bind.as_ref() else { continue };
            if bind.vol_id != vol_id || !slot.dirty {
                continue;
            }
            let data = slot.data.as_ref().ok_or(Error::NoBufferAvailable)?;
            bind.dev.write(bind.sector, 1, &data[..bind.sector_size])?;
            slot.dirty = false;
        }
        Ok(())
    }

    /// Drops all resident buffers of `vol_id` without writing them back.
    pub fn discard_vol(&self, vol_id: u64) -> Result<()> {
        let mut inner = self.lock()?;
        for slot in &mut inner.slots {
            if slot.bind.as_ref().is_some_and(|bind| bind.vol_id == vol_id) {
                slot.bind = None;
                slot.dirty = false;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tapir_ds_ram::RamDisk;

    fn device() -> Arc<Device> {
        let dev = Arc::new(Device::new(Arc::new(RamDisk::new(0, 512, 32)), 0));
        dev.open().unwrap();
        dev
    }

    #[test]
    fn write_back_through_eviction() {
        let dev = device();
        let pool = BufPool::new(2, 512);

        let mut buf = pool.acquire(1, &dev, 5, SecKind::File, false).unwrap();
        buf.bytes_mut().fill(0x5A);
        buf.mark_dirty();
        pool.release(buf);

        // Evict by cycling more sectors than the pool holds.
        for sector in 10..14 {
            let buf = pool.acquire(1, &dev, sector, SecKind::File, true).unwrap();
            pool.release(buf);
        }

        let buf = pool.acquire(1, &dev, 5, SecKind::File, true).unwrap();
        assert!(buf.bytes().iter().all(|&byte| byte == 0x5A));
        pool.release(buf);
    }

    #[test]
    fn exhaustion_is_reported() {
        let dev = device();
        let pool = BufPool::new(2, 512);
        let a = pool.acquire(1, &dev, 0, SecKind::Mgmt, true).unwrap();
        let b = pool.acquire(1, &dev, 1, SecKind::Mgmt, true).unwrap();
        assert!(matches!(
            pool.acquire(1, &dev, 2, SecKind::Mgmt, true),
            Err(Error::NoBufferAvailable)
        ));
        pool.release(a);
        pool.release(b);
        let c = pool.acquire(1, &dev, 2, SecKind::Mgmt, true).unwrap();
        pool.release(c);
    }

    #[test]
    fn discard_loses_unflushed_writes() {
        let dev = device();
        let pool = BufPool::new(2, 512);
        let mut buf = pool.acquire(1, &dev, 3, SecKind::File, false).unwrap();
        buf.bytes_mut().fill(0xEE);
        buf.mark_dirty();
        pool.release(buf);
        pool.discard_vol(1).unwrap();

        let mut raw = [0u8; 512];
        dev.read(3, 1, &mut raw).unwrap();
        assert!(raw.iter().all(|&byte| byte == 0));
    }

    #[test]
    fn cache_hit_preserves_dirty_data() {
        let dev = device();
        let pool = BufPool::new(2, 512);
        let mut buf = pool.acquire(1, &dev, 7, SecKind::DirEntry, false).unwrap();
        buf.bytes_mut()[0] = 0xAB;
        buf.mark_dirty();
        pool.release(buf);

        let buf = pool.acquire(1, &dev, 7, SecKind::DirEntry, true).unwrap();
        assert_eq!(buf.bytes()[0], 0xAB);
        assert!(buf.is_dirty());
        pool.release(buf);
    }
}
