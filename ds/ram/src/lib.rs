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

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Mutex,
};

use tapir_ds::{DeviceDriver, DeviceInfo, IoCtl};
use tapir_err::{DevError, Error, Result};

/// A volatile sector store backed by heap memory.
///
/// The contents survive close/open cycles for as long as the driver instance
/// is alive, which makes the driver suitable both for bring-up on targets
/// without storage hardware and for crash-consistency tests (discarding all
/// unflushed buffers and remounting observes exactly the sectors that were
/// written through).
pub struct RamDisk {
    unit: u8,
    sector_size: u32,
    sector_count: u64,
    write_protected: AtomicBool,
    data: Mutex<Vec<u8>>,
}

impl RamDisk {
    pub fn new(unit: u8, sector_size: u32, sector_count: u64) -> Self {
        Self {
            unit,
            sector_size,
            sector_count,
            write_protected: AtomicBool::new(false),
            data: Mutex::new(vec![0; sector_size as usize * sector_count as usize]),
        }
    }

    pub fn set_write_protected(&self, write_protected: bool) {
        self.write_protected.store(write_protected, Ordering::SeqCst);
    }

    fn check_unit(&self, unit: u8) -> Result<()> {
        if unit != self.unit {
            return Err(Error::Dev(DevError::InvalidUnit));
        }
        Ok(())
    }

    fn span(&self, start: u64, count: u32) -> Result<std::ops::Range<usize>> {
        let end = start
            .checked_add(count as u64)
            .filter(|&end| end <= self.sector_count)
            .ok_or(Error::Dev(DevError::InvalidSector))?;
        Ok(start as usize * self.sector_size as usize..end as usize * self.sector_size as usize)
    }
}

impl DeviceDriver for RamDisk {
    fn name(&self) -> &'static str {
        "ram"
    }

    fn open(&self, unit: u8) -> Result<DeviceInfo> {
        self.check_unit(unit)?;
        self.query(unit)
    }

    fn close(&self, _unit: u8) {}

    fn query(&self, unit: u8) -> Result<DeviceInfo> {
        self.check_unit(unit)?;
        Ok(DeviceInfo {
            sector_size: self.sector_size,
            sector_count: self.sector_count,
            fixed: true,
            write_protected: self.write_protected.load(Ordering::SeqCst),
        })
    }

    fn read(&self, unit: u8, start: u64, count: u32, buffer: &mut [u8]) -> Result<()> {
        self.check_unit(unit)?;
        let span = self.span(start, count)?;
        let data = self.data.lock().map_err(|_| Error::Lock)?;
        buffer[..span.len()].copy_from_slice(&data[span]);
        Ok(())
    }

    fn write(&self, unit: u8, start: u64, count: u32, buffer: &[u8]) -> Result<()> {
        self.check_unit(unit)?;
        if self.write_protected.load(Ordering::SeqCst) {
            return Err(Error::Dev(DevError::WriteProtected));
        }
        let span = self.span(start, count)?;
        let mut data = self.data.lock().map_err(|_| Error::Lock)?;
        let len = span.len();
        data[span].copy_from_slice(&buffer[..len]);
        Ok(())
    }

    fn io_ctl(&self, unit: u8, _op: IoCtl) -> Result<()> {
        self.check_unit(unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let disk = RamDisk::new(0, 512, 8);
        let sector = [0xA5u8; 512];
        disk.write(0, 3, 1, &sector).unwrap();
        let mut back = [0u8; 512];
        disk.read(0, 3, 1, &mut back).unwrap();
        assert_eq!(sector, back);
    }

    #[test]
    fn out_of_range_rejected() {
        let disk = RamDisk::new(0, 512, 8);
        let mut buf = [0u8; 512];
        assert_eq!(disk.read(0, 8, 1, &mut buf), Err(Error::Dev(DevError::InvalidSector)));
    }

    #[test]
    fn write_protect() {
        let disk = RamDisk::new(0, 512, 8);
        disk.set_write_protected(true);
        let sector = [0u8; 512];
        assert_eq!(disk.write(0, 0, 1, &sector), Err(Error::Dev(DevError::WriteProtected)));
    }
}
