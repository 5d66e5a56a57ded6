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

pub use tapir_err::{DevError, Error, Result};

use std::sync::{Arc, Mutex, MutexGuard};

use log::{info, warn};

/// Geometry and media properties reported by a driver for one open unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Sector size in bytes, one of 512, 1024, 2048 or 4096.
    pub sector_size: u32,
    /// Total number of sectors on the medium.
    pub sector_count: u64,
    /// Whether the medium is fixed (cannot be removed or exchanged).
    pub fixed: bool,
    /// Whether the medium rejects writes.
    pub write_protected: bool,
}

impl DeviceInfo {
    pub fn validate(&self) -> Result<()> {
        if !matches!(self.sector_size, 512 | 1024 | 2048 | 4096) {
            return Err(Error::Dev(DevError::InvalidConfig));
        }
        if self.sector_count == 0 {
            return Err(Error::Dev(DevError::InvalidConfig));
        }
        Ok(())
    }
}

/// Driver control operations that do not move sector data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoCtl {
    /// Re-probe the medium.
    Refresh,
    /// Flush any driver-internal write caching to the medium.
    Sync,
}

/// A hardware (or simulated) block device driver.
///
/// One driver instance may serve several units. All sector transfers use
/// `sector_size`-sized chunks aligned on sector boundaries; a transfer is
/// atomic at sector granularity (a sector is either fully updated or the
/// driver reports a failure). A `count` of zero is a no-op.
pub trait DeviceDriver: Send + Sync {
    /// Short driver name, used as the first component of device names
    /// (`"ram"` in `"ram:0:"`).
    fn name(&self) -> &'static str;

    /// Opens a unit and reports its geometry.
    fn open(&self, unit: u8) -> Result<DeviceInfo>;

    /// Closes a unit.
    fn close(&self, unit: u8);

    /// Re-queries the geometry of an open unit.
    fn query(&self, unit: u8) -> Result<DeviceInfo>;

    /// Reads `count` sectors starting at `start` into `buffer`.
    fn read(&self, unit: u8, start: u64, count: u32, buffer: &mut [u8]) -> Result<()>;

    /// Writes `count` sectors starting at `start` from `buffer`.
    fn write(&self, unit: u8, start: u64, count: u32, buffer: &[u8]) -> Result<()>;

    /// Performs a control operation on an open unit.
    fn io_ctl(&self, unit: u8, op: IoCtl) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// Unit not opened, or medium reported absent.
    Closed,
    /// Medium present and geometry known.
    Present,
    /// At least one volume is mounted on the device.
    Mounted,
}

struct DeviceCtl {
    state: DeviceState,
    info: Option<DeviceInfo>,
    /// Bumped whenever a refresh observes different media. Volumes remember
    /// the value at mount time and refuse further I/O once it moves.
    media_seq: u64,
}

/// One `(driver, unit)` pair.
///
/// All sector I/O against the unit is serialized by an internal lock which is
/// held across the entire sector batch.
pub struct Device {
    name: String,
    driver: Arc<dyn DeviceDriver>,
    unit: u8,
    ctl: Mutex<DeviceCtl>,
}

impl Device {
    pub fn new(driver: Arc<dyn DeviceDriver>, unit: u8) -> Self {
        let name = format!("{}:{}:", driver.name(), unit);
        Self {
            name,
            driver,
            unit,
            ctl: Mutex::new(DeviceCtl {
                state: DeviceState::Closed,
                info: None,
                media_seq: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unit(&self) -> u8 {
        self.unit
    }

    fn ctl(&self) -> Result<MutexGuard<'_, DeviceCtl>> {
        self.ctl.lock().map_err(|_| Error::Lock)
    }

    /// Opens the unit. The driver reports geometry and the device becomes
    /// `Present`.
    pub fn open(&self) -> Result<DeviceInfo> {
        let mut ctl = self.ctl()?;
        if ctl.state != DeviceState::Closed {
            return ctl.info.ok_or(Error::Dev(DevError::NotOpen));
        }
        let info = self.driver.open(self.unit)?;
        info.validate()?;
        info!("{}: open, {} sectors of {} B", self.name, info.sector_count, info.sector_size);
        ctl.state = DeviceState::Present;
        ctl.info = Some(info);
        Ok(info)
    }

    pub fn close(&self) -> Result<()> {
        let mut ctl = self.ctl()?;
        if ctl.state != DeviceState::Closed {
            self.driver.close(self.unit);
            ctl.state = DeviceState::Closed;
            ctl.info = None;
        }
        Ok(())
    }

    /// Re-queries the driver. Returns `true` if the medium changed, in which
    /// case the device drops back to `Present` and dependent volumes must be
    /// remounted.
    pub fn refresh(&self) -> Result<bool> {
        let mut ctl = self.ctl()?;
        if ctl.state == DeviceState::Closed {
            let info = self.driver.open(self.unit)?;
            info.validate()?;
            ctl.state = DeviceState::Present;
            ctl.info = Some(info);
            return Ok(true);
        }
        self.driver.io_ctl(self.unit, IoCtl::Refresh)?;
        let info = self.driver.query(self.unit)?;
        info.validate()?;
        let changed = ctl.info != Some(info);
        if changed {
            warn!("{}: media changed, dependent volumes invalid", self.name);
            ctl.state = DeviceState::Present;
            ctl.info = Some(info);
            ctl.media_seq += 1;
        }
        Ok(changed)
    }

    pub fn state(&self) -> Result<DeviceState> {
        Ok(self.ctl()?.state)
    }

    pub fn info(&self) -> Result<DeviceInfo> {
        self.ctl()?.info.ok_or(Error::Dev(DevError::NotOpen))
    }

    pub fn media_seq(&self) -> Result<u64> {
        Ok(self.ctl()?.media_seq)
    }

    pub fn mark_mounted(&self) -> Result<()> {
        let mut ctl = self.ctl()?;
        if ctl.state == DeviceState::Closed {
            return Err(Error::Dev(DevError::NotOpen));
        }
        ctl.state = DeviceState::Mounted;
        Ok(())
    }

    pub fn mark_unmounted(&self) -> Result<()> {
        let mut ctl = self.ctl()?;
        if ctl.state == DeviceState::Mounted {
            ctl.state = DeviceState::Present;
        }
        Ok(())
    }

    fn check_range(info: &DeviceInfo, start: u64, count: u32, buffer_len: usize) -> Result<()> {
        let end = start
            .checked_add(count as u64)
            .ok_or(Error::Dev(DevError::InvalidSector))?;
        if end > info.sector_count {
            return Err(Error::Dev(DevError::InvalidSector));
        }
        if buffer_len < count as usize * info.sector_size as usize {
            return Err(Error::Dev(DevError::InvalidSector));
        }
        Ok(())
    }

    /// Reads `count` sectors starting at `start`. The device lock is held
    /// across the whole batch.
    pub fn read(&self, start: u64, count: u32, buffer: &mut [u8]) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let ctl = self.ctl()?;
        let info = ctl.info.ok_or(Error::Dev(DevError::NotOpen))?;
        Self::check_range(&info, start, count, buffer.len())?;
        self.driver.read(self.unit, start, count, buffer)
    }

    /// Writes `count` sectors starting at `start`. The device lock is held
    /// across the whole batch.
    pub fn write(&self, start: u64, count: u32, buffer: &[u8]) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let ctl = self.ctl()?;
        let info = ctl.info.ok_or(Error::Dev(DevError::NotOpen))?;
        Self::check_range(&info, start, count, buffer.len())?;
        if info.write_protected {
            return Err(Error::Dev(DevError::WriteProtected));
        }
        self.driver.write(self.unit, start, count, buffer)
    }

    pub fn sync(&self) -> Result<()> {
        let ctl = self.ctl()?;
        if ctl.state == DeviceState::Closed {
            return Ok(());
        }
        self.driver.io_ctl(self.unit, IoCtl::Sync)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullDriver;

    impl DeviceDriver for NullDriver {
        fn name(&self) -> &'static str {
            "null"
        }

        fn open(&self, unit: u8) -> Result<DeviceInfo> {
            if unit != 0 {
                return Err(Error::Dev(DevError::InvalidUnit));
            }
            Ok(DeviceInfo { sector_size: 512, sector_count: 16, fixed: true, write_protected: false })
        }

        fn close(&self, _unit: u8) {}

        fn query(&self, unit: u8) -> Result<DeviceInfo> {
            self.open(unit)
        }

        fn read(&self, _unit: u8, _start: u64, _count: u32, buffer: &mut [u8]) -> Result<()> {
            buffer.fill(0);
            Ok(())
        }

        fn write(&self, _unit: u8, _start: u64, _count: u32, _buffer: &[u8]) -> Result<()> {
            Ok(())
        }

        fn io_ctl(&self, _unit: u8, _op: IoCtl) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn open_reports_geometry() {
        let dev = Device::new(Arc::new(NullDriver), 0);
        assert_eq!(dev.name(), "null:0:");
        let info = dev.open().unwrap();
        assert_eq!(info.sector_size, 512);
        assert_eq!(dev.state().unwrap(), DeviceState::Present);
    }

    #[test]
    fn range_checked() {
        let dev = Device::new(Arc::new(NullDriver), 0);
        dev.open().unwrap();
        let mut buf = vec![0u8; 512];
        assert!(dev.read(15, 1, &mut buf).is_ok());
        assert_eq!(dev.read(16, 1, &mut buf), Err(Error::Dev(DevError::InvalidSector)));
        assert_eq!(dev.read(0, 2, &mut buf), Err(Error::Dev(DevError::InvalidSector)));
        // Zero-length transfers are a no-op even out of range.
        assert!(dev.read(16, 0, &mut []).is_ok());
    }

    #[test]
    fn invalid_unit_refused() {
        let dev = Device::new(Arc::new(NullDriver), 3);
        assert_eq!(dev.open(), Err(Error::Dev(DevError::InvalidUnit)));
    }
}
