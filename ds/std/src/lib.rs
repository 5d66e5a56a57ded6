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

use std::{fs::File, os::unix::fs::FileExt, path::Path, sync::Mutex};

use log::error;
use tapir_ds::{DeviceDriver, DeviceInfo, IoCtl};
use tapir_err::{DevError, Error, Result};

/// A block device backed by a regular file (or a raw block special file) on
/// the host.
pub struct FileDisk {
    unit: u8,
    sector_size: u32,
    file: Mutex<Option<File>>,
    path: std::path::PathBuf,
}

impl FileDisk {
    pub fn new<P: AsRef<Path>>(unit: u8, sector_size: u32, path: P) -> Self {
        Self {
            unit,
            sector_size,
            file: Mutex::new(None),
            path: path.as_ref().to_path_buf(),
        }
    }

    fn check_unit(&self, unit: u8) -> Result<()> {
        if unit != self.unit {
            return Err(Error::Dev(DevError::InvalidUnit));
        }
        Ok(())
    }
}

impl DeviceDriver for FileDisk {
    fn name(&self) -> &'static str {
        "file"
    }

    fn open(&self, unit: u8) -> Result<DeviceInfo> {
        self.check_unit(unit)?;
        let file = File::options()
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|err| {
                error!("file:{unit}: cannot open {}: {err}", self.path.display());
                Error::Dev(DevError::NotPresent)
            })?;
        let len = file.metadata().map_err(|_| Error::Dev(DevError::Io))?.len();
        *self.file.lock().map_err(|_| Error::Lock)? = Some(file);
        Ok(DeviceInfo {
            sector_size: self.sector_size,
            sector_count: len / self.sector_size as u64,
            fixed: true,
            write_protected: false,
        })
    }

    fn close(&self, _unit: u8) {
        if let Ok(mut file) = self.file.lock() {
            *file = None;
        }
    }

    fn query(&self, unit: u8) -> Result<DeviceInfo> {
        self.check_unit(unit)?;
        let file = self.file.lock().map_err(|_| Error::Lock)?;
        let file = file.as_ref().ok_or(Error::Dev(DevError::NotOpen))?;
        let len = file.metadata().map_err(|_| Error::Dev(DevError::Io))?.len();
        Ok(DeviceInfo {
            sector_size: self.sector_size,
            sector_count: len / self.sector_size as u64,
            fixed: true,
            write_protected: false,
        })
    }

    fn read(&self, unit: u8, start: u64, count: u32, buffer: &mut [u8]) -> Result<()> {
        self.check_unit(unit)?;
        let file = self.file.lock().map_err(|_| Error::Lock)?;
        let file = file.as_ref().ok_or(Error::Dev(DevError::NotOpen))?;
        let len = count as usize * self.sector_size as usize;
        file.read_exact_at(&mut buffer[..len], start * self.sector_size as u64)
            .map_err(|_| Error::Dev(DevError::Io))
    }

    fn write(&self, unit: u8, start: u64, count: u32, buffer: &[u8]) -> Result<()> {
        self.check_unit(unit)?;
        let file = self.file.lock().map_err(|_| Error::Lock)?;
        let file = file.as_ref().ok_or(Error::Dev(DevError::NotOpen))?;
        let len = count as usize * self.sector_size as usize;
        file.write_all_at(&buffer[..len], start * self.sector_size as u64)
            .map_err(|_| Error::Dev(DevError::Io))
    }

    fn io_ctl(&self, unit: u8, op: IoCtl) -> Result<()> {
        self.check_unit(unit)?;
        match op {
            IoCtl::Refresh => Ok(()),
            IoCtl::Sync => {
                let file = self.file.lock().map_err(|_| Error::Lock)?;
                let file = file.as_ref().ok_or(Error::Dev(DevError::NotOpen))?;
                file.sync_data().map_err(|_| Error::Dev(DevError::Io))
            }
        }
    }
}
