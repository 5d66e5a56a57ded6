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

use tapir_ds::Device;
use tapir_ds_ram::RamDisk;
use tapir_fs::{
    buf::BufPool,
    clock::DateTime,
    vol::{FormatParams, MountCtx},
};

use crate::{format, FatVolume};

pub(crate) fn test_time() -> DateTime {
    DateTime { year: 2024, month: 6, day: 1, hour: 12, minute: 0, second: 0 }
}

pub(crate) fn vpath(path: &str) -> tapir_fs::path::VPath {
    tapir_fs::path::resolve(&format!("test:0:{path}"), None, None, 255, 4096)
        .unwrap()
        .path
}

/// A formatted RAM device that can be mounted repeatedly. Every mount gets a
/// fresh buffer pool, so dropping a volume without syncing loses exactly the
/// unflushed sectors, the way a power loss would.
pub(crate) struct Rig {
    pub dev: Arc<Device>,
    next_vol: u64,
}

impl Rig {
    pub fn new(sector_count: u64, params: &FormatParams) -> Self {
        let dev = Arc::new(Device::new(Arc::new(RamDisk::new(0, 512, sector_count)), 0));
        dev.open().unwrap();
        format::format(&dev, 0, sector_count, params).unwrap();
        Self { dev, next_vol: 1 }
    }

    pub fn mount(&mut self, journaled: bool) -> FatVolume {
        let vol_id = self.next_vol;
        self.next_vol += 1;
        let sectors = self.dev.info().unwrap().sector_count;
        FatVolume::mount(MountCtx {
            vol_id,
            dev: self.dev.clone(),
            pool: Arc::new(BufPool::new(8, 4096)),
            base: 0,
            sectors,
            read_only: false,
            journaled,
            now: test_time(),
        })
        .unwrap()
    }
}
