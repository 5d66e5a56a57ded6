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

use log::error;
use tapir_ds::Device;
use tapir_err::{Error, Result, VolError};
use zerocopy::{little_endian::U32, FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// One of the four primary slots of an MBR partition table.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct MbrPartitionEntry {
    /// 0x80 marks the partition active; any other value is inactive.
    pub boot_flag: u8,
    /// Legacy cylinder/head/sector start address, ignored in favor of LBA.
    pub chs_start: [u8; 3],
    /// Partition type tag.
    pub part_type: u8,
    /// Legacy cylinder/head/sector end address, ignored in favor of LBA.
    pub chs_end: [u8; 3],
    pub lba_start: U32,
    pub lba_count: U32,
}

pub const MBR_TABLE_OFFSET: usize = 446;
pub const SIGNATURE_OFFSET: usize = 510;

/// The sector span a volume mounts over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionSpan {
    pub start: u64,
    pub sectors: u64,
}

/// Resolves `partition_nbr` on `dev` to a sector span.
///
/// Slot numbering is zero-based. Media without a partition table (a boot
/// sector that is itself a BPB, or no 0x55AA signature at all) only resolve
/// slot 0, as the whole device.
pub fn find(dev: &Device, partition_nbr: u8) -> Result<PartitionSpan> {
    let info = dev.info()?;
    let whole = PartitionSpan { start: 0, sectors: info.sector_count };
    let mut sector = vec![0u8; info.sector_size as usize];
    dev.read(0, 1, &mut sector)?;

    if sector[SIGNATURE_OFFSET] != 0x55 || sector[SIGNATURE_OFFSET + 1] != 0xAA {
        if partition_nbr == 0 {
            return Ok(whole);
        }
        error!("{}: no partition table", dev.name());
        return Err(Error::Vol(VolError::PartitionInvalid));
    }

    // A FAT boot sector carries the same signature as an MBR. A plausible
    // jump opcode plus a legal bytes-per-sector value means the device is
    // formatted without a partition table.
    let bytes_per_sec = u16::from_le_bytes([sector[11], sector[12]]);
    if matches!(sector[0], 0xEB | 0xE9) && matches!(bytes_per_sec, 512 | 1024 | 2048 | 4096) {
        if partition_nbr == 0 {
            return Ok(whole);
        }
        error!("{}: unpartitioned media has no partition {partition_nbr}", dev.name());
        return Err(Error::Vol(VolError::PartitionInvalid));
    }

    if partition_nbr >= 4 {
        return Err(Error::Vol(VolError::PartitionInvalid));
    }
    let offset = MBR_TABLE_OFFSET + partition_nbr as usize * size_of::<MbrPartitionEntry>();
    let entry = MbrPartitionEntry::read_from_bytes(&sector[offset..offset + 16])
        .map_err(|_| Error::Vol(VolError::PartitionInvalid))?;
    let start = entry.lba_start.get() as u64;
    let count = entry.lba_count.get() as u64;
    if entry.part_type == 0 || count == 0 || start >= info.sector_count {
        error!("{}: partition {partition_nbr} empty or out of range", dev.name());
        return Err(Error::Vol(VolError::PartitionInvalid));
    }
    Ok(PartitionSpan { start, sectors: count.min(info.sector_count - start) })
}
