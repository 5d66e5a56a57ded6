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
use tapir_err::{Error, Result, VolError};
use tapir_fs::vol::FsType;
use zerocopy::{
    little_endian::{U16, U32},
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
};

pub const SIGNATURE_OFFSET: usize = 510;

/// Cluster-count thresholds determining the FAT variant. A volume with
/// fewer than 4085 data clusters is FAT12, fewer than 65525 FAT16,
/// anything else FAT32.
pub const FAT12_MAX_CLUSTERS: u32 = 4084;
pub const FAT16_MAX_CLUSTERS: u32 = 65524;

/// The BIOS parameter block common to all FAT variants, bytes 0..36 of the
/// boot sector.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct BpbCommon {
    /// Jump instruction to boot code, 0xEB 0x?? 0x90 or 0xE9 0x?? 0x??.
    pub bs_jmpboot: [u8; 3],
    pub bs_oemname: [u8; 8],
    /// Count of bytes per sector: 512, 1024, 2048 or 4096.
    pub bpb_bytspersec: U16,
    /// Sectors per allocation unit, a power of two up to 128.
    pub bpb_secperclus: u8,
    /// Sectors in the reserved region, starting at the volume's first
    /// sector. Must not be 0.
    pub bpb_rsvdseccnt: U16,
    /// Count of FAT copies, 1 or 2.
    pub bpb_numfats: u8,
    /// FAT12/16: count of 32-byte root directory entries. 0 on FAT32.
    pub bpb_rootentcnt: U16,
    /// 16-bit total sector count; 0 if the count needs BPB_TotSec32.
    pub bpb_totsec16: U16,
    /// Media type; 0xF8 for fixed media, 0xF0 for removable.
    pub bpb_media: u8,
    /// FAT12/16: sectors per FAT copy. 0 on FAT32.
    pub bpb_fatsz16: U16,
    pub bpb_secpertrk: U16,
    pub bpb_numheads: U16,
    /// Sectors preceding the partition that contains this volume.
    pub bpb_hiddsec: U32,
    /// 32-bit total sector count; 0 if BPB_TotSec16 holds the count.
    pub bpb_totsec32: U32,
}

/// FAT12/16 extended fields, bytes 36..62 of the boot sector.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct Ebpb16 {
    pub bs_drvnum: u8,
    pub bs_reserved1: u8,
    /// 0x29 if the following three fields are present.
    pub bs_bootsig: u8,
    pub bs_volid: U32,
    /// Matches the volume-label entry in the root directory; "NO NAME    "
    /// when unset.
    pub bs_vollab: [u8; 11],
    pub bs_filsystype: [u8; 8],
}

/// FAT32 extended fields, bytes 36..90 of the boot sector.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct Ebpb32 {
    /// Sectors per FAT copy; BPB_FATSz16 must be 0.
    pub bpb_fatsz32: U32,
    /// Bit 7 clear: the FAT is mirrored at runtime into all copies.
    pub bpb_extflags: U16,
    /// Must be 0.
    pub bpb_fsver: U16,
    /// First cluster of the root directory, usually 2.
    pub bpb_rootclus: U32,
    /// Sector number of the FSINFO structure, usually 1.
    pub bpb_fsinfo: U16,
    /// Sector number of the boot-record copy, 0 or 6.
    pub bpb_bkbootsec: U16,
    pub bpb_reserved: [u8; 12],
    pub bs_drvnum: u8,
    pub bs_reserved1: u8,
    pub bs_bootsig: u8,
    pub bs_volid: U32,
    pub bs_vollab: [u8; 11],
    pub bs_filsystype: [u8; 8],
}

/// FAT32 FSINFO sector: free-cluster count and allocation hint. Both fields
/// are advisory and re-validated against the FAT on mount.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct FsInfo {
    /// 0x41615252.
    pub fsi_leadsig: U32,
    pub fsi_reserved1: [u8; 480],
    /// 0x61417272.
    pub fsi_strucsig: U32,
    /// Last known free cluster count; 0xFFFFFFFF when unknown.
    pub fsi_free_count: U32,
    /// Cluster number the allocator should start scanning at.
    pub fsi_nxt_free: U32,
    pub fsi_reserved2: [u8; 12],
    /// 0xAA550000.
    pub fsi_trailsig: U32,
}

pub const FSINFO_LEAD_SIG: u32 = 0x4161_5252;
pub const FSINFO_STRUC_SIG: u32 = 0x6141_7272;
pub const FSINFO_TRAIL_SIG: u32 = 0xAA55_0000;
pub const FSINFO_UNKNOWN: u32 = 0xFFFF_FFFF;

/// Volume geometry computed from a validated BPB. All sector numbers are
/// relative to the volume's first sector.
#[derive(Debug, Clone, Copy)]
pub struct FatLayout {
    pub fs_type: FsType,
    pub bytes_per_sec: u32,
    pub sec_per_clus: u32,
    pub rsvd_secs: u32,
    pub num_fats: u32,
    /// Sectors per FAT copy.
    pub fat_size: u32,
    pub root_ent_cnt: u32,
    /// FAT12/16: first sector of the fixed root directory region.
    pub root_dir_start: u32,
    pub root_dir_sectors: u32,
    /// FAT32: first cluster of the root directory.
    pub root_clus: u32,
    /// FAT32: FSINFO sector, 0 when absent.
    pub fsinfo_sec: u32,
    /// First sector of the data region (cluster 2).
    pub data_start: u32,
    /// Count of data clusters; valid cluster numbers are 2..2+cluster_count.
    pub cluster_count: u32,
    pub total_sectors: u64,
}

impl FatLayout {
    pub fn cluster_bytes(&self) -> u32 {
        self.sec_per_clus * self.bytes_per_sec
    }

    /// First data sector of a cluster, relative to the volume start.
    pub fn clus_to_sector(&self, clus: u32) -> u64 {
        self.data_start as u64 + (clus as u64 - 2) * self.sec_per_clus as u64
    }

    /// One past the largest valid cluster number.
    pub fn cluster_end(&self) -> u32 {
        2 + self.cluster_count
    }

    /// End-of-chain sentinel written by this implementation.
    pub fn eoc(&self) -> u32 {
        match self.fs_type {
            FsType::Fat12 => 0xFFF,
            FsType::Fat16 => 0xFFFF,
            FsType::Fat32 => 0x0FFF_FFFF,
        }
    }

    /// Whether a FAT entry value terminates a chain.
    pub fn is_eoc(&self, entry: u32) -> bool {
        match self.fs_type {
            FsType::Fat12 => entry >= 0xFF8,
            FsType::Fat16 => entry >= 0xFFF8,
            FsType::Fat32 => entry >= 0x0FFF_FFF8,
        }
    }

    /// The bad-block marker.
    pub fn bad(&self) -> u32 {
        match self.fs_type {
            FsType::Fat12 => 0xFF7,
            FsType::Fat16 => 0xFFF7,
            FsType::Fat32 => 0x0FFF_FFF7,
        }
    }
}

/// Validates the boot sector of a volume spanning `span_sectors` sectors of
/// a device with `dev_sector_size`-byte sectors.
///
/// Returns `InvalidSys` for anything that does not look like a FAT volume
/// at all, so mount probing can move on to another file system type.
pub fn parse(sector0: &[u8], dev_sector_size: u32, span_sectors: u64) -> Result<FatLayout> {
    if sector0.len() < 512
        || sector0[SIGNATURE_OFFSET] != 0x55
        || sector0[SIGNATURE_OFFSET + 1] != 0xAA
    {
        return Err(Error::Vol(VolError::InvalidSys));
    }
    let bpb = BpbCommon::read_from_bytes(&sector0[..size_of::<BpbCommon>()])
        .map_err(|_| Error::Vol(VolError::InvalidSys))?;
    if !matches!(bpb.bs_jmpboot[0], 0xEB | 0xE9) {
        return Err(Error::Vol(VolError::InvalidSys));
    }

    let bytes_per_sec = bpb.bpb_bytspersec.get() as u32;
    if !matches!(bytes_per_sec, 512 | 1024 | 2048 | 4096) {
        error!("Bytes per sector ({bytes_per_sec}) shall be 512, 1024, 2048 or 4096");
        return Err(Error::Vol(VolError::InvalidSys));
    }
    if bytes_per_sec != dev_sector_size {
        error!("Bytes per sector ({bytes_per_sec}) shall match the device sector size ({dev_sector_size})");
        return Err(Error::Vol(VolError::InvalidSys));
    }
    let sec_per_clus = bpb.bpb_secperclus as u32;
    if !sec_per_clus.is_power_of_two() || sec_per_clus > 128 {
        error!("Sectors per cluster ({sec_per_clus}) shall be a power of 2 up to 128");
        return Err(Error::Vol(VolError::InvalidSys));
    }
    let rsvd_secs = bpb.bpb_rsvdseccnt.get() as u32;
    if rsvd_secs == 0 {
        error!("Reserved sector count shall not be 0");
        return Err(Error::Vol(VolError::InvalidSys));
    }
    let num_fats = bpb.bpb_numfats as u32;
    if num_fats != 1 && num_fats != 2 {
        error!("Number of FATs ({num_fats}) shall be 1 or 2");
        return Err(Error::Vol(VolError::InvalidSys));
    }

    let total_sectors = if bpb.bpb_totsec16.get() != 0 {
        bpb.bpb_totsec16.get() as u64
    } else {
        bpb.bpb_totsec32.get() as u64
    };
    if total_sectors == 0 || total_sectors > span_sectors {
        error!("Total sectors ({total_sectors}) shall fit the volume span ({span_sectors})");
        return Err(Error::Vol(VolError::InvalidSys));
    }

    let root_ent_cnt = bpb.bpb_rootentcnt.get() as u32;
    let root_dir_sectors = (root_ent_cnt * 32).div_ceil(bytes_per_sec);
    let fat_size = if bpb.bpb_fatsz16.get() != 0 {
        bpb.bpb_fatsz16.get() as u32
    } else {
        let ebpb = Ebpb32::read_from_bytes(&sector0[36..36 + size_of::<Ebpb32>()])
            .map_err(|_| Error::Vol(VolError::InvalidSys))?;
        ebpb.bpb_fatsz32.get()
    };
    if fat_size == 0 {
        error!("FAT size shall not be 0");
        return Err(Error::Vol(VolError::InvalidSys));
    }

    let root_dir_start = rsvd_secs + num_fats * fat_size;
    let data_start = root_dir_start + root_dir_sectors;
    if data_start as u64 >= total_sectors {
        error!("Data region start ({data_start}) shall lie inside the volume");
        return Err(Error::Vol(VolError::InvalidSys));
    }
    let cluster_count = ((total_sectors - data_start as u64) / sec_per_clus as u64) as u32;
    let fs_type = if cluster_count <= FAT12_MAX_CLUSTERS {
        FsType::Fat12
    } else if cluster_count <= FAT16_MAX_CLUSTERS {
        FsType::Fat16
    } else {
        FsType::Fat32
    };

    let (root_clus, fsinfo_sec) = if fs_type == FsType::Fat32 {
        let ebpb = Ebpb32::read_from_bytes(&sector0[36..36 + size_of::<Ebpb32>()])
            .map_err(|_| Error::Vol(VolError::InvalidSys))?;
        if root_ent_cnt != 0 {
            error!("Root entry count ({root_ent_cnt}) shall be 0 on FAT32");
            return Err(Error::Vol(VolError::InvalidSys));
        }
        if ebpb.bpb_fsver.get() != 0 {
            error!("File system version ({}) shall be 0", ebpb.bpb_fsver.get());
            return Err(Error::Vol(VolError::InvalidSys));
        }
        let root_clus = ebpb.bpb_rootclus.get();
        if root_clus < 2 || root_clus >= 2 + cluster_count {
            error!("Root cluster ({root_clus}) shall be a valid cluster");
            return Err(Error::Vol(VolError::InvalidSys));
        }
        (root_clus, ebpb.bpb_fsinfo.get() as u32)
    } else {
        if root_ent_cnt == 0 {
            error!("Root entry count shall not be 0 on FAT12/16");
            return Err(Error::Vol(VolError::InvalidSys));
        }
        (0, 0)
    };

    Ok(FatLayout {
        fs_type,
        bytes_per_sec,
        sec_per_clus,
        rsvd_secs,
        num_fats,
        fat_size,
        root_ent_cnt,
        root_dir_start,
        root_dir_sectors,
        root_clus,
        fsinfo_sec,
        data_start,
        cluster_count,
        total_sectors,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use tapir_fs::vol::FormatParams;

    use crate::testing::Rig;

    #[test]
    fn layout_sizes() {
        assert_eq!(size_of::<BpbCommon>(), 36);
        assert_eq!(size_of::<Ebpb16>(), 26);
        assert_eq!(size_of::<Ebpb32>(), 54);
        assert_eq!(size_of::<FsInfo>(), 512);
    }

    #[test]
    fn rejects_garbage() {
        let sector = [0u8; 512];
        assert!(parse(&sector, 512, 1024).is_err());
    }

    #[test]
    fn parses_formatted_volume() {
        let params = FormatParams {
            fs_type: Some(FsType::Fat16),
            sec_per_clus: Some(4),
            ..Default::default()
        };
        let rig = Rig::new(131_072, &params);
        let mut sector = vec![0u8; 512];
        rig.dev.read(0, 1, &mut sector).unwrap();

        let layout = parse(&sector, 512, 131_072).unwrap();
        assert_eq!(layout.fs_type, FsType::Fat16);
        assert_eq!(layout.sec_per_clus, 4);
        assert_eq!(layout.num_fats, 2);
        assert!(layout.cluster_count > FAT12_MAX_CLUSTERS);
        assert!(layout.cluster_count <= FAT16_MAX_CLUSTERS);
        assert_eq!(layout.root_dir_sectors, 32);
        assert_eq!(layout.data_start, layout.root_dir_start + 32);
        assert_eq!(layout.total_sectors, 131_072);
        // A mismatched device sector size is refused.
        assert!(parse(&sector, 1024, 131_072).is_err());
    }
}
