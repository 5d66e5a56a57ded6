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

use log::{error, info};
use tapir_ds::Device;
use tapir_err::{Error, Result};
use tapir_fs::vol::{FormatParams, FsType};
use zerocopy::{
    little_endian::{U16, U32},
    IntoBytes,
};

use crate::boot_sector::{
    BpbCommon, Ebpb16, Ebpb32, FsInfo, FAT12_MAX_CLUSTERS, FAT16_MAX_CLUSTERS, FSINFO_LEAD_SIG,
    FSINFO_STRUC_SIG, FSINFO_TRAIL_SIG, SIGNATURE_OFFSET,
};

const OEM_NAME: &[u8; 8] = b"TAPIR   ";

fn entry_bits(fs_type: FsType) -> u64 {
    match fs_type {
        FsType::Fat12 => 12,
        FsType::Fat16 => 16,
        FsType::Fat32 => 32,
    }
}

/// Derived format geometry, all sector counts relative to the volume.
struct Geometry {
    fs_type: FsType,
    sec_per_clus: u32,
    rsvd_secs: u32,
    num_fats: u32,
    root_entries: u32,
    fat_size: u32,
    clusters: u32,
}

fn pick_type(sectors: u64, bytes_per_sec: u32) -> FsType {
    let bytes = sectors * bytes_per_sec as u64;
    if bytes < 16 << 20 {
        FsType::Fat12
    } else if bytes < 512 << 20 {
        FsType::Fat16
    } else {
        FsType::Fat32
    }
}

fn pick_sec_per_clus(sectors: u64, fs_type: FsType) -> u32 {
    // Smallest power-of-two cluster size keeping the cluster count within
    // the variant's range.
    let max = match fs_type {
        FsType::Fat12 => FAT12_MAX_CLUSTERS as u64,
        FsType::Fat16 => FAT16_MAX_CLUSTERS as u64,
        FsType::Fat32 => 0x0FFF_FFF4,
    };
    let mut spc = 1u32;
    while spc < 128 && sectors / spc as u64 > max {
        spc *= 2;
    }
    spc
}

fn geometry(sectors: u64, bytes_per_sec: u32, params: &FormatParams) -> Result<Geometry> {
    let fs_type = params.fs_type.unwrap_or_else(|| pick_type(sectors, bytes_per_sec));
    let sec_per_clus = match params.sec_per_clus {
        Some(spc) => {
            if !spc.is_power_of_two() {
                return Err(Error::InvalidConfig);
            }
            spc as u32
        }
        None => pick_sec_per_clus(sectors, fs_type),
    };
    let num_fats = params.num_fats.unwrap_or(2) as u32;
    if num_fats != 1 && num_fats != 2 {
        return Err(Error::InvalidConfig);
    }
    let (rsvd_secs, root_entries) = match fs_type {
        FsType::Fat32 => (32, 0),
        _ => (1, params.root_entries.unwrap_or(512) as u32),
    };
    if fs_type != FsType::Fat32 && root_entries == 0 {
        return Err(Error::InvalidConfig);
    }
    let root_secs = (root_entries * 32).div_ceil(bytes_per_sec);

    // The FAT must cover the clusters, whose count shrinks as the FAT
    // grows; iterate to the fixed point.
    let bits = entry_bits(fs_type);
    let mut fat_size = 1u64;
    let clusters = loop {
        let overhead = rsvd_secs as u64 + num_fats as u64 * fat_size + root_secs as u64;
        if overhead >= sectors {
            error!("Volume of {sectors} sectors shall fit its own metadata");
            return Err(Error::InvalidConfig);
        }
        let clusters = (sectors - overhead) / sec_per_clus as u64;
        let needed = ((clusters + 2) * bits).div_ceil(8).div_ceil(bytes_per_sec as u64);
        if needed <= fat_size {
            break clusters as u32;
        }
        fat_size = needed;
    };

    let fits = match fs_type {
        FsType::Fat12 => clusters <= FAT12_MAX_CLUSTERS,
        FsType::Fat16 => clusters > FAT12_MAX_CLUSTERS && clusters <= FAT16_MAX_CLUSTERS,
        FsType::Fat32 => clusters > FAT16_MAX_CLUSTERS,
    };
    if !fits {
        error!("{fs_type} with {clusters} clusters shall match the variant thresholds");
        return Err(Error::InvalidConfig);
    }
    Ok(Geometry {
        fs_type,
        sec_per_clus,
        rsvd_secs,
        num_fats,
        root_entries,
        fat_size: fat_size as u32,
        clusters,
    })
}

fn boot_sector(
    geo: &Geometry,
    sectors: u64,
    bytes_per_sec: u32,
    hidden: u32,
    media: u8,
    label: &[u8; 11],
) -> Vec<u8> {
    let mut sector = vec![0u8; bytes_per_sec as usize];
    let common = BpbCommon {
        bs_jmpboot: [0xEB, 0x3C, 0x90],
        bs_oemname: *OEM_NAME,
        bpb_bytspersec: U16::new(bytes_per_sec as u16),
        bpb_secperclus: geo.sec_per_clus as u8,
        bpb_rsvdseccnt: U16::new(geo.rsvd_secs as u16),
        bpb_numfats: geo.num_fats as u8,
        bpb_rootentcnt: U16::new(geo.root_entries as u16),
        bpb_totsec16: U16::new(if geo.fs_type != FsType::Fat32 && sectors <= 0xFFFF {
            sectors as u16
        } else {
            0
        }),
        bpb_media: media,
        bpb_fatsz16: U16::new(if geo.fs_type == FsType::Fat32 { 0 } else { geo.fat_size as u16 }),
        bpb_secpertrk: U16::new(63),
        bpb_numheads: U16::new(255),
        bpb_hiddsec: U32::new(hidden),
        bpb_totsec32: U32::new(if geo.fs_type != FsType::Fat32 && sectors <= 0xFFFF {
            0
        } else {
            sectors as u32
        }),
    };
    sector[..size_of::<BpbCommon>()].copy_from_slice(common.as_bytes());
    match geo.fs_type {
        FsType::Fat32 => {
            let ebpb = Ebpb32 {
                bpb_fatsz32: U32::new(geo.fat_size),
                bpb_extflags: U16::new(0),
                bpb_fsver: U16::new(0),
                bpb_rootclus: U32::new(2),
                bpb_fsinfo: U16::new(1),
                bpb_bkbootsec: U16::new(6),
                bpb_reserved: [0; 12],
                bs_drvnum: 0x80,
                bs_reserved1: 0,
                bs_bootsig: 0x29,
                bs_volid: U32::new(0),
                bs_vollab: *label,
                bs_filsystype: *b"FAT32   ",
            };
            sector[36..36 + size_of::<Ebpb32>()].copy_from_slice(ebpb.as_bytes());
        }
        _ => {
            let ebpb = Ebpb16 {
                bs_drvnum: 0x80,
                bs_reserved1: 0,
                bs_bootsig: 0x29,
                bs_volid: U32::new(0),
                bs_vollab: *label,
                bs_filsystype: if geo.fs_type == FsType::Fat12 {
                    *b"FAT12   "
                } else {
                    *b"FAT16   "
                },
            };
            sector[36..36 + size_of::<Ebpb16>()].copy_from_slice(ebpb.as_bytes());
        }
    }
    sector[SIGNATURE_OFFSET] = 0x55;
    sector[SIGNATURE_OFFSET + 1] = 0xAA;
    sector
}

/// Creates a FAT file system over `sectors` sectors starting at `base`.
pub fn format(dev: &Arc<Device>, base: u64, sectors: u64, params: &FormatParams) -> Result<()> {
    let dev_info = dev.info()?;
    let bytes_per_sec = dev_info.sector_size;
    let geo = geometry(sectors, bytes_per_sec, params)?;
    let media = if dev_info.fixed { 0xF8 } else { 0xF0 };

    let mut label = *b"NO NAME    ";
    if let Some(text) = &params.label {
        let text = text.to_uppercase();
        if text.len() > 11 {
            return Err(Error::Vol(tapir_err::VolError::LabelInvalid));
        }
        label[..text.len()].copy_from_slice(text.as_bytes());
    }

    let boot = boot_sector(&geo, sectors, bytes_per_sec, base as u32, media, &label);
    dev.write(base, 1, &boot)?;
    if geo.fs_type == FsType::Fat32 {
        dev.write(base + 6, 1, &boot)?;
    }

    // Zero every FAT copy, then seed entries 0 and 1: the media byte filled
    // up with 1-bits, and an end-of-chain terminator.
    let zero = vec![0u8; bytes_per_sec as usize];
    for at in 0..geo.num_fats as u64 * geo.fat_size as u64 {
        dev.write(base + geo.rsvd_secs as u64 + at, 1, &zero)?;
    }
    let mut fat_head = zero.clone();
    match geo.fs_type {
        FsType::Fat12 => fat_head[..3].copy_from_slice(&[media, 0xFF, 0xFF]),
        FsType::Fat16 => fat_head[..4].copy_from_slice(&[media, 0xFF, 0xFF, 0xFF]),
        FsType::Fat32 => {
            fat_head[..4].copy_from_slice(&(0x0FFF_FF00u32 | media as u32).to_le_bytes());
            fat_head[4..8].copy_from_slice(&0x0FFF_FFFFu32.to_le_bytes());
            // Root directory cluster.
            fat_head[8..12].copy_from_slice(&0x0FFF_FFFFu32.to_le_bytes());
        }
    }
    for copy in 0..geo.num_fats as u64 {
        dev.write(base + geo.rsvd_secs as u64 + copy * geo.fat_size as u64, 1, &fat_head)?;
    }

    let root_secs = (geo.root_entries * 32).div_ceil(bytes_per_sec);
    let data_start = geo.rsvd_secs as u64 + geo.num_fats as u64 * geo.fat_size as u64;
    match geo.fs_type {
        FsType::Fat32 => {
            // FSINFO, primary and backup.
            let mut info_sector = vec![0u8; bytes_per_sec as usize];
            let fs_info = FsInfo {
                fsi_leadsig: U32::new(FSINFO_LEAD_SIG),
                fsi_reserved1: [0; 480],
                fsi_strucsig: U32::new(FSINFO_STRUC_SIG),
                fsi_free_count: U32::new(geo.clusters - 1),
                fsi_nxt_free: U32::new(3),
                fsi_reserved2: [0; 12],
                fsi_trailsig: U32::new(FSINFO_TRAIL_SIG),
            };
            info_sector[..size_of::<FsInfo>()].copy_from_slice(fs_info.as_bytes());
            dev.write(base + 1, 1, &info_sector)?;
            dev.write(base + 7, 1, &info_sector)?;
            // Root directory cluster 2.
            for at in 0..geo.sec_per_clus as u64 {
                dev.write(base + data_start + at, 1, &zero)?;
            }
        }
        _ => {
            for at in 0..root_secs as u64 {
                dev.write(base + data_start + at, 1, &zero)?;
            }
        }
    }

    info!(
        "formatted {} at sector {base}: {} clusters of {} sectors",
        geo.fs_type, geo.clusters, geo.sec_per_clus
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_fat16() {
        // 64 MiB at 512 B/sector.
        let geo = geometry(131_072, 512, &FormatParams::default()).unwrap();
        assert_eq!(geo.fs_type, FsType::Fat16);
        assert!(geo.clusters > FAT12_MAX_CLUSTERS);
        assert!(geo.clusters <= FAT16_MAX_CLUSTERS);
        // The FAT covers every cluster entry.
        let capacity = geo.fat_size as u64 * 512 / 2;
        assert!(capacity >= geo.clusters as u64 + 2);
    }

    #[test]
    fn geometry_fat12() {
        let geo = geometry(2880, 512, &FormatParams::default()).unwrap();
        assert_eq!(geo.fs_type, FsType::Fat12);
    }

    #[test]
    fn geometry_respects_explicit_cluster_size() {
        let params = FormatParams { sec_per_clus: Some(4), ..Default::default() };
        let geo = geometry(131_072, 512, &params).unwrap();
        assert_eq!(geo.sec_per_clus, 4);
    }
}
