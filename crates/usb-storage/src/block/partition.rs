//! First-partition selection.
//!
//! Thumb drives come in two layouts: an MBR partition table at LBA 0, or a FAT
//! boot sector at LBA 0 with no table at all ("superfloppy"). We check for the
//! latter first because a boot sector also ends in the 0x55AA signature and would
//! otherwise be misread as a partition table.

use super::BlockDevice;
use log::{debug, info};
use mbr_nostd::{MasterBootRecord, PartitionTable, PartitionType};
use std::io;

const MBR_SIZE: usize = 512;
const BOOT_SIGNATURE: [u8; 2] = [0x55, 0xAA];

/// Where the selected partition lives on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionInfo {
    pub first_lba: u64,
    pub block_count: u64,
    pub layout: PartitionLayout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionLayout {
    /// Filesystem starts at LBA 0, no partition table.
    WholeDevice,
    /// Entry `index` (0-based) of the MBR partition table.
    Mbr { index: usize },
}

/// Selects partition 0 of the device.
///
/// Returns `Ok(None)` when the device has neither a FAT boot sector nor a used
/// MBR entry.
pub fn select_first_partition(device: &mut dyn BlockDevice) -> io::Result<Option<PartitionInfo>> {
    let block_size = device.block_size() as usize;
    let block_count = device.block_count();
    if block_count == 0 || block_size < MBR_SIZE {
        debug!("Device reports {} blocks of {} bytes, nothing to select", block_count, block_size);
        return Ok(None);
    }

    let mut sector = vec![0u8; block_size];
    device.read_blocks(0, &mut sector)?;

    if looks_like_fat_boot_sector(&sector) {
        info!("No partition table, filesystem spans the whole device");
        return Ok(Some(PartitionInfo {
            first_lba: 0,
            block_count,
            layout: PartitionLayout::WholeDevice,
        }));
    }

    let mut mbr_bytes = [0u8; MBR_SIZE];
    mbr_bytes.copy_from_slice(&sector[..MBR_SIZE]);
    let Ok(mbr) = MasterBootRecord::from_bytes(&mbr_bytes) else {
        debug!("LBA 0 holds neither a FAT boot sector nor an MBR");
        return Ok(None);
    };

    let selected = mbr
        .partition_table_entries()
        .iter()
        .enumerate()
        .find(|(_, entry)| !matches!(entry.partition_type, PartitionType::Unused) && entry.sector_count > 0);

    let Some((index, entry)) = selected else {
        debug!("MBR has no used entries");
        return Ok(None);
    };

    let first_lba = u64::from(entry.logical_block_address);
    if first_lba >= block_count {
        debug!("MBR entry {} starts at LBA {} beyond the device end", index, first_lba);
        return Ok(None);
    }
    // Some tables overstate the size; clamp to what the device can serve
    let count = u64::from(entry.sector_count).min(block_count - first_lba);

    info!(
        "Selected MBR partition {}: first_lba={}, blocks={}",
        index, first_lba, count
    );
    Ok(Some(PartitionInfo {
        first_lba,
        block_count: count,
        layout: PartitionLayout::Mbr { index },
    }))
}

/// Returns true if the sector carries a FAT12/16/32 BIOS parameter block.
pub fn looks_like_fat_boot_sector(sector: &[u8]) -> bool {
    if sector.len() < MBR_SIZE || sector[510..512] != BOOT_SIGNATURE {
        return false;
    }
    // x86 jump instruction in front of the BPB
    if sector[0] != 0xEB && sector[0] != 0xE9 {
        return false;
    }
    let fat16_label = &sector[54..57] == b"FAT";
    let fat32_label = &sector[82..87] == b"FAT32";
    (fat16_label || fat32_label) && cluster_size(sector).is_some()
}

/// Cluster size in bytes from a FAT boot sector, if the BPB is plausible.
pub fn cluster_size(boot_sector: &[u8]) -> Option<u32> {
    if boot_sector.len() < 14 {
        return None;
    }
    let bytes_per_sector = u16::from_le_bytes([boot_sector[11], boot_sector[12]]);
    let sectors_per_cluster = boot_sector[13];
    let valid_sector = matches!(bytes_per_sector, 512 | 1024 | 2048 | 4096);
    let valid_cluster = sectors_per_cluster != 0 && sectors_per_cluster.is_power_of_two();
    if !valid_sector || !valid_cluster {
        return None;
    }
    Some(u32::from(bytes_per_sector) * u32::from(sectors_per_cluster))
}
