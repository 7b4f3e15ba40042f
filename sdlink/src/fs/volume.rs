//! Mounted volume geometry.

use crate::error::{Error, Result};
use byteorder::{ByteOrder, LittleEndian};

/// Size of one card block.
pub const BLOCK_SIZE: usize = 512;

/// Directory entries per block.
pub const ENTRIES_PER_BLOCK: usize = BLOCK_SIZE / 32;

/// Length of the volume record sent by the device after `SD_INIT`.
pub const VOLUME_RECORD_LEN: usize = 25;

/// FAT width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FatType {
    /// 16-bit FAT with a fixed root region.
    Fat16,
    /// 32-bit FAT (28 bits used) with a root cluster chain.
    Fat32,
}

impl FatType {
    /// Smallest value that marks the end of a chain.
    pub fn eoc_min(self) -> u32 {
        match self {
            Self::Fat16 => 0xFFF8,
            Self::Fat32 => 0x0FFF_FFF8,
        }
    }

    /// Value written to terminate a chain.
    pub fn eoc_mark(self) -> u32 {
        match self {
            Self::Fat16 => 0xFFFF,
            Self::Fat32 => 0x0FFF_FFFF,
        }
    }

    /// Bytes per FAT entry.
    pub fn entry_size(self) -> u32 {
        match self {
            Self::Fat16 => 2,
            Self::Fat32 => 4,
        }
    }
}

/// Geometry of the mounted card. Immutable until the next initialisation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Volume {
    /// FAT width.
    pub fat_type: FatType,
    /// Blocks per cluster (power of two).
    pub blocks_per_cluster: u8,
    /// First block of the first FAT copy.
    pub fat_start_block: u32,
    /// Blocks occupied by one FAT copy.
    pub fat_size_blocks: u32,
    /// Number of FAT copies.
    pub fat_count: u8,
    /// Block of cluster 2.
    pub data_start_block: u32,
    /// Root cluster (FAT32) or first root block (FAT16).
    pub root_start: u32,
    /// Root directory capacity in entries (FAT16 only).
    pub root_entry_count: u16,
    /// Highest valid cluster index.
    pub cluster_last: u32,
}

impl Volume {
    /// Offset of the boot sector: 0 for a bare volume, else the first
    /// partition's start taken from the MBR in block 0.
    pub fn boot_block(block0: &[u8]) -> u32 {
        if matches!(block0[0], 0xEB | 0xE9) {
            return 0;
        }
        LittleEndian::read_u32(&block0[446 + 8..446 + 12])
    }

    /// Parse a FAT16/FAT32 boot sector located at `base`.
    ///
    /// The FAT type follows the 16-bit FAT size field: zero means FAT32.
    pub fn from_boot_sector(bs: &[u8], base: u32) -> Result<Self> {
        if bs.len() < BLOCK_SIZE || bs[510] != 0x55 || bs[511] != 0xAA {
            return Err(Error::Filesystem("missing boot sector signature".into()));
        }
        let bytes_per_sector = LittleEndian::read_u16(&bs[11..13]);
        if usize::from(bytes_per_sector) != BLOCK_SIZE {
            return Err(Error::Filesystem(format!(
                "unsupported sector size {bytes_per_sector}"
            )));
        }
        let blocks_per_cluster = bs[13];
        if blocks_per_cluster == 0 || !blocks_per_cluster.is_power_of_two() {
            return Err(Error::Filesystem("invalid cluster size".into()));
        }
        let reserved = u32::from(LittleEndian::read_u16(&bs[14..16]));
        let fat_count = bs[16];
        let root_entry_count = LittleEndian::read_u16(&bs[17..19]);
        let total16 = u32::from(LittleEndian::read_u16(&bs[19..21]));
        let fat16_size = u32::from(LittleEndian::read_u16(&bs[22..24]));
        let total32 = LittleEndian::read_u32(&bs[32..36]);
        let total = if total16 != 0 { total16 } else { total32 };

        let (fat_type, fat_size_blocks) = if fat16_size != 0 {
            (FatType::Fat16, fat16_size)
        } else {
            (FatType::Fat32, LittleEndian::read_u32(&bs[36..40]))
        };

        let fat_start_block = base + reserved;
        let root_blocks = (u32::from(root_entry_count) * 32).div_ceil(BLOCK_SIZE as u32);
        let fats_end = fat_start_block + u32::from(fat_count) * fat_size_blocks;
        let (root_start, data_start_block) = match fat_type {
            FatType::Fat16 => (fats_end, fats_end + root_blocks),
            FatType::Fat32 => (LittleEndian::read_u32(&bs[44..48]), fats_end),
        };

        let data_blocks = (base + total).saturating_sub(data_start_block);
        let cluster_count = data_blocks / u32::from(blocks_per_cluster);
        if cluster_count == 0 {
            return Err(Error::Filesystem("volume has no data clusters".into()));
        }

        Ok(Self {
            fat_type,
            blocks_per_cluster,
            fat_start_block,
            fat_size_blocks,
            fat_count,
            data_start_block,
            root_start,
            root_entry_count: if fat_type == FatType::Fat16 {
                root_entry_count
            } else {
                0
            },
            cluster_last: cluster_count + 1,
        })
    }

    /// Encode as the device's volume record.
    pub fn encode(&self) -> [u8; VOLUME_RECORD_LEN] {
        let mut out = [0u8; VOLUME_RECORD_LEN];
        out[0] = match self.fat_type {
            FatType::Fat16 => 16,
            FatType::Fat32 => 32,
        };
        out[1] = self.blocks_per_cluster;
        LittleEndian::write_u32(&mut out[2..6], self.fat_start_block);
        LittleEndian::write_u32(&mut out[6..10], self.fat_size_blocks);
        out[10] = self.fat_count;
        LittleEndian::write_u32(&mut out[11..15], self.data_start_block);
        LittleEndian::write_u32(&mut out[15..19], self.root_start);
        LittleEndian::write_u16(&mut out[19..21], self.root_entry_count);
        LittleEndian::write_u32(&mut out[21..25], self.cluster_last);
        out
    }

    /// Decode the device's volume record.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < VOLUME_RECORD_LEN {
            return Err(Error::Protocol(format!(
                "volume record too short ({} bytes)",
                data.len()
            )));
        }
        let fat_type = match data[0] {
            16 => FatType::Fat16,
            32 => FatType::Fat32,
            other => {
                return Err(Error::Filesystem(format!("unsupported FAT width {other}")));
            },
        };
        let blocks_per_cluster = data[1];
        if !blocks_per_cluster.is_power_of_two() {
            return Err(Error::Protocol(format!(
                "volume record has {blocks_per_cluster} blocks per cluster"
            )));
        }
        let cluster_last = LittleEndian::read_u32(&data[21..25]);
        if cluster_last < 2 {
            return Err(Error::Protocol(format!("volume record has last cluster {cluster_last}")));
        }
        Ok(Self {
            fat_type,
            blocks_per_cluster,
            fat_start_block: LittleEndian::read_u32(&data[2..6]),
            fat_size_blocks: LittleEndian::read_u32(&data[6..10]),
            fat_count: data[10],
            data_start_block: LittleEndian::read_u32(&data[11..15]),
            root_start: LittleEndian::read_u32(&data[15..19]),
            root_entry_count: LittleEndian::read_u16(&data[19..21]),
            cluster_last,
        })
    }

    /// Bytes per cluster.
    pub fn cluster_bytes(&self) -> u32 {
        u32::from(self.blocks_per_cluster) * BLOCK_SIZE as u32
    }

    /// Blocks spanned by the FAT16 root region.
    pub fn root_blocks(&self) -> u32 {
        (u32::from(self.root_entry_count) * 32).div_ceil(BLOCK_SIZE as u32)
    }

    /// Whether `block` lies in the fixed FAT16 root region.
    pub fn in_root_region(&self, block: u32) -> bool {
        self.fat_type == FatType::Fat16
            && (self.root_start..self.root_start + self.root_blocks()).contains(&block)
    }

    /// First block of `cluster`.
    pub fn cluster_block(&self, cluster: u32) -> u32 {
        self.data_start_block + cluster.saturating_sub(2) * u32::from(self.blocks_per_cluster)
    }

    /// Cluster containing `block`.
    pub fn cluster_from_block(&self, block: u32) -> u32 {
        block.saturating_sub(self.data_start_block) / u32::from(self.blocks_per_cluster) + 2
    }

    /// Whether `block` is the last block of its cluster.
    pub fn is_last_block_of_cluster(&self, block: u32) -> bool {
        let bpc = u32::from(self.blocks_per_cluster);
        (block.saturating_sub(self.data_start_block) + 1) % bpc == 0
    }

    /// A FAT value that ends a chain (or an empty chain).
    pub fn is_eoc(&self, cluster: u32) -> bool {
        cluster == 0 || cluster >= self.fat_type.eoc_min()
    }

    /// Whether `cluster` indexes a data cluster.
    pub fn is_valid_cluster(&self, cluster: u32) -> bool {
        (2..=self.cluster_last).contains(&cluster)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Volume {
        Volume {
            fat_type: FatType::Fat32,
            blocks_per_cluster: 8,
            fat_start_block: 32,
            fat_size_blocks: 100,
            fat_count: 2,
            data_start_block: 232,
            root_start: 2,
            root_entry_count: 0,
            cluster_last: 12000,
        }
    }

    #[test]
    fn test_record_roundtrip() {
        let volume = sample();
        assert_eq!(Volume::decode(&volume.encode()).unwrap(), volume);
    }

    #[test]
    fn test_record_rejects_unknown_width() {
        let mut record = sample().encode();
        record[0] = 12;
        assert!(Volume::decode(&record).is_err());
        assert!(Volume::decode(&record[..10]).is_err());
    }

    #[test]
    fn test_record_rejects_bad_geometry() {
        for bpc in [0u8, 3, 6] {
            let mut record = sample().encode();
            record[1] = bpc;
            assert!(matches!(Volume::decode(&record), Err(Error::Protocol(_))), "{bpc}");
        }
        let mut record = sample().encode();
        LittleEndian::write_u32(&mut record[21..25], 1);
        assert!(matches!(Volume::decode(&record), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_eoc_constants() {
        assert_eq!(FatType::Fat16.eoc_min(), 0xFFF8);
        assert_eq!(FatType::Fat32.eoc_mark(), 0x0FFF_FFFF);
        assert_eq!(FatType::Fat32.entry_size(), 4);
    }

    #[test]
    fn test_cluster_arithmetic() {
        let volume = sample();
        assert_eq!(volume.cluster_block(2), 232);
        assert_eq!(volume.cluster_block(3), 240);
        assert_eq!(volume.cluster_from_block(247), 3);
        assert!(volume.is_last_block_of_cluster(239));
        assert!(!volume.is_last_block_of_cluster(240));
        assert!(volume.is_eoc(0));
        assert!(volume.is_eoc(0x0FFF_FFF8));
        assert!(!volume.is_eoc(5));
        assert!(!volume.is_valid_cluster(1));
        assert!(volume.is_valid_cluster(12000));
        assert!(!volume.in_root_region(232));
    }

    #[test]
    fn test_boot_block_detects_mbr() {
        let mut block0 = [0u8; BLOCK_SIZE];
        block0[0] = 0xEB;
        assert_eq!(Volume::boot_block(&block0), 0);
        block0[0] = 0x33;
        block0[446 + 8..446 + 12].copy_from_slice(&2048u32.to_le_bytes());
        assert_eq!(Volume::boot_block(&block0), 2048);
    }
}
