//! In-memory card image.
//!
//! Used as the card behind [`VirtualDevice`](crate::port::VirtualDevice)
//! and directly as a [`BlockDevice`] in tests.

use std::fs;
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};
use log::debug;

use crate::error::{Error, Result};
use crate::fs::BlockDevice;
use crate::fs::entry::{DirectoryEntry, attr};
use crate::fs::volume::{BLOCK_SIZE, FatType, Volume};

/// Layout of a freshly formatted card.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatOptions {
    /// FAT width.
    pub fat_type: FatType,
    /// Size of the whole image in blocks.
    pub total_blocks: u32,
    /// Blocks per cluster (power of two).
    pub blocks_per_cluster: u8,
    /// Number of FAT copies.
    pub fat_count: u8,
    /// Root directory capacity (FAT16).
    pub root_entries: u16,
    /// Volume label written into the boot sector and the root directory.
    pub label: Option<String>,
    /// Start of the partition; 0 writes a bare volume without MBR.
    pub partition_offset: u32,
}

impl FormatOptions {
    /// FAT16 layout with 512 root entries.
    pub fn fat16(total_blocks: u32, blocks_per_cluster: u8) -> Self {
        Self {
            fat_type: FatType::Fat16,
            total_blocks,
            blocks_per_cluster,
            fat_count: 2,
            root_entries: 512,
            label: None,
            partition_offset: 0,
        }
    }

    /// FAT32 layout with the root directory in cluster 2.
    pub fn fat32(total_blocks: u32, blocks_per_cluster: u8) -> Self {
        Self {
            fat_type: FatType::Fat32,
            root_entries: 0,
            ..Self::fat16(total_blocks, blocks_per_cluster)
        }
    }

    /// Set the volume label.
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Put the volume in a partition starting at `offset`.
    #[must_use]
    pub fn with_partition_offset(mut self, offset: u32) -> Self {
        self.partition_offset = offset;
        self
    }
}

/// Block transfer counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceStats {
    /// Blocks read.
    pub reads: u64,
    /// Blocks written.
    pub writes: u64,
    /// Calls to [`BlockDevice::recover`].
    pub recoveries: u64,
}

/// A card image held in memory.
#[derive(Debug)]
pub struct MemoryCard {
    data: Vec<u8>,
    stats: DeviceStats,
    fail_next: Option<Error>,
}

fn label_bytes(label: Option<&str>) -> [u8; 11] {
    let mut out = [b' '; 11];
    let text = label.unwrap_or("NO NAME");
    for (slot, b) in out.iter_mut().zip(text.bytes().filter(u8::is_ascii)) {
        *slot = b.to_ascii_uppercase();
    }
    out
}

impl MemoryCard {
    /// Zero-filled image of `total_blocks` blocks, unformatted.
    pub fn blank(total_blocks: u32) -> Self {
        Self {
            data: vec![0; total_blocks as usize * BLOCK_SIZE],
            stats: DeviceStats::default(),
            fail_next: None,
        }
    }

    /// Wrap an existing image.
    pub fn from_image(data: Vec<u8>) -> Result<Self> {
        if data.is_empty() || data.len() % BLOCK_SIZE != 0 {
            return Err(Error::Filesystem(format!(
                "image size {} is not a multiple of {BLOCK_SIZE}",
                data.len()
            )));
        }
        Ok(Self {
            data,
            stats: DeviceStats::default(),
            fail_next: None,
        })
    }

    /// Load an image file.
    pub fn load(path: &Path) -> Result<Self> {
        Self::from_image(fs::read(path)?)
    }

    /// Write the image to a file.
    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, &self.data)?;
        Ok(())
    }

    /// Raw image bytes.
    pub fn image(&self) -> &[u8] {
        &self.data
    }

    /// Number of blocks.
    pub fn block_count(&self) -> u32 {
        (self.data.len() / BLOCK_SIZE) as u32
    }

    /// Contents of one block, bypassing the counters.
    ///
    /// # Panics
    ///
    /// Panics if `block` is past the end of the image.
    pub fn block(&self, block: u32) -> &[u8] {
        let start = block as usize * BLOCK_SIZE;
        &self.data[start..start + BLOCK_SIZE]
    }

    /// Transfer counters.
    pub fn stats(&self) -> DeviceStats {
        self.stats
    }

    /// Make the next block transfer fail with `err`.
    pub fn fail_next(&mut self, err: Error) {
        self.fail_next = Some(err);
    }

    /// Create a formatted image.
    pub fn format(opts: &FormatOptions) -> Self {
        let mut card = Self::blank(opts.total_blocks);
        card.write_filesystem(opts);
        debug!(
            "Formatted {:?} image: {} blocks, {} per cluster",
            opts.fat_type, opts.total_blocks, opts.blocks_per_cluster
        );
        card
    }

    fn block_mut(&mut self, block: u32) -> &mut [u8] {
        let start = block as usize * BLOCK_SIZE;
        &mut self.data[start..start + BLOCK_SIZE]
    }

    fn write_filesystem(&mut self, opts: &FormatOptions) {
        let base = opts.partition_offset;
        let total = opts.total_blocks.saturating_sub(base);
        let bpc = u32::from(opts.blocks_per_cluster.max(1));
        let fat_count = u32::from(opts.fat_count.max(1));
        let (reserved, root_entries) = match opts.fat_type {
            FatType::Fat16 => (1u32, opts.root_entries),
            FatType::Fat32 => (32u32, 0),
        };
        let root_blocks = (u32::from(root_entries) * 32).div_ceil(BLOCK_SIZE as u32);
        let entry_size = opts.fat_type.entry_size();

        // Upper bound on clusters, so the FAT is never too small.
        let estimate = total.saturating_sub(reserved + root_blocks) / bpc;
        let fat_size = ((estimate + 2) * entry_size).div_ceil(BLOCK_SIZE as u32).max(1);
        let label = label_bytes(opts.label.as_deref());

        if base > 0 {
            let mbr = self.block_mut(0);
            let part = &mut mbr[446..462];
            part[4] = match opts.fat_type {
                FatType::Fat16 => 0x06,
                FatType::Fat32 => 0x0C,
            };
            LittleEndian::write_u32(&mut part[8..12], base);
            LittleEndian::write_u32(&mut part[12..16], total);
            mbr[510] = 0x55;
            mbr[511] = 0xAA;
        }

        let bs = self.block_mut(base);
        bs[0..3].copy_from_slice(match opts.fat_type {
            FatType::Fat16 => &[0xEB, 0x3C, 0x90],
            FatType::Fat32 => &[0xEB, 0x58, 0x90],
        });
        bs[3..11].copy_from_slice(b"SDLINK  ");
        LittleEndian::write_u16(&mut bs[11..13], BLOCK_SIZE as u16);
        bs[13] = bpc as u8;
        LittleEndian::write_u16(&mut bs[14..16], reserved as u16);
        bs[16] = fat_count as u8;
        LittleEndian::write_u16(&mut bs[17..19], root_entries);
        bs[21] = 0xF8;
        LittleEndian::write_u16(&mut bs[24..26], 32);
        LittleEndian::write_u16(&mut bs[26..28], 64);
        LittleEndian::write_u32(&mut bs[28..32], base);
        match opts.fat_type {
            FatType::Fat16 => {
                if let Ok(small) = u16::try_from(total) {
                    LittleEndian::write_u16(&mut bs[19..21], small);
                } else {
                    LittleEndian::write_u32(&mut bs[32..36], total);
                }
                LittleEndian::write_u16(&mut bs[22..24], fat_size as u16);
                bs[36] = 0x80;
                bs[38] = 0x29;
                LittleEndian::write_u32(&mut bs[39..43], 0x5D1C_0016);
                bs[43..54].copy_from_slice(&label);
                bs[54..62].copy_from_slice(b"FAT16   ");
            },
            FatType::Fat32 => {
                LittleEndian::write_u32(&mut bs[32..36], total);
                LittleEndian::write_u32(&mut bs[36..40], fat_size);
                LittleEndian::write_u32(&mut bs[44..48], 2);
                LittleEndian::write_u16(&mut bs[48..50], 1);
                LittleEndian::write_u16(&mut bs[50..52], 6);
                bs[64] = 0x80;
                bs[66] = 0x29;
                LittleEndian::write_u32(&mut bs[67..71], 0x5D1C_0032);
                bs[71..82].copy_from_slice(&label);
                bs[82..90].copy_from_slice(b"FAT32   ");
            },
        }
        bs[510] = 0x55;
        bs[511] = 0xAA;

        if opts.fat_type == FatType::Fat32 {
            let boot = self.block(base).to_vec();
            self.block_mut(base + 6).copy_from_slice(&boot);
            let info = self.block_mut(base + 1);
            LittleEndian::write_u32(&mut info[0..4], 0x4161_5252);
            LittleEndian::write_u32(&mut info[484..488], 0x6141_7272);
            LittleEndian::write_u32(&mut info[488..492], 0xFFFF_FFFF);
            LittleEndian::write_u32(&mut info[492..496], 0xFFFF_FFFF);
            info[510] = 0x55;
            info[511] = 0xAA;
        }

        let fat_start = base + reserved;
        for copy in 0..fat_count {
            let fat = self.block_mut(fat_start + copy * fat_size);
            match opts.fat_type {
                FatType::Fat16 => {
                    LittleEndian::write_u16(&mut fat[0..2], 0xFFF8);
                    LittleEndian::write_u16(&mut fat[2..4], 0xFFFF);
                },
                FatType::Fat32 => {
                    LittleEndian::write_u32(&mut fat[0..4], 0x0FFF_FFF8);
                    LittleEndian::write_u32(&mut fat[4..8], 0x0FFF_FFFF);
                    LittleEndian::write_u32(&mut fat[8..12], 0x0FFF_FFFF);
                },
            }
        }

        if let Some(text) = &opts.label {
            if !text.is_empty() {
                let root = fat_start + fat_count * fat_size;
                let entry = DirectoryEntry::new_short(label, attr::VOLUME_ID | attr::ARCHIVE);
                self.block_mut(root)[0..32].copy_from_slice(entry.as_bytes());
            }
        }
    }

    fn take_failure(&mut self) -> Result<()> {
        match self.fail_next.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn check_range(&self, block: u32) -> Result<()> {
        if block >= self.block_count() {
            return Err(Error::Filesystem(format!(
                "block {block} is past the end of the card ({} blocks)",
                self.block_count()
            )));
        }
        Ok(())
    }
}

impl BlockDevice for MemoryCard {
    fn read_block(&mut self, block: u32, buf: &mut [u8; BLOCK_SIZE]) -> Result<()> {
        self.take_failure()?;
        self.check_range(block)?;
        buf.copy_from_slice(self.block(block));
        self.stats.reads += 1;
        Ok(())
    }

    fn write_block(&mut self, block: u32, buf: &[u8; BLOCK_SIZE]) -> Result<()> {
        self.take_failure()?;
        self.check_range(block)?;
        self.block_mut(block)
            .copy_from_slice(buf);
        self.stats.writes += 1;
        Ok(())
    }

    fn init_volume(&mut self) -> Result<Volume> {
        let base = Volume::boot_block(self.block(0));
        self.check_range(base)?;
        Volume::from_boot_sector(self.block(base), base)
    }

    fn recover(&mut self) -> Result<()> {
        self.stats.recoveries += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fat16_geometry() {
        let mut card = MemoryCard::format(&FormatOptions::fat16(2048, 1));
        let volume = card.init_volume().unwrap();
        assert_eq!(volume.fat_type, FatType::Fat16);
        assert_eq!(volume.fat_start_block, 1);
        assert_eq!(volume.fat_size_blocks, 8);
        assert_eq!(volume.root_start, 17);
        assert_eq!(volume.data_start_block, 49);
        assert_eq!(volume.cluster_last, 2000);
        assert_eq!(volume.root_entry_count, 512);
    }

    #[test]
    fn test_fat32_geometry() {
        let mut card = MemoryCard::format(&FormatOptions::fat32(4096, 1));
        let volume = card.init_volume().unwrap();
        assert_eq!(volume.fat_type, FatType::Fat32);
        assert_eq!(volume.fat_start_block, 32);
        assert_eq!(volume.fat_size_blocks, 32);
        assert_eq!(volume.data_start_block, 96);
        assert_eq!(volume.root_start, 2);
        assert_eq!(volume.cluster_last, 4001);
        // Root cluster is allocated in every FAT copy.
        assert_eq!(LittleEndian::read_u32(&card.block(32)[8..12]), 0x0FFF_FFFF);
        assert_eq!(LittleEndian::read_u32(&card.block(64)[8..12]), 0x0FFF_FFFF);
    }

    #[test]
    fn test_partitioned_image() {
        let mut card = MemoryCard::format(&FormatOptions::fat16(4096, 4).with_partition_offset(63));
        let volume = card.init_volume().unwrap();
        assert_eq!(volume.fat_start_block, 64);
        assert_eq!(volume.blocks_per_cluster, 4);
    }

    #[test]
    fn test_label_entry_in_root() {
        let mut card = MemoryCard::format(&FormatOptions::fat16(2048, 1).with_label("cards"));
        let volume = card.init_volume().unwrap();
        let root = DirectoryEntry::from_bytes(&card.block(volume.root_start)[0..32]);
        assert!(root.is_volume_label());
        assert_eq!(root.short_name(), b"CARDS      ");
    }

    #[test]
    fn test_counters_and_injected_failure() {
        let mut card = MemoryCard::format(&FormatOptions::fat16(2048, 1));
        let mut buf = [0u8; BLOCK_SIZE];
        card.read_block(0, &mut buf).unwrap();
        card.write_block(100, &buf).unwrap();
        assert_eq!(card.stats().reads, 1);
        assert_eq!(card.stats().writes, 1);

        card.fail_next(Error::Timeout("test".into()));
        assert!(card.read_block(0, &mut buf).is_err());
        assert!(card.read_block(0, &mut buf).is_ok());
        assert!(card.read_block(5000, &mut buf).is_err());
    }

    #[test]
    fn test_image_rejects_partial_blocks() {
        assert!(MemoryCard::from_image(vec![0; 700]).is_err());
        assert_eq!(MemoryCard::from_image(vec![0; 1024]).unwrap().block_count(), 2);
    }
}
