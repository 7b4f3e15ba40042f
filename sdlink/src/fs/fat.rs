//! FAT layer: cluster chains and directory slot walking.

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info, trace};

use crate::error::{Error, Result};
use crate::fs::BlockDevice;
use crate::fs::cache::{BlockCache, with_retry};
use crate::fs::entry::{DirectoryEntry, DirectoryEntryPointer, ENTRY_SIZE};
use crate::fs::volume::{BLOCK_SIZE, ENTRIES_PER_BLOCK, FatType, Volume};

/// Upper 4 bits of a FAT32 entry, preserved on write.
const FAT32_RESERVED_BITS: u32 = 0xF000_0000;

/// A FAT filesystem on a block device.
///
/// All block access goes through the write-back cache. Call
/// [`flush`](Self::flush) before relying on written data.
pub struct FatFs<D> {
    dev: D,
    cache: BlockCache,
    volume: Option<Volume>,
    alloc_hint: u32,
}

impl<D: BlockDevice> FatFs<D> {
    /// Wrap a device. The volume is mounted on first use.
    pub fn new(dev: D) -> Self {
        Self {
            dev,
            cache: BlockCache::new(),
            volume: None,
            alloc_hint: 0,
        }
    }

    /// The underlying device.
    pub fn device(&self) -> &D {
        &self.dev
    }

    /// Mutable access to the underlying device, bypassing the cache.
    pub fn device_mut(&mut self) -> &mut D {
        &mut self.dev
    }

    /// Consume the filesystem and return the device. Unflushed data is lost.
    pub fn into_device(self) -> D {
        self.dev
    }

    /// The block cache.
    pub fn cache(&self) -> &BlockCache {
        &self.cache
    }

    /// Initialise the card and read its geometry.
    pub fn mount(&mut self) -> Result<Volume> {
        self.cache.invalidate();
        let volume = with_retry(&mut self.dev, |d| d.init_volume())?;
        info!(
            "Mounted {:?} volume: {} clusters of {} bytes",
            volume.fat_type,
            volume.cluster_last.saturating_sub(1),
            volume.cluster_bytes()
        );
        self.volume = Some(volume);
        self.alloc_hint = 0;
        Ok(volume)
    }

    /// The mounted volume, mounting it if needed.
    pub fn volume(&mut self) -> Result<Volume> {
        match self.volume {
            Some(volume) => Ok(volume),
            None => self.mount(),
        }
    }

    /// Forget the volume and every cached block.
    ///
    /// Needed after the device was reset; dirty lines are dropped.
    pub fn invalidate(&mut self) {
        if self.cache.dirty_count() > 0 {
            debug!("Dropping {} dirty cache lines", self.cache.dirty_count());
        }
        self.cache.invalidate();
        self.volume = None;
    }

    /// Write back every dirty block.
    pub fn flush(&mut self) -> Result<()> {
        self.cache.flush(&mut self.dev)
    }

    /// Read access to a block through the cache.
    pub fn block(&mut self, block: u32) -> Result<&[u8; BLOCK_SIZE]> {
        self.cache.block(&mut self.dev, block, false)
    }

    /// Write access to a block through the cache.
    pub fn block_mut(&mut self, block: u32) -> Result<&mut [u8; BLOCK_SIZE]> {
        self.cache.block_mut(&mut self.dev, block, false)
    }

    /// Cache a block that will be overwritten entirely, without reading it.
    pub fn block_overwrite(&mut self, block: u32) -> Result<&mut [u8; BLOCK_SIZE]> {
        self.cache.block_overwrite(&mut self.dev, block)
    }

    /// First block of `cluster`.
    pub fn cluster_block(&mut self, cluster: u32) -> Result<u32> {
        Ok(self.volume()?.cluster_block(cluster))
    }

    /// Cluster containing `block`.
    pub fn cluster_from_block(&mut self, block: u32) -> Result<u32> {
        Ok(self.volume()?.cluster_from_block(block))
    }

    /// Whether `cluster` ends a chain.
    pub fn is_eoc(&mut self, cluster: u32) -> Result<bool> {
        Ok(self.volume()?.is_eoc(cluster))
    }

    fn fat_location(volume: &Volume, cluster: u32) -> Result<(u32, usize)> {
        if !volume.is_valid_cluster(cluster) {
            return Err(Error::Filesystem(format!(
                "cluster {cluster} out of range (2..={})",
                volume.cluster_last
            )));
        }
        let offset = cluster * volume.fat_type.entry_size();
        Ok((
            volume.fat_start_block + offset / BLOCK_SIZE as u32,
            (offset % BLOCK_SIZE as u32) as usize,
        ))
    }

    /// Read the FAT entry for `cluster`.
    pub fn fat_get(&mut self, cluster: u32) -> Result<u32> {
        let volume = self.volume()?;
        let (block, offset) = Self::fat_location(&volume, cluster)?;
        let data = self.cache.block(&mut self.dev, block, true)?;
        Ok(match volume.fat_type {
            FatType::Fat16 => u32::from(LittleEndian::read_u16(&data[offset..offset + 2])),
            FatType::Fat32 => LittleEndian::read_u32(&data[offset..offset + 4]) & !FAT32_RESERVED_BITS,
        })
    }

    /// Write the FAT entry for `cluster` into every FAT copy.
    pub fn fat_put(&mut self, cluster: u32, value: u32) -> Result<()> {
        let volume = self.volume()?;
        let (block, offset) = Self::fat_location(&volume, cluster)?;
        trace!("FAT[{cluster}] = 0x{value:X}");
        for copy in 0..u32::from(volume.fat_count) {
            let data = self
                .cache
                .block_mut(&mut self.dev, block + copy * volume.fat_size_blocks, true)?;
            match volume.fat_type {
                FatType::Fat16 => {
                    LittleEndian::write_u16(&mut data[offset..offset + 2], value as u16);
                },
                FatType::Fat32 => {
                    let old = LittleEndian::read_u32(&data[offset..offset + 4]);
                    let new = (old & FAT32_RESERVED_BITS) | (value & !FAT32_RESERVED_BITS);
                    LittleEndian::write_u32(&mut data[offset..offset + 4], new);
                },
            }
        }
        Ok(())
    }

    /// Next free cluster after `start`, wrapping from the last cluster to 2.
    ///
    /// `start` itself is not probed. An out-of-range `start` probes every
    /// cluster.
    pub fn find_free_cluster(&mut self, start: u32) -> Result<u32> {
        let volume = self.volume()?;
        let last = volume.cluster_last;
        let span = last.saturating_sub(1);
        let (mut cluster, probes) = if volume.is_valid_cluster(start) {
            (start, span.saturating_sub(1))
        } else {
            (last, span)
        };
        for _ in 0..probes {
            cluster = if cluster >= last { 2 } else { cluster + 1 };
            if self.fat_get(cluster)? == 0 {
                return Ok(cluster);
            }
        }
        Err(Error::NoSpace)
    }

    /// Allocate a cluster, terminate it and link it behind `prev` (0 for a
    /// new chain). With `zero` set its data blocks are cleared.
    pub fn alloc_cluster(&mut self, prev: u32, zero: bool) -> Result<u32> {
        let volume = self.volume()?;
        let start = if volume.is_valid_cluster(prev) { prev } else { self.alloc_hint };
        let cluster = self.find_free_cluster(start)?;
        self.fat_put(cluster, volume.fat_type.eoc_mark())?;
        if volume.is_valid_cluster(prev) {
            self.fat_put(prev, cluster)?;
        }
        if zero {
            let first = volume.cluster_block(cluster);
            for block in first..first + u32::from(volume.blocks_per_cluster) {
                self.block_overwrite(block)?;
            }
        }
        self.alloc_hint = cluster;
        trace!("Allocated cluster {cluster} after {prev}");
        Ok(cluster)
    }

    /// Clusters of the chain starting at `first`.
    pub fn chain(&mut self, first: u32) -> Result<Vec<u32>> {
        let volume = self.volume()?;
        let mut clusters = Vec::new();
        let mut cluster = first;
        while !volume.is_eoc(cluster) {
            if clusters.len() > volume.cluster_last as usize {
                return Err(Error::Filesystem(format!("cluster chain from {first} loops")));
            }
            clusters.push(cluster);
            cluster = self.fat_get(cluster)?;
        }
        Ok(clusters)
    }

    /// Free every FAT entry of the chain starting at `first`. Data blocks
    /// are left untouched.
    pub fn wipe_cluster_chain(&mut self, first: u32) -> Result<()> {
        let freed = self.chain(first)?;
        for &cluster in &freed {
            self.fat_put(cluster, 0)?;
        }
        if !freed.is_empty() {
            debug!("Freed {} clusters from {first}", freed.len());
        }
        Ok(())
    }

    /// First slot of the root directory.
    pub fn root_pointer(&mut self) -> Result<DirectoryEntryPointer> {
        let volume = self.volume()?;
        Ok(match volume.fat_type {
            FatType::Fat16 => DirectoryEntryPointer::new(volume.root_start, 0),
            FatType::Fat32 => DirectoryEntryPointer::new(volume.cluster_block(volume.root_start), 0),
        })
    }

    /// First slot of the directory starting at `cluster`; 0 means root.
    pub fn directory_pointer(&mut self, cluster: u32) -> Result<DirectoryEntryPointer> {
        if cluster == 0 {
            return self.root_pointer();
        }
        Ok(DirectoryEntryPointer::new(self.cluster_block(cluster)?, 0))
    }

    /// Cluster number stored in `..` entries for the directory at `start`.
    pub fn directory_cluster(&mut self, start: DirectoryEntryPointer) -> Result<u32> {
        if start == self.root_pointer()? {
            return Ok(0);
        }
        self.cluster_from_block(start.block)
    }

    /// Advance `ptr` by `count` slots.
    ///
    /// Crosses block and cluster boundaries. At the end of the chain a
    /// zeroed cluster is appended when `create` is set, otherwise `None` is
    /// returned. The FAT16 root region cannot grow.
    pub fn next_directory(
        &mut self,
        ptr: DirectoryEntryPointer,
        count: usize,
        create: bool,
    ) -> Result<Option<DirectoryEntryPointer>> {
        let mut ptr = ptr;
        for _ in 0..count {
            match self.next_slot(ptr, create)? {
                Some(next) => ptr = next,
                None => return Ok(None),
            }
        }
        Ok(Some(ptr))
    }

    fn next_slot(
        &mut self,
        ptr: DirectoryEntryPointer,
        create: bool,
    ) -> Result<Option<DirectoryEntryPointer>> {
        if usize::from(ptr.index) + 1 < ENTRIES_PER_BLOCK {
            return Ok(Some(DirectoryEntryPointer::new(ptr.block, ptr.index + 1)));
        }
        let volume = self.volume()?;
        if volume.in_root_region(ptr.block) {
            if ptr.block + 1 < volume.root_start + volume.root_blocks() {
                return Ok(Some(DirectoryEntryPointer::new(ptr.block + 1, 0)));
            }
            if create {
                return Err(Error::Filesystem("root directory is full".into()));
            }
            return Ok(None);
        }
        if !volume.is_last_block_of_cluster(ptr.block) {
            return Ok(Some(DirectoryEntryPointer::new(ptr.block + 1, 0)));
        }

        let cluster = volume.cluster_from_block(ptr.block);
        let next = self.fat_get(cluster)?;
        if !volume.is_eoc(next) {
            if !volume.is_valid_cluster(next) {
                return Err(Error::Filesystem(format!(
                    "directory chain points to invalid cluster {next}"
                )));
            }
            return Ok(Some(DirectoryEntryPointer::new(volume.cluster_block(next), 0)));
        }
        if !create {
            return Ok(None);
        }
        let grown = self.alloc_cluster(cluster, true)?;
        debug!("Directory grew by cluster {grown}");
        Ok(Some(DirectoryEntryPointer::new(volume.cluster_block(grown), 0)))
    }

    /// Read the entry at `ptr`.
    pub fn read_entry(&mut self, ptr: DirectoryEntryPointer) -> Result<DirectoryEntry> {
        let offset = ptr.offset();
        let data = self.block(ptr.block)?;
        Ok(DirectoryEntry::from_bytes(&data[offset..offset + ENTRY_SIZE]))
    }

    /// Write the entry at `ptr`.
    pub fn write_entry(&mut self, ptr: DirectoryEntryPointer, entry: &DirectoryEntry) -> Result<()> {
        let offset = ptr.offset();
        let data = self.block_mut(ptr.block)?;
        data[offset..offset + ENTRY_SIZE].copy_from_slice(entry.as_bytes());
        Ok(())
    }
}
