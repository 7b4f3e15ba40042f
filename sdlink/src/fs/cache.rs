//! Write-back block cache.
//!
//! A fixed table of [`CACHE_LINES`] lines with an index from block number to
//! line. At most one line maps to a block. Evicting a dirty line writes it
//! back first.

use std::collections::HashMap;

use log::{debug, trace, warn};

use crate::error::Result;
use crate::fs::BlockDevice;
use crate::fs::volume::BLOCK_SIZE;

/// Number of cache lines.
pub const CACHE_LINES: usize = 10;

#[derive(Clone)]
struct CacheLine {
    data: [u8; BLOCK_SIZE],
    block: u32,
    valid: bool,
    is_fat: bool,
    dirty: bool,
    usage: u64,
}

impl Default for CacheLine {
    fn default() -> Self {
        Self {
            data: [0; BLOCK_SIZE],
            block: 0,
            valid: false,
            is_fat: false,
            dirty: false,
            usage: 0,
        }
    }
}

/// Hit/miss counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups served from a line.
    pub hits: u64,
    /// Lookups that needed a line to be (re)assigned.
    pub misses: u64,
    /// Dirty lines written back.
    pub write_backs: u64,
}

/// Run `op`, and on a link failure recover the device and run it once more.
pub(crate) fn with_retry<D, T>(dev: &mut D, mut op: impl FnMut(&mut D) -> Result<T>) -> Result<T>
where
    D: BlockDevice + ?Sized,
{
    match op(dev) {
        Err(e) if e.is_transport() => {
            warn!("Block transfer failed ({e}), resetting link and retrying once");
            dev.recover()?;
            op(dev)
        },
        other => other,
    }
}

/// The block cache.
pub struct BlockCache {
    lines: Vec<CacheLine>,
    index: HashMap<u32, usize>,
    tick: u64,
    stats: CacheStats,
}

impl Default for BlockCache {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self {
            lines: vec![CacheLine::default(); CACHE_LINES],
            index: HashMap::with_capacity(CACHE_LINES),
            tick: 0,
            stats: CacheStats::default(),
        }
    }

    /// Counters since creation.
    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Number of dirty lines.
    pub fn dirty_count(&self) -> usize {
        self.lines
            .iter()
            .filter(|l| l.valid && l.dirty)
            .count()
    }

    /// Whether `block` currently has a line.
    pub fn contains(&self, block: u32) -> bool {
        self.index
            .contains_key(&block)
    }

    /// Map `block` to a line and return the line index.
    ///
    /// A hit bumps usage and ORs in `mark_dirty`. A miss evicts the least
    /// recently used line (writing it back when dirty), retags it and reads
    /// the block when `read` is set; otherwise the line is zero-filled.
    pub fn cache_block<D>(
        &mut self,
        dev: &mut D,
        block: u32,
        read: bool,
        mark_dirty: bool,
        is_fat: bool,
    ) -> Result<usize>
    where
        D: BlockDevice + ?Sized,
    {
        self.tick += 1;
        if let Some(&slot) = self.index.get(&block) {
            let line = &mut self.lines[slot];
            line.usage = self.tick;
            line.dirty |= mark_dirty;
            self.stats.hits += 1;
            return Ok(slot);
        }

        self.stats.misses += 1;
        let slot = self.victim();
        self.evict(dev, slot)?;

        let line = &mut self.lines[slot];
        if read {
            with_retry(dev, |d| d.read_block(block, &mut line.data))?;
        } else {
            line.data.fill(0);
        }
        trace!("Cache line {slot} <- block {block} (read={read})");
        line.block = block;
        line.valid = true;
        line.is_fat = is_fat;
        line.dirty = mark_dirty;
        line.usage = self.tick;
        self.index.insert(block, slot);
        Ok(slot)
    }

    /// Read access to a cached block.
    pub fn block<D>(&mut self, dev: &mut D, block: u32, is_fat: bool) -> Result<&[u8; BLOCK_SIZE]>
    where
        D: BlockDevice + ?Sized,
    {
        let slot = self.cache_block(dev, block, true, false, is_fat)?;
        Ok(&self.lines[slot].data)
    }

    /// Write access to a cached block; the line becomes dirty.
    pub fn block_mut<D>(
        &mut self,
        dev: &mut D,
        block: u32,
        is_fat: bool,
    ) -> Result<&mut [u8; BLOCK_SIZE]>
    where
        D: BlockDevice + ?Sized,
    {
        let slot = self.cache_block(dev, block, true, true, is_fat)?;
        Ok(&mut self.lines[slot].data)
    }

    /// Like [`block_mut`](Self::block_mut) but skips reading: the caller
    /// overwrites the whole block.
    pub fn block_overwrite<D>(&mut self, dev: &mut D, block: u32) -> Result<&mut [u8; BLOCK_SIZE]>
    where
        D: BlockDevice + ?Sized,
    {
        let slot = self.cache_block(dev, block, false, true, false)?;
        Ok(&mut self.lines[slot].data)
    }

    fn victim(&self) -> usize {
        self.lines
            .iter()
            .enumerate()
            .min_by_key(|(_, l)| (l.valid, l.usage))
            .map_or(0, |(i, _)| i)
    }

    fn evict<D>(&mut self, dev: &mut D, slot: usize) -> Result<()>
    where
        D: BlockDevice + ?Sized,
    {
        self.write_back(dev, slot)?;
        let line = &mut self.lines[slot];
        if line.valid {
            self.index
                .remove(&line.block);
            line.valid = false;
        }
        Ok(())
    }

    fn write_back<D>(&mut self, dev: &mut D, slot: usize) -> Result<()>
    where
        D: BlockDevice + ?Sized,
    {
        let line = &mut self.lines[slot];
        if line.valid && line.dirty {
            let block = line.block;
            with_retry(dev, |d| d.write_block(block, &line.data))?;
            line.dirty = false;
            self.stats.write_backs += 1;
        }
        Ok(())
    }

    /// Write back every dirty line, FAT lines first.
    pub fn flush<D>(&mut self, dev: &mut D) -> Result<()>
    where
        D: BlockDevice + ?Sized,
    {
        let mut order: Vec<usize> = (0..self.lines.len())
            .filter(|&i| self.lines[i].valid && self.lines[i].dirty)
            .collect();
        if order.is_empty() {
            return Ok(());
        }
        order.sort_by_key(|&i| (!self.lines[i].is_fat, self.lines[i].block));
        debug!("Flushing {} dirty cache lines", order.len());
        for slot in order {
            self.write_back(dev, slot)?;
        }
        Ok(())
    }

    /// Drop every line without writing back.
    pub fn invalidate(&mut self) {
        for line in &mut self.lines {
            line.valid = false;
            line.dirty = false;
        }
        self.index.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::fs::memory::{FormatOptions, MemoryCard};

    fn card() -> MemoryCard {
        MemoryCard::format(&FormatOptions::fat16(2048, 1))
    }

    #[test]
    fn test_write_then_read_hits_cache() {
        let mut dev = card();
        let mut cache = BlockCache::new();

        cache.block_mut(&mut dev, 500, false).unwrap()[0..4].copy_from_slice(b"DATA");
        let reads_after_write = dev.stats().reads;

        let data = cache.block(&mut dev, 500, false).unwrap();
        assert_eq!(&data[0..4], b"DATA");
        assert_eq!(dev.stats().reads, reads_after_write);
        assert_eq!(dev.stats().writes, 0);
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn test_flush_writes_dirty_lines_once() {
        let mut dev = card();
        let mut cache = BlockCache::new();
        cache.block_mut(&mut dev, 600, false).unwrap()[0] = 0xAA;
        cache.block_mut(&mut dev, 601, false).unwrap()[0] = 0xBB;
        assert_eq!(cache.dirty_count(), 2);

        cache.flush(&mut dev).unwrap();
        assert_eq!(cache.dirty_count(), 0);
        assert_eq!(dev.stats().writes, 2);
        assert_eq!(dev.block(600)[0], 0xAA);

        cache.flush(&mut dev).unwrap();
        assert_eq!(dev.stats().writes, 2);
    }

    #[test]
    fn test_eviction_flushes_dirty_line() {
        let mut dev = card();
        let mut cache = BlockCache::new();
        for block in 0..CACHE_LINES as u32 {
            cache.block_mut(&mut dev, 1000 + block, false).unwrap()[0] = block as u8 + 1;
        }
        assert_eq!(cache.dirty_count(), CACHE_LINES);
        assert_eq!(dev.stats().writes, 0);

        cache.block(&mut dev, 1500, false).unwrap();
        assert_eq!(dev.stats().writes, 1);
        assert_eq!(dev.block(1000)[0], 1);
        assert!(!cache.contains(1000));
        assert!(cache.dirty_count() <= CACHE_LINES);
    }

    #[test]
    fn test_lru_keeps_recently_used() {
        let mut dev = card();
        let mut cache = BlockCache::new();
        for block in 0..CACHE_LINES as u32 {
            cache.block(&mut dev, block, false).unwrap();
        }
        cache.block(&mut dev, 0, false).unwrap();
        cache.block(&mut dev, 100, false).unwrap();
        assert!(cache.contains(0));
        assert!(!cache.contains(1));
    }

    #[test]
    fn test_one_transient_failure_is_retried() {
        let mut dev = card();
        dev.fail_next(Error::Timeout("injected".into()));
        let mut cache = BlockCache::new();
        assert!(cache.block(&mut dev, 3, false).is_ok());
        assert_eq!(dev.stats().recoveries, 1);
    }

    #[test]
    fn test_logical_errors_are_not_retried() {
        let mut dev = card();
        dev.fail_next(Error::NoSpace);
        let mut cache = BlockCache::new();
        assert!(matches!(cache.block(&mut dev, 3, false), Err(Error::NoSpace)));
        assert_eq!(dev.stats().recoveries, 0);
    }
}
