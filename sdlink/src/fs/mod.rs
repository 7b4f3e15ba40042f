//! FAT16/FAT32 filesystem over remote block I/O.
//!
//! ```text
//! dir / file       logical entries, file data
//!      |
//!    FatFs          cluster arithmetic, FAT entries, directory walking
//!      |
//!  BlockCache       write-back, 10 lines
//!      |
//!  BlockDevice      Session (remote card) or MemoryCard
//! ```

pub mod cache;
pub mod dir;
pub mod entry;
pub mod fat;
pub mod file;
pub mod lfn;
pub mod memory;
pub mod volume;

use crate::error::Result;

pub use cache::{BlockCache, CACHE_LINES};
pub use dir::DirectoryInfo;
pub use entry::{DirectoryEntry, DirectoryEntryPointer};
pub use fat::FatFs;
pub use lfn::LongFileNameGen;
pub use memory::{FormatOptions, MemoryCard};
pub use volume::{BLOCK_SIZE, FatType, Volume};

/// Source of 512-byte card blocks.
pub trait BlockDevice {
    /// Read one block.
    fn read_block(&mut self, block: u32, buf: &mut [u8; BLOCK_SIZE]) -> Result<()>;

    /// Write one block.
    fn write_block(&mut self, block: u32, buf: &[u8; BLOCK_SIZE]) -> Result<()>;

    /// Initialise the card and return its geometry.
    fn init_volume(&mut self) -> Result<Volume>;

    /// Bring the link back into a usable state after a transport failure.
    fn recover(&mut self) -> Result<()>;
}
