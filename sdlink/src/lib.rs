//! # sdlink
//!
//! A library for driving STK500-framed microcontroller boards over a serial
//! link and for managing the Micro-SD card plugged into them.
//!
//! - Framed, checksummed and sequenced command protocol with device modes
//!   (bootloader, sketch, service)
//! - FAT16/FAT32 over remote block reads and writes, with long file names and
//!   a write-back block cache
//! - A worker-thread task engine with synchronous and asynchronous queues,
//!   progress and cooperative cancellation
//! - An in-process virtual device for tests and offline use
//!
//! ## Features
//!
//! - `native` (default): Native serial port support
//! - `serde`: Serialization support for data types
//!
//! ## Example
//!
//! ```rust,no_run
//! use sdlink::fs::{FormatOptions, MemoryCard};
//! use sdlink::port::VirtualDevice;
//! use sdlink::task::catalog::ListDirectoryTask;
//! use sdlink::task::{EngineConfig, TaskEngine};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let card = MemoryCard::format(&FormatOptions::fat32(65536, 8));
//!     let engine = TaskEngine::open(Box::new(VirtualDevice::new(card)), EngineConfig::default())?;
//!
//!     let task = ListDirectoryTask::new("/");
//!     let entries = task.output();
//!     engine.execute(task, false).result()?;
//!     for entry in entries.take().unwrap_or_default() {
//!         println!("{} {}", entry.name, entry.size());
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod fs;
pub mod monitor;
pub mod port;
pub mod protocol;
pub mod settings;
pub mod task;

#[cfg(feature = "native")]
pub use port::{NativePort, NativePortEnumerator};
pub use {
    error::{Error, Result},
    fs::{BlockDevice, DirectoryInfo, FatFs, FormatOptions, MemoryCard, Volume},
    monitor::{LineFormatter, TextDecoder},
    port::{Port, PortEnumerator, PortInfo, SerialConfig, VirtualDevice},
    protocol::{Mode, Session, SessionConfig},
    settings::{DeviceSettings, RegisterSet},
    task::{EngineConfig, Event, Task, TaskContext, TaskEngine, TaskHandle, TaskOutput},
};
