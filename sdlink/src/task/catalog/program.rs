//! Program and firmware uploads.

use std::sync::Arc;

use log::info;

use crate::error::{Error, Result};
use crate::protocol::command::FLASH_PAGE_SIZE;
use crate::task::{Task, TaskContext};

/// Write a flat binary into flash.
#[derive(Debug)]
pub struct UploadProgramTask {
    image: Vec<u8>,
    address: u32,
    verify: bool,
}

impl UploadProgramTask {
    /// Program `image` starting at byte `address` (page aligned).
    pub fn new(image: Vec<u8>, address: u32) -> Self {
        Self {
            image,
            address,
            verify: true,
        }
    }

    /// Read every page back after writing (on by default).
    #[must_use]
    pub fn with_verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }
}

impl Task for UploadProgramTask {
    fn title(&self) -> String {
        format!("Upload program ({} bytes)", self.image.len())
    }

    fn run(&mut self, ctx: &mut TaskContext<'_>) -> Result<()> {
        if self.address as usize % FLASH_PAGE_SIZE != 0 {
            return Err(Error::Config(format!(
                "program address 0x{:X} is not aligned to {FLASH_PAGE_SIZE}-byte pages",
                self.address
            )));
        }
        let pages = self.image.len().div_ceil(FLASH_PAGE_SIZE);
        let steps = if self.verify { pages * 2 } else { pages };
        ctx.set_status("Writing flash");
        for (i, page) in self.image.chunks(FLASH_PAGE_SIZE).enumerate() {
            ctx.check_cancel()?;
            let address = self.address + (i * FLASH_PAGE_SIZE) as u32;
            ctx.session().flash_write_page(address, page)?;
            ctx.set_progress((i + 1) as f32 / steps as f32);
        }

        if self.verify {
            ctx.set_status("Verifying flash");
            for (i, page) in self.image.chunks(FLASH_PAGE_SIZE).enumerate() {
                ctx.check_cancel()?;
                let address = self.address + (i * FLASH_PAGE_SIZE) as u32;
                let back = ctx.session().flash_read(address, page.len())?;
                if back != page {
                    let at = back
                        .iter()
                        .zip(page)
                        .position(|(a, b)| a != b)
                        .unwrap_or(0);
                    return Err(Error::Protocol(format!(
                        "flash verify failed at 0x{:X}",
                        address as usize + at
                    )));
                }
                ctx.set_progress((pages + i + 1) as f32 / steps as f32);
            }
        }
        info!("Programmed {} bytes at 0x{:X}", self.image.len(), self.address);
        Ok(())
    }
}

/// Reflash the firmware through service mode.
///
/// Cancellation is honoured only before the device enters service mode;
/// once the first page is written the upload runs to the end.
#[derive(Debug)]
pub struct UploadFirmwareTask {
    image: Vec<u8>,
}

impl UploadFirmwareTask {
    /// Upload `image` to the firmware region.
    pub fn new(image: Vec<u8>) -> Self {
        Self { image }
    }
}

impl Task for UploadFirmwareTask {
    fn title(&self) -> String {
        format!("Upload firmware ({} bytes)", self.image.len())
    }

    fn run(&mut self, ctx: &mut TaskContext<'_>) -> Result<()> {
        if self.image.is_empty() {
            return Err(Error::Config("firmware image is empty".into()));
        }
        ctx.check_cancel()?;
        ctx.fs().flush()?;
        ctx.fs().invalidate();

        let handle = Arc::clone(ctx.handle());
        let _uninterruptible = handle.suppress_cancel();
        ctx.set_status("Entering service mode");
        ctx.session().set_service_mode()?;

        ctx.set_status("Writing firmware");
        let pages = self.image.len().div_ceil(FLASH_PAGE_SIZE);
        for (i, page) in self.image.chunks(FLASH_PAGE_SIZE).enumerate() {
            let address = (i * FLASH_PAGE_SIZE) as u32;
            ctx.session().service_program(address, page)?;
            ctx.set_progress((i + 1) as f32 / pages as f32);
        }

        ctx.set_status("Restarting firmware");
        ctx.session().set_firmware_mode()?;
        info!("Firmware updated ({} bytes)", self.image.len());
        Ok(())
    }
}
