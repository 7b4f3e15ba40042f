//! Flash upload commands.

use anyhow::Result;
use console::style;
use sdlink::task::catalog::{UploadFirmwareTask, UploadProgramTask};

use super::human_size;
use crate::Cli;
use crate::link::Link;

/// `upload-program` command.
pub(crate) fn cmd_upload_program(
    cli: &Cli,
    link: &Link,
    data: Vec<u8>,
    address: u32,
    verify: bool,
) -> Result<()> {
    let size = data.len();
    if !cli.quiet {
        eprintln!(
            "{} Uploading {} at 0x{address:05X}",
            style("⚡").cyan(),
            human_size(size as u64)
        );
    }
    link.run(UploadProgramTask::new(data, address).with_verify(verify))?;
    if !cli.quiet {
        let how = if verify { "written and verified" } else { "written" };
        eprintln!("{} {} {how}", style("✓").green(), human_size(size as u64));
    }
    Ok(())
}

/// `upload-firmware` command. Confirmation happens before the link is opened.
pub(crate) fn cmd_upload_firmware(cli: &Cli, link: &Link, data: Vec<u8>) -> Result<()> {
    let size = data.len();
    link.run(UploadFirmwareTask::new(data))?;
    if !cli.quiet {
        eprintln!(
            "{} Firmware updated ({})",
            style("✓").green(),
            human_size(size as u64)
        );
    }
    Ok(())
}
