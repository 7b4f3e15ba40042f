//! Registers, settings and device identity.

use crate::error::Result;
use crate::fs::volume::Volume;
use crate::settings::{DeviceSettings, RegisterSet, RegisterValue};
use crate::task::{Task, TaskContext, TaskOutput};

/// Read a register set from RAM.
#[derive(Debug)]
pub struct ReadRegistersTask {
    registers: RegisterSet,
    output: TaskOutput<Vec<RegisterValue>>,
}

impl ReadRegistersTask {
    /// Read `registers`.
    pub fn new(registers: RegisterSet) -> Self {
        Self {
            registers,
            output: TaskOutput::new(),
        }
    }

    /// Values, once finished.
    pub fn output(&self) -> TaskOutput<Vec<RegisterValue>> {
        self.output.clone()
    }
}

impl Task for ReadRegistersTask {
    fn title(&self) -> String {
        "Read registers".into()
    }

    fn run(&mut self, ctx: &mut TaskContext<'_>) -> Result<()> {
        let (address, len) = self.registers.span();
        let span = ctx.session().ram_read(address, len)?;
        self.output.set(self.registers.decode(&span)?);
        Ok(())
    }
}

/// Change register values, writing only the bytes that differ.
#[derive(Debug)]
pub struct UpdateRegistersTask {
    registers: RegisterSet,
    updates: Vec<(String, u32)>,
    output: TaskOutput<usize>,
}

impl UpdateRegistersTask {
    /// Apply `updates` (name, value) within `registers`.
    pub fn new(registers: RegisterSet, updates: Vec<(String, u32)>) -> Self {
        Self {
            registers,
            updates,
            output: TaskOutput::new(),
        }
    }

    /// Number of bytes written.
    pub fn output(&self) -> TaskOutput<usize> {
        self.output.clone()
    }
}

impl Task for UpdateRegistersTask {
    fn title(&self) -> String {
        "Update registers".into()
    }

    fn run(&mut self, ctx: &mut TaskContext<'_>) -> Result<()> {
        let (address, len) = self.registers.span();
        let current = ctx.session().ram_read(address, len)?;
        let write = self
            .registers
            .encode_changes(&current, &self.updates)?;
        let changed = write
            .mask
            .iter()
            .filter(|&&m| m != 0)
            .count();
        if changed > 0 {
            ctx.session()
                .ram_write(write.address, &write.data, &write.mask)?;
        }
        self.output.set(changed);
        Ok(())
    }
}

/// Read the EEPROM settings block.
#[derive(Debug, Default)]
pub struct ReadSettingsTask {
    output: TaskOutput<DeviceSettings>,
}

impl ReadSettingsTask {
    /// New task.
    pub fn new() -> Self {
        Self::default()
    }

    /// Settings, once finished.
    pub fn output(&self) -> TaskOutput<DeviceSettings> {
        self.output.clone()
    }
}

impl Task for ReadSettingsTask {
    fn title(&self) -> String {
        "Read settings".into()
    }

    fn run(&mut self, ctx: &mut TaskContext<'_>) -> Result<()> {
        self.output
            .set(DeviceSettings::read(ctx.session())?);
        Ok(())
    }
}

/// Store an EEPROM settings block.
#[derive(Debug)]
pub struct WriteSettingsTask {
    settings: DeviceSettings,
}

impl WriteSettingsTask {
    /// Write `settings`.
    pub fn new(settings: DeviceSettings) -> Self {
        Self { settings }
    }
}

impl Task for WriteSettingsTask {
    fn title(&self) -> String {
        "Write settings".into()
    }

    fn run(&mut self, ctx: &mut TaskContext<'_>) -> Result<()> {
        self.settings.write(ctx.session())
    }
}

/// Identity and card summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Name reported by sign-on.
    pub name: String,
    /// Signature bytes.
    pub signature: [u8; 3],
    /// Card geometry, if a card answered.
    pub volume: Option<Volume>,
    /// Volume label.
    pub label: Option<String>,
}

/// Query the device name, signature and card.
#[derive(Debug, Default)]
pub struct DeviceInfoTask {
    output: TaskOutput<DeviceInfo>,
}

impl DeviceInfoTask {
    /// New task.
    pub fn new() -> Self {
        Self::default()
    }

    /// The summary, once finished.
    pub fn output(&self) -> TaskOutput<DeviceInfo> {
        self.output.clone()
    }
}

impl Task for DeviceInfoTask {
    fn title(&self) -> String {
        "Device info".into()
    }

    fn run(&mut self, ctx: &mut TaskContext<'_>) -> Result<()> {
        let session = ctx.session();
        let name = session
            .device_name()
            .unwrap_or_default()
            .to_string();
        let signature = session.device_signature()?;
        let fs = ctx.fs();
        let (volume, label) = match fs.volume() {
            Ok(volume) => (Some(volume), fs.volume_label()?),
            Err(e) => {
                log::debug!("No card: {e}");
                (None, None)
            },
        };
        self.output.set(DeviceInfo {
            name,
            signature,
            volume,
            label,
        });
        Ok(())
    }
}
