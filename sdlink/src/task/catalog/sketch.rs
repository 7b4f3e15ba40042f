//! Sketches stored on the card.
//!
//! A sketch is a root-level `.HEX` file. Its icon, if any, is the root file
//! with the same base name and the `.SKI` extension.

use log::info;

use crate::error::{Error, Result};
use crate::fs::dir::DirectoryInfo;
use crate::settings::DeviceSettings;
use crate::task::{Task, TaskContext, TaskOutput};

/// Extension of sketch files.
pub const SKETCH_EXTENSION: &str = "HEX";

/// Extension of sketch icons.
pub const ICON_EXTENSION: &str = "SKI";

/// A sketch found on the card.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SketchInfo {
    /// Display name without extension.
    pub name: String,
    /// File name on the card.
    pub file_name: String,
    /// Size of the sketch file.
    pub size: u32,
    /// File name of the icon, if present.
    pub icon: Option<String>,
}

fn base_name(file_name: &str) -> &str {
    file_name
        .rsplit_once('.')
        .map_or(file_name, |(base, _)| base)
}

fn sketches(entries: &[DirectoryInfo]) -> Vec<SketchInfo> {
    let icons: Vec<&DirectoryInfo> = entries
        .iter()
        .filter(|e| !e.is_directory() && e.extension() == ICON_EXTENSION)
        .collect();
    entries
        .iter()
        .filter(|e| !e.is_directory() && e.extension() == SKETCH_EXTENSION)
        .map(|e| {
            let base = base_name(&e.name);
            SketchInfo {
                name: base.to_string(),
                file_name: e.name.clone(),
                size: e.size(),
                icon: icons
                    .iter()
                    .find(|icon| base_name(&icon.name).eq_ignore_ascii_case(base))
                    .map(|icon| icon.name.clone()),
            }
        })
        .collect()
}

/// Find the sketch called `name` (with or without extension) in the root.
fn find_sketch(ctx: &mut TaskContext<'_>, name: &str) -> Result<(SketchInfo, DirectoryInfo)> {
    let fs = ctx.fs();
    let root = fs.root_pointer()?;
    let entries = fs.list(root, &|| false)?;
    let wanted = base_name(name);
    let sketch = sketches(&entries)
        .into_iter()
        .find(|s| s.name.eq_ignore_ascii_case(wanted) || s.file_name.eq_ignore_ascii_case(name))
        .ok_or_else(|| Error::NotFound(format!("sketch {name}")))?;
    let entry = entries
        .into_iter()
        .find(|e| e.name == sketch.file_name)
        .ok_or_else(|| Error::NotFound(format!("sketch {name}")))?;
    Ok((sketch, entry))
}

/// List the sketches on the card.
#[derive(Debug, Default)]
pub struct ListSketchesTask {
    output: TaskOutput<Vec<SketchInfo>>,
}

impl ListSketchesTask {
    /// New listing task.
    pub fn new() -> Self {
        Self::default()
    }

    /// The sketches, once finished.
    pub fn output(&self) -> TaskOutput<Vec<SketchInfo>> {
        self.output.clone()
    }
}

impl Task for ListSketchesTask {
    fn title(&self) -> String {
        "List sketches".into()
    }

    fn run(&mut self, ctx: &mut TaskContext<'_>) -> Result<()> {
        let handle = std::sync::Arc::clone(ctx.handle());
        let fs = ctx.fs();
        let root = fs.root_pointer()?;
        let entries = fs.list(root, &|| handle.is_cancelled())?;
        self.output.set(sketches(&entries));
        Ok(())
    }
}

/// Read a sketch icon as raw bytes.
#[derive(Debug)]
pub struct LoadIconTask {
    sketch: String,
    output: TaskOutput<Option<Vec<u8>>>,
}

impl LoadIconTask {
    /// Load the icon of `sketch`.
    pub fn new(sketch: impl Into<String>) -> Self {
        Self {
            sketch: sketch.into(),
            output: TaskOutput::new(),
        }
    }

    /// Icon bytes, `None` when the sketch has no icon.
    pub fn output(&self) -> TaskOutput<Option<Vec<u8>>> {
        self.output.clone()
    }
}

impl Task for LoadIconTask {
    fn title(&self) -> String {
        format!("Load icon of {}", self.sketch)
    }

    fn run(&mut self, ctx: &mut TaskContext<'_>) -> Result<()> {
        let (sketch, _) = find_sketch(ctx, &self.sketch)?;
        let Some(icon) = sketch.icon else {
            self.output.set(None);
            return Ok(());
        };
        let fs = ctx.fs();
        let root = fs.root_pointer()?;
        let info = fs
            .find(root, &icon)?
            .ok_or_else(|| Error::NotFound(icon.clone()))?;
        let mut data = Vec::with_capacity(info.size() as usize);
        let mut progress = ctx.transfer_progress(0, u64::from(info.size()));
        ctx.fs()
            .read_file(&info, &mut data, &mut progress)?;
        self.output.set(Some(data));
        Ok(())
    }
}

/// Queue a sketch for loading and start it.
///
/// The bootloader copies the queued sketch from the card into flash when it
/// leaves command mode.
#[derive(Debug)]
pub struct LaunchSketchTask {
    sketch: String,
}

impl LaunchSketchTask {
    /// Launch `sketch` (name with or without `.HEX`).
    pub fn new(sketch: impl Into<String>) -> Self {
        Self {
            sketch: sketch.into(),
        }
    }
}

impl Task for LaunchSketchTask {
    fn title(&self) -> String {
        format!("Launch {}", self.sketch)
    }

    fn run(&mut self, ctx: &mut TaskContext<'_>) -> Result<()> {
        let (sketch, entry) = find_sketch(ctx, &self.sketch)?;
        ctx.check_cancel()?;
        ctx.set_status(format!("Launching {}", sketch.name));

        let session = ctx.session();
        let mut settings = DeviceSettings::read(session)?;
        settings
            .sketch_to_load
            .copy_from_slice(entry.entry.short_name());
        settings.load_sketch = true;
        settings.write(session)?;

        // Nothing may be left to write once the device runs the sketch.
        ctx.fs().flush()?;
        ctx.fs().invalidate();
        ctx.session().set_sketch_mode()?;
        info!("Launched sketch {}", sketch.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_name() {
        assert_eq!(base_name("snake.hex"), "snake");
        assert_eq!(base_name("a.b.HEX"), "a.b");
        assert_eq!(base_name("README"), "README");
    }
}
