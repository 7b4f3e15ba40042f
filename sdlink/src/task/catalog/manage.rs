//! Deleting and renaming.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::fs::dir::{DirectoryInfo, PathTarget};
use crate::task::{Task, TaskContext, TaskOutput};

/// Delete card files and directory trees.
#[derive(Debug)]
pub struct DeleteTask {
    paths: Vec<String>,
}

impl DeleteTask {
    /// Delete every path in `paths`.
    pub fn new(paths: Vec<String>) -> Self {
        Self { paths }
    }
}

impl Task for DeleteTask {
    fn title(&self) -> String {
        match self.paths.as_slice() {
            [one] => format!("Delete {one}"),
            many => format!("Delete {} entries", many.len()),
        }
    }

    fn run(&mut self, ctx: &mut TaskContext<'_>) -> Result<()> {
        let total = self.paths.len();
        for (i, path) in self.paths.iter().enumerate() {
            ctx.check_cancel()?;
            ctx.set_status(format!("Deleting {path}"));
            let info = match ctx.fs().resolve_path(path)? {
                PathTarget::Root => {
                    return Err(Error::Unsupported("the root directory cannot be deleted".into()));
                },
                PathTarget::Entry { info, .. } => info,
            };
            let handle = Arc::clone(ctx.handle());
            ctx.fs()
                .delete_recursive(&info, &|| handle.is_cancelled())?;
            ctx.set_progress((i + 1) as f32 / total as f32);
        }
        Ok(())
    }
}

/// Rename one card entry in place.
#[derive(Debug)]
pub struct RenameTask {
    path: String,
    new_name: String,
    output: TaskOutput<DirectoryInfo>,
}

impl RenameTask {
    /// Rename the entry at `path` to `new_name` (a name, not a path).
    pub fn new(path: impl Into<String>, new_name: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            new_name: new_name.into(),
            output: TaskOutput::new(),
        }
    }

    /// The renamed entry.
    pub fn output(&self) -> TaskOutput<DirectoryInfo> {
        self.output.clone()
    }
}

impl Task for RenameTask {
    fn title(&self) -> String {
        format!("Rename {} to {}", self.path, self.new_name)
    }

    fn run(&mut self, ctx: &mut TaskContext<'_>) -> Result<()> {
        if self.new_name.contains(['/', '\\']) {
            return Err(Error::Unsupported("rename cannot move entries".into()));
        }
        let PathTarget::Entry { parent, info } = ctx.fs().resolve_path(&self.path)? else {
            return Err(Error::Unsupported("the root directory cannot be renamed".into()));
        };
        let renamed = ctx
            .fs()
            .rename_entry(parent, &info, &self.new_name)?;
        self.output.set(renamed);
        Ok(())
    }
}

/// Change the volume label.
#[derive(Debug)]
pub struct RenameVolumeTask {
    label: String,
}

impl RenameVolumeTask {
    /// Set the label to `label`; empty removes it.
    pub fn new(label: impl Into<String>) -> Self {
        Self { label: label.into() }
    }
}

impl Task for RenameVolumeTask {
    fn title(&self) -> String {
        format!("Label volume {}", self.label)
    }

    fn run(&mut self, ctx: &mut TaskContext<'_>) -> Result<()> {
        ctx.fs().set_volume_label(&self.label)
    }
}
