//! Listing and host transfers.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Component, Path, PathBuf};

use log::{debug, warn};

use crate::error::{Error, Result};
use crate::fs::dir::{DirectoryInfo, PathTarget};
use crate::fs::entry::attr;
use crate::fs::DirectoryEntryPointer;
use crate::task::{Task, TaskContext, TaskOutput};

fn host_name(path: &Path) -> Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| Error::Config(format!("'{}' has no file name", path.display())))
}

/// A card name usable as one host path component. Names written by other
/// tools may hold `..` or separators; those are refused.
fn card_name_on_host(name: &str) -> Result<&str> {
    let mut parts = Path::new(name).components();
    match (parts.next(), parts.next()) {
        (Some(Component::Normal(_)), None) if !name.contains(['/', '\\', '\0']) => Ok(name),
        _ => Err(Error::Filesystem(format!(
            "card name '{name}' cannot be used on the host"
        ))),
    }
}

/// Total size of the regular files below `path`.
fn host_tree_size(path: &Path) -> Result<u64> {
    let meta = fs::metadata(path)?;
    if meta.is_file() {
        return Ok(meta.len());
    }
    let mut total = 0;
    for entry in fs::read_dir(path)? {
        total += host_tree_size(&entry?.path())?;
    }
    Ok(total)
}

/// Copy one host file into `dir` as `name`. A partial destination is removed
/// when the copy fails or is cancelled.
fn import_one(
    ctx: &mut TaskContext<'_>,
    dir: DirectoryEntryPointer,
    source: &Path,
    name: &str,
    offset: u64,
    total: u64,
) -> Result<u64> {
    ctx.check_cancel()?;
    ctx.set_status(format!("Importing {name}"));
    let file = File::open(source)?;
    let len = file.metadata()?.len();

    let fs = ctx.fs();
    let mut info = match fs.find(dir, name)? {
        Some(info) if info.is_directory() => {
            return Err(Error::Filesystem(format!("'{name}' is a directory on the card")));
        },
        Some(info) => info,
        None => fs.create_entry(dir, name, attr::ARCHIVE)?,
    };

    let mut progress = ctx.transfer_progress(offset, total);
    let result = ctx
        .fs()
        .write_file(&mut info, &mut BufReader::new(file), len, &mut progress);
    if let Err(e) = result {
        let handle = std::sync::Arc::clone(ctx.handle());
        let _cleanup = handle.suppress_cancel();
        debug!("Removing partial '{name}' after: {e}");
        let fs = ctx.fs();
        if let Err(cleanup) = fs.delete_entry(&info).and_then(|()| fs.flush()) {
            warn!("Could not remove partial '{name}': {cleanup}");
        }
        return Err(e);
    }
    Ok(len)
}

/// Copy the card file `info` to the host path `dest`. A partial host file is
/// removed when the copy fails or is cancelled.
fn export_one(ctx: &mut TaskContext<'_>, info: &DirectoryInfo, dest: &Path, offset: u64, total: u64) -> Result<u64> {
    ctx.check_cancel()?;
    ctx.set_status(format!("Exporting {}", info.name));
    let mut out = BufWriter::new(File::create(dest)?);
    let mut progress = ctx.transfer_progress(offset, total);
    let result = ctx
        .fs()
        .read_file(info, &mut out, &mut progress);
    drop(out);
    if result.is_err() {
        if let Err(e) = fs::remove_file(dest) {
            warn!("Could not remove partial '{}': {e}", dest.display());
        }
    }
    result
}

/// List one card directory.
#[derive(Debug)]
pub struct ListDirectoryTask {
    path: String,
    output: TaskOutput<Vec<DirectoryInfo>>,
}

impl ListDirectoryTask {
    /// List `path` (`/` is the root).
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            output: TaskOutput::new(),
        }
    }

    /// The entries, once finished.
    pub fn output(&self) -> TaskOutput<Vec<DirectoryInfo>> {
        self.output.clone()
    }
}

impl Task for ListDirectoryTask {
    fn title(&self) -> String {
        format!("List {}", self.path)
    }

    fn run(&mut self, ctx: &mut TaskContext<'_>) -> Result<()> {
        let handle = std::sync::Arc::clone(ctx.handle());
        let fs = ctx.fs();
        let dir = fs.open_directory(&self.path)?;
        let entries = fs.list(dir, &|| handle.is_cancelled())?;
        self.output.set(entries);
        ctx.check_cancel()
    }
}

/// Copy a host file into a card directory.
#[derive(Debug)]
pub struct ImportFileTask {
    source: PathBuf,
    dest_dir: String,
    name: Option<String>,
}

impl ImportFileTask {
    /// Import `source` into the card directory `dest_dir` under its own name.
    pub fn new(source: impl Into<PathBuf>, dest_dir: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            dest_dir: dest_dir.into(),
            name: None,
        }
    }

    /// Store under a different name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

impl Task for ImportFileTask {
    fn title(&self) -> String {
        format!("Import {}", self.source.display())
    }

    fn run(&mut self, ctx: &mut TaskContext<'_>) -> Result<()> {
        let name = match &self.name {
            Some(name) => name.clone(),
            None => host_name(&self.source)?,
        };
        let total = fs::metadata(&self.source)?.len();
        let dir = ctx.fs().open_directory(&self.dest_dir)?;
        import_one(ctx, dir, &self.source, &name, 0, total)?;
        Ok(())
    }
}

/// Copy a host folder tree into a card directory.
#[derive(Debug)]
pub struct ImportFolderTask {
    source: PathBuf,
    dest_dir: String,
}

impl ImportFolderTask {
    /// Import `source` as a new subdirectory of `dest_dir`.
    pub fn new(source: impl Into<PathBuf>, dest_dir: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            dest_dir: dest_dir.into(),
        }
    }

    fn import_tree(
        ctx: &mut TaskContext<'_>,
        dir: DirectoryEntryPointer,
        source: &Path,
        done: &mut u64,
        total: u64,
    ) -> Result<()> {
        let mut children: Vec<_> = fs::read_dir(source)?.collect::<std::io::Result<_>>()?;
        children.sort_by_key(fs::DirEntry::file_name);
        for child in children {
            ctx.check_cancel()?;
            let path = child.path();
            let name = host_name(&path)?;
            if child.file_type()?.is_dir() {
                let info = ctx.fs().ensure_directory(dir, &name)?;
                let sub = ctx.fs().open_entry(&info)?;
                Self::import_tree(ctx, sub, &path, done, total)?;
            } else {
                *done += import_one(ctx, dir, &path, &name, *done, total)?;
            }
        }
        Ok(())
    }
}

impl Task for ImportFolderTask {
    fn title(&self) -> String {
        format!("Import folder {}", self.source.display())
    }

    fn run(&mut self, ctx: &mut TaskContext<'_>) -> Result<()> {
        let name = host_name(&self.source)?;
        let total = host_tree_size(&self.source)?;
        let parent = ctx.fs().open_directory(&self.dest_dir)?;
        let info = ctx.fs().ensure_directory(parent, &name)?;
        let dir = ctx.fs().open_entry(&info)?;
        let mut done = 0;
        Self::import_tree(ctx, dir, &self.source, &mut done, total)
    }
}

/// Copy a card file to the host.
#[derive(Debug)]
pub struct ExportFileTask {
    source: String,
    dest: PathBuf,
}

impl ExportFileTask {
    /// Export the card file `source` to `dest`. When `dest` is an existing
    /// directory the file keeps its card name inside it.
    pub fn new(source: impl Into<String>, dest: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            dest: dest.into(),
        }
    }
}

impl Task for ExportFileTask {
    fn title(&self) -> String {
        format!("Export {}", self.source)
    }

    fn run(&mut self, ctx: &mut TaskContext<'_>) -> Result<()> {
        let info = match ctx.fs().resolve_path(&self.source)? {
            PathTarget::Entry { info, .. } if !info.is_directory() => info,
            _ => {
                return Err(Error::Filesystem(format!("'{}' is a directory", self.source)));
            },
        };
        let dest = if self.dest.is_dir() {
            self.dest.join(card_name_on_host(&info.name)?)
        } else {
            self.dest.clone()
        };
        export_one(ctx, &info, &dest, 0, u64::from(info.size()))?;
        Ok(())
    }
}

/// Copy a card directory tree to the host.
#[derive(Debug)]
pub struct ExportFolderTask {
    source: String,
    dest_dir: PathBuf,
}

/// One file of an export plan.
struct PlannedFile {
    info: DirectoryInfo,
    dest: PathBuf,
}

impl ExportFolderTask {
    /// Export the card directory `source` into the host directory `dest_dir`.
    pub fn new(source: impl Into<String>, dest_dir: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            dest_dir: dest_dir.into(),
        }
    }

    /// Create the host directories and collect the files to copy.
    fn plan(
        ctx: &mut TaskContext<'_>,
        dir: DirectoryEntryPointer,
        dest: &Path,
        files: &mut Vec<PlannedFile>,
    ) -> Result<()> {
        fs::create_dir_all(dest)?;
        let handle = std::sync::Arc::clone(ctx.handle());
        let entries = ctx
            .fs()
            .list(dir, &|| handle.is_cancelled())?;
        ctx.check_cancel()?;
        for info in entries {
            let target = dest.join(card_name_on_host(&info.name)?);
            if info.is_directory() {
                let sub = ctx.fs().open_entry(&info)?;
                Self::plan(ctx, sub, &target, files)?;
            } else {
                files.push(PlannedFile { info, dest: target });
            }
        }
        Ok(())
    }
}

impl Task for ExportFolderTask {
    fn title(&self) -> String {
        format!("Export folder {}", self.source)
    }

    fn run(&mut self, ctx: &mut TaskContext<'_>) -> Result<()> {
        let (dir, name) = match ctx.fs().resolve_path(&self.source)? {
            PathTarget::Root => (ctx.fs().root_pointer()?, None),
            PathTarget::Entry { info, .. } => (ctx.fs().open_entry(&info)?, Some(info.name)),
        };
        let dest = match name {
            Some(name) => self.dest_dir.join(card_name_on_host(&name)?),
            None => self.dest_dir.clone(),
        };
        let mut files = Vec::new();
        Self::plan(ctx, dir, &dest, &mut files)?;

        let total = files
            .iter()
            .map(|f| u64::from(f.info.size()))
            .sum();
        let mut done = 0;
        for file in &files {
            done += export_one(ctx, &file.info, &file.dest, done, total)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_card_name_on_host() {
        assert_eq!(card_name_on_host("Long File Name.bin").unwrap(), "Long File Name.bin");
        assert_eq!(card_name_on_host("README").unwrap(), "README");
        for bad in ["", ".", "..", "../escape.txt", "a/b", "a\\b", "/etc", "nul\0"] {
            assert!(
                matches!(card_name_on_host(bad), Err(Error::Filesystem(_))),
                "{bad:?} accepted"
            );
        }
    }
}
