//! Directory listing and logical entry management.
//!
//! A logical entry is a short entry plus the LFN fragments in front of it.
//! Creating, renaming and deleting entries keeps every directory compact:
//! the slots behind the changed entry are shifted so that the first free
//! slot always terminates the directory.

use log::{debug, trace};

use crate::error::{Error, Result};
use crate::fs::BlockDevice;
use crate::fs::entry::{
    DirectoryEntry, DirectoryEntryPointer, attr, fat_timestamp_now, short_name_to_string,
};
use crate::fs::fat::FatFs;
use crate::fs::lfn::{LongFileNameGen, ResolvedEntry, USER_ATTRIBUTES, encode_lfn, lfn_checksum, short_name_for};

/// Characters never allowed in a long name.
const ILLEGAL_NAME_CHARS: &[char] = &['"', '*', '/', ':', '<', '>', '?', '\\', '|'];

/// Longest long name in UTF-16 units.
const MAX_NAME_LEN: usize = 255;

/// One listed file or directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryInfo {
    /// First physical slot of the logical entry.
    pub first: DirectoryEntryPointer,
    /// Slot of the short entry.
    pub entry_ptr: DirectoryEntryPointer,
    /// Slots occupied, LFN fragments included.
    pub count: usize,
    /// Long name (or case-folded short name).
    pub name: String,
    /// The short entry.
    pub entry: DirectoryEntry,
}

impl From<ResolvedEntry> for DirectoryInfo {
    fn from(resolved: ResolvedEntry) -> Self {
        Self {
            first: resolved.first,
            entry_ptr: resolved.entry_ptr,
            count: resolved.count,
            name: resolved.name,
            entry: resolved.entry,
        }
    }
}

impl DirectoryInfo {
    /// The 8.3 name as stored, `NAME.EXT`.
    pub fn short_name(&self) -> String {
        short_name_to_string(self.entry.short_name(), 0)
    }

    /// File size in bytes.
    pub fn size(&self) -> u32 {
        self.entry.file_size()
    }

    /// First cluster of the data chain; 0 when empty.
    pub fn first_cluster(&self) -> u32 {
        self.entry.first_cluster()
    }

    /// Attribute bits.
    pub fn attributes(&self) -> u8 {
        self.entry.attributes()
    }

    /// Whether this is a directory.
    pub fn is_directory(&self) -> bool {
        self.entry.is_directory()
    }

    /// Read-only attribute.
    pub fn is_read_only(&self) -> bool {
        self.attributes() & attr::READ_ONLY != 0
    }

    /// Hidden attribute.
    pub fn is_hidden(&self) -> bool {
        self.attributes() & attr::HIDDEN != 0
    }

    /// System attribute.
    pub fn is_system(&self) -> bool {
        self.attributes() & attr::SYSTEM != 0
    }

    /// Last write as FAT (date, time).
    pub fn modified(&self) -> (u16, u16) {
        (self.entry.write_date(), self.entry.write_time())
    }

    /// `.` or `..`.
    pub fn is_dot_entry(&self) -> bool {
        self.entry.short_name()[0] == b'.'
    }

    /// Extension of the short name, upper case.
    pub fn extension(&self) -> String {
        String::from_utf8_lossy(&self.entry.short_name()[8..11])
            .trim_end()
            .to_string()
    }
}

/// Where a path led.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathTarget {
    /// The root directory.
    Root,
    /// An entry inside `parent`.
    Entry {
        /// First slot of the containing directory.
        parent: DirectoryEntryPointer,
        /// The entry itself.
        info: DirectoryInfo,
    },
}

impl PathTarget {
    /// Whether the target can be listed.
    pub fn is_directory(&self) -> bool {
        match self {
            Self::Root => true,
            Self::Entry { info, .. } => info.is_directory(),
        }
    }
}

/// Split a card path into components.
pub fn split_path(path: &str) -> Vec<&str> {
    path.split(['/', '\\'])
        .filter(|part| !part.is_empty() && *part != ".")
        .collect()
}

fn validate_name(name: &str) -> Result<&str> {
    let trimmed = name.trim_end_matches(['.', ' ']);
    if trimmed.is_empty() {
        return Err(Error::Filesystem(format!("invalid name '{name}'")));
    }
    if trimmed
        .chars()
        .any(|c| c.is_control() || ILLEGAL_NAME_CHARS.contains(&c))
    {
        return Err(Error::Filesystem(format!(
            "name '{name}' contains characters not allowed on the card"
        )));
    }
    if trimmed.encode_utf16().count() > MAX_NAME_LEN {
        return Err(Error::Filesystem(format!("name '{name}' is too long")));
    }
    Ok(trimmed)
}

fn names_match(a: &str, b: &str) -> bool {
    a.to_lowercase() == b.to_lowercase()
}

fn label_bytes(label: &str) -> [u8; 11] {
    let mut out = [b' '; 11];
    let allowed = label
        .bytes()
        .filter(|b| b.is_ascii_alphanumeric() || b" _-!#$%&'()@^`{}~".contains(b))
        .map(|b| b.to_ascii_uppercase());
    for (slot, b) in out.iter_mut().zip(allowed) {
        *slot = b;
    }
    out
}

impl<D: BlockDevice> FatFs<D> {
    /// Walk the directory at `start`, feeding each logical entry to `visit`
    /// until it returns `false` or the directory ends.
    fn walk(
        &mut self,
        start: DirectoryEntryPointer,
        mut visit: impl FnMut(DirectoryInfo) -> bool,
    ) -> Result<()> {
        let mut lfn = LongFileNameGen::new();
        let mut cursor = Some(start);
        while let Some(ptr) = cursor {
            let entry = self.read_entry(ptr)?;
            if entry.is_free() {
                break;
            }
            if let Some(resolved) = lfn.feed(ptr, &entry) {
                if !visit(resolved.into()) {
                    break;
                }
            }
            cursor = self.next_directory(ptr, 1, false)?;
        }
        Ok(())
    }

    /// List the directory at `start`, without `.`/`..` and the volume label.
    ///
    /// Returns what was collected so far once `cancel` reports true.
    pub fn list(
        &mut self,
        start: DirectoryEntryPointer,
        cancel: &dyn Fn() -> bool,
    ) -> Result<Vec<DirectoryInfo>> {
        let mut out = Vec::new();
        self.walk(start, |info| {
            if cancel() {
                return false;
            }
            if !info.is_dot_entry() && !info.entry.is_volume_label() {
                out.push(info);
            }
            true
        })?;
        trace!("Listed {} entries at block {}", out.len(), start.block);
        Ok(out)
    }

    /// Find `name` (case-insensitive) in the directory at `start`.
    pub fn find(&mut self, start: DirectoryEntryPointer, name: &str) -> Result<Option<DirectoryInfo>> {
        let mut found = None;
        self.walk(start, |info| {
            if !info.entry.is_volume_label()
                && (names_match(&info.name, name) || names_match(&info.short_name(), name))
            {
                found = Some(info);
                return false;
            }
            true
        })?;
        Ok(found)
    }

    /// Short names in use at `start`, and the entry already called `name`.
    fn scan_names(
        &mut self,
        start: DirectoryEntryPointer,
        name: &str,
    ) -> Result<(Vec<[u8; 11]>, Option<DirectoryInfo>)> {
        let mut names = Vec::new();
        let mut clash = None;
        self.walk(start, |info| {
            let mut short = [0u8; 11];
            short.copy_from_slice(info.entry.short_name());
            names.push(short);
            if clash.is_none()
                && !info.entry.is_volume_label()
                && (names_match(&info.name, name) || names_match(&info.short_name(), name))
            {
                clash = Some(info);
            }
            true
        })?;
        Ok((names, clash))
    }

    /// First free slot of the directory, growing it when full.
    fn find_end(&mut self, start: DirectoryEntryPointer) -> Result<DirectoryEntryPointer> {
        let mut ptr = start;
        loop {
            if self.read_entry(ptr)?.is_free() {
                return Ok(ptr);
            }
            ptr = self
                .next_directory(ptr, 1, true)?
                .ok_or_else(|| Error::Filesystem("unexpected end of directory".into()))?;
        }
    }

    /// Resize the logical entry at `pos` from `old_count` to `new_count`
    /// slots, shifting every following entry. Growth extends the directory
    /// chain when its last cluster is exhausted. The slots at `pos` are left
    /// for the caller to fill.
    pub fn alloc_entries(
        &mut self,
        pos: DirectoryEntryPointer,
        old_count: usize,
        new_count: usize,
    ) -> Result<()> {
        if old_count == new_count {
            return Ok(());
        }

        let mut tail = Vec::new();
        let mut cursor = self.next_directory(pos, old_count, false)?;
        while let Some(ptr) = cursor {
            let entry = self.read_entry(ptr)?;
            if entry.is_free() {
                break;
            }
            tail.push(entry);
            cursor = self.next_directory(ptr, 1, false)?;
        }

        let cleared = old_count.saturating_sub(new_count);
        let writes = tail.len() + cleared;
        debug!(
            "Resizing entry at {}:{} from {old_count} to {new_count} slots, moving {}",
            pos.block,
            pos.index,
            tail.len()
        );
        if writes == 0 {
            return Ok(());
        }

        let free = DirectoryEntry::default();
        let mut ptr = self
            .next_directory(pos, new_count, true)?
            .ok_or_else(|| Error::Filesystem("unexpected end of directory".into()))?;
        let entries = tail.iter().chain(std::iter::repeat_n(&free, cleared));
        for (i, entry) in entries.enumerate() {
            if i > 0 {
                ptr = self
                    .next_directory(ptr, 1, true)?
                    .ok_or_else(|| Error::Filesystem("unexpected end of directory".into()))?;
            }
            self.write_entry(ptr, entry)?;
        }
        Ok(())
    }

    /// Write LFN fragments and the short entry starting at `pos`. Returns
    /// the slot of the short entry.
    fn write_logical(
        &mut self,
        pos: DirectoryEntryPointer,
        fragments: &[DirectoryEntry],
        entry: &DirectoryEntry,
    ) -> Result<DirectoryEntryPointer> {
        let mut ptr = pos;
        for (i, slot) in fragments.iter().chain(std::iter::once(entry)).enumerate() {
            if i > 0 {
                ptr = self
                    .next_directory(ptr, 1, true)?
                    .ok_or_else(|| Error::Filesystem("unexpected end of directory".into()))?;
            }
            self.write_entry(ptr, slot)?;
        }
        Ok(ptr)
    }

    fn name_entries(
        name: &str,
        existing: &[[u8; 11]],
        template: DirectoryEntry,
    ) -> (Vec<DirectoryEntry>, DirectoryEntry) {
        let short = short_name_for(name, existing);
        let fragments = if short.needs_lfn {
            encode_lfn(name, lfn_checksum(&short.name))
        } else {
            Vec::new()
        };
        let mut entry = template;
        entry.set_short_name(&short.name);
        entry.set_reserved_nt(short.reserved_nt);
        (fragments, entry)
    }

    /// Create an empty entry called `name` in the directory at `dir`.
    pub fn create_entry(
        &mut self,
        dir: DirectoryEntryPointer,
        name: &str,
        attributes: u8,
    ) -> Result<DirectoryInfo> {
        let name = validate_name(name)?;
        let (existing, clash) = self.scan_names(dir, name)?;
        if clash.is_some() {
            return Err(Error::Filesystem(format!("'{name}' already exists")));
        }

        let mut template = DirectoryEntry::new_short([b' '; 11], attributes & USER_ATTRIBUTES);
        let (date, time) = fat_timestamp_now();
        template.set_timestamps(date, time);
        let (fragments, entry) = Self::name_entries(name, &existing, template);

        let count = fragments.len() + 1;
        let pos = self.find_end(dir)?;
        self.alloc_entries(pos, 0, count)?;
        let entry_ptr = self.write_logical(pos, &fragments, &entry)?;
        debug!("Created '{name}' ({count} slots)");
        Ok(DirectoryInfo {
            first: pos,
            entry_ptr,
            count,
            name: name.to_string(),
            entry,
        })
    }

    /// Store a changed short entry (size, first cluster, attributes).
    pub fn update_entry(&mut self, info: &DirectoryInfo) -> Result<()> {
        self.write_entry(info.entry_ptr, &info.entry)
    }

    /// Remove a logical entry and free its cluster chain.
    ///
    /// Directory contents are not visited; see
    /// [`delete_recursive`](Self::delete_recursive).
    pub fn delete_entry(&mut self, info: &DirectoryInfo) -> Result<()> {
        if info.first_cluster() != 0 {
            self.wipe_cluster_chain(info.first_cluster())?;
        }
        self.alloc_entries(info.first, info.count, 0)?;
        debug!("Deleted '{}'", info.name);
        Ok(())
    }

    /// Remove an entry and, for directories, everything below it.
    pub fn delete_recursive(&mut self, info: &DirectoryInfo, cancel: &dyn Fn() -> bool) -> Result<()> {
        if info.is_directory() && info.first_cluster() != 0 {
            let start = self.directory_pointer(info.first_cluster())?;
            let children = self.list(start, cancel)?;
            if cancel() {
                return Err(Error::Cancelled);
            }
            // Last first, so earlier pointers stay valid while slots shift.
            for child in children.iter().rev() {
                self.delete_recursive(child, cancel)?;
            }
        }
        self.delete_entry(info)
    }

    /// Give the entry `info` in `dir` a new name.
    pub fn rename_entry(
        &mut self,
        dir: DirectoryEntryPointer,
        info: &DirectoryInfo,
        new_name: &str,
    ) -> Result<DirectoryInfo> {
        let name = validate_name(new_name)?;
        if name == info.name {
            return Ok(info.clone());
        }
        let (mut existing, clash) = self.scan_names(dir, name)?;
        if clash.is_some_and(|other| other.first != info.first) {
            return Err(Error::Filesystem(format!("'{name}' already exists")));
        }
        existing.retain(|short| short.as_slice() != info.entry.short_name());

        let (fragments, entry) = Self::name_entries(name, &existing, info.entry);
        let count = fragments.len() + 1;
        self.alloc_entries(info.first, info.count, count)?;
        let entry_ptr = self.write_logical(info.first, &fragments, &entry)?;
        debug!("Renamed '{}' to '{name}'", info.name);
        Ok(DirectoryInfo {
            first: info.first,
            entry_ptr,
            count,
            name: name.to_string(),
            entry,
        })
    }

    /// Create a subdirectory with its `.` and `..` entries.
    pub fn create_directory(&mut self, dir: DirectoryEntryPointer, name: &str) -> Result<DirectoryInfo> {
        let parent = self.directory_cluster(dir)?;
        let cluster = self.alloc_cluster(0, true)?;
        let mut info = match self.create_entry(dir, name, attr::DIRECTORY) {
            Ok(info) => info,
            Err(e) => {
                self.wipe_cluster_chain(cluster)?;
                return Err(e);
            },
        };
        info.entry.set_first_cluster(cluster);
        self.update_entry(&info)?;

        let (date, time) = fat_timestamp_now();
        let start = self.directory_pointer(cluster)?;
        let mut dot = DirectoryEntry::new_short(*b".          ", attr::DIRECTORY);
        dot.set_first_cluster(cluster);
        dot.set_timestamps(date, time);
        let mut dotdot = DirectoryEntry::new_short(*b"..         ", attr::DIRECTORY);
        dotdot.set_first_cluster(parent);
        dotdot.set_timestamps(date, time);
        self.write_entry(start, &dot)?;
        self.write_entry(DirectoryEntryPointer::new(start.block, 1), &dotdot)?;
        Ok(info)
    }

    /// Subdirectory `name` of `dir`, created if missing.
    pub fn ensure_directory(&mut self, dir: DirectoryEntryPointer, name: &str) -> Result<DirectoryInfo> {
        match self.find(dir, name)? {
            Some(info) if info.is_directory() => Ok(info),
            Some(info) => Err(Error::Filesystem(format!(
                "'{}' exists and is not a directory",
                info.name
            ))),
            None => self.create_directory(dir, name),
        }
    }

    /// First slot of the directory described by `info`.
    pub fn open_entry(&mut self, info: &DirectoryInfo) -> Result<DirectoryEntryPointer> {
        if !info.is_directory() {
            return Err(Error::Filesystem(format!("'{}' is not a directory", info.name)));
        }
        self.directory_pointer(info.first_cluster())
    }

    /// Follow a `/`-separated path from the root.
    pub fn resolve_path(&mut self, path: &str) -> Result<PathTarget> {
        let parts = split_path(path);
        let Some((last, parents)) = parts.split_last() else {
            return Ok(PathTarget::Root);
        };
        let mut dir = self.root_pointer()?;
        for part in parents {
            let info = self
                .find(dir, part)?
                .ok_or_else(|| Error::NotFound(path.to_string()))?;
            dir = self.open_entry(&info)?;
        }
        let info = self
            .find(dir, last)?
            .ok_or_else(|| Error::NotFound(path.to_string()))?;
        Ok(PathTarget::Entry { parent: dir, info })
    }

    /// First slot of the directory at `path`.
    pub fn open_directory(&mut self, path: &str) -> Result<DirectoryEntryPointer> {
        match self.resolve_path(path)? {
            PathTarget::Root => self.root_pointer(),
            PathTarget::Entry { info, .. } => self.open_entry(&info),
        }
    }

    fn find_label(&mut self) -> Result<Option<DirectoryInfo>> {
        let root = self.root_pointer()?;
        let mut label = None;
        self.walk(root, |info| {
            if info.entry.is_volume_label() {
                label = Some(info);
                return false;
            }
            true
        })?;
        Ok(label)
    }

    /// Label stored in the root directory.
    pub fn volume_label(&mut self) -> Result<Option<String>> {
        Ok(self.find_label()?.map(|info| {
            String::from_utf8_lossy(info.entry.short_name())
                .trim_end()
                .to_string()
        }))
    }

    /// Replace the root volume label; an empty label removes it.
    pub fn set_volume_label(&mut self, label: &str) -> Result<()> {
        let name = label_bytes(label.trim());
        let existing = self.find_label()?;
        if name == [b' '; 11] {
            if let Some(info) = existing {
                self.alloc_entries(info.first, info.count, 0)?;
            }
            return Ok(());
        }
        match existing {
            Some(mut info) => {
                info.entry.set_short_name(&name);
                self.update_entry(&info)
            },
            None => {
                let root = self.root_pointer()?;
                let pos = self.find_end(root)?;
                let mut entry = DirectoryEntry::new_short(name, attr::VOLUME_ID | attr::ARCHIVE);
                let (date, time) = fat_timestamp_now();
                entry.set_timestamps(date, time);
                self.alloc_entries(pos, 0, 1)?;
                self.write_entry(pos, &entry)
            },
        }
    }
}
