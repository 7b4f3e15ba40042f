//! 32-byte FAT directory entries.
//!
//! ## Short entry layout
//!
//! ```text
//! 0   name[11]        11  attr           12  reserved NT (case bits)
//! 13  create tenths   14  create time    16  create date
//! 18  access date     20  cluster high   22  write time
//! 24  write date      26  cluster low    28  file size
//! ```
//!
//! LFN entries reuse the record: ordinal at 0, UTF-16 units at 1..11,
//! 14..26 and 28..32, attribute 0x0F at 11, checksum at 13.

use byteorder::{ByteOrder, LittleEndian};

/// Size of one directory entry.
pub const ENTRY_SIZE: usize = 32;

/// First name byte of a deleted entry.
pub const DELETED_MARK: u8 = 0xE5;

/// First name byte of a never-used entry (end of directory).
pub const FREE_MARK: u8 = 0x00;

/// Directory entry attribute bits.
pub mod attr {
    /// Read-only.
    pub const READ_ONLY: u8 = 0x01;
    /// Hidden.
    pub const HIDDEN: u8 = 0x02;
    /// System.
    pub const SYSTEM: u8 = 0x04;
    /// Volume label.
    pub const VOLUME_ID: u8 = 0x08;
    /// Directory.
    pub const DIRECTORY: u8 = 0x10;
    /// Archive.
    pub const ARCHIVE: u8 = 0x20;
    /// Long filename composite.
    pub const LONG_NAME: u8 = READ_ONLY | HIDDEN | SYSTEM | VOLUME_ID;
    /// Bits compared when testing for a long filename entry.
    pub const LONG_NAME_MASK: u8 = LONG_NAME | DIRECTORY | ARCHIVE;
}

/// NT reserved-byte bits for lowercase short names.
pub mod nt {
    /// Base name is lowercase.
    pub const LOWER_BASE: u8 = 0x08;
    /// Extension is lowercase.
    pub const LOWER_EXT: u8 = 0x10;
}

/// Location of a directory slot: block and index within it (0..16).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DirectoryEntryPointer {
    /// Absolute block number.
    pub block: u32,
    /// Slot within the block.
    pub index: u8,
}

impl DirectoryEntryPointer {
    /// Create a pointer.
    pub fn new(block: u32, index: u8) -> Self {
        Self { block, index }
    }

    /// Byte offset of the slot inside its block.
    pub fn offset(&self) -> usize {
        usize::from(self.index) * ENTRY_SIZE
    }
}

/// One raw 32-byte directory entry.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct DirectoryEntry {
    raw: [u8; ENTRY_SIZE],
}

impl Default for DirectoryEntry {
    fn default() -> Self {
        Self {
            raw: [0; ENTRY_SIZE],
        }
    }
}

impl std::fmt::Debug for DirectoryEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_lfn() {
            write!(f, "LfnEntry(ord=0x{:02X})", self.raw[0])
        } else {
            write!(
                f,
                "DirectoryEntry({:?}, attr=0x{:02X}, cluster={}, size={})",
                String::from_utf8_lossy(self.short_name()),
                self.attributes(),
                self.first_cluster(),
                self.file_size()
            )
        }
    }
}

impl DirectoryEntry {
    /// Wrap raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut raw = [0u8; ENTRY_SIZE];
        raw.copy_from_slice(&bytes[..ENTRY_SIZE]);
        Self { raw }
    }

    /// Short entry with the given 11-byte name and attributes.
    pub fn new_short(name: [u8; 11], attributes: u8) -> Self {
        let mut entry = Self::default();
        entry.raw[..11].copy_from_slice(&name);
        entry.raw[11] = attributes;
        entry
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; ENTRY_SIZE] {
        &self.raw
    }

    /// Mutable raw bytes.
    pub fn as_bytes_mut(&mut self) -> &mut [u8; ENTRY_SIZE] {
        &mut self.raw
    }

    /// Never-used slot: terminates a directory.
    pub fn is_free(&self) -> bool {
        self.raw[0] == FREE_MARK
    }

    /// Deleted slot.
    pub fn is_deleted(&self) -> bool {
        self.raw[0] == DELETED_MARK
    }

    /// Long filename fragment.
    pub fn is_lfn(&self) -> bool {
        self.raw[11] & attr::LONG_NAME_MASK == attr::LONG_NAME
    }

    /// Volume label entry.
    pub fn is_volume_label(&self) -> bool {
        !self.is_lfn() && self.raw[11] & attr::VOLUME_ID != 0
    }

    /// Directory entry.
    pub fn is_directory(&self) -> bool {
        !self.is_lfn() && self.raw[11] & attr::DIRECTORY != 0
    }

    /// Raw 11-byte short name.
    pub fn short_name(&self) -> &[u8] {
        &self.raw[..11]
    }

    /// Replace the short name.
    pub fn set_short_name(&mut self, name: &[u8; 11]) {
        self.raw[..11].copy_from_slice(name);
    }

    /// Mark the slot deleted.
    pub fn mark_deleted(&mut self) {
        self.raw[0] = DELETED_MARK;
    }

    /// Attribute byte.
    pub fn attributes(&self) -> u8 {
        self.raw[11]
    }

    /// Set the attribute byte.
    pub fn set_attributes(&mut self, value: u8) {
        self.raw[11] = value;
    }

    /// NT case bits.
    pub fn reserved_nt(&self) -> u8 {
        self.raw[12]
    }

    /// Set NT case bits.
    pub fn set_reserved_nt(&mut self, value: u8) {
        self.raw[12] = value;
    }

    /// Packed FAT write time.
    pub fn write_time(&self) -> u16 {
        LittleEndian::read_u16(&self.raw[22..24])
    }

    /// Packed FAT write date.
    pub fn write_date(&self) -> u16 {
        LittleEndian::read_u16(&self.raw[24..26])
    }

    /// Set creation, access and write timestamps at once.
    pub fn set_timestamps(&mut self, date: u16, time: u16) {
        self.raw[13] = 0;
        LittleEndian::write_u16(&mut self.raw[14..16], time);
        LittleEndian::write_u16(&mut self.raw[16..18], date);
        LittleEndian::write_u16(&mut self.raw[18..20], date);
        LittleEndian::write_u16(&mut self.raw[22..24], time);
        LittleEndian::write_u16(&mut self.raw[24..26], date);
    }

    /// First cluster (high and low words combined).
    pub fn first_cluster(&self) -> u32 {
        let hi = u32::from(LittleEndian::read_u16(&self.raw[20..22]));
        let lo = u32::from(LittleEndian::read_u16(&self.raw[26..28]));
        (hi << 16) | lo
    }

    /// Set the first cluster.
    pub fn set_first_cluster(&mut self, cluster: u32) {
        LittleEndian::write_u16(&mut self.raw[20..22], (cluster >> 16) as u16);
        LittleEndian::write_u16(&mut self.raw[26..28], cluster as u16);
    }

    /// File size in bytes.
    pub fn file_size(&self) -> u32 {
        LittleEndian::read_u32(&self.raw[28..32])
    }

    /// Set the file size.
    pub fn set_file_size(&mut self, size: u32) {
        LittleEndian::write_u32(&mut self.raw[28..32], size);
    }

    /// LFN ordinal byte.
    pub fn lfn_ordinal(&self) -> u8 {
        self.raw[0]
    }

    /// LFN checksum of the owning short name.
    pub fn lfn_checksum(&self) -> u8 {
        self.raw[13]
    }

    /// The 13 UTF-16 units of an LFN fragment.
    pub fn lfn_units(&self) -> [u16; 13] {
        let mut units = [0u16; 13];
        for (i, unit) in units.iter_mut().enumerate() {
            let off = LFN_OFFSETS[i];
            *unit = LittleEndian::read_u16(&self.raw[off..off + 2]);
        }
        units
    }

    /// Build an LFN fragment.
    pub fn new_lfn(ordinal: u8, checksum: u8, units: &[u16; 13]) -> Self {
        let mut entry = Self::default();
        entry.raw[0] = ordinal;
        entry.raw[11] = attr::LONG_NAME;
        entry.raw[13] = checksum;
        for (i, unit) in units.iter().enumerate() {
            let off = LFN_OFFSETS[i];
            LittleEndian::write_u16(&mut entry.raw[off..off + 2], *unit);
        }
        entry
    }
}

/// Byte offsets of the 13 UTF-16 units in an LFN entry.
const LFN_OFFSETS: [usize; 13] = [1, 3, 5, 7, 9, 14, 16, 18, 20, 22, 24, 28, 30];

/// Render an 11-byte short name as `NAME.EXT`, applying NT case bits.
pub fn short_name_to_string(name: &[u8], reserved_nt: u8) -> String {
    let decode = |bytes: &[u8], lower: bool| -> String {
        bytes
            .iter()
            .take_while(|&&b| b != b' ')
            .enumerate()
            .map(|(i, &b)| {
                // 0x05 stands in for a leading 0xE5
                let b = if i == 0 && b == 0x05 { 0xE5 } else { b };
                let c = char::from(b);
                if lower { c.to_ascii_lowercase() } else { c }
            })
            .collect()
    };
    let base = decode(&name[..8], reserved_nt & nt::LOWER_BASE != 0);
    let ext = decode(&name[8..11], reserved_nt & nt::LOWER_EXT != 0);
    if ext.is_empty() {
        base
    } else {
        format!("{base}.{ext}")
    }
}

/// Current time packed as FAT (date, time), in UTC.
pub fn fat_timestamp_now() -> (u16, u16) {
    let secs = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_secs());
    fat_timestamp(secs)
}

/// Pack seconds since the Unix epoch as FAT (date, time).
pub fn fat_timestamp(unix_secs: u64) -> (u16, u16) {
    let days = unix_secs / 86_400;
    let rem = unix_secs % 86_400;
    let (year, month, day) = civil_from_days(days as i64);
    let year = year.clamp(1980, 2107);
    let date = (((year - 1980) as u16) << 9) | ((month as u16) << 5) | day as u16;
    let time = (((rem / 3600) as u16) << 11) | ((((rem / 60) % 60) as u16) << 5) | ((rem % 60) / 2) as u16;
    (date, time)
}

fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    (if m <= 2 { y + 1 } else { y }, m, d)
}
