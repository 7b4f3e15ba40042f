//! Long filename (VFAT) reconstruction and generation.
//!
//! On disk a long name is stored as fragments ahead of its short entry,
//! highest ordinal first:
//!
//! ```text
//! [0x43 "me.txt"] [0x02 "ry long na"] [0x01 "A ve"] [A VERY~1 TXT]
//! ```
//!
//! Every fragment carries the checksum of the short name it belongs to.

use crate::fs::entry::{
    DirectoryEntry, DirectoryEntryPointer, attr, nt, short_name_to_string,
};

/// UTF-16 units per LFN fragment.
pub const UNITS_PER_FRAGMENT: usize = 13;

/// Flag on the ordinal of the last logical (first physical) fragment.
pub const LAST_FRAGMENT: u8 = 0x40;

/// Longest name a directory entry can carry.
pub const MAX_NAME_UNITS: usize = 255;

/// Characters allowed in a short name besides letters and digits.
const SHORT_NAME_SPECIALS: &[u8] = b"!#$%&'()-@^_`{}~";

/// Checksum of an 11-byte short name, stored in each LFN fragment.
pub fn lfn_checksum(short_name: &[u8]) -> u8 {
    short_name
        .iter()
        .take(11)
        .fold(0u8, |sum, &b| sum.rotate_right(1).wrapping_add(b))
}

/// A resolved logical entry: short entry plus its long name.
#[derive(Debug, Clone)]
pub struct ResolvedEntry {
    /// First physical slot (first LFN fragment, or the short entry).
    pub first: DirectoryEntryPointer,
    /// Slot of the short entry.
    pub entry_ptr: DirectoryEntryPointer,
    /// Slots consumed, including LFN fragments.
    pub count: usize,
    /// Long name, or the case-folded short name.
    pub name: String,
    /// The short entry.
    pub entry: DirectoryEntry,
}

/// Accumulates LFN fragments while walking a directory in disk order.
#[derive(Debug, Default)]
pub struct LongFileNameGen {
    fragments: Vec<[u16; UNITS_PER_FRAGMENT]>,
    checksum: u8,
    first: Option<DirectoryEntryPointer>,
    expect: u8,
}

impl LongFileNameGen {
    /// Create an empty generator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Discard any partial accumulation.
    pub fn reset(&mut self) {
        self.fragments.clear();
        self.first = None;
        self.expect = 0;
    }

    /// Feed the entry at `ptr`. Returns the logical entry once a short
    /// entry terminates the sequence.
    pub fn feed(&mut self, ptr: DirectoryEntryPointer, entry: &DirectoryEntry) -> Option<ResolvedEntry> {
        if entry.is_free() || entry.is_deleted() {
            self.reset();
            return None;
        }
        if entry.is_lfn() {
            self.feed_fragment(ptr, entry);
            return None;
        }

        let checksum = lfn_checksum(entry.short_name());
        let complete = self.first.is_some() && self.expect == 0 && self.checksum == checksum;
        let resolved = if complete {
            ResolvedEntry {
                first: self.first.unwrap_or(ptr),
                entry_ptr: ptr,
                count: self.fragments.len() + 1,
                name: self.assemble(),
                entry: *entry,
            }
        } else {
            ResolvedEntry {
                first: ptr,
                entry_ptr: ptr,
                count: 1,
                name: short_name_to_string(entry.short_name(), entry.reserved_nt()),
                entry: *entry,
            }
        };
        self.reset();
        Some(resolved)
    }

    fn feed_fragment(&mut self, ptr: DirectoryEntryPointer, entry: &DirectoryEntry) {
        let ordinal = entry.lfn_ordinal();
        let index = ordinal & !LAST_FRAGMENT;
        if ordinal & LAST_FRAGMENT != 0 {
            self.reset();
            if index == 0 || usize::from(index) * UNITS_PER_FRAGMENT > MAX_NAME_UNITS + UNITS_PER_FRAGMENT {
                return;
            }
            self.checksum = entry.lfn_checksum();
            self.first = Some(ptr);
            self.fragments.push(entry.lfn_units());
            self.expect = index - 1;
            return;
        }
        if self.first.is_some() && self.expect != 0 && index == self.expect && entry.lfn_checksum() == self.checksum {
            self.fragments.push(entry.lfn_units());
            self.expect -= 1;
        } else {
            self.reset();
        }
    }

    fn assemble(&self) -> String {
        // Fragments were collected highest ordinal first.
        let units: Vec<u16> = self
            .fragments
            .iter()
            .rev()
            .flat_map(|f| f.iter().copied())
            .take_while(|&u| u != 0x0000)
            .filter(|&u| u != 0xFFFF)
            .collect();
        char::decode_utf16(units)
            .map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER))
            .collect()
    }
}

/// Build LFN fragments for `name` in write order (highest ordinal first).
pub fn encode_lfn(name: &str, checksum: u8) -> Vec<DirectoryEntry> {
    let mut units: Vec<u16> = name.encode_utf16().collect();
    if units.len() % UNITS_PER_FRAGMENT != 0 {
        units.push(0x0000);
    }
    let count = units.len().div_ceil(UNITS_PER_FRAGMENT);
    units.resize(count * UNITS_PER_FRAGMENT, 0xFFFF);

    (0..count)
        .rev()
        .map(|i| {
            let mut chunk = [0u16; UNITS_PER_FRAGMENT];
            chunk.copy_from_slice(&units[i * UNITS_PER_FRAGMENT..(i + 1) * UNITS_PER_FRAGMENT]);
            let mut ordinal = (i + 1) as u8;
            if i + 1 == count {
                ordinal |= LAST_FRAGMENT;
            }
            DirectoryEntry::new_lfn(ordinal, checksum, &chunk)
        })
        .collect()
}

/// Outcome of deriving a short name for a long one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShortName {
    /// Space padded 8.3 name.
    pub name: [u8; 11],
    /// NT case bits making `name` display as the original.
    pub reserved_nt: u8,
    /// Whether LFN fragments are required to keep the original name.
    pub needs_lfn: bool,
}

fn sanitize(part: &str, limit: usize) -> Vec<u8> {
    part.bytes()
        .filter(|b| b.is_ascii_alphanumeric() || SHORT_NAME_SPECIALS.contains(b))
        .map(|b| b.to_ascii_uppercase())
        .take(limit)
        .collect()
}

fn split_name(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(pos) if pos > 0 => (&name[..pos], &name[pos + 1..]),
        _ => (name, ""),
    }
}

fn pack(base: &[u8], ext: &[u8]) -> [u8; 11] {
    let mut out = [b' '; 11];
    out[..base.len().min(8)].copy_from_slice(&base[..base.len().min(8)]);
    out[8..8 + ext.len().min(3)].copy_from_slice(&ext[..ext.len().min(3)]);
    out
}

fn case_bits(part: &str) -> Option<u8> {
    let has_upper = part.bytes().any(|b| b.is_ascii_uppercase());
    let has_lower = part.bytes().any(|b| b.is_ascii_lowercase());
    match (has_upper, has_lower) {
        (true, true) => None,
        (false, true) => Some(1),
        _ => Some(0),
    }
}

fn name_hash(name: &str) -> u16 {
    name.encode_utf16()
        .fold(0u16, |h, unit| h.rotate_left(3).wrapping_mul(31).wrapping_add(unit))
}

/// Derive an 8.3 short name for `name`, unique among `existing`.
///
/// Names that fit 8.3 exactly (optionally all-lowercase per part) are
/// stored without LFN fragments. Others get a `~1`..`~4` tail, then a
/// hashed `XXHHHH~1` form when all four are taken.
pub fn short_name_for(name: &str, existing: &[[u8; 11]]) -> ShortName {
    let trimmed = name.trim_end_matches(['.', ' ']);
    let (base_part, ext_part) = split_name(trimmed);
    let mut base = sanitize(base_part, usize::MAX);
    if base.is_empty() {
        base.push(b'_');
    }
    let ext = sanitize(ext_part, 3);

    let direct = pack(&base, &ext);
    if let (Some(base_lower), Some(ext_lower)) = (case_bits(base_part), case_bits(ext_part)) {
        let mut reserved_nt = 0;
        if base_lower == 1 {
            reserved_nt |= nt::LOWER_BASE;
        }
        if ext_lower == 1 {
            reserved_nt |= nt::LOWER_EXT;
        }
        if base.len() <= 8 && short_name_to_string(&direct, reserved_nt) == trimmed {
            return ShortName {
                name: direct,
                reserved_nt,
                needs_lfn: false,
            };
        }
    }

    for n in 1..=4u8 {
        let tail = format!("~{n}");
        let keep = 8 - tail.len();
        let mut candidate_base: Vec<u8> = base.iter().copied().take(keep).collect();
        candidate_base.extend_from_slice(tail.as_bytes());
        let candidate = pack(&candidate_base, &ext);
        if !existing.contains(&candidate) {
            return ShortName {
                name: candidate,
                reserved_nt: 0,
                needs_lfn: true,
            };
        }
    }

    let mut hash = name_hash(name);
    loop {
        let mut candidate_base: Vec<u8> = base.iter().copied().take(2).collect();
        candidate_base.extend_from_slice(format!("{hash:04X}~1").as_bytes());
        let candidate = pack(&candidate_base, &ext);
        if !existing.contains(&candidate) {
            return ShortName {
                name: candidate,
                reserved_nt: 0,
                needs_lfn: true,
            };
        }
        hash = hash.wrapping_add(1);
    }
}

/// Attribute mask of bits a caller may set on a new entry.
pub const USER_ATTRIBUTES: u8 = attr::READ_ONLY | attr::HIDDEN | attr::SYSTEM | attr::DIRECTORY | attr::ARCHIVE;

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(entries: &[DirectoryEntry]) -> Vec<ResolvedEntry> {
        let mut generator = LongFileNameGen::new();
        entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| generator.feed(DirectoryEntryPointer::new(100, i as u8), e))
            .collect()
    }

    #[test]
    fn test_checksum_known_value() {
        // Reference value for "FOO     BAR"
        let mut sum = 0u8;
        for &b in b"FOO     BAR" {
            sum = (if sum & 1 != 0 { 0x80 } else { 0 }) + (sum >> 1);
            sum = sum.wrapping_add(b);
        }
        assert_eq!(lfn_checksum(b"FOO     BAR"), sum);
    }

    #[test]
    fn test_long_name_reconstruction() {
        let name = "A very long name.txt";
        let short = short_name_for(name, &[]);
        assert!(short.needs_lfn);
        let mut entries = encode_lfn(name, lfn_checksum(&short.name));
        assert_eq!(entries.len(), 2);
        entries.push(DirectoryEntry::new_short(short.name, attr::ARCHIVE));

        let resolved = feed_all(&entries);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].name, name);
        assert_eq!(resolved[0].count, 3);
        assert_eq!(resolved[0].first, DirectoryEntryPointer::new(100, 0));
        assert_eq!(resolved[0].entry_ptr, DirectoryEntryPointer::new(100, 2));
    }

    #[test]
    fn test_exact_multiple_of_fragment_has_no_terminator() {
        let name = "abcdefghijklm"; // 13 units
        let entries = encode_lfn(name, 0);
        assert_eq!(entries.len(), 1);
        assert!(!entries[0].lfn_units().contains(&0));
    }

    #[test]
    fn test_checksum_mismatch_falls_back_to_short_name() {
        let mut entries = encode_lfn("Some long file.bin", 0x00);
        let short = short_name_for("Some long file.bin", &[]);
        assert_ne!(lfn_checksum(&short.name), 0x00);
        entries.push(DirectoryEntry::new_short(short.name, attr::ARCHIVE));

        let resolved = feed_all(&entries);
        assert_eq!(resolved[0].name, "SOMELO~1.BIN");
        assert_eq!(resolved[0].count, 1);
    }

    #[test]
    fn test_deleted_entry_discards_accumulation() {
        let short = short_name_for("Long enough name.doc", &[]);
        let mut entries = encode_lfn("Long enough name.doc", lfn_checksum(&short.name));
        let mut deleted = DirectoryEntry::new_short(*b"OLD     TXT", 0);
        deleted.mark_deleted();
        entries.insert(1, deleted);
        entries.push(DirectoryEntry::new_short(short.name, attr::ARCHIVE));

        let resolved = feed_all(&entries);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].count, 1);
    }

    #[test]
    fn test_fitting_names_need_no_lfn() {
        let upper = short_name_for("README.TXT", &[]);
        assert!(!upper.needs_lfn);
        assert_eq!(&upper.name, b"README  TXT");

        let lower = short_name_for("readme.txt", &[]);
        assert!(!lower.needs_lfn);
        assert_eq!(lower.reserved_nt, nt::LOWER_BASE | nt::LOWER_EXT);

        let mixed = short_name_for("ReadMe.txt", &[]);
        assert!(mixed.needs_lfn);
    }

    #[test]
    fn test_lowercase_short_name_lists_lowercase() {
        let short = short_name_for("boot.hex", &[]);
        let mut entry = DirectoryEntry::new_short(short.name, attr::ARCHIVE);
        entry.set_reserved_nt(short.reserved_nt);
        assert_eq!(feed_all(&[entry])[0].name, "boot.hex");
    }

    #[test]
    fn test_numeric_tails_and_hash_fallback() {
        let first = short_name_for("Photograph one.jpg", &[]);
        assert_eq!(&first.name, b"PHOTOG~1JPG");

        let second = short_name_for("Photograph two.jpg", &[first.name]);
        assert_eq!(&second.name, b"PHOTOG~2JPG");

        let taken = [*b"PHOTOG~1JPG", *b"PHOTOG~2JPG", *b"PHOTOG~3JPG", *b"PHOTOG~4JPG"];
        let hashed = short_name_for("Photograph five.jpg", &taken);
        assert!(!taken.contains(&hashed.name));
        assert_eq!(&hashed.name[..2], b"PH");
        assert_eq!(&hashed.name[6..8], b"~1");
    }

    #[test]
    fn test_illegal_characters_are_stripped() {
        let short = short_name_for("my+file[1].c", &[]);
        assert!(short.needs_lfn);
        assert_eq!(&short.name, b"MYFILE~1C  ");
    }

    #[test]
    fn test_trailing_dots_trimmed() {
        let short = short_name_for("NOTES...", &[]);
        assert_eq!(&short.name, b"NOTES      ");
        assert!(!short.needs_lfn);
    }
}
