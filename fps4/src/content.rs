//! The 16-bit content bitmask that selects the shape of directory entries.

use bitflags::bitflags;

bitflags! {
    /// Selects which optional fields are present in each directory entry.
    ///
    /// Each flag enables one fixed-width field. Enabled fields always appear
    /// in the canonical order of the flag values below, so the entry size
    /// and the offset of any field follow from the bitmask alone. Bits
    /// 0xFE00 are reserved: archives carrying them are accepted, the bits
    /// round-trip through manifests unchanged, and no field is read or
    /// written for them.
    #[derive(Copy, Clone, Eq, PartialEq, Debug)]
    pub struct ContentFlags: u16 {
        /// 4-byte payload start pointer (scaled by the file-location
        /// multiplier).
        const START_POINTERS = 0x0001;
        /// 4-byte sector size.
        const SECTOR_SIZES = 0x0002;
        /// 4-byte file size.
        const FILE_SIZES = 0x0004;
        /// 32-byte Shift-JIS filename, NUL-padded.
        const FILENAMES = 0x0008;
        /// 8-byte Shift-JIS file extension.
        const FILE_EXTENSIONS = 0x0010;
        /// 4-byte Shift-JIS file type.
        const FILE_TYPES = 0x0020;
        /// 4-byte pointer to a Shift-JIS metadata blob.
        const METADATA = 0x0040;
        /// 4-byte field of unknown meaning; a non-zero value marks the
        /// entry as skippable.
        const UNKNOWN_0X080 = 0x0080;
        /// 4-byte field of unknown meaning.
        const UNKNOWN_0X100 = 0x0100;
    }
}

/// Width of the filename field.
pub(crate) const FILENAME_WIDTH: usize = 0x20;

/// Width of the file-extension field.
pub(crate) const EXTENSION_WIDTH: usize = 0x8;

/// Width of the file-type field.
pub(crate) const FILE_TYPE_WIDTH: usize = 0x4;

/// The canonical field order with each field's width in bytes.
const FIELD_WIDTHS: [(ContentFlags, u16); 9] = [
    (ContentFlags::START_POINTERS, 0x4),
    (ContentFlags::SECTOR_SIZES, 0x4),
    (ContentFlags::FILE_SIZES, 0x4),
    (ContentFlags::FILENAMES, FILENAME_WIDTH as u16),
    (ContentFlags::FILE_EXTENSIONS, EXTENSION_WIDTH as u16),
    (ContentFlags::FILE_TYPES, FILE_TYPE_WIDTH as u16),
    (ContentFlags::METADATA, 0x4),
    (ContentFlags::UNKNOWN_0X080, 0x4),
    (ContentFlags::UNKNOWN_0X100, 0x4),
];

impl ContentFlags {
    /// The size in bytes of one directory entry under this bitmask.
    pub fn entry_size(self) -> u16 {
        FIELD_WIDTHS
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, width)| width)
            .sum()
    }

    /// Byte offset of the metadata pointer within one entry, or 0 when the
    /// metadata field is not present.
    pub fn metadata_offset(self) -> u16 {
        if !self.contains(Self::METADATA) {
            return 0;
        }
        FIELD_WIDTHS
            .iter()
            .take_while(|(flag, _)| *flag != Self::METADATA)
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, width)| width)
            .sum()
    }

    /// Returns `true` if any reserved bit (0xFE00) is set.
    pub fn has_unknown_types(self) -> bool {
        self.bits() & 0xfe00 != 0
    }
}
