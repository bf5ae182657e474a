//! Reads and writes FPS4 file containers.
//!
//! An FPS4 archive is a directory of variable-shape entries followed by a
//! payload region. The shape of each entry is selected by a 16-bit content
//! bitmask in the header: nine independent flags each enable one fixed-width
//! field (start pointer, sector size, file size, filename, and so on), and
//! the per-entry size is the sum of the enabled widths. The header is
//! self-describing in two further ways: its byte order is detected from a
//! plausibility check on the `header_size` field, and archives whose
//! pointers are expressed in sector units rather than bytes are recovered by
//! inferring a file-location multiplier from the observed entry addresses.
//!
//! Extraction produces the payload files plus a [`Manifest`] that captures
//! everything needed to rebuild the archive byte-for-byte; [`pack`] consumes
//! that manifest and the files on disk. All strings inside an archive
//! (filenames, metadata, the optional archive comment) are Shift-JIS.

#![forbid(unsafe_code)]
#![forbid(unused_must_use)]
#![warn(missing_docs)]

mod content;
mod entry;
mod manifest;
mod parser;
mod read;
mod write;

pub use content::ContentFlags;
pub use entry::{Entry, MetadataField, SENTINEL_ADDRESS};
pub use manifest::{Manifest, ManifestEntry};
pub use read::{extract, ExtractOptions, Fps4Archive};
pub use write::{build, pack};

use anyhow::{bail, Result};
use parser::Parser;
use serde_derive::{Deserialize, Serialize};

/// The signature at the start of every FPS4 archive.
pub const FPS4_MAGIC: [u8; 4] = *b"FPS4";

/// The length of the FPS4 file header.
pub const FPS4_HEADER_LEN: usize = 0x1c;

/// Checks whether `header` begins with the FPS4 signature.
pub fn is_header_fps4(header: &[u8]) -> bool {
    header.starts_with(&FPS4_MAGIC)
}

/// The byte order of an archive.
///
/// FPS4 reuses one header and entry layout across both byte orders, so the
/// order is a runtime property of each archive rather than part of the type
/// of its structures. It round-trips through manifests as `"little"` /
/// `"big"`.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    /// Least significant byte first.
    Little,
    /// Most significant byte first.
    Big,
}

impl ByteOrder {
    /// The byte order of the host.
    pub const HOST: ByteOrder = if cfg!(target_endian = "big") {
        ByteOrder::Big
    } else {
        ByteOrder::Little
    };

    pub(crate) fn u16_from(self, bytes: [u8; 2]) -> u16 {
        match self {
            Self::Little => u16::from_le_bytes(bytes),
            Self::Big => u16::from_be_bytes(bytes),
        }
    }

    pub(crate) fn u32_from(self, bytes: [u8; 4]) -> u32 {
        match self {
            Self::Little => u32::from_le_bytes(bytes),
            Self::Big => u32::from_be_bytes(bytes),
        }
    }

    pub(crate) fn u16_bytes(self, value: u16) -> [u8; 2] {
        match self {
            Self::Little => value.to_le_bytes(),
            Self::Big => value.to_be_bytes(),
        }
    }

    pub(crate) fn u32_bytes(self, value: u32) -> [u8; 4] {
        match self {
            Self::Little => value.to_le_bytes(),
            Self::Big => value.to_be_bytes(),
        }
    }
}

/// The decoded FPS4 file header.
///
/// The header is 28 bytes on disk, in the archive's byte order; see
/// [`ByteOrder`] for why this is a plain struct rather than a fixed-endian
/// wire struct.
#[derive(Copy, Clone, Debug, Default)]
pub struct Fps4Header {
    /// Count of directory entries, including the terminator.
    pub file_entries: u32,
    /// Byte offset of the first directory entry. 28 in every known archive.
    pub header_size: u32,
    /// Byte offset of the first payload.
    pub file_start: u32,
    /// Size in bytes of each directory entry.
    pub entry_size: u16,
    /// Selects which fields are present per entry; see [`ContentFlags`].
    pub content_bitmask: u16,
    /// Meaning unknown; preserved verbatim through manifests.
    pub unknown0: u32,
    /// Byte offset of a NUL-terminated Shift-JIS archive comment, or 0.
    pub archive_name_address: u32,
}

impl Fps4Header {
    /// Decodes the fields following the magic under the given byte order.
    pub(crate) fn parse(data: &[u8], order: ByteOrder) -> Result<Self> {
        let mut p = Parser::new(data);
        p.skip(4)?; // magic, validated by the caller
        Ok(Self {
            file_entries: p.u32(order)?,
            header_size: p.u32(order)?,
            file_start: p.u32(order)?,
            entry_size: p.u16(order)?,
            content_bitmask: p.u16(order)?,
            unknown0: p.u32(order)?,
            archive_name_address: p.u32(order)?,
        })
    }

    /// Encodes the header under the given byte order.
    pub(crate) fn to_bytes(self, order: ByteOrder) -> [u8; FPS4_HEADER_LEN] {
        let mut out = [0u8; FPS4_HEADER_LEN];
        out[0..4].copy_from_slice(&FPS4_MAGIC);
        out[4..8].copy_from_slice(&order.u32_bytes(self.file_entries));
        out[8..12].copy_from_slice(&order.u32_bytes(self.header_size));
        out[12..16].copy_from_slice(&order.u32_bytes(self.file_start));
        out[16..18].copy_from_slice(&order.u16_bytes(self.entry_size));
        out[18..20].copy_from_slice(&order.u16_bytes(self.content_bitmask));
        out[20..24].copy_from_slice(&order.u32_bytes(self.unknown0));
        out[24..28].copy_from_slice(&order.u32_bytes(self.archive_name_address));
        out
    }
}

/// The categorised failure modes of the FPS4 container.
#[derive(Copy, Clone, Debug)]
pub enum Fps4Error {
    /// The input does not begin with the FPS4 signature.
    BadMagic,
    /// The header's entry size disagrees with the size implied by its
    /// content bitmask.
    EntrySizeMismatch {
        /// The entry size stored in the header.
        stored: u16,
        /// The size the content bitmask implies.
        implied: u16,
    },
    /// The archive ends before its declared contents do.
    Truncated,
    /// A non-skippable entry has no start pointer.
    MissingAddress {
        /// Index of the offending entry.
        index: u32,
    },
    /// A non-skippable entry has no stored size and none can be inferred
    /// from its neighbours.
    MissingFileSize {
        /// Index of the offending entry.
        index: u32,
    },
    /// An entry's payload lies outside the archive.
    PayloadOutOfRange {
        /// Index of the offending entry.
        index: u32,
        /// Resolved byte offset of the payload.
        offset: u64,
        /// Resolved byte length of the payload.
        len: u64,
    },
    /// The packed archive would exceed the 32-bit size fields.
    TooLarge,
}

impl std::error::Error for Fps4Error {}

impl std::fmt::Display for Fps4Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadMagic => f.write_str("The input does not have an FPS4 signature."),
            Self::EntrySizeMismatch { stored, implied } => write!(
                f,
                "The header declares {stored}-byte entries, but its content bitmask \
                 implies {implied}-byte entries."
            ),
            Self::Truncated => f.write_str("The FPS4 archive is truncated."),
            Self::MissingAddress { index } => write!(
                f,
                "Entry {index} carries a payload but has no start pointer."
            ),
            Self::MissingFileSize { index } => write!(
                f,
                "Entry {index} carries a payload but has no stored size, and no size \
                 could be inferred from its neighbours."
            ),
            Self::PayloadOutOfRange { index, offset, len } => write!(
                f,
                "The payload of entry {index} ({len} bytes at offset {offset:#x}) lies \
                 outside the archive."
            ),
            Self::TooLarge => {
                f.write_str("Archives over 4 GiB are not supported.")
            }
        }
    }
}

/// Validates the header invariant tying `entry_size` to the content bitmask.
pub(crate) fn check_entry_size(header: &Fps4Header, flags: ContentFlags) -> Result<()> {
    let implied = flags.entry_size();
    if header.entry_size != implied {
        bail!(Fps4Error::EntrySizeMismatch {
            stored: header.entry_size,
            implied,
        });
    }
    Ok(())
}

/// Chooses the byte order of an archive from its header bytes.
///
/// The header layout is reused across byte orders, so the order is detected
/// by interpreting `header_size` both ways: an archive is little-endian iff
/// the little-endian reading is plausible (at most 0xFFFF) and the
/// big-endian reading is not, and vice versa. When neither reading is
/// conclusive, the host's byte order is used.
pub(crate) fn detect_byteorder(data: &[u8]) -> Result<ByteOrder> {
    let le = Fps4Header::parse(data, ByteOrder::Little)?;
    let be = Fps4Header::parse(data, ByteOrder::Big)?;

    Ok(match (le.header_size <= 0xffff, be.header_size <= 0xffff) {
        (true, false) => ByteOrder::Little,
        (false, true) => ByteOrder::Big,
        _ => ByteOrder::HOST,
    })
}
