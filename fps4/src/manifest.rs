//! The manifest produced by extraction and consumed by packing.
//!
//! A manifest is a serialisable key-value tree (JSON in practice, but any
//! serde format serves) capturing everything the archive bytes carry beyond
//! the payloads themselves: the content bitmask, byte order, pointer scale,
//! alignment, terminator, comment, and one record per directory entry.
//! Unrecognised keys are preserved on both structures so that external
//! tooling can round-trip annotated manifests.

use serde_derive::{Deserialize, Serialize};

use crate::entry::{Entry, MetadataField};
use crate::ByteOrder;

/// The archive-level manifest.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Manifest {
    /// 16-bit entry-layout selector; see [`crate::ContentFlags`].
    pub content_bitmask: u16,

    /// Header field of unknown meaning, preserved verbatim.
    pub unknown0: u32,

    /// Pointer scale: payload byte offset = entry address × this.
    #[serde(default = "default_multiplier")]
    pub file_location_multiplier: u32,

    /// The archive's byte order.
    pub byteorder: ByteOrder,

    /// The terminator entry's raw start-pointer value, or -1 when it simply
    /// points at the end of the payload region and can be recomputed.
    #[serde(default = "default_terminator")]
    pub file_terminator_address: i64,

    /// Optional Shift-JIS archive comment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,

    /// Archive-wide payload alignment.
    #[serde(default = "default_alignment")]
    pub alignment: u64,

    /// Alignment of the first payload, when stricter than `alignment`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_file_alignment: Option<u64>,

    /// When set, the packer stores each entry's exact file size in the
    /// sector-size field instead of rounding it up to the alignment.
    #[serde(default)]
    pub set_sector_size_as_file_size: bool,

    /// One record per directory entry, in directory order.
    pub files: Vec<ManifestEntry>,

    /// Unrecognised manifest keys, preserved for round trips.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// One directory entry of a manifest.
///
/// Only the fields the archive's content bitmask enables are present;
/// absent numeric fields pack as zero.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// 0-based index of the entry in the directory.
    #[serde(default)]
    pub index: u32,

    /// Scaled payload start pointer, as parsed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<u32>,

    /// Sector size, as parsed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sector_size: Option<u32>,

    /// Payload size in bytes; refreshed from disk before packing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u32>,

    /// Filename field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,

    /// File-extension field. When absent, packing derives it from the
    /// filename's last dot-segment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_extension: Option<String>,

    /// File-type field. When absent, packing derives it like the extension.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,

    /// Metadata fields, serialised as `[key-or-null, value]` pairs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Vec<MetadataField>>,

    /// Unknown-mask field 0x080.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unknown_0x080: Option<u32>,

    /// Unknown-mask field 0x100.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unknown_0x100: Option<u32>,

    /// Whether this slot carries no payload.
    #[serde(default)]
    pub skippable: bool,

    /// Where the extracted payload lives on disk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Unrecognised entry keys, preserved for round trips.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_multiplier() -> u32 {
    1
}

fn default_terminator() -> i64 {
    -1
}

fn default_alignment() -> u64 {
    1
}

impl From<&Entry> for ManifestEntry {
    fn from(entry: &Entry) -> Self {
        Self {
            index: entry.index,
            address: entry.address,
            sector_size: entry.sector_size,
            file_size: entry.file_size,
            filename: entry.filename.clone(),
            file_extension: entry.file_extension.clone(),
            file_type: entry.file_type.clone(),
            metadata: entry.metadata.clone(),
            unknown_0x080: entry.unknown_0x080,
            unknown_0x100: entry.unknown_0x100,
            skippable: entry.skippable,
            path: None,
            extra: serde_json::Map::new(),
        }
    }
}
