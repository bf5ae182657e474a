//! Reads and writes Scenario text archives.
//!
//! A Scenario archive is a fixed-shape container: a big-endian header region
//! of 0x20 bytes, a table of 32-byte entries starting at 0x20, and payloads
//! from `file_offset` onward. Payloads are addressed by decimal index; an
//! all-zero entry is a gap. Consecutive identical payloads are stored once,
//! with the later entry pointing at the earlier payload's offset.
//!
//! Payloads are opaque to this crate; in shipped archives they are TLZC
//! frames, which is where the convention of reading the uncompressed size
//! from offset 5 of each input file comes from.

#![forbid(unsafe_code)]
#![forbid(unused_must_use)]
#![warn(missing_docs)]

use anyhow::{bail, Context, Result};
use rayon::prelude::*;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;
use tracing::{debug, trace_span};
use vesperia_growbuf::{GrowBuf, Whence};
use zerocopy::byteorder::{BE, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

#[cfg(test)]
mod tests;

/// The tag written at the start of every Scenario archive.
pub const SCENARIO_MAGIC: [u8; 8] = *b"TO8SCEL\0";

/// Where the payload region begins in packed archives.
pub const FILE_OFFSET: u32 = 0x800;

/// Byte offset of the entry table.
pub const ENTRY_TABLE_OFFSET: usize = 0x20;

/// Payloads are padded to this boundary.
const PAYLOAD_ALIGNMENT: usize = 0x10;

/// Identical consecutive payloads are only stored once when they are larger
/// than this.
const DUPLICATE_SIZE_THRESHOLD: usize = 0x30;

/// The fixed first payload: the ASCII tag `DUMMY` and 11 zero bytes.
const DUMMY_PAYLOAD: [u8; 16] = *b"DUMMY\0\0\0\0\0\0\0\0\0\0\0";

/// Describes the header at the start of a Scenario archive.
///
/// A duplicate copy of `file_size` follows the header, then four padding
/// bytes; the entry table starts at [`ENTRY_TABLE_OFFSET`].
#[derive(AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct ScenarioHeader {
    /// Archive tag; [`SCENARIO_MAGIC`] in packed archives.
    pub magic: [u8; 8],

    /// Number of entries in the table, gaps included.
    pub file_count: U32<BE>,

    /// Byte offset of the payload region.
    pub file_offset: U32<BE>,

    /// Total size in bytes of the archive.
    pub file_size: U32<BE>,

    /// Padding; zero.
    pub padding: [u8; 4],
}

static_assertions::const_assert_eq!(core::mem::size_of::<ScenarioHeader>(), 0x18);

/// One entry of the table. All fields beyond the first three are zero.
#[derive(AsBytes, FromBytes, FromZeroes, Unaligned, Clone)]
#[repr(C)]
pub struct ScenarioEntry {
    /// Payload offset, relative to the header's `file_offset`.
    pub offset: U32<BE>,

    /// Size in bytes of the stored payload. Zero marks a gap.
    pub file_size_compressed: U32<BE>,

    /// Uncompressed payload size, harvested from the payload's own framing.
    pub file_size_uncompressed: U32<BE>,

    /// Zero.
    pub reserved: [u8; 20],
}

static_assertions::const_assert_eq!(core::mem::size_of::<ScenarioEntry>(), 0x20);

/// The categorised failure modes of the Scenario container.
#[derive(Copy, Clone, Debug)]
pub enum ScenarioError {
    /// The archive ends before its declared contents do.
    Truncated,
    /// An entry's payload lies outside the archive.
    PayloadOutOfRange {
        /// Index of the offending entry.
        index: u32,
        /// Resolved byte offset of the payload.
        offset: u64,
        /// Length of the payload.
        len: u64,
    },
    /// An input file is too large for the 32-bit size fields.
    TooLarge,
    /// The entry table would run past the fixed payload offset.
    TableOverflow {
        /// The number of entries that did not fit.
        file_count: u32,
    },
}

impl std::error::Error for ScenarioError {}

impl std::fmt::Display for ScenarioError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Truncated => f.write_str("The Scenario archive is truncated."),
            Self::PayloadOutOfRange { index, offset, len } => write!(
                f,
                "The payload of entry {index} ({len} bytes at offset {offset:#x}) lies \
                 outside the archive."
            ),
            Self::TooLarge => f.write_str("Files over 4 GiB are not supported."),
            Self::TableOverflow { file_count } => write!(
                f,
                "{file_count} entries do not fit between the entry table and the payload \
                 region at {FILE_OFFSET:#x}."
            ),
        }
    }
}

/// Extracts every stored payload of `archive` into `out_dir`, one file per
/// entry named by its decimal index. Gap entries produce no file. Returns
/// the number of files written.
pub fn extract(archive: &Path, out_dir: &Path) -> Result<usize> {
    let _span = trace_span!("scenario::extract").entered();

    let data = fs::read(archive)
        .with_context(|| format!("failed to read {}", archive.display()))?;
    fs::create_dir_all(out_dir)
        .with_context(|| format!("failed to create {}", out_dir.display()))?;

    let Some(header) = ScenarioHeader::read_from_prefix(data.as_slice()) else {
        bail!(ScenarioError::Truncated);
    };
    let file_offset = header.file_offset.get() as usize;

    debug!(
        file_count = header.file_count.get(),
        file_offset,
        "parsed Scenario header"
    );

    // Slice every payload up front, then fan the independent writes out.
    let mut slices: Vec<(u32, std::ops::Range<usize>)> = Vec::new();
    for index in 0..header.file_count.get() {
        let entry_offset = ENTRY_TABLE_OFFSET + 0x20 * index as usize;
        let Some(entry_bytes) = data.get(entry_offset..) else {
            bail!(ScenarioError::Truncated);
        };
        let Some(entry) = ScenarioEntry::read_from_prefix(entry_bytes) else {
            bail!(ScenarioError::Truncated);
        };

        let compressed_size = entry.file_size_compressed.get() as usize;
        if compressed_size == 0 {
            continue;
        }

        let start = file_offset + entry.offset.get() as usize;
        let end = start + compressed_size;
        if data.get(start..end).is_none() {
            bail!(ScenarioError::PayloadOutOfRange {
                index,
                offset: start as u64,
                len: compressed_size as u64,
            });
        }
        slices.push((index, start..end));
    }

    slices.par_iter().try_for_each(|(index, range)| {
        let path = out_dir.join(index.to_string());
        fs::write(&path, &data[range.clone()])
            .with_context(|| format!("failed to write {}", path.display()))
    })?;

    Ok(slices.len())
}

/// Packs the numbered files of `directory` into a Scenario archive at
/// `output`.
///
/// The archive's entry count is the largest numeric filename plus one;
/// missing indices become gap entries. A file identical to its immediate
/// predecessor (and larger than 0x30 bytes) is not stored again: its entry
/// points at the predecessor's payload.
pub fn pack(directory: &Path, output: &Path) -> Result<()> {
    let _span = trace_span!("scenario::pack").entered();

    let indices = numbered_files(directory)?;
    let Some(max_index) = indices.iter().copied().max() else {
        bail!("{} contains no numbered payload files.", directory.display());
    };
    let file_count = max_index + 1;

    // The packed layout keeps the payload region at the fixed offset, so
    // the table has a hard capacity.
    if ENTRY_TABLE_OFFSET + 0x20 * file_count as usize > FILE_OFFSET as usize {
        bail!(ScenarioError::TableOverflow { file_count });
    }

    let mut buf = GrowBuf::with_len(FILE_OFFSET as usize);
    buf.seek(FILE_OFFSET as i64, Whence::Start);
    buf.write(&DUMMY_PAYLOAD);

    let mut previous_hash: Option<[u8; 32]> = None;
    let mut entries: Vec<ScenarioEntry> = Vec::with_capacity(file_count as usize);

    for index in 0..file_count {
        if !indices.contains(&index) {
            entries.push(ScenarioEntry::new_zeroed());
            previous_hash = None;
            continue;
        }

        let path = directory.join(index.to_string());
        let payload =
            fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
        let Ok(compressed_size) = u32::try_from(payload.len()) else {
            bail!(ScenarioError::TooLarge);
        };

        let hash: [u8; 32] = Sha256::digest(&payload).into();
        let is_duplicate =
            previous_hash == Some(hash) && payload.len() > DUPLICATE_SIZE_THRESHOLD;
        previous_hash = Some(hash);

        let mut entry = ScenarioEntry::new_zeroed();
        entry.offset = if is_duplicate {
            // Reuse the previous payload rather than storing it again.
            entries.last().map(|e| e.offset).unwrap_or(U32::new(0))
        } else {
            U32::new(buf.position() as u32 - FILE_OFFSET)
        };
        entry.file_size_compressed = U32::new(compressed_size);
        entry.file_size_uncompressed = U32::new(uncompressed_size_hint(&payload));
        entries.push(entry);

        if !is_duplicate {
            buf.write(&payload);
            if buf.len() % PAYLOAD_ALIGNMENT != 0 {
                buf.write_zeros(PAYLOAD_ALIGNMENT - buf.len() % PAYLOAD_ALIGNMENT);
            }
        } else {
            debug!(index, "suppressed duplicate payload");
        }
    }

    // Header, the duplicated size word, and the entry table go in last.
    let Ok(total_size) = u32::try_from(buf.len()) else {
        bail!(ScenarioError::TooLarge);
    };
    let header = ScenarioHeader {
        magic: SCENARIO_MAGIC,
        file_count: U32::new(file_count),
        file_offset: U32::new(FILE_OFFSET),
        file_size: U32::new(total_size),
        padding: [0; 4],
    };
    buf.write_at(0, header.as_bytes());
    buf.write_at(0x18, &total_size.to_be_bytes());

    for (index, entry) in entries.iter().enumerate() {
        buf.write_at(ENTRY_TABLE_OFFSET + 0x20 * index, entry.as_bytes());
    }

    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(output, buf.into_vec())
        .with_context(|| format!("failed to write {}", output.display()))?;

    debug!(file_count, total_size, "packed Scenario archive");
    Ok(())
}

/// The numeric filenames present in `directory`.
fn numbered_files(directory: &Path) -> Result<Vec<u32>> {
    let mut indices = Vec::new();
    let listing = fs::read_dir(directory)
        .with_context(|| format!("failed to list {}", directory.display()))?;
    for dir_entry in listing {
        let dir_entry = dir_entry?;
        if let Some(index) = dir_entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u32>().ok())
        {
            indices.push(index);
        }
    }
    Ok(indices)
}

/// The game convention for the uncompressed size: a little-endian u32 at
/// offset 5 of the payload (inside its TLZC framing). Short payloads record
/// zero.
fn uncompressed_size_hint(payload: &[u8]) -> u32 {
    match payload.get(5..9) {
        Some(bytes) => u32::from_le_bytes(bytes.try_into().unwrap()),
        None => 0,
    }
}
