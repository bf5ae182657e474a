//! Parsing and whole-archive extraction.

use anyhow::{bail, Context, Result};
use encoding_rs::SHIFT_JIS;
use std::fs;
use std::path::Path;
use tracing::{debug, trace_span};
use vesperia_growbuf::{alignment_from_lowest_unset_bit, read_cstring};

use crate::{
    check_entry_size, detect_byteorder, is_header_fps4, ByteOrder, ContentFlags, Entry,
    Fps4Error, Fps4Header, Manifest, ManifestEntry,
};

/// Options for [`extract`].
#[derive(Clone, Debug, Default)]
pub struct ExtractOptions {
    /// Record absolute `path` values in the manifest instead of paths
    /// relative to the working directory.
    pub absolute_paths: bool,

    /// Ignore entry metadata when resolving output paths.
    pub ignore_metadata: bool,
}

/// A parsed FPS4 archive: the decoded header, the directory, and the
/// properties inferred from them.
pub struct Fps4Archive {
    /// The decoded file header.
    pub header: Fps4Header,
    /// The archive's detected byte order.
    pub byteorder: ByteOrder,
    /// The decoded content bitmask.
    pub flags: ContentFlags,
    /// All directory entries, including the terminator slot.
    pub entries: Vec<Entry>,
    /// The archive comment, when the header points at one.
    pub archive_name: Option<String>,
    /// Pointer scale recovered from the observed entry addresses.
    pub file_location_multiplier: u32,
    /// Whether neighbour-based size guessing is meaningful for this archive:
    /// it stores file sizes, lacks sector sizes, and is linear.
    pub should_guess_file_size: bool,
}

impl Fps4Archive {
    /// Parses an archive image.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let _span = trace_span!("Fps4Archive::parse").entered();

        if !is_header_fps4(data) {
            bail!(Fps4Error::BadMagic);
        }

        let byteorder = detect_byteorder(data)?;
        let header = Fps4Header::parse(data, byteorder)?;
        let flags = ContentFlags::from_bits_retain(header.content_bitmask);
        check_entry_size(&header, flags)?;

        debug!(
            ?byteorder,
            file_entries = header.file_entries,
            content_bitmask = header.content_bitmask,
            "parsed FPS4 header"
        );

        let archive_name = match header.archive_name_address {
            0 => None,
            address => Some(read_cstring(data, SHIFT_JIS, address as usize)),
        };

        let mut entries = Vec::with_capacity(header.file_entries as usize);
        for index in 0..header.file_entries {
            let offset =
                header.header_size as usize + index as usize * header.entry_size as usize;
            let entry = Entry::parse(data, offset, index, flags, byteorder)
                .with_context(|| format!("failed to decode directory entry {index}"))?;
            entries.push(entry);
        }

        let file_location_multiplier = calculate_multiplier(&header, &entries, flags);
        let should_guess_file_size = flags.contains(ContentFlags::FILE_SIZES)
            && !flags.contains(ContentFlags::SECTOR_SIZES)
            && is_linear(&entries, flags);

        Ok(Self {
            header,
            byteorder,
            flags,
            entries,
            archive_name,
            file_location_multiplier,
            should_guess_file_size,
        })
    }

    /// Whether every non-skippable entry's address strictly exceeds its
    /// non-skippable predecessor's.
    pub fn is_linear(&self) -> bool {
        is_linear(&self.entries, self.flags)
    }

    /// The archive-level manifest fields, before any entry records.
    fn base_manifest(&self, archive_len: u64) -> Manifest {
        // Most terminators point at the end of the payload region; those are
        // recorded as -1 and recomputed on pack. A terminator that encodes
        // something else is preserved verbatim.
        let file_terminator_address = match self.entries.last().and_then(|e| e.address) {
            Some(address) if address as u64 != archive_len => address as i64,
            _ => -1,
        };

        Manifest {
            content_bitmask: self.header.content_bitmask,
            unknown0: self.header.unknown0,
            file_location_multiplier: self.file_location_multiplier,
            byteorder: self.byteorder,
            file_terminator_address,
            comment: self.archive_name.clone(),
            alignment: 1,
            first_file_alignment: None,
            set_sector_size_as_file_size: false,
            files: Vec::with_capacity(self.entries.len()),
            extra: serde_json::Map::new(),
        }
    }

    /// Writes every payload under `out_dir` and returns the manifest that
    /// rebuilds this archive.
    pub fn extract_to(
        &self,
        data: &[u8],
        out_dir: &Path,
        options: &ExtractOptions,
    ) -> Result<Manifest> {
        let _span = trace_span!("Fps4Archive::extract_to").entered();

        let mut manifest = self.base_manifest(data.len() as u64);

        let mut first_file_position: u64 = u64::MAX;
        let mut estimated_alignment: u64 = u64::MAX;
        let mut saw_payload = false;

        for entry in &self.entries {
            let mut record = ManifestEntry::from(entry);

            if !entry.skippable {
                let Some(address) = entry.address else {
                    bail!(Fps4Error::MissingAddress { index: entry.index });
                };
                let Some(file_size) = entry.estimate_file_size(&self.entries) else {
                    bail!(Fps4Error::MissingFileSize { index: entry.index });
                };

                let offset = address as u64 * self.file_location_multiplier as u64;
                saw_payload = true;
                first_file_position = first_file_position.min(offset);
                estimated_alignment &= !offset;

                let (directory, filename) = entry.estimate_file_path(options.ignore_metadata);
                let target_dir = match &directory {
                    Some(dir) => out_dir.join(dir),
                    None => out_dir.to_path_buf(),
                };
                fs::create_dir_all(&target_dir)
                    .with_context(|| format!("failed to create {}", target_dir.display()))?;
                let out_path = target_dir.join(&filename);

                let end = offset + file_size as u64;
                let payload = match data.get(offset as usize..end as usize) {
                    Some(payload) => payload,
                    None => bail!(Fps4Error::PayloadOutOfRange {
                        index: entry.index,
                        offset,
                        len: file_size as u64,
                    }),
                };
                fs::write(&out_path, payload)
                    .with_context(|| format!("failed to write {}", out_path.display()))?;

                debug!(
                    index = entry.index,
                    offset,
                    size = file_size,
                    path = %out_path.display(),
                    "extracted payload"
                );

                let recorded = if options.absolute_paths {
                    std::path::absolute(&out_path)?
                } else {
                    out_path
                };
                record.path = Some(recorded.to_string_lossy().into_owned());
            }

            manifest.files.push(record);
        }

        let alignment = if saw_payload {
            alignment_from_lowest_unset_bit(estimated_alignment)
        } else {
            1
        };
        manifest.alignment = alignment;

        if first_file_position != u64::MAX {
            let first_file_alignment = alignment_from_lowest_unset_bit(!first_file_position);
            if first_file_alignment > alignment {
                manifest.first_file_alignment = Some(first_file_alignment);
            }
        }

        manifest.set_sector_size_as_file_size = saw_payload
            && self.flags.contains(ContentFlags::FILE_SIZES)
            && self.flags.contains(ContentFlags::SECTOR_SIZES);

        Ok(manifest)
    }
}

/// Extracts an archive from disk: payloads land under `out_dir`, and the
/// returned manifest rebuilds the archive byte-for-byte via [`crate::pack`].
pub fn extract(archive: &Path, out_dir: &Path, options: &ExtractOptions) -> Result<Manifest> {
    let data = fs::read(archive)
        .with_context(|| format!("failed to read {}", archive.display()))?;
    let parsed = Fps4Archive::parse(&data)
        .with_context(|| format!("{} is not a usable FPS4 archive", archive.display()))?;
    parsed.extract_to(&data, out_dir, options)
}

/// Recovers the file-location multiplier from the observed entry addresses.
///
/// When the smallest non-skippable address evenly divides `file_start`, the
/// archive's pointers are expressed in units of that size (sector units);
/// otherwise pointers are plain byte offsets.
fn calculate_multiplier(header: &Fps4Header, entries: &[Entry], flags: ContentFlags) -> u32 {
    if !flags.contains(ContentFlags::START_POINTERS) {
        return 1;
    }

    let smallest = entries
        .iter()
        .filter(|e| !e.skippable)
        .filter_map(|e| e.address)
        .min();

    match smallest {
        None | Some(0) => 1,
        Some(s) if s == header.file_start => 1,
        Some(s) if header.file_start % s == 0 => header.file_start / s,
        Some(_) => 1,
    }
}

fn is_linear(entries: &[Entry], flags: ContentFlags) -> bool {
    if !flags.contains(ContentFlags::START_POINTERS) {
        return false;
    }

    let mut previous: Option<u32> = None;
    for entry in entries.iter().filter(|e| !e.skippable) {
        let Some(address) = entry.address else {
            return false;
        };
        if previous.is_some_and(|prev| address <= prev) {
            return false;
        }
        previous = Some(address);
    }
    true
}
