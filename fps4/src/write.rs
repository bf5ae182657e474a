//! Whole-archive packing from a manifest.

use anyhow::{bail, Context, Result};
use encoding_rs::SHIFT_JIS;
use std::fs;
use std::path::Path;
use tracing::{debug, trace_span, warn};
use vesperia_growbuf::{align_up, encode_string, GrowBuf, Whence};

use crate::content::{EXTENSION_WIDTH, FILENAME_WIDTH, FILE_TYPE_WIDTH};
use crate::{
    ContentFlags, Fps4Error, Fps4Header, Manifest, ManifestEntry, FPS4_HEADER_LEN,
    SENTINEL_ADDRESS,
};

/// Builds an archive from a manifest and writes it to `output`.
///
/// Each entry's `file_size` is refreshed from the file at its `path` before
/// the archive is planned, so payloads edited after extraction repack
/// correctly.
pub fn pack(manifest: &Manifest, output: &Path) -> Result<()> {
    let image = build(manifest)?;

    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(output, image).with_context(|| format!("failed to write {}", output.display()))
}

/// Builds the complete archive image in memory.
pub fn build(manifest: &Manifest) -> Result<Vec<u8>> {
    let _span = trace_span!("fps4::build").entered();

    let mut files = manifest.files.clone();
    refresh_file_sizes(&mut files)?;

    let flags = ContentFlags::from_bits_retain(manifest.content_bitmask);
    let entry_size = flags.entry_size() as usize;
    let metadata_offset = flags.metadata_offset() as usize;
    let order = manifest.byteorder;
    let alignment = manifest.alignment.max(1);
    let first_file_alignment = manifest.first_file_alignment.unwrap_or(alignment);
    let multiplier = manifest.file_location_multiplier.max(1) as u64;

    let mut buf = GrowBuf::with_len(FPS4_HEADER_LEN);
    buf.seek(FPS4_HEADER_LEN as i64, Whence::Start);

    // Directory. Self-contained fields are written now; start pointers,
    // sector sizes and metadata pointers stay zero until payload positions
    // are known.
    for file in &files {
        if flags.contains(ContentFlags::START_POINTERS) {
            buf.write_zeros(4);
        }
        if flags.contains(ContentFlags::SECTOR_SIZES) {
            buf.write_zeros(4);
        }
        if flags.contains(ContentFlags::FILE_SIZES) {
            buf.write(&order.u32_bytes(file.file_size.unwrap_or(0)));
        }
        if flags.contains(ContentFlags::FILENAMES) {
            write_padded(&mut buf, file.filename.as_deref().unwrap_or(""), FILENAME_WIDTH)?;
        }
        if flags.contains(ContentFlags::FILE_EXTENSIONS) {
            let extension = match &file.file_extension {
                Some(extension) => extension.clone(),
                None => derived_suffix(file).to_owned(),
            };
            write_padded(&mut buf, &extension, EXTENSION_WIDTH)?;
        }
        if flags.contains(ContentFlags::FILE_TYPES) {
            let file_type = match &file.file_type {
                Some(file_type) => file_type.clone(),
                None => derived_suffix(file).to_owned(),
            };
            write_padded(&mut buf, &file_type, FILE_TYPE_WIDTH)?;
        }
        if flags.contains(ContentFlags::METADATA) {
            buf.write_zeros(4);
        }
        if flags.contains(ContentFlags::UNKNOWN_0X080) {
            buf.write(&order.u32_bytes(file.unknown_0x080.unwrap_or(0)));
        }
        if flags.contains(ContentFlags::UNKNOWN_0X100) {
            buf.write(&order.u32_bytes(file.unknown_0x100.unwrap_or(0)));
        }
    }

    // One extra slot for the terminator entry.
    buf.write_zeros(entry_size);

    // Metadata text region. Each entry with metadata gets its pointer
    // patched and its fields appended, space-separated and NUL-terminated.
    if flags.contains(ContentFlags::METADATA) {
        for (i, file) in files.iter().enumerate() {
            let Some(metadata) = file.metadata.as_deref().filter(|m| !m.is_empty()) else {
                continue;
            };

            let pointer_pos = FPS4_HEADER_LEN + i * entry_size + metadata_offset;
            let text_start = u32_checked(buf.position() as u64)?;
            buf.write_at(pointer_pos, &order.u32_bytes(text_start));

            for (key, value) in metadata {
                let field = match key {
                    Some(key) => format!("{key}={value}"),
                    None => value.clone(),
                };
                buf.write(&encode_string(&field, SHIFT_JIS)?);
                buf.write(&[0x20]);
            }
            // The final trailing space becomes the terminating NUL.
            buf.seek(-1, Whence::Current);
            buf.write(&[0]);
        }
    }

    // Archive comment.
    let mut archive_name_address = 0u32;
    if let Some(comment) = &manifest.comment {
        archive_name_address = u32_checked(buf.position() as u64)?;
        buf.write(&encode_string(comment, SHIFT_JIS)?);
        buf.write(&[0]);
    }

    // Payload planning: a running pointer from the aligned file start,
    // advanced by each entry's aligned size regardless of skippability.
    let pre_payload = buf.position() as u64;
    let file_start = align_up(pre_payload, first_file_alignment, 0);

    let mut start_addresses = Vec::with_capacity(files.len());
    let mut pointer = file_start;
    for file in &files {
        start_addresses.push(pointer);
        pointer += align_up(file.file_size.unwrap_or(0) as u64, alignment, 0);
    }
    let end_of_payload = pointer;

    // Patch start pointers and sector sizes.
    for (i, file) in files.iter().enumerate() {
        let mut pos = FPS4_HEADER_LEN + i * entry_size;
        let on_disk = file
            .path
            .as_deref()
            .is_some_and(|p| Path::new(p).is_file());

        if flags.contains(ContentFlags::START_POINTERS) {
            let value = if on_disk {
                u32_checked(start_addresses[i] / multiplier)?
            } else {
                SENTINEL_ADDRESS
            };
            buf.write_at(pos, &order.u32_bytes(value));
            pos += 4;
        }
        if flags.contains(ContentFlags::SECTOR_SIZES) {
            let value = if on_disk {
                let file_size = file.file_size.unwrap_or(0);
                if manifest.set_sector_size_as_file_size {
                    file_size
                } else {
                    u32_checked(align_up(file_size as u64, alignment, 0))?
                }
            } else {
                0
            };
            buf.write_at(pos, &order.u32_bytes(value));
        }
    }

    // Terminator entry. The corpus convention is that the terminator rides
    // the manifest as its final, skippable entry, so counting the
    // non-skippable entries lands the pointer back on the terminator's own
    // slot.
    let valid_files = files.iter().filter(|f| !f.skippable).count();
    let terminator_pos = FPS4_HEADER_LEN + valid_files * entry_size;
    let terminator = if manifest.file_terminator_address < 0 {
        u32_checked(end_of_payload / multiplier)?
    } else {
        u32::try_from(manifest.file_terminator_address)
            .map_err(|_| Fps4Error::TooLarge)?
    };
    buf.write_at(terminator_pos, &order.u32_bytes(terminator));

    // Pad out to the first payload.
    buf.write_zeros((file_start - pre_payload) as usize);

    // Payloads, each padded to the archive alignment.
    for file in &files {
        if file.skippable {
            continue;
        }
        let Some(path) = file.path.as_deref() else {
            warn!(index = file.index, "entry has no path; leaving a gap");
            continue;
        };
        if !Path::new(path).is_file() {
            warn!(index = file.index, path, "payload file is missing; leaving a gap");
            continue;
        }

        let payload = fs::read(path).with_context(|| format!("failed to read {path}"))?;
        buf.write(&payload);

        if alignment > 1 {
            let len = buf.len() as u64;
            buf.write_zeros((align_up(len, alignment, 0) - len) as usize);
        }
    }

    // The header goes in last.
    let header = Fps4Header {
        file_entries: files.len() as u32,
        header_size: FPS4_HEADER_LEN as u32,
        file_start: u32_checked(file_start)?,
        entry_size: flags.entry_size(),
        content_bitmask: manifest.content_bitmask,
        unknown0: manifest.unknown0,
        archive_name_address,
    };
    buf.write_at(0, &header.to_bytes(order));

    debug!(
        entries = files.len(),
        file_start,
        end_of_payload,
        total = buf.len(),
        "built FPS4 archive"
    );
    Ok(buf.into_vec())
}

/// Refreshes each entry's `file_size` from the file at its `path`.
fn refresh_file_sizes(files: &mut [ManifestEntry]) -> Result<()> {
    for file in files {
        let Some(path) = file.path.as_deref() else {
            continue;
        };
        let Ok(meta) = fs::metadata(path) else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        let Ok(size) = u32::try_from(meta.len()) else {
            bail!(Fps4Error::TooLarge);
        };
        file.file_size = Some(size);
    }
    Ok(())
}

/// Writes a Shift-JIS string into a fixed-width field, truncating to the
/// width and padding the remainder with NULs.
fn write_padded(buf: &mut GrowBuf, text: &str, width: usize) -> Result<()> {
    let mut bytes = encode_string(text, SHIFT_JIS)?;
    bytes.truncate(width);
    buf.write(&bytes);
    buf.write_zeros(width - bytes.len());
    Ok(())
}

/// The extension/type fallback: the last dot-segment of the entry's
/// filename, or the whole filename when it has no dot.
fn derived_suffix(file: &ManifestEntry) -> &str {
    let filename = file.filename.as_deref().unwrap_or("");
    match filename.rsplit_once('.') {
        Some((_, suffix)) => suffix,
        None => filename,
    }
}

fn u32_checked(value: u64) -> Result<u32> {
    u32::try_from(value).map_err(|_| Fps4Error::TooLarge.into())
}
