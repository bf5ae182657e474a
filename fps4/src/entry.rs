//! The per-file directory record of an FPS4 archive.

use anyhow::{bail, Result};
use encoding_rs::SHIFT_JIS;
use vesperia_growbuf::read_cstring;

use crate::content::{EXTENSION_WIDTH, FILENAME_WIDTH, FILE_TYPE_WIDTH};
use crate::parser::Parser;
use crate::{ByteOrder, ContentFlags, Fps4Error};

/// The start-pointer value that marks a directory slot with no payload.
pub const SENTINEL_ADDRESS: u32 = 0xffff_ffff;

/// One field of an entry's metadata blob: a `KEY=VALUE` pair, or a bare
/// value stored with `None` as its key. The first bare value is
/// conventionally a filesystem path.
pub type MetadataField = (Option<String>, String);

/// One directory entry, with whichever fields its archive's content bitmask
/// enables.
///
/// `address` is a scaled pointer: the payload's byte offset is
/// `address * file_location_multiplier`. An entry is *skippable* iff its
/// address is [`SENTINEL_ADDRESS`] or its `unknown_0x080` field is non-zero;
/// skippable entries are directory slots that carry no payload.
#[derive(Clone, Debug, Default)]
pub struct Entry {
    /// 0-based index of this entry in the directory.
    pub index: u32,
    /// Scaled payload start pointer.
    pub address: Option<u32>,
    /// Sector size; doubles as a size hint when the file size is absent.
    pub sector_size: Option<u32>,
    /// Payload size in bytes.
    pub file_size: Option<u32>,
    /// Filename, trailing NULs stripped.
    pub filename: Option<String>,
    /// File extension, trailing NULs stripped.
    pub file_extension: Option<String>,
    /// File type, trailing NULs stripped.
    pub file_type: Option<String>,
    /// Decoded metadata fields, present when the entry's metadata pointer is
    /// non-zero.
    pub metadata: Option<Vec<MetadataField>>,
    /// Unknown; a non-zero value marks the entry skippable.
    pub unknown_0x080: Option<u32>,
    /// Unknown.
    pub unknown_0x100: Option<u32>,
    /// Whether this slot carries no payload.
    pub skippable: bool,
}

impl Entry {
    /// Decodes the entry at `offset` in `archive`.
    ///
    /// Exactly `flags.entry_size()` bytes are consumed, reading each enabled
    /// field in canonical order under the archive's byte order. The whole
    /// archive buffer is needed because the metadata field is a pointer into
    /// the archive's text region.
    pub(crate) fn parse(
        archive: &[u8],
        offset: usize,
        index: u32,
        flags: ContentFlags,
        order: ByteOrder,
    ) -> Result<Self> {
        let entry_size = flags.entry_size() as usize;
        let Some(block) = archive.get(offset..offset + entry_size) else {
            bail!(Fps4Error::Truncated);
        };
        let mut p = Parser::new(block);

        let mut entry = Entry {
            index,
            ..Entry::default()
        };

        if flags.contains(ContentFlags::START_POINTERS) {
            entry.address = Some(p.u32(order)?);
        }
        if flags.contains(ContentFlags::SECTOR_SIZES) {
            entry.sector_size = Some(p.u32(order)?);
        }
        if flags.contains(ContentFlags::FILE_SIZES) {
            entry.file_size = Some(p.u32(order)?);
        }
        if flags.contains(ContentFlags::FILENAMES) {
            entry.filename = Some(decode_padded(p.bytes(FILENAME_WIDTH)?));
        }
        if flags.contains(ContentFlags::FILE_EXTENSIONS) {
            entry.file_extension = Some(decode_padded(p.bytes(EXTENSION_WIDTH)?));
        }
        if flags.contains(ContentFlags::FILE_TYPES) {
            entry.file_type = Some(decode_padded(p.bytes(FILE_TYPE_WIDTH)?));
        }
        if flags.contains(ContentFlags::METADATA) {
            let pointer = p.u32(order)?;
            if pointer != 0 {
                let raw = read_cstring(archive, SHIFT_JIS, pointer as usize);
                entry.metadata = Some(parse_metadata(&raw));
            }
        }
        if flags.contains(ContentFlags::UNKNOWN_0X080) {
            entry.unknown_0x080 = Some(p.u32(order)?);
        }
        if flags.contains(ContentFlags::UNKNOWN_0X100) {
            entry.unknown_0x100 = Some(p.u32(order)?);
        }

        entry.skippable = entry.address == Some(SENTINEL_ADDRESS)
            || entry.unknown_0x080.is_some_and(|v| v > 0);

        Ok(entry)
    }

    /// Resolves this entry's payload size.
    ///
    /// The first available of: the stored file size, the stored sector
    /// size, or the distance to the next non-skippable entry's address. A
    /// stored zero counts as unavailable. Returns `None` when all three
    /// fail; packers and extractors must treat that as an error for
    /// non-skippable entries.
    pub fn estimate_file_size(&self, entries: &[Entry]) -> Option<u32> {
        if let Some(size) = self.file_size.filter(|&s| s != 0) {
            return Some(size);
        }
        if let Some(size) = self.sector_size.filter(|&s| s != 0) {
            return Some(size);
        }

        let address = self.address.filter(|&a| a != 0)?;
        for later in entries.iter().skip(self.index as usize + 1) {
            if !later.skippable {
                return later.address.and_then(|next| next.checked_sub(address));
            }
        }
        None
    }

    /// Resolves this entry's output path as `(directory, filename)`.
    ///
    /// The first bare metadata value is the path candidate (unless
    /// `ignore_metadata`). The basename is the filename field if present,
    /// else the metadata `name=` value, else a synthesised `{index:04}`
    /// (with the file type appended as an extension when present). The
    /// synthesised basename combines with the path candidate: a candidate
    /// containing `/` splits into directory and basename, otherwise the
    /// whole candidate becomes the basename; either way the synthesised
    /// name is appended as a suffix.
    pub fn estimate_file_path(&self, ignore_metadata: bool) -> (Option<String>, String) {
        let metadata: &[MetadataField] = match (&self.metadata, ignore_metadata) {
            (Some(fields), false) => fields,
            _ => &[],
        };

        let path = metadata
            .iter()
            .find(|(key, _)| key.is_none())
            .map(|(_, value)| value.clone());

        if let Some(filename) = self.filename.as_deref().filter(|n| !n.is_empty()) {
            return (path, filename.to_owned());
        }

        if let Some((_, name)) = metadata
            .iter()
            .find(|(key, value)| key.as_deref() == Some("name") && !value.is_empty())
        {
            return (path, name.clone());
        }

        let index = format!("{:04}", self.index);
        let synthesised = match self.file_type.as_deref().filter(|t| !t.is_empty()) {
            Some(file_type) => format!("{index}.{file_type}"),
            None => index,
        };

        match path {
            None => (None, synthesised),
            Some(p) => match p.rsplit_once('/') {
                None => (None, format!("{p}.{synthesised}")),
                Some((dir, base)) => (Some(dir.to_owned()), format!("{base}.{synthesised}")),
            },
        }
    }
}

/// Decodes a fixed-width Shift-JIS field, stripping the NUL padding.
fn decode_padded(bytes: &[u8]) -> String {
    let (text, _, _) = SHIFT_JIS.decode(bytes);
    text.trim_end_matches('\0').to_owned()
}

/// Splits a metadata blob into its fields: space-separated, each either
/// `KEY=VALUE` or a bare `VALUE`.
fn parse_metadata(raw: &str) -> Vec<MetadataField> {
    raw.split(' ')
        .filter(|field| !field.is_empty())
        .map(|field| match field.split_once('=') {
            Some((key, value)) => (Some(key.to_owned()), value.to_owned()),
            None => (None, field.to_owned()),
        })
        .collect()
}
