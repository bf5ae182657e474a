//! Reads and writes TLZC compression frames.
//!
//! TLZC is a small framing header wrapped around one of three codec
//! payloads. Type 2 frames hold a zlib stream (or, in a rarer variant, a raw
//! deflate stream) starting at offset 0x18. Type 4 frames hold LZMA1 data
//! sliced into 64 KiB streams: a 5-byte filter-properties block at offset
//! 0x14, a table of per-stream compressed sizes, and then the raw LZMA1
//! streams themselves. A size-table entry of zero marks a stream that is
//! stored uncompressed.
//!
//! Frames are decoded and encoded as whole in-memory buffers; see
//! [`decompress`] and [`compress`].

#![forbid(unsafe_code)]
#![forbid(unused_must_use)]
#![warn(missing_docs)]

use anyhow::{bail, Context, Result};
use std::io::{Read, Write};
use std::mem::size_of;
use tracing::{debug, trace_span};
use zerocopy::byteorder::{LE, U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

mod lzma;

#[cfg(test)]
mod tests;

/// The signature at the start of every TLZC frame.
pub const TLZC_MAGIC: [u8; 4] = *b"TLZC";

/// Type code of frames whose payload is a zlib (or raw deflate) stream.
pub const TYPE_DEFLATE: u16 = 0x0201;

/// Type code of frames whose payload is chunked LZMA1.
pub const TYPE_LZMA: u16 = 0x0401;

/// Byte offset of the payload in a type-2 frame.
pub(crate) const DEFLATE_PAYLOAD_OFFSET: usize = 0x18;

/// Describes the header at the start of a TLZC frame.
///
/// All fields are little-endian regardless of the platform the archive was
/// built for. In type-4 frames the final reserved word is overlaid by the
/// first four bytes of the LZMA filter-properties block.
#[derive(AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct TlzcHeader {
    /// Identifies this as a TLZC frame. The value must always be
    /// [`TLZC_MAGIC`].
    pub magic: [u8; 4],

    /// The compression type code; see [`TYPE_DEFLATE`] and [`TYPE_LZMA`].
    pub compression_type: U16<LE>,

    /// Reserved; zero in every observed frame.
    pub unknown: U16<LE>,

    /// The total size in bytes of the compressed frame, including this
    /// header.
    pub file_size_compressed: U32<LE>,

    /// The size in bytes of the payload after decompression.
    pub file_size_uncompressed: U32<LE>,

    /// Reserved space; must be zero on write.
    pub reserved: [U32<LE>; 2],
}

/// The length of the TLZC frame header.
pub(crate) const TLZC_HEADER_LEN: usize = size_of::<TlzcHeader>();
static_assertions::const_assert_eq!(TLZC_HEADER_LEN, 0x18);

/// Selects the codec used inside a TLZC frame.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Mode {
    /// Type 2 with a zlib-wrapped payload. This is the common case.
    Zlib,
    /// Type 2 with a raw deflate payload (no zlib wrapper).
    Deflate,
    /// Type 4 with a chunked LZMA1 payload.
    Lzma,
    /// Resolve the codec from the frame's type code. Decompression only.
    Auto,
}

/// Checks whether `header` begins with the TLZC signature.
pub fn is_header_tlzc(header: &[u8]) -> bool {
    header.starts_with(&TLZC_MAGIC)
}

/// The categorised failure modes of the TLZC codec.
///
/// IO and underlying-codec failures surface separately through
/// [`anyhow::Error`]; this enum covers the frame-level conditions.
#[derive(Copy, Clone, Debug)]
pub enum TlzcError {
    /// The input does not begin with the TLZC signature.
    BadMagic,
    /// The header's compressed-size field does not match the input length.
    LengthMismatch {
        /// The value stored in the header.
        stored: u32,
        /// The actual input length.
        actual: usize,
    },
    /// The frame's type code selects a codec this library does not support.
    UnsupportedType(u16),
    /// The frame ends before its declared contents do.
    Truncated,
    /// The input is too large for the 32-bit size fields.
    TooLarge,
}

impl std::error::Error for TlzcError {}

impl std::fmt::Display for TlzcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadMagic => f.write_str("The input does not have a TLZC signature."),
            Self::LengthMismatch { stored, actual } => write!(
                f,
                "The TLZC header declares a compressed size of {stored} bytes, \
                 but the input is {actual} bytes."
            ),
            Self::UnsupportedType(code) => {
                write!(f, "Unsupported TLZC compression type: 0x{code:04x}.")
            }
            Self::Truncated => f.write_str("The TLZC frame is truncated."),
            Self::TooLarge => {
                f.write_str("Compression of files over 4 GiB is not supported.")
            }
        }
    }
}

/// Parses and validates the header of a TLZC frame.
pub(crate) fn parse_header(src: &[u8]) -> Result<TlzcHeader> {
    let Some(header) = TlzcHeader::read_from_prefix(src) else {
        bail!(TlzcError::Truncated);
    };

    if header.magic != TLZC_MAGIC {
        bail!(TlzcError::BadMagic);
    }

    // Zlib and LZMA frames record the whole frame length. Deflate frames
    // record the payload length alone, so both forms are accepted.
    let stored = header.file_size_compressed.get();
    let whole = stored as usize == src.len();
    let content_only = (stored as usize).checked_add(DEFLATE_PAYLOAD_OFFSET) == Some(src.len());
    if !whole && !content_only {
        bail!(TlzcError::LengthMismatch {
            stored,
            actual: src.len(),
        });
    }

    Ok(header)
}

/// Decompresses a TLZC frame.
///
/// With [`Mode::Auto`] the codec is resolved from the frame's type code:
/// type 2 resolves to zlib (its default subtype) and type 4 to LZMA1. A raw
/// deflate payload is indistinguishable from zlib at the header level and
/// must be requested explicitly with [`Mode::Deflate`].
pub fn decompress(src: &[u8], mode: Mode) -> Result<Vec<u8>> {
    let _span = trace_span!("tlzc::decompress").entered();

    let header = parse_header(src)?;

    let mode = match mode {
        Mode::Auto => match (header.compression_type.get() >> 8) & 0xff {
            2 => Mode::Zlib,
            4 => Mode::Lzma,
            _ => bail!(TlzcError::UnsupportedType(header.compression_type.get())),
        },
        m => m,
    };

    let out = match mode {
        Mode::Zlib => {
            let payload = frame_payload(src)?;
            let mut data = Vec::with_capacity(header.file_size_uncompressed.get() as usize);
            flate2::read::ZlibDecoder::new(payload)
                .read_to_end(&mut data)
                .context("zlib decompression failed")?;
            data
        }

        Mode::Deflate => {
            let payload = frame_payload(src)?;
            let mut data = Vec::with_capacity(header.file_size_uncompressed.get() as usize);
            flate2::read::DeflateDecoder::new(payload)
                .read_to_end(&mut data)
                .context("deflate decompression failed")?;
            data
        }

        Mode::Lzma => lzma::decompress_frame(src, &header)?,

        Mode::Auto => unreachable!(),
    };

    debug!(
        compressed = src.len(),
        uncompressed = out.len(),
        "decompressed TLZC frame"
    );
    Ok(out)
}

/// Compresses `src` into a TLZC frame.
///
/// `nice_len` tunes the LZMA1 match heuristic and is ignored by the type-2
/// codecs; 64 matches the frames found in shipped archives.
pub fn compress(src: &[u8], mode: Mode, nice_len: u32) -> Result<Vec<u8>> {
    let _span = trace_span!("tlzc::compress").entered();

    let Ok(uncompressed_size) = u32::try_from(src.len()) else {
        bail!(TlzcError::TooLarge);
    };

    let out = match mode {
        Mode::Zlib => {
            let mut enc =
                flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::best());
            enc.write_all(src)?;
            let content = enc.finish().context("zlib compression failed")?;

            let mut header = TlzcHeader::new_zeroed();
            header.magic = TLZC_MAGIC;
            header.compression_type = U16::new(TYPE_DEFLATE);
            header.file_size_compressed =
                U32::new((TLZC_HEADER_LEN + content.len()) as u32);
            header.file_size_uncompressed = U32::new(uncompressed_size);

            let mut frame = Vec::with_capacity(TLZC_HEADER_LEN + content.len());
            frame.extend_from_slice(header.as_bytes());
            frame.extend_from_slice(&content);
            frame
        }

        Mode::Deflate => {
            let mut enc =
                flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
            enc.write_all(src)?;
            let content = enc.finish().context("deflate compression failed")?;

            // Deflate frames record the payload length alone, not the whole
            // frame length.
            let mut header = TlzcHeader::new_zeroed();
            header.magic = TLZC_MAGIC;
            header.compression_type = U16::new(TYPE_DEFLATE);
            header.file_size_compressed = U32::new(content.len() as u32);
            header.file_size_uncompressed = U32::new(uncompressed_size);

            let mut frame = Vec::with_capacity(TLZC_HEADER_LEN + content.len());
            frame.extend_from_slice(header.as_bytes());
            frame.extend_from_slice(&content);
            frame
        }

        Mode::Lzma => lzma::compress_frame(src, nice_len)?,

        Mode::Auto => bail!("Mode::Auto is only meaningful for decompression."),
    };

    debug!(
        uncompressed = src.len(),
        compressed = out.len(),
        "compressed TLZC frame"
    );
    Ok(out)
}

/// The payload slice of a type-2 frame.
fn frame_payload(src: &[u8]) -> Result<&[u8]> {
    match src.get(DEFLATE_PAYLOAD_OFFSET..) {
        Some(payload) => Ok(payload),
        None => bail!(TlzcError::Truncated),
    }
}
