//! The chunked LZMA1 payload of type-4 TLZC frames.
//!
//! A type-4 frame slices the uncompressed data into 64 KiB chunks and
//! encodes each chunk as an independent raw LZMA1 stream. The frame stores
//! the shared filter properties once (a packed properties byte plus a
//! little-endian dictionary size, at offset 0x14) followed by one
//! little-endian u16 per chunk giving its compressed size. A stored size of
//! zero means the chunk did not shrink and its 64 KiB are stored raw.

use anyhow::{bail, Context, Result};
use std::io::{Read, Write};
use tracing::{debug, trace_span};
use xz2::stream::{Filters, LzmaOptions, MatchFinder, Stream};

use crate::{TlzcError, TlzcHeader, TLZC_MAGIC, TYPE_LZMA};
use zerocopy::byteorder::{LE, U16, U32};
use zerocopy::{AsBytes, FromZeroes};

/// Byte offset of the 5-byte filter-properties block. Type-4 frames reuse
/// the final header word for the first four of those bytes.
const PROPS_OFFSET: usize = 0x14;

/// Uncompressed size of each LZMA1 stream except the last.
const STREAM_SIZE: usize = 0x10000;

/// The dictionary size every observed frame was encoded with.
const DEFAULT_DICT_SIZE: u32 = 0x10000;

/// LZMA1 filter properties in the frame's packed form.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
struct FilterProps {
    lc: u32,
    lp: u32,
    pb: u32,
    dict_size: u32,
}

impl FilterProps {
    /// The fixed properties used when encoding: lc=3, lp=0, pb=2 over a
    /// 64 KiB dictionary.
    const ENCODER_DEFAULT: Self = Self {
        lc: 3,
        lp: 0,
        pb: 2,
        dict_size: DEFAULT_DICT_SIZE,
    };

    fn unpack(mask: u8, dict_size: u32) -> Self {
        let mask = mask as u32;
        Self {
            lc: mask % 9,
            lp: (mask / 9) % 5,
            pb: (mask / 9) / 5,
            dict_size,
        }
    }

    fn pack(&self) -> u8 {
        ((self.pb * 5 + self.lp) * 9 + self.lc) as u8
    }

    /// Builds the single-entry raw filter chain for these properties.
    fn filters(&self, nice_len: u32) -> Result<Filters> {
        let mut options = LzmaOptions::new_preset(6).context("LZMA preset unavailable")?;
        options
            .dict_size(self.dict_size)
            .literal_context_bits(self.lc)
            .literal_position_bits(self.lp)
            .position_bits(self.pb)
            .mode(xz2::stream::Mode::Normal)
            .match_finder(MatchFinder::BinaryTree4)
            .nice_len(nice_len);

        let mut filters = Filters::new();
        filters.lzma1(&options);
        Ok(filters)
    }
}

/// Decompresses the payload of a type-4 frame.
pub(crate) fn decompress_frame(src: &[u8], header: &TlzcHeader) -> Result<Vec<u8>> {
    let _span = trace_span!("tlzc::lzma::decompress_frame").entered();

    let Some(props_bytes) = src.get(PROPS_OFFSET..PROPS_OFFSET + 5) else {
        bail!(TlzcError::Truncated);
    };
    let mask = props_bytes[0];
    let dict_size = u32::from_le_bytes(props_bytes[1..5].try_into().unwrap());
    let props = FilterProps::unpack(mask, dict_size);

    let uncompressed_size = header.file_size_uncompressed.get() as usize;
    let stream_count = (uncompressed_size + 0xffff) >> 16;

    let sizes_end = PROPS_OFFSET + 5 + 2 * stream_count;
    let Some(size_table) = src.get(PROPS_OFFSET + 5..sizes_end) else {
        bail!(TlzcError::Truncated);
    };
    let stream_sizes: Vec<usize> = size_table
        .chunks_exact(2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]) as usize)
        .collect();

    debug!(stream_count, ?props, "decoding LZMA streams");

    let mut out: Vec<u8> = Vec::with_capacity(uncompressed_size);
    let mut pos = sizes_end;
    for compressed_size in stream_sizes {
        let stream_len = (uncompressed_size - out.len()).min(STREAM_SIZE);

        if compressed_size != 0 {
            let Some(compressed) = src.get(pos..pos + compressed_size) else {
                bail!(TlzcError::Truncated);
            };
            pos += compressed_size;

            // Each stream is decoded by a fresh raw decoder; the streams
            // share filter properties but not encoder state.
            let stream = Stream::new_raw_decoder(&props.filters(64)?)
                .context("failed to create the raw LZMA1 decoder")?;
            let mut decoder = xz2::read::XzDecoder::new_stream(compressed, stream);

            let start = out.len();
            out.resize(start + stream_len, 0);
            decoder
                .read_exact(&mut out[start..])
                .with_context(|| format!("LZMA decompression failed at offset {pos:#x}"))?;
        } else {
            // A zero table entry marks a stored (uncompressed) chunk.
            let Some(raw) = src.get(pos..pos + stream_len) else {
                bail!(TlzcError::Truncated);
            };
            out.extend_from_slice(raw);
            pos += stream_len;
        }
    }

    if out.len() != uncompressed_size {
        bail!(
            "LZMA frame produced {} bytes where the header declares {}.",
            out.len(),
            uncompressed_size
        );
    }

    Ok(out)
}

/// Compresses `src` into a complete type-4 frame.
pub(crate) fn compress_frame(src: &[u8], nice_len: u32) -> Result<Vec<u8>> {
    let _span = trace_span!("tlzc::lzma::compress_frame").entered();

    let props = FilterProps::ENCODER_DEFAULT;

    let mut stream_sizes: Vec<U16<LE>> = Vec::new();
    let mut content: Vec<u8> = Vec::new();
    for chunk in src.chunks(STREAM_SIZE) {
        let compressed = compress_stream(chunk, &props, nice_len)?;

        if compressed.len() >= STREAM_SIZE {
            // Not shrinkable; store the chunk raw and record a zero size so
            // the decoder reads it back verbatim.
            stream_sizes.push(U16::new(0));
            content.extend_from_slice(chunk);
        } else {
            stream_sizes.push(U16::new(compressed.len() as u16));
            content.extend_from_slice(&compressed);
        }
    }

    let size_table_len = 2 * stream_sizes.len();
    let frame_len = PROPS_OFFSET + 5 + size_table_len + content.len();

    let mut header = TlzcHeader::new_zeroed();
    header.magic = TLZC_MAGIC;
    header.compression_type = U16::new(TYPE_LZMA);
    header.file_size_compressed = U32::new(frame_len as u32);
    header.file_size_uncompressed = U32::new(src.len() as u32);

    let mut frame = Vec::with_capacity(frame_len);
    frame.extend_from_slice(&header.as_bytes()[..PROPS_OFFSET]);
    frame.push(props.pack());
    frame.extend_from_slice(&props.dict_size.to_le_bytes());
    frame.extend_from_slice(stream_sizes.as_bytes());
    frame.extend_from_slice(&content);

    debug!(
        streams = stream_sizes.len(),
        frame_len,
        "encoded LZMA frame"
    );
    Ok(frame)
}

/// Encodes one chunk as an independent raw LZMA1 stream.
fn compress_stream(chunk: &[u8], props: &FilterProps, nice_len: u32) -> Result<Vec<u8>> {
    let stream = Stream::new_raw_encoder(&props.filters(nice_len)?)
        .context("failed to create the raw LZMA1 encoder")?;
    let mut encoder = xz2::write::XzEncoder::new_stream(Vec::new(), stream);
    encoder.write_all(chunk)?;
    encoder.finish().context("LZMA compression failed")
}
