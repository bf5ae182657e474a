use super::*;

#[static_init::dynamic]
static INIT_LOGGER: () = {
    tracing_subscriber::fmt::fmt()
        .compact()
        .with_max_level(tracing_subscriber::filter::LevelFilter::TRACE)
        .with_level(false)
        .with_test_writer()
        .without_time()
        .with_ansi(false)
        .init();
};

/// Text-like data that every codec shrinks.
fn compressible(len: usize) -> Vec<u8> {
    let phrase = b"the quick brown fox jumps over the lazy dog #";
    let mut v = Vec::with_capacity(len + phrase.len());
    let mut i = 0usize;
    while v.len() < len {
        v.extend_from_slice(phrase);
        v.extend_from_slice(format!("{i:06}\n").as_bytes());
        i += 1;
    }
    v.truncate(len);
    v
}

/// Deterministic noise that no codec shrinks.
fn noise(len: usize, mut state: u64) -> Vec<u8> {
    let mut v = Vec::with_capacity(len + 8);
    while v.len() < len {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        v.extend_from_slice(&state.to_le_bytes());
    }
    v.truncate(len);
    v
}

/// The size-table entries of an LZMA frame.
fn lzma_size_table(frame: &[u8]) -> Vec<u16> {
    let uncompressed =
        u32::from_le_bytes(frame[0xc..0x10].try_into().unwrap()) as usize;
    let stream_count = (uncompressed + 0xffff) >> 16;
    frame[0x19..0x19 + 2 * stream_count]
        .chunks_exact(2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .collect()
}

#[test]
fn zlib_round_trip() {
    let data = compressible(50_000);
    let frame = compress(&data, Mode::Zlib, 64).unwrap();

    assert!(is_header_tlzc(&frame));
    let header = TlzcHeader::read_from_prefix(frame.as_slice()).unwrap();
    assert_eq!(header.compression_type.get(), TYPE_DEFLATE);
    assert_eq!(header.file_size_compressed.get() as usize, frame.len());
    assert_eq!(header.file_size_uncompressed.get() as usize, data.len());
    assert!(frame.len() < data.len());

    assert_eq!(decompress(&frame, Mode::Auto).unwrap(), data);
    assert_eq!(decompress(&frame, Mode::Zlib).unwrap(), data);
}

#[test]
fn deflate_round_trip() {
    let data = compressible(30_000);
    let frame = compress(&data, Mode::Deflate, 64).unwrap();

    // Deflate frames store the payload length alone in the compressed-size
    // field.
    let header = TlzcHeader::read_from_prefix(frame.as_slice()).unwrap();
    assert_eq!(
        header.file_size_compressed.get() as usize,
        frame.len() - TLZC_HEADER_LEN
    );

    assert_eq!(decompress(&frame, Mode::Deflate).unwrap(), data);
}

#[test]
fn lzma_round_trip_chunk_boundaries() {
    for len in [0usize, 1, 0xffff, 0x10000, 0x10001, 0x28000 + 123] {
        let data = compressible(len);
        let frame = compress(&data, Mode::Lzma, 64).unwrap();

        let header = TlzcHeader::read_from_prefix(frame.as_slice()).unwrap();
        assert_eq!(header.compression_type.get(), TYPE_LZMA);
        assert_eq!(header.file_size_compressed.get() as usize, frame.len());
        assert_eq!(header.file_size_uncompressed.get() as usize, len);
        assert_eq!(lzma_size_table(&frame).len(), (len + 0xffff) >> 16);

        assert_eq!(decompress(&frame, Mode::Auto).unwrap(), data, "len {len}");
        assert_eq!(decompress(&frame, Mode::Lzma).unwrap(), data, "len {len}");
    }
}

#[test]
fn lzma_stores_incompressible_chunks_raw() {
    let data = noise(0x10000, 0x5eed);
    let frame = compress(&data, Mode::Lzma, 64).unwrap();

    // The chunk cannot shrink, so it is stored raw behind a zero table
    // entry.
    assert_eq!(lzma_size_table(&frame), vec![0]);
    assert_eq!(&frame[0x19 + 2..], data.as_slice());

    assert_eq!(decompress(&frame, Mode::Auto).unwrap(), data);
}

#[test]
fn lzma_mixes_raw_and_compressed_chunks() {
    let mut data = noise(0x10000, 42);
    data.extend_from_slice(&compressible(0x10000));
    data.extend_from_slice(&noise(0x1234, 7));

    let frame = compress(&data, Mode::Lzma, 64).unwrap();
    let table = lzma_size_table(&frame);
    assert_eq!(table.len(), 3);
    assert_eq!(table[0], 0);
    assert_ne!(table[1], 0);

    assert_eq!(decompress(&frame, Mode::Auto).unwrap(), data);
}

#[test]
fn rejects_bad_magic() {
    let mut frame = compress(b"payload", Mode::Zlib, 64).unwrap();
    frame[0] = b'X';
    let err = decompress(&frame, Mode::Auto).unwrap_err();
    assert!(err.to_string().contains("TLZC signature"), "{err}");
}

#[test]
fn rejects_length_mismatch() {
    let mut frame = compress(b"payload", Mode::Zlib, 64).unwrap();
    frame.push(0);
    let err = decompress(&frame, Mode::Auto).unwrap_err();
    assert!(err.to_string().contains("compressed size"), "{err}");
}

#[test]
fn rejects_unknown_type_code() {
    let mut frame = compress(b"payload", Mode::Zlib, 64).unwrap();
    frame[5] = 0x03; // type 0x0301
    let err = decompress(&frame, Mode::Auto).unwrap_err();
    assert!(err.to_string().contains("Unsupported"), "{err}");
}

#[test]
fn rejects_truncated_frame() {
    assert!(decompress(b"TLZC", Mode::Auto).is_err());
    assert!(decompress(&[], Mode::Auto).is_err());
}

#[test]
fn auto_mode_cannot_compress() {
    assert!(compress(b"data", Mode::Auto, 64).is_err());
}

#[test]
fn corrupt_zlib_payload_is_a_codec_error() {
    let mut frame = compress(&compressible(4096), Mode::Zlib, 64).unwrap();
    let last = frame.len() - 1;
    frame[TLZC_HEADER_LEN..=last].fill(0xAA);
    let err = decompress(&frame, Mode::Auto).unwrap_err();
    assert!(err.to_string().contains("zlib"), "{err}");
}
