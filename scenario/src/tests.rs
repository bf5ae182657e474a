use super::*;
use tempfile::TempDir;

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

fn payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(17).wrapping_add(seed))
        .collect()
}

fn write_inputs(dir: &Path, files: &[(u32, &[u8])]) {
    for (index, data) in files {
        fs::write(dir.join(index.to_string()), data).unwrap();
    }
}

fn read_entry(image: &[u8], index: usize) -> ScenarioEntry {
    let offset = ENTRY_TABLE_OFFSET + 0x20 * index;
    ScenarioEntry::read_from_prefix(&image[offset..]).unwrap()
}

#[test]
fn pack_extract_round_trip() {
    let tmp = TempDir::new().unwrap();
    let src = tmp.path().join("src");
    fs::create_dir_all(&src).unwrap();

    let files: Vec<(u32, Vec<u8>)> = (0..5u32)
        .map(|i| (i, payload(0x40 + i as usize * 7, i as u8)))
        .collect();
    let refs: Vec<(u32, &[u8])> = files.iter().map(|(i, d)| (*i, d.as_slice())).collect();
    write_inputs(&src, &refs);

    let archive = tmp.path().join("scenario.dat");
    pack(&src, &archive).unwrap();

    let image = fs::read(&archive).unwrap();
    let header = ScenarioHeader::read_from_prefix(image.as_slice()).unwrap();
    assert_eq!(header.magic, SCENARIO_MAGIC);
    assert_eq!(header.file_count.get(), 5);
    assert_eq!(header.file_offset.get(), FILE_OFFSET);
    assert_eq!(header.file_size.get() as usize, image.len());
    // The duplicated size word follows the header.
    assert_eq!(
        &image[0x18..0x1c],
        header.file_size.get().to_be_bytes().as_slice()
    );
    // The payload region opens with the fixed dummy.
    assert_eq!(&image[0x800..0x805], b"DUMMY");

    let out = tmp.path().join("out");
    let written = extract(&archive, &out).unwrap();
    assert_eq!(written, 5);
    for (index, data) in &files {
        assert_eq!(&fs::read(out.join(index.to_string())).unwrap(), data);
    }
}

#[test]
fn payload_offsets_are_aligned() {
    let tmp = TempDir::new().unwrap();
    let src = tmp.path().join("src");
    fs::create_dir_all(&src).unwrap();
    // Deliberately misaligned sizes.
    let a = payload(0x41, 1);
    let b = payload(0x33, 2);
    let c = payload(0x57, 3);
    write_inputs(
        &src,
        &[(0, a.as_slice()), (1, b.as_slice()), (2, c.as_slice())],
    );

    let archive = tmp.path().join("scenario.dat");
    pack(&src, &archive).unwrap();
    let image = fs::read(&archive).unwrap();

    for index in 0..3 {
        let entry = read_entry(&image, index);
        assert_eq!(entry.offset.get() % 0x10, 0, "entry {index}");
        assert_ne!(entry.file_size_compressed.get(), 0);
    }
}

#[test]
fn large_duplicates_are_suppressed() {
    let tmp = TempDir::new().unwrap();
    let src = tmp.path().join("src");
    fs::create_dir_all(&src).unwrap();

    let repeated = payload(0x100, 9);
    write_inputs(
        &src,
        &[(0, repeated.as_slice()), (1, repeated.as_slice()), (2, &[0xAAu8; 0x40])],
    );

    let archive = tmp.path().join("scenario.dat");
    pack(&src, &archive).unwrap();
    let image = fs::read(&archive).unwrap();

    let first = read_entry(&image, 0);
    let second = read_entry(&image, 1);
    let third = read_entry(&image, 2);
    assert_eq!(second.offset.get(), first.offset.get());
    assert_eq!(second.file_size_compressed.get(), 0x100);
    assert!(third.offset.get() > first.offset.get());

    // Both indices extract to the shared bytes.
    let out = tmp.path().join("out");
    assert_eq!(extract(&archive, &out).unwrap(), 3);
    assert_eq!(fs::read(out.join("0")).unwrap(), repeated);
    assert_eq!(fs::read(out.join("1")).unwrap(), repeated);
}

#[test]
fn small_duplicates_are_kept() {
    let tmp = TempDir::new().unwrap();
    let src = tmp.path().join("src");
    fs::create_dir_all(&src).unwrap();

    // Identical, but at the 0x30-byte threshold: both copies are stored.
    let small = payload(0x30, 5);
    write_inputs(&src, &[(0, small.as_slice()), (1, small.as_slice())]);

    let archive = tmp.path().join("scenario.dat");
    pack(&src, &archive).unwrap();
    let image = fs::read(&archive).unwrap();

    let first = read_entry(&image, 0);
    let second = read_entry(&image, 1);
    assert_ne!(second.offset.get(), first.offset.get());
}

#[test]
fn gaps_produce_zero_entries_and_reset_dedup() {
    let tmp = TempDir::new().unwrap();
    let src = tmp.path().join("src");
    fs::create_dir_all(&src).unwrap();

    let repeated = payload(0x100, 4);
    // Index 1 is missing; 0 and 2 are identical but no longer consecutive.
    write_inputs(&src, &[(0, repeated.as_slice()), (2, repeated.as_slice())]);

    let archive = tmp.path().join("scenario.dat");
    pack(&src, &archive).unwrap();
    let image = fs::read(&archive).unwrap();

    let header = ScenarioHeader::read_from_prefix(image.as_slice()).unwrap();
    assert_eq!(header.file_count.get(), 3);

    let gap = read_entry(&image, 1);
    assert_eq!(gap.as_bytes(), &[0u8; 0x20]);

    // The gap cleared the duplicate tracking, so index 2 is stored again.
    let first = read_entry(&image, 0);
    let third = read_entry(&image, 2);
    assert_ne!(third.offset.get(), first.offset.get());

    let out = tmp.path().join("out");
    assert_eq!(extract(&archive, &out).unwrap(), 2);
    assert!(out.join("0").is_file());
    assert!(!out.join("1").exists());
    assert!(out.join("2").is_file());
}

#[test]
fn uncompressed_size_comes_from_payload_framing() {
    let tmp = TempDir::new().unwrap();
    let src = tmp.path().join("src");
    fs::create_dir_all(&src).unwrap();

    // A fake TLZC-framed payload with a recognisable size at offset 5.
    let mut framed = payload(0x40, 6);
    framed[5..9].copy_from_slice(&0x0001_2345u32.to_le_bytes());
    // And one too short to carry the hint at all.
    let stub = [0u8; 4];
    write_inputs(&src, &[(0, framed.as_slice()), (1, &stub)]);

    let archive = tmp.path().join("scenario.dat");
    pack(&src, &archive).unwrap();
    let image = fs::read(&archive).unwrap();

    assert_eq!(read_entry(&image, 0).file_size_uncompressed.get(), 0x0001_2345);
    assert_eq!(read_entry(&image, 1).file_size_uncompressed.get(), 0);
}

#[test]
fn rejects_oversized_entry_table() {
    let tmp = TempDir::new().unwrap();
    let src = tmp.path().join("src");
    fs::create_dir_all(&src).unwrap();
    // Index 63 pushes the entry table past the fixed payload offset.
    let data = payload(0x40, 1);
    write_inputs(&src, &[(63, data.as_slice())]);

    let err = pack(&src, &tmp.path().join("scenario.dat")).unwrap_err();
    assert!(err.to_string().contains("do not fit"), "{err}");
}

#[test]
fn rejects_empty_input_directory() {
    let tmp = TempDir::new().unwrap();
    let src = tmp.path().join("src");
    fs::create_dir_all(&src).unwrap();
    assert!(pack(&src, &tmp.path().join("scenario.dat")).is_err());
}

#[test]
fn rejects_truncated_archive() {
    let tmp = TempDir::new().unwrap();
    let archive = tmp.path().join("scenario.dat");
    fs::write(&archive, b"TO8SCEL\0short").unwrap();
    let err = extract(&archive, &tmp.path().join("out")).unwrap_err();
    assert!(err.to_string().contains("truncated"), "{err}");
}
