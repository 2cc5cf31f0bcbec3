use lzextract::block::BLOCK_SIZE;
use lzextract::codec::PlainCodec;
use lzextract::{
    extract_all, ArchiveSource, BufferSource, CodecRegistry, ContainerType, DigestSink,
    DirectorySink, EntryHeader, EntrySink, ExtractError, ExtractOptions, Extractor,
    FailurePolicy, FileSource, FormatError, LzopHeader, LzopOptions, LzopReader, LzopWriter,
    MemorySink, SinkError,
};
use proptest::prelude::*;
use std::io::{self, Cursor, Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

// ── helpers ──────────────────────────────────────────────────────────────────

/// `len` bytes made of one pseudo-random block of `stride` bytes repeated.
fn stride_bytes(len: usize, stride: usize, seed: u64) -> Vec<u8> {
    let mut state = seed | 1;
    let block: Vec<u8> = (0..stride.max(1))
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state >> 24) as u8
        })
        .collect();
    block.iter().copied().cycle().take(len).collect()
}

fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
    stride_bytes(len, len, seed)
}

fn tar_of(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, *data).unwrap();
    }
    builder.into_inner().unwrap()
}

fn lzop(data: &[u8]) -> Vec<u8> {
    let mut w = LzopWriter::new(Vec::new()).unwrap();
    w.write_all(data).unwrap();
    w.finish().unwrap()
}

fn lzop_source(path: &str, entries: &[(&str, &[u8])]) -> BufferSource {
    BufferSource::new(path, ContainerType::Lzop, lzop(&tar_of(entries)))
}

/// Compress `data` with a fresh lzop stream, put it in a tar as one member,
/// extract, and compare.  Mirrors the shape of a base-backup restore.
fn roundtrip_through_extract(data: &[u8]) {
    let source = lzop_source("part_1.tar.lzo", &[("member.bin", data)]);
    let sink = MemorySink::new();
    extract_all(&sink, &[source]).unwrap();

    let entries = sink.into_entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].header.name, "member.bin");
    assert_eq!(entries[0].header.size, data.len() as u64);
    assert!(entries[0].data == data, "body differs from original");
}

fn header_len() -> usize {
    let mut buf = Vec::new();
    LzopHeader::new(5, 0o100644, 0, b"").write(&mut buf).unwrap();
    buf.len()
}

/// Rejects entries with a given name, captures everything else.
struct PickySink {
    reject: &'static str,
    inner:  MemorySink,
}

impl EntrySink for PickySink {
    fn consume(&self, source: &str, header: &EntryHeader, body: &mut dyn Read) -> Result<(), SinkError> {
        if header.name == self.reject {
            return Err(SinkError::Rejected(format!("{} not wanted", header.name)));
        }
        self.inner.consume(source, header, body)
    }
}

/// Counts `open` calls and bytes pulled through the returned stream.
struct CountingSource {
    inner: BufferSource,
    opens: Arc<AtomicUsize>,
    reads: Arc<AtomicUsize>,
}

struct CountingReader {
    inner: Box<dyn Read + Send>,
    reads: Arc<AtomicUsize>,
}

impl Read for CountingReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.reads.fetch_add(n, Ordering::SeqCst);
        Ok(n)
    }
}

impl ArchiveSource for CountingSource {
    fn path(&self) -> &str { self.inner.path() }
    fn container_type(&self) -> ContainerType { self.inner.container_type() }
    fn open(&self) -> io::Result<Box<dyn Read + Send>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(CountingReader { inner: self.inner.open()?, reads: Arc::clone(&self.reads) }))
    }
}

fn counting(inner: BufferSource) -> CountingSource {
    CountingSource { inner, opens: Arc::default(), reads: Arc::default() }
}

// ── round trips ──────────────────────────────────────────────────────────────

#[test]
fn test_single_byte() {
    roundtrip_through_extract(&[0x41]);
}

#[test]
fn test_two_blocks_large_stride() {
    roundtrip_through_extract(&stride_bytes(2 * BLOCK_SIZE, 2 * BLOCK_SIZE, 7));
}

#[test]
fn test_one_mib_stride_7924() {
    roundtrip_through_extract(&stride_bytes(1024 * 1024, 7924, 11));
}

#[test]
fn test_ten_mib_stride_7924() {
    roundtrip_through_extract(&stride_bytes(10 * 1024 * 1024, 7924, 13));
}

#[test]
fn test_block_boundaries() {
    for len in [0, 1, BLOCK_SIZE - 1, BLOCK_SIZE, BLOCK_SIZE + 1] {
        let data = stride_bytes(len, 333, len as u64);
        let wire = lzop(&data);
        let mut out = Vec::new();
        LzopReader::new(Cursor::new(wire)).read_to_end(&mut out).unwrap();
        assert_eq!(out.len(), len);
        assert!(out == data, "length {len}");
    }
}

#[test]
fn test_empty_and_single_byte_layout() {
    let hlen = header_len();
    // header + terminator
    assert_eq!(lzop(&[]).len(), hlen + 4);
    // header + one stored block (8 + d_adler) + terminator
    assert_eq!(lzop(&[0x41]).len(), hlen + 12 + 1 + 4);
}

#[test]
fn test_incompressible_overhead() {
    let data = random_bytes(3 * BLOCK_SIZE + 17, 99);
    let wire = lzop(&data);
    let blocks = 4;
    assert!(wire.len() <= data.len() + 16 * blocks + header_len() + 4,
            "{} bytes for {} input bytes", wire.len(), data.len());

    let mut out = Vec::new();
    LzopReader::new(Cursor::new(wire)).read_to_end(&mut out).unwrap();
    assert!(out == data);
}

/// Written the way `lzop` 1.04 lays out a file on unix: one LZO1X-1 block
/// without a compressed checksum, one stored block, terminator.
const LZOP_TOOL_FILE: &[u8] = include_bytes!("data/hello.txt.lzo");

#[test]
fn test_decodes_lzop_tool_file() {
    let mut r = LzopReader::new(Cursor::new(LZOP_TOOL_FILE));
    let header = r.read_header().unwrap().clone();
    assert_eq!(header.version, 0x1040);
    assert_eq!(header.flags, 0x0300_0001);
    assert_eq!(header.mode, 0o100644);
    assert_eq!(header.mtime, 1_600_000_000);
    assert_eq!(header.name_lossy(), "hello.txt");

    let mut out = Vec::new();
    let mut chunk = [0u8; 5];
    loop {
        let n = r.read(&mut chunk).unwrap();
        if n == 0 {
            break;
        }
        out.extend_from_slice(&chunk[..n]);
    }
    let mut expected = vec![b'a'; 32];
    expected.extend_from_slice(b"hello world\n");
    assert_eq!(out, expected);
    assert_eq!(r.blocks_read, 2);
    assert!(r.is_finished());
    assert_eq!(r.read(&mut chunk).unwrap(), 0);
}

#[test]
fn test_encoded_layout_matches_lzop() {
    let options = LzopOptions {
        name: "hello.txt".into(),
        mode: 0o100644,
        mtime: 1_600_000_000,
        ..LzopOptions::default()
    };
    let mut w = LzopWriter::with_options(Vec::new(), options).unwrap();
    w.write_all(b"hello world\n").unwrap();
    let wire = w.finish().unwrap();

    #[rustfmt::skip]
    let expected: [u8; 75] = [
        // magic
        0x89, 0x4c, 0x5a, 0x4f, 0x00, 0x0d, 0x0a, 0x1a, 0x0a,
        // version 1.030, lib 0x2080, needs 0.940, LZO1X-1, level 5
        0x10, 0x30, 0x20, 0x80, 0x09, 0x40, 0x01, 0x05,
        // flags (adler32 d+c), mode, mtime low, mtime high
        0x00, 0x00, 0x00, 0x03, 0x00, 0x00, 0x81, 0xa4,
        0x5f, 0x5e, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00,
        // name, header adler32
        0x09, 0x68, 0x65, 0x6c, 0x6c, 0x6f, 0x2e, 0x74, 0x78, 0x74,
        0x5b, 0x9d, 0x06, 0xd0,
        // stored block: dst 12, src 12, d_adler32, data
        0x00, 0x00, 0x00, 0x0c, 0x00, 0x00, 0x00, 0x0c, 0x1e, 0x72, 0x04, 0x67,
        0x68, 0x65, 0x6c, 0x6c, 0x6f, 0x20, 0x77, 0x6f, 0x72, 0x6c, 0x64, 0x0a,
        // terminator
        0x00, 0x00, 0x00, 0x00,
    ];
    assert_eq!(wire, expected);

    // the stored block is byte-identical to the one in the lzop file
    let block = &wire[47..71];
    assert!(LZOP_TOOL_FILE.windows(block.len()).any(|w| w == block));
}

#[test]
fn test_every_container_type() {
    let payload = stride_bytes(300_000, 4096, 5);
    let tar = tar_of(&[("dir/a.bin", &payload[..]), ("b.txt", &b"hello"[..])]);
    let registry = CodecRegistry::default();

    let sources: Vec<BufferSource> = ContainerType::ALL
        .into_iter()
        .map(|t| {
            let mut packed = Vec::new();
            registry.lookup(t).unwrap().compress_stream(&mut Cursor::new(&tar), &mut packed).unwrap();
            BufferSource::new(format!("backup.{}", t.extension()), t, packed)
        })
        .collect();

    let sink = MemorySink::new();
    let report = Extractor::default().run(&sink, &sources);
    assert!(report.is_success(), "{:?}", report.failures);
    assert_eq!(report.entries(), 2 * ContainerType::ALL.len() as u64);
    for s in &sources {
        let mut expected = payload.clone();
        expected.extend_from_slice(b"hello");
        assert!(sink.concatenated(s.path()) == expected, "{}", s.path());
    }
}

// ── orchestration ────────────────────────────────────────────────────────────

#[test]
fn test_empty_source_list() {
    let sink = MemorySink::new();
    let none: [BufferSource; 0] = [];
    extract_all(&sink, &none).unwrap();
    assert!(sink.is_empty());

    let report = Extractor::default().run(&sink, &none);
    assert!(report.is_success());
    assert_eq!(report.entries(), 0);
}

#[test]
fn test_unregistered_type_fails_before_open() {
    let registry = CodecRegistry::empty().with(Arc::new(PlainCodec));
    let source = counting(lzop_source("base.tar.lzo", &[("a", &b"data"[..])]));
    let opens = Arc::clone(&source.opens);

    let sink = MemorySink::new();
    let report = Extractor::new(registry, ExtractOptions::default()).run(&sink, &[source]);

    assert_eq!(report.failures.len(), 1);
    assert!(matches!(report.failures[0].error, ExtractError::Configuration(_)));
    assert_eq!(report.failures[0].path, "base.tar.lzo");
    assert_eq!(opens.load(Ordering::SeqCst), 0);
    assert!(sink.is_empty());
}

#[test]
fn test_open_is_side_effect_free() {
    let source = counting(lzop_source("a.tar.lzo", &[("a", &b"data"[..])]));
    let stream = source.open().unwrap();
    assert_eq!(source.opens.load(Ordering::SeqCst), 1);
    assert_eq!(source.reads.load(Ordering::SeqCst), 0);
    drop(stream);

    extract_all(&MemorySink::new(), &[&source]).unwrap();
    assert_eq!(source.opens.load(Ordering::SeqCst), 2);
    assert!(source.reads.load(Ordering::SeqCst) > 0);
}

#[test]
fn test_corrupt_block_is_format_error() {
    let data = stride_bytes(100_000, 64, 3);
    let mut wire = lzop(&tar_of(&[("a", &data[..])]));
    // inside the first block's compressed payload
    let at = header_len() + 16 + 10;
    wire[at] ^= 0x5A;

    let sink = MemorySink::new();
    let report = Extractor::default().run(&sink, &[BufferSource::new("bad.lzo", ContainerType::Lzop, wire)]);
    assert_eq!(report.failures.len(), 1, "{:?}", report.failures);
    assert!(matches!(report.failures[0].error, ExtractError::Format(_)), "{}", report.failures[0].error);
}

#[test]
fn test_leading_garbage_is_format_error() {
    let mut wire = b"junk".to_vec();
    wire.extend(lzop(&tar_of(&[("a", &b"x"[..])])));
    let err = extract_all(&MemorySink::new(), &[BufferSource::new("g.lzo", ContainerType::Lzop, wire)])
        .unwrap_err();
    assert_eq!(err.failures.len(), 1);
    assert!(matches!(err.failures[0].error, ExtractError::Format(FormatError::InvalidMagic)));
}

#[test]
fn test_truncated_container_is_format_error() {
    let mut wire = lzop(&tar_of(&[("a", &stride_bytes(50_000, 50_000, 1)[..])]));
    wire.truncate(wire.len() / 2);
    let err = extract_all(&DigestSink::new(), &[BufferSource::new("t.lzo", ContainerType::Lzop, wire)])
        .unwrap_err();
    assert!(matches!(err.failures[0].error, ExtractError::Format(FormatError::Truncated)),
            "{}", err.failures[0].error);
}

#[test]
fn test_missing_file_is_resource_error() {
    let dir = tempfile::tempdir().unwrap();
    let source = FileSource::new(dir.path().join("absent.tar.lzo")).unwrap();
    let err = extract_all(&MemorySink::new(), &[source]).unwrap_err();
    assert!(matches!(err.failures[0].error, ExtractError::Resource { .. }));
}

fn mixed_sources() -> Vec<BufferSource> {
    vec![
        BufferSource::new("broken.lzo", ContainerType::Lzop, b"not an lzop file".to_vec()),
        lzop_source("good1.lzo", &[("one", &b"1"[..])]),
        lzop_source("good2.lzo", &[("two", &b"2"[..])]),
    ]
}

#[test]
fn test_best_effort_keeps_going() {
    let sink = MemorySink::new();
    let report = Extractor::default().run(&sink, &mixed_sources());

    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].path, "broken.lzo");
    assert!(report.skipped.is_empty());
    assert_eq!(sink.concatenated("good1.lzo"), b"1");
    assert_eq!(sink.concatenated("good2.lzo"), b"2");

    let err = report.into_result().unwrap_err();
    assert_eq!(err.failed_paths(), ["broken.lzo"]);
}

#[test]
fn test_abort_on_first_skips_the_rest() {
    let options = ExtractOptions { failure_policy: FailurePolicy::AbortOnFirst, ..ExtractOptions::default() };
    let sink = MemorySink::new();
    let report = Extractor::new(CodecRegistry::default(), options).run(&sink, &mixed_sources());

    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.skipped, ["good1.lzo", "good2.lzo"]);
    assert!(sink.is_empty());
}

#[test]
fn test_sink_error_does_not_stop_the_source() {
    let sink = PickySink { reject: "b", inner: MemorySink::new() };
    let source = lzop_source("s.lzo", &[("a", &b"AAA"[..]), ("b", &b"BBB"[..]), ("c", &b"CCC"[..])]);
    let report = Extractor::default().run(&sink, &[source]);

    assert_eq!(report.failures.len(), 1);
    match &report.failures[0].error {
        ExtractError::Sink { entry, source: SinkError::Rejected(_) } => assert_eq!(entry, "b"),
        other => panic!("unexpected failure {other}"),
    }
    assert_eq!(report.sources[0].entries, 3);
    assert_eq!(sink.inner.concatenated("s.lzo"), b"AAACCC");
}

#[test]
fn test_early_consumer_stop_does_not_hang() {
    // one good member, then a header the tar parser rejects, then a lot more
    let mut stream = tar_of(&[("a", &b"ok"[..])]);
    stream.truncate(1024);
    stream.extend_from_slice(&[0xFF; 512]);
    stream.extend(std::iter::repeat(0u8).take(8 * 1024 * 1024));
    let source = BufferSource::new("stuck.lzo", ContainerType::Lzop, lzop(&stream));

    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let options = ExtractOptions { pipe_slots: 1, pipe_chunk_size: 1024, ..ExtractOptions::default() };
        let sink = MemorySink::new();
        let report = Extractor::new(CodecRegistry::default(), options).run(&sink, &[source]);
        let _ = tx.send((report, sink.len()));
    });

    let (report, delivered) = rx.recv_timeout(Duration::from_secs(60)).expect("extraction hung");
    assert_eq!(delivered, 1);
    assert_eq!(report.failures.len(), 1);
    match &report.failures[0].error {
        ExtractError::Parse { offset, .. } => assert_eq!(*offset, 1024),
        other => panic!("unexpected failure {other}"),
    }
}

#[test]
fn test_directory_sink_from_files() {
    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("base_0001.tar.lzo");
    let mut builder = tar::Builder::new(Vec::new());
    let mut dir_header = tar::Header::new_gnu();
    dir_header.set_entry_type(tar::EntryType::Directory);
    dir_header.set_size(0);
    dir_header.set_mode(0o755);
    dir_header.set_cksum();
    builder.append_data(&mut dir_header, "pg_wal/", io::empty()).unwrap();
    let mut file_header = tar::Header::new_gnu();
    file_header.set_size(11);
    file_header.set_mode(0o600);
    file_header.set_cksum();
    builder.append_data(&mut file_header, "pg_wal/000001", &b"wal records"[..]).unwrap();
    let tar = builder.into_inner().unwrap();
    std::fs::write(&archive, lzop(&tar)).unwrap();

    let out = dir.path().join("restore");
    extract_all(&DirectorySink::new(&out), &[FileSource::new(&archive).unwrap()]).unwrap();

    assert!(out.join("pg_wal").is_dir());
    assert_eq!(std::fs::read(out.join("pg_wal/000001")).unwrap(), b"wal records");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(out.join("pg_wal/000001")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}

#[test]
fn test_digest_sink_matches_blake3() {
    let data = stride_bytes(70_000, 1000, 21);
    let sink = DigestSink::new();
    extract_all(&sink, &[lzop_source("d.lzo", &[("x", &data[..])])]).unwrap();
    let digests = sink.into_digests();
    assert_eq!(digests.len(), 1);
    assert_eq!(digests[0].hex(), blake3::hash(&data).to_hex().to_string());
}

#[test]
fn test_report_summary_serializes() {
    let report = Extractor::default().run(&MemorySink::new(), &mixed_sources());
    let json = serde_json::to_value(report.summary()).unwrap();
    assert_eq!(json["entries"], 2);
    assert_eq!(json["failures"][0]["kind"], "format");
    assert_eq!(json["sources"][1]["container"], "lzop");
}

#[cfg(feature = "parallel")]
#[test]
fn test_parallel_sources() {
    let sources: Vec<BufferSource> = (0..8)
        .map(|i| {
            let body = stride_bytes(200_000 + i, 500, i as u64);
            let name = format!("s{i}.lzo");
            BufferSource::new(name, ContainerType::Lzop, lzop(&tar_of(&[("f", &body[..])])))
        })
        .collect();
    let options = ExtractOptions { concurrency: 4, ..ExtractOptions::default() };
    let sink = MemorySink::new();
    let report = Extractor::new(CodecRegistry::default(), options).run(&sink, &sources);

    assert!(report.is_success());
    assert_eq!(report.sources.len(), 8);
    for (i, s) in sources.iter().enumerate() {
        assert_eq!(sink.concatenated(s.path()), stride_bytes(200_000 + i, 500, i as u64));
    }
}

// ── properties ───────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_lzop_roundtrip(data in proptest::collection::vec(any::<u8>(), 0..20_000), block in 1usize..4096) {
        let options = LzopOptions { block_size: block, ..LzopOptions::default() };
        let mut w = LzopWriter::with_options(Vec::new(), options).unwrap();
        w.write_all(&data).unwrap();
        let wire = w.finish().unwrap();

        let mut out = Vec::new();
        LzopReader::new(Cursor::new(wire)).read_to_end(&mut out).unwrap();
        prop_assert_eq!(out, data);
    }

    #[test]
    fn prop_extract_preserves_members(
        bodies in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..3000), 0..6),
        slots in 1usize..4,
        chunk in 1usize..700,
    ) {
        let names: Vec<String> = (0..bodies.len()).map(|i| format!("m{i}")).collect();
        let entries: Vec<(&str, &[u8])> = names.iter().map(String::as_str).zip(bodies.iter().map(Vec::as_slice)).collect();
        let source = lzop_source("p.lzo", &entries);

        let options = ExtractOptions { pipe_slots: slots, pipe_chunk_size: chunk, ..ExtractOptions::default() };
        let sink = MemorySink::new();
        let report = Extractor::new(CodecRegistry::default(), options).run(&sink, &[source]);
        prop_assert!(report.is_success());

        let got = sink.into_entries();
        prop_assert_eq!(got.len(), bodies.len());
        for (entry, body) in got.iter().zip(&bodies) {
            prop_assert_eq!(&entry.data, body);
        }
    }
}
