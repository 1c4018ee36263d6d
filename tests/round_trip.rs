use chunkpipe::{ReaderConfig, StreamReader, StreamWriter, WriterConfig};
use std::time::Duration;
use tempfile::TempDir;

fn fast_reader() -> ReaderConfig {
    ReaderConfig {
        poll_interval: Duration::from_millis(1),
        claim_interval: Duration::from_millis(1),
        notify: false,
        ..ReaderConfig::default()
    }
}

fn drain(reader: &mut StreamReader, buf_len: usize) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = vec![0u8; buf_len];
    loop {
        match reader.read(&mut buf).expect("read") {
            0 => break,
            n => out.extend_from_slice(&buf[..n]),
        }
    }
    out
}

#[test]
fn blocks_concatenate_unsplit_regardless_of_chunk_boundaries() {
    let dir = TempDir::new().expect("tempdir");
    let root = dir.path().join("stream");

    let blocks: Vec<Vec<u8>> = (0u8..20)
        .map(|i| vec![b'a' + (i % 26); 1 + (i as usize * 7) % 40])
        .collect();
    let expected: Vec<u8> = blocks.concat();

    let mut writer = StreamWriter::attach(
        &root,
        WriterConfig {
            max_chunk_size: 13,
            ..WriterConfig::default()
        },
    )
    .expect("writer attach");
    for block in &blocks {
        writer.append(block).expect("append");
    }
    writer.detach().expect("detach");

    let mut reader = StreamReader::attach(&root, fast_reader()).expect("reader attach");
    assert_eq!(drain(&mut reader, 8), expected);
    assert!(!root.exists(), "directory removed at end of stream");
}

#[test]
fn scenario_helloworld_across_two_chunks() {
    let dir = TempDir::new().expect("tempdir");
    let root = dir.path().join("stream");

    let mut writer = StreamWriter::attach(
        &root,
        WriterConfig {
            max_chunk_size: 10,
            ..WriterConfig::default()
        },
    )
    .expect("writer attach");
    writer.append(b"HELLOWORLD!").expect("append");

    // chunk 1 is exactly full and already closed; chunk 2 holds the tail and
    // stays open under the writer's lock
    assert_eq!(
        std::fs::read(root.join("0000000001.chunk")).expect("chunk 1"),
        b"HELLOWORLD"
    );
    assert_eq!(
        std::fs::read(root.join("0000000002.chunk")).expect("chunk 2"),
        b"!"
    );
    writer.detach().expect("detach");

    let mut reader = StreamReader::attach(&root, fast_reader()).expect("reader attach");
    assert_eq!(drain(&mut reader, 64), b"HELLOWORLD!");
}

#[test]
fn live_tail_follows_a_concurrent_writer() {
    let dir = TempDir::new().expect("tempdir");
    let root = dir.path().join("stream");
    let root_clone = root.clone();

    let expected: Vec<u8> = (0..200u32).flat_map(|i| i.to_le_bytes()).collect();
    let payload = expected.clone();

    let writer_thread = std::thread::spawn(move || {
        let mut writer = StreamWriter::attach(
            &root_clone,
            WriterConfig {
                max_chunk_size: 64,
                ..WriterConfig::default()
            },
        )
        .expect("writer attach");
        for piece in payload.chunks(17) {
            writer.append(piece).expect("append");
            std::thread::sleep(Duration::from_millis(1));
        }
        writer.detach().expect("detach");
    });

    // give the writer a moment to create the directory
    while !root.exists() {
        std::thread::sleep(Duration::from_millis(1));
    }
    let mut reader = StreamReader::attach(
        &root,
        ReaderConfig {
            wait_for_root: true,
            ..fast_reader()
        },
    )
    .expect("reader attach");
    let got = drain(&mut reader, 32);

    writer_thread.join().expect("writer thread");
    assert_eq!(got, expected);
    assert!(!root.exists());
}
