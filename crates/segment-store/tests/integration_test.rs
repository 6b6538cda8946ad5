// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fs;

use segment_store::{suffix::trailing_suffix, RotatingStore, StoreConfig};
use tempfile::TempDir;

fn line(i: usize) -> Vec<u8> {
    format!("{{\"id\":\"event-{i:04}\"}}\n").into_bytes()
}

#[test]
fn store_survives_restarts_without_reusing_suffixes() {
    let dir = TempDir::new().expect("failed to create temp dir");
    let config = StoreConfig::new("archive", dir.path())
        .with_max_file_size(64)
        .with_max_file_count(4);

    let mut written = 0;
    for _ in 0..3 {
        let mut store = RotatingStore::open(config.clone()).expect("failed to open store");
        for _ in 0..7 {
            store.write(&line(written)).expect("failed to write");
            written += 1;
        }
        store.flush().expect("failed to flush");
    }

    let store = RotatingStore::open(config).expect("failed to open store");
    let segments = store.list_segments().expect("failed to list segments");
    assert!(segments.len() <= 4);

    let suffixes: Vec<u64> = segments.iter().map(|s| trailing_suffix(s)).collect();
    for pair in suffixes.windows(2) {
        assert_eq!(pair[0] + 1, pair[1], "segments must be contiguous: {suffixes:?}");
    }

    // The newest record must be the last line of the newest segment
    let newest = segments.last().expect("at least one segment");
    let contents = fs::read_to_string(dir.path().join(newest)).expect("failed to read segment");
    assert_eq!(
        contents.lines().last(),
        Some(format!("{{\"id\":\"event-{:04}\"}}", written - 1).as_str())
    );
}

#[test]
fn every_segment_holds_whole_records() {
    let dir = TempDir::new().expect("failed to create temp dir");
    let mut store = RotatingStore::open(
        StoreConfig::new("archive", dir.path())
            .with_max_file_size(100)
            .with_max_file_count(50),
    )
    .expect("failed to open store");

    for i in 0..40 {
        store.write(&line(i)).expect("failed to write");
    }

    let mut seen = 0;
    for segment in store.list_segments().expect("failed to list segments") {
        let contents = fs::read_to_string(dir.path().join(&segment)).expect("read failed");
        assert!(contents.len() as u64 <= 100, "{segment} exceeds the bound");
        assert!(contents.ends_with('\n'));
        seen += contents.lines().count();
    }
    assert_eq!(seen, 40);
}
