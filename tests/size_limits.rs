//! Growth, back-pressure, and drop-path coverage, matching
//! `vector_buffers::variants::disk_v2::tests::size_limits` in spirit: push the ring against
//! `max_block_count` and confirm both the blocking (`no_lose = true`) and dropping
//! (`no_lose = false`) paths behave per spec.md §8 scenarios 3 and 4.

use std::{sync::Arc, thread, time::Duration};

use mmap_write_buffer::{get_buffer_instance, remove_buffer_instance, BufferConfig};
use rand::Rng;

#[test]
fn drop_path_rejects_only_when_no_free_block_exists() {
    let dir = tempfile::tempdir().unwrap();
    let buffer = get_buffer_instance("size-limits-drop-path");
    buffer
        .init(
            BufferConfig::builder(dir.path().join("dest"), dir.path().join("scratch"))
                .max_block_count(1)
                .initial_block_count(1)
                .block_size(100)
                .page_size(100)
                // Long enough that the persister won't have drained the block by the time the
                // second append arrives, so the drop path is actually exercised.
                .persist_timeout(Duration::from_secs(3600))
                .build()
                .unwrap(),
        )
        .unwrap();

    assert!(buffer.try_append(&[0x41; 100], false));
    assert!(!buffer.try_append(&[0x42; 1], false), "second append should be dropped: no free block and no_lose=false");

    buffer.flush();
    let contents = std::fs::read(dir.path().join("dest")).unwrap();
    assert_eq!(contents.len(), 100);
    assert!(contents.iter().all(|&b| b == 0x41), "dropped append must not leave a partial byte written");

    remove_buffer_instance("size-limits-drop-path");
}

#[test]
fn no_lose_producers_never_see_a_rejected_append_under_growth() {
    let dir = tempfile::tempdir().unwrap();
    let buffer = get_buffer_instance("size-limits-growth-to-cap");
    buffer
        .init(
            BufferConfig::builder(dir.path().join("dest"), dir.path().join("scratch"))
                .max_block_count(2)
                .initial_block_count(1)
                .block_size(4096)
                .page_size(4096)
                .persist_timeout(Duration::from_millis(1))
                .build()
                .unwrap(),
        )
        .unwrap();

    const PRODUCERS: usize = 2;
    const RECORDS_PER_PRODUCER: usize = 10;
    const RECORD_LEN: usize = 1000;

    let handles: Vec<_> = (0..PRODUCERS)
        .map(|_| {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || {
                for _ in 0..RECORDS_PER_PRODUCER {
                    assert!(buffer.try_append(&[0x7A; RECORD_LEN], true));
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    buffer.flush();
    assert_eq!(buffer.actual_data_len(), (PRODUCERS * RECORDS_PER_PRODUCER * RECORD_LEN) as u64);

    remove_buffer_instance("size-limits-growth-to-cap");
}

#[test]
fn ring_reuses_drained_blocks_instead_of_growing_past_cap() {
    let dir = tempfile::tempdir().unwrap();
    let buffer = get_buffer_instance("size-limits-reuse");
    buffer
        .init(
            BufferConfig::builder(dir.path().join("dest"), dir.path().join("scratch"))
                .max_block_count(2)
                .initial_block_count(1)
                .block_size(256)
                .page_size(256)
                .persist_timeout(Duration::from_millis(1))
                .build()
                .unwrap(),
        )
        .unwrap();

    // Far more records than max_block_count * block_size could hold staged at once, with
    // no_lose=true: the only way this completes is if the persister keeps draining and the
    // ring reuses freed blocks rather than requiring unbounded growth. Record lengths are
    // randomized (but always <= block_size) to avoid exercising only the exact-fill boundary.
    let mut rng = rand::thread_rng();
    let mut total = 0u64;
    for _ in 0..500 {
        let len = rng.gen_range(1..=256);
        assert!(buffer.try_append(&vec![0x01; len], true));
        total += len as u64;
    }
    buffer.flush();
    assert_eq!(buffer.actual_data_len(), total);

    remove_buffer_instance("size-limits-reuse");
}
