//! Cache pool guarantees observed through the operation engine.
//!
//! - Round trips across every size class
//! - Hits never reach the backend
//! - Single-flight fetches under concurrent readers
//! - Dirty data is never dropped by eviction
//! - Many writers against a pool smaller than their working set
//!
//! Run: `cargo nextest run -p bucketfs-engine cache_properties`

mod common;

use std::sync::Arc;
use std::time::Duration;

use bucketfs_core::BackendErrorKind;
use bucketfs_core::testing::SIZE_CLASS_SAMPLES;
use bucketfs_engine::{CacheConfig, EngineConfig, Operation, Response};
use common::{Capability, TestEngine, patterned, random_bytes};
use tokio::task::JoinSet;

fn small_pool(capacity: u64, classes: Vec<usize>) -> EngineConfig {
    EngineConfig::default().cache(CacheConfig::default().size_classes(classes).capacity_bytes(capacity))
}

// =============================================================================
// Round trips
// =============================================================================

#[tokio::test]
async fn test_write_read_round_trip_across_size_classes() {
    let t = TestEngine::new();
    for (i, &size) in SIZE_CLASS_SAMPLES.iter().enumerate() {
        let path = format!("/file{i}.bin");
        let data = random_bytes(size);
        let h = t.create(&path).await.unwrap();
        t.write_at(h, 0, &data).await.unwrap();
        assert_eq!(t.read_all(h).await.unwrap(), data, "size {size}");

        t.fsync(h).await.unwrap();
        assert_eq!(t.stored(&path[1..]).unwrap(), data, "stored size {size}");
    }
}

#[tokio::test]
async fn test_read_after_write_issues_no_get() {
    let t = TestEngine::new();
    let h = t.create("/a.txt").await.unwrap();
    let data = patterned(20_000, 3);
    t.write_at(h, 0, &data).await.unwrap();
    t.backend.reset_counts();

    assert_eq!(t.read_at(h, 0, 20_000).await.unwrap(), data);
    assert_eq!(t.read_at(h, 4096, 100).await.unwrap(), &data[4096..4196]);
    assert_eq!(t.backend.calls(Capability::Get), 0);
    assert!(t.engine.stats().hits >= 2);
}

#[tokio::test]
async fn test_second_read_of_fetched_object_is_a_hit() {
    let t = TestEngine::new();
    t.store.insert("remote.bin", patterned(10_000, 8));
    let h = t.handle("/remote.bin").await.unwrap();

    t.read_at(h, 0, 100).await.unwrap();
    t.read_at(h, 9_000, 1_000).await.unwrap();
    assert_eq!(t.backend.calls(Capability::Get), 1);
}

// =============================================================================
// Single-flight
// =============================================================================

async fn concurrent_reads(t: &TestEngine, path: &str, readers: usize, expected: &[u8]) {
    let handle = t.handle(path).await.unwrap();
    let mut set = JoinSet::new();
    for _ in 0..readers {
        let engine = Arc::clone(&t.engine);
        set.spawn(async move {
            engine
                .execute(Operation::Read {
                    handle,
                    offset: 0,
                    length: 1 << 20,
                })
                .await
        });
    }
    while let Some(result) = set.join_next().await {
        match result.unwrap().unwrap() {
            Response::Data(data) => assert_eq!(data, expected),
            other => panic!("unexpected reply {other:?}"),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_readers_share_one_get() {
    let t = TestEngine::new();
    let data = patterned(300_000, 5);
    t.store.insert("shared.bin", data.clone());
    t.backend.set_delay(Capability::Get, Some(Duration::from_millis(50)));

    concurrent_reads(&t, "/shared.bin", 16, &data).await;
    assert_eq!(t.backend.calls(Capability::Get), 1);
    assert!(t.engine.stats().coalesced >= 15);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_readers_of_expired_key_share_one_get() {
    let t = TestEngine::new();
    let data = patterned(5_000, 1);
    t.store.insert("k", data.clone());
    concurrent_reads(&t, "/k", 1, &data).await;
    assert_eq!(t.backend.calls(Capability::Get), 1);

    tokio::time::advance(Duration::from_secs(6)).await;
    let updated = patterned(5_000, 2);
    t.store.insert("k", updated.clone());
    t.backend.set_delay(Capability::Get, Some(Duration::from_millis(50)));

    concurrent_reads(&t, "/k", 12, &updated).await;
    assert_eq!(t.backend.calls(Capability::Get), 2);
}

// =============================================================================
// Eviction
// =============================================================================

#[tokio::test]
async fn test_failed_flush_blocks_eviction_of_dirty_data() {
    // Eight 1 KiB blocks in total.
    let t = TestEngine::with_config(small_pool(8 << 10, vec![1024]));
    let a = t.create("/a").await.unwrap();
    let b = t.create("/b").await.unwrap();
    let a_data = patterned(6 << 10, 1);
    let b_data = patterned(6 << 10, 2);

    t.backend.fail_always(Capability::Put, BackendErrorKind::Fatal);
    t.write_at(a, 0, &a_data).await.unwrap();
    // Needs six blocks but only two are free and nothing can be flushed.
    let err = t.write_at(b, 0, &b_data).await.unwrap_err();
    assert_eq!(err.kind(), bucketfs_core::ErrorKind::BackendFatal);

    let stats = t.engine.stats();
    assert_eq!(stats.evictions_flushed, 0);
    assert_eq!(stats.evictions_clean, 0);
    assert_eq!(t.read_all(a).await.unwrap(), a_data);

    t.backend.clear_faults();
    t.fsync(a).await.unwrap();
    assert_eq!(t.stored("a").unwrap(), a_data);
    assert_eq!(t.stored("b").unwrap(), "");
}

#[tokio::test]
async fn test_eviction_flushes_before_reclaiming() {
    let t = TestEngine::with_config(small_pool(8 << 10, vec![1024]));
    let a = t.create("/a").await.unwrap();
    let b = t.create("/b").await.unwrap();
    let a_data = patterned(6 << 10, 1);
    let b_data = patterned(6 << 10, 2);

    t.write_at(a, 0, &a_data).await.unwrap();
    t.write_at(b, 0, &b_data).await.unwrap();

    assert!(t.engine.stats().evictions_flushed > 0);
    assert_eq!(t.stored("a").unwrap(), a_data);
    assert_eq!(t.read_all(b).await.unwrap(), b_data);
    assert_eq!(t.read_all(a).await.unwrap(), a_data);
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn test_hello_survives_dropping_all_cache_state() {
    let t = TestEngine::new();
    t.mkdir("/a").await.unwrap();
    let h = t.create("/a/b.txt").await.unwrap();
    t.write_at(h, 0, b"hello").await.unwrap();
    t.fsync(h).await.unwrap();

    assert_eq!(t.engine.cache().invalidate_all().await, 0);
    t.backend.reset_counts();

    assert_eq!(t.read_at(h, 0, 100).await.unwrap(), "hello");
    assert_eq!(t.backend.calls(Capability::Get), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_writers_on_undersized_pool() {
    const WRITERS: usize = 10;
    const FILE_SIZE: usize = 32 << 10;
    const CHUNK: usize = 4 << 10;

    // 16 blocks shared by 10 writers that need 8 blocks each.
    let t = TestEngine::with_config(small_pool(64 << 10, vec![4096]));
    let mut set = JoinSet::new();
    for w in 0..WRITERS {
        let path = format!("/w{w}.bin");
        let handle = t.create(&path).await.unwrap();
        let engine = Arc::clone(&t.engine);
        set.spawn(async move {
            let data = patterned(FILE_SIZE, w as u8);
            // Back to front so every write lands in a fresh block.
            for chunk in (0..FILE_SIZE / CHUNK).rev() {
                let start = chunk * CHUNK;
                engine
                    .execute(Operation::Write {
                        handle,
                        offset: start as u64,
                        data: data[start..start + CHUNK].to_vec().into(),
                    })
                    .await
                    .unwrap();
                tokio::task::yield_now().await;
            }
            (handle, data)
        });
    }

    let mut written = Vec::new();
    while let Some(result) = set.join_next().await {
        written.push(result.unwrap());
    }
    t.engine.cache().flush_all().await.unwrap();

    for (handle, data) in written {
        assert_eq!(t.read_all(handle).await.unwrap(), data);
    }
    for w in 0..WRITERS {
        assert_eq!(t.stored(&format!("w{w}.bin")).unwrap(), patterned(FILE_SIZE, w as u8));
    }
    let stats = t.engine.stats();
    assert!(stats.evictions_flushed + stats.evictions_clean + stats.write_through > 0);
}
