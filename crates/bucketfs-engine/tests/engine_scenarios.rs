//! End-to-end scenarios through `Engine::execute`.
//!
//! Run: `cargo nextest run -p bucketfs-engine engine_scenarios`

mod common;

use std::time::Duration;

use bucketfs_core::{BackendErrorKind, EntryKind, ErrorKind, FsError};
use bucketfs_engine::{CacheConfig, EngineConfig, OpenMode, Operation, Response};
use common::{Capability, TestEngine, patterned};

// =============================================================================
// File data
// =============================================================================

#[tokio::test]
async fn test_append_writes_land_at_end() {
    let t = TestEngine::new();
    t.store.insert("log.txt", "start\n");
    let h = t.open("/log.txt", OpenMode::READ_WRITE.append()).await.unwrap();

    t.write_at(h, 0, b"one\n").await.unwrap();
    t.write_at(h, 0, b"two\n").await.unwrap();
    assert_eq!(t.read_all(h).await.unwrap(), b"start\none\ntwo\n");

    t.fsync(h).await.unwrap();
    assert_eq!(t.stored("log.txt").unwrap(), "start\none\ntwo\n");
}

#[tokio::test]
async fn test_open_mode_is_shared_by_every_opener() {
    let t = TestEngine::new();
    t.store.insert("shared.txt", "0123");
    let plain = t.open("/shared.txt", OpenMode::READ_WRITE).await.unwrap();
    let appender = t.open("/shared.txt", OpenMode::READ_WRITE.append()).await.unwrap();
    assert_eq!(plain, appender);

    // The append open applies to the earlier opener too.
    t.write_at(plain, 0, b"a").await.unwrap();
    assert_eq!(t.read_all(plain).await.unwrap(), b"0123a");

    // A later plain open switches appending off for everyone.
    t.open("/shared.txt", OpenMode::READ_WRITE).await.unwrap();
    t.write_at(appender, 0, b"X").await.unwrap();
    assert_eq!(t.read_all(appender).await.unwrap(), b"X123a");
}

#[tokio::test]
async fn test_seek_and_read() {
    let t = TestEngine::new();
    let data = patterned(100_000, 4);
    t.store.insert("big.bin", data.clone());
    let h = t.handle("/big.bin").await.unwrap();

    assert_eq!(t.read_at(h, 50_000, 1_000).await.unwrap(), &data[50_000..51_000]);
    assert_eq!(t.read_at(h, 99_990, 100).await.unwrap(), &data[99_990..]);
    assert!(t.read_at(h, 200_000, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_overwrite_in_the_middle_of_remote_object() {
    let t = TestEngine::new();
    let mut data = patterned(50_000, 9);
    t.store.insert("f", data.clone());
    let h = t.handle("/f").await.unwrap();

    t.write_at(h, 20_000, b"PATCH").await.unwrap();
    data[20_000..20_005].copy_from_slice(b"PATCH");
    t.fsync(h).await.unwrap();
    assert_eq!(t.stored("f").unwrap(), data);
}

#[tokio::test]
async fn test_truncate_on_open() {
    let t = TestEngine::new();
    t.store.insert("f.txt", "old content");
    let h = t.open("/f.txt", OpenMode::READ_WRITE.truncate()).await.unwrap();
    assert_eq!(t.getattr(h).await.unwrap().size, 0);

    t.write_at(h, 0, b"new").await.unwrap();
    t.fsync(h).await.unwrap();
    assert_eq!(t.stored("f.txt").unwrap(), "new");
}

#[tokio::test]
async fn test_setattr_shrinks_and_extends() {
    let t = TestEngine::new();
    t.store.insert("f", "0123456789");
    let h = t.handle("/f").await.unwrap();

    let reply = t
        .exec(Operation::SetAttr {
            handle: h,
            size: Some(4),
        })
        .await
        .unwrap();
    let Response::Attr(attr) = reply else {
        panic!("expected attributes, got {reply:?}");
    };
    assert_eq!(attr.size, 4);
    assert_eq!(t.read_all(h).await.unwrap(), b"0123");

    t.exec(Operation::SetAttr {
        handle: h,
        size: Some(6),
    })
    .await
    .unwrap();
    assert_eq!(t.read_all(h).await.unwrap(), b"0123\0\0");
    t.fsync(h).await.unwrap();
    assert_eq!(t.stored("f").unwrap(), &b"0123\0\0"[..]);
}

#[tokio::test]
async fn test_write_through_mode_puts_before_reply() {
    let t = TestEngine::with_config(EngineConfig::default().cache(CacheConfig::default().write_back(false)));
    let h = t.create("/f").await.unwrap();
    t.write_at(h, 0, b"durable").await.unwrap();
    assert_eq!(t.stored("f").unwrap(), "durable");
}

// =============================================================================
// Handles
// =============================================================================

#[tokio::test]
async fn test_lookup_returns_same_handle() {
    let t = TestEngine::new();
    t.store.insert("f", "");
    let first = t.handle("/f").await.unwrap();
    let second = t.handle("/f").await.unwrap();
    assert_eq!(first, second);
    assert_eq!(t.engine.handles().resolve(first).unwrap().ref_count, 2);
}

#[tokio::test]
async fn test_stale_handle_after_release() {
    let t = TestEngine::new();
    let h = t.create("/f").await.unwrap();
    t.exec(Operation::Release { handle: h }).await.unwrap();
    t.getattr(h).await.unwrap();
    t.exec(Operation::Forget { handle: h, nlookup: 1 }).await.unwrap();

    let err = t.getattr(h).await.unwrap_err();
    assert!(matches!(err, FsError::InvalidHandle { .. }));
    assert_eq!(err.kind(), ErrorKind::InvalidHandle);

    let again = t.handle("/f").await.unwrap();
    assert_ne!(again, h);
    assert!(t.getattr(h).await.is_err());
}

#[tokio::test]
async fn test_create_exclusive_and_shared() {
    let t = TestEngine::new();
    t.create("/f").await.unwrap();
    let err = t.create("/f").await.unwrap_err();
    assert!(matches!(err, FsError::AlreadyExists(_)));
    t.create_with("/f", OpenMode::READ_WRITE, false).await.unwrap();
}

// =============================================================================
// Namespace
// =============================================================================

#[tokio::test]
async fn test_mkdir_rmdir_and_not_empty() {
    let t = TestEngine::new();
    t.mkdir("/a").await.unwrap();
    t.mkdir("/a/b").await.unwrap();
    assert!(matches!(t.rmdir("/a").await.unwrap_err(), FsError::NotEmpty(_)));
    t.rmdir("/a/b").await.unwrap();
    t.rmdir("/a").await.unwrap();
    assert!(t.store.is_empty());
}

#[tokio::test]
async fn test_readdir_sorted_with_offsets_and_unflushed_sizes() {
    let t = TestEngine::new();
    t.mkdir("/d").await.unwrap();
    t.create("/d/b").await.unwrap();
    let a = t.create("/d/a").await.unwrap();
    t.mkdir("/d/c").await.unwrap();
    t.write_at(a, 0, &[7; 10]).await.unwrap();

    let entries = t.readdir("/d", 0).await.unwrap();
    let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, ["a", "b", "c"]);
    assert_eq!(entries[0].size, 10);
    assert_eq!(entries[2].kind, EntryKind::Directory);
    assert_eq!(entries.iter().map(|e| e.offset).collect::<Vec<_>>(), [1, 2, 3]);

    let rest = t.readdir("/d", 2).await.unwrap();
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].name, "c");
}

#[tokio::test]
async fn test_unlink_discards_dirty_data() {
    let t = TestEngine::new();
    let h = t.create("/f").await.unwrap();
    t.write_at(h, 0, b"never flushed").await.unwrap();
    t.unlink("/f").await.unwrap();

    assert_eq!(t.engine.cache().flush_all().await.unwrap(), 0);
    assert!(t.stored("f").is_none());
    assert!(matches!(t.handle("/f").await.unwrap_err(), FsError::NotFound(_)));
}

#[tokio::test]
async fn test_unlink_directory_is_type_mismatch() {
    let t = TestEngine::new();
    t.mkdir("/d").await.unwrap();
    assert_eq!(t.unlink("/d").await.unwrap_err().kind(), ErrorKind::IsDirectory);
}

#[tokio::test]
async fn test_rename_file_carries_unflushed_data() {
    let t = TestEngine::new();
    let h = t.create("/a").await.unwrap();
    t.write_at(h, 0, b"payload").await.unwrap();
    t.rename("/a", "/b").await.unwrap();

    assert!(t.stored("a").is_none());
    assert_eq!(t.stored("b").unwrap(), "payload");
    // The open handle follows the file.
    assert_eq!(t.read_all(h).await.unwrap(), b"payload");
    assert_eq!(t.engine.handles().resolve(h).unwrap().path.as_str(), "/b");
}

#[tokio::test]
async fn test_rename_directory_moves_subtree() {
    let t = TestEngine::new();
    t.mkdir("/d").await.unwrap();
    let x = t.create("/d/x").await.unwrap();
    t.write_at(x, 0, b"x").await.unwrap();
    t.rename("/d", "/e").await.unwrap();

    assert!(!t.store.contains("d/"));
    assert!(!t.store.contains("d/x"));
    assert!(t.store.contains("e/"));
    assert_eq!(t.stored("e/x").unwrap(), "x");
    let moved = t.handle("/e/x").await.unwrap();
    assert_eq!(moved, x);
}

#[tokio::test]
async fn test_rename_partial_failure_leaves_both_objects() {
    let t = TestEngine::new();
    let h = t.create("/a").await.unwrap();
    t.write_at(h, 0, b"v").await.unwrap();
    t.backend.fail_keys(Capability::Delete, "a", BackendErrorKind::Fatal);

    let err = t.rename("/a", "/b").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BackendFatal);
    assert_eq!(t.stored("a").unwrap(), "v");
    assert_eq!(t.stored("b").unwrap(), "v");
}

// =============================================================================
// Background flushing
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_sweeper_flushes_idle_dirty_data() {
    let t = TestEngine::new();
    t.exec(Operation::Init).await.unwrap();
    let h = t.create("/idle").await.unwrap();
    t.write_at(h, 0, b"eventually").await.unwrap();
    assert_eq!(t.stored("idle").unwrap(), "");

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(t.stored("idle").unwrap(), "eventually");
    assert!(t.engine.stats().flushes >= 1);

    t.exec(Operation::Destroy).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_flush_retries_surface_at_fsync() {
    let cache = CacheConfig::default()
        .flush_interval(Duration::from_millis(100))
        .sweep_interval(Duration::from_millis(50))
        .max_flush_retries(2);
    let t = TestEngine::with_config(EngineConfig::default().cache(cache));
    t.exec(Operation::Init).await.unwrap();
    let h = t.create("/f").await.unwrap();
    t.backend.fail_always(Capability::Put, BackendErrorKind::Fatal);
    t.write_at(h, 0, b"keep me").await.unwrap();

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(t.engine.stats().flush_failures, 2);
    assert_eq!(t.getattr(h).await.unwrap().size, 7);

    let err = t.fsync(h).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BackendFatal);

    t.backend.clear_faults();
    t.fsync(h).await.unwrap();
    assert_eq!(t.stored("f").unwrap(), "keep me");
    t.exec(Operation::Destroy).await.unwrap();
}

#[tokio::test]
async fn test_destroy_flushes_everything() {
    let t = TestEngine::new();
    let a = t.create("/a").await.unwrap();
    let b = t.create("/b").await.unwrap();
    t.write_at(a, 0, b"A").await.unwrap();
    t.write_at(b, 0, b"B").await.unwrap();
    t.exec(Operation::Destroy).await.unwrap();
    assert_eq!(t.stored("a").unwrap(), "A");
    assert_eq!(t.stored("b").unwrap(), "B");
}

#[tokio::test]
async fn test_stats_snapshot_serializes() {
    let t = TestEngine::new();
    let h = t.create("/f").await.unwrap();
    t.write_at(h, 0, b"x").await.unwrap();
    let stats = t.engine.stats();
    assert_eq!(stats.dirty_files, 1);
    assert_eq!(stats.classes.len(), 5);

    let json = serde_json::to_value(&stats).unwrap();
    assert_eq!(json["dirty_files"], 1);
}
