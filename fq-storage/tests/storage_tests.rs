//! End-to-end storage tests: commit path, restart recovery from dump and
//! WAL, and window behavior against the real wall clock.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::mpsc;

use fq_core::types::BatchKey;
use fq_storage::dumper::Dumper;
use fq_storage::engine::{Engine, DEFAULT_PARTITIONS};
use fq_storage::storage::Storage;
use fq_storage::wal::Wal;

struct Instance {
    storage: Arc<Storage>,
    dumper: Arc<Dumper>,
}

/// Wire up a full master instance over the given data directories.
fn open_instance(wal_dir: &Path, dump_dir: &Path) -> Instance {
    let (wal_stream_tx, wal_stream_rx) = mpsc::channel(1);

    let engine = Engine::new(DEFAULT_PARTITIONS, Some(wal_stream_rx), None).unwrap();
    let wal = Arc::new(Wal::new(
        wal_dir,
        Duration::from_millis(5),
        100,
        10 << 20,
        wal_stream_tx,
    ));
    let dumper = Dumper::new(Arc::clone(&engine), Some(Arc::clone(&wal)), dump_dir);

    let storage = Storage::new(
        engine,
        Some(wal),
        Arc::clone(&dumper),
        Duration::from_secs(10),
        Duration::from_secs(600),
        true,
        false,
    );

    Instance { storage, dumper }
}

impl Instance {
    async fn start(&self) {
        self.storage.recover().await.unwrap();
        Arc::clone(&self.storage).start();
        // Recovery streams the WAL tail through the engine consumer task.
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    async fn stop(&self) {
        self.storage.shutdown().await;
        self.dumper.shutdown().await;
    }
}

fn key(name: &str) -> BatchKey {
    BatchKey::new(name, "600").unwrap()
}

#[tokio::test]
async fn restart_recovers_from_wal() {
    let wal_dir = TempDir::new().unwrap();
    let dump_dir = TempDir::new().unwrap();

    {
        let instance = open_instance(wal_dir.path(), dump_dir.path());
        instance.start().await;
        assert_eq!(instance.storage.incr(&key("a")).await.unwrap(), 1);
        assert_eq!(instance.storage.incr(&key("a")).await.unwrap(), 2);
        instance.stop().await;
    }

    let instance = open_instance(wal_dir.path(), dump_dir.path());
    instance.start().await;

    assert_eq!(instance.storage.get(&key("a")).await.unwrap(), 2);
    assert_eq!(instance.storage.last_lsn(), 2);

    // Committed LSNs keep increasing after recovery.
    instance.storage.incr(&key("a")).await.unwrap();
    assert_eq!(instance.storage.last_lsn(), 3);
    instance.stop().await;
}

#[tokio::test]
async fn restart_recovers_from_dump_plus_wal_tail() {
    let wal_dir = TempDir::new().unwrap();
    let dump_dir = TempDir::new().unwrap();

    {
        let instance = open_instance(wal_dir.path(), dump_dir.path());
        instance.start().await;

        instance.storage.incr(&key("a")).await.unwrap();
        instance.storage.dump().await.unwrap();
        instance.storage.incr(&key("a")).await.unwrap();
        instance.stop().await;
    }

    let instance = open_instance(wal_dir.path(), dump_dir.path());
    instance.start().await;

    // Dump carries LSN 1, the WAL tail applies LSN 2 on top.
    assert_eq!(instance.storage.get(&key("a")).await.unwrap(), 2);
    assert_eq!(instance.storage.dump_lsn(), 1);
    assert_eq!(instance.storage.last_lsn(), 2);
    instance.stop().await;
}

#[tokio::test]
async fn dump_removes_superseded_wal_segments() {
    let wal_dir = TempDir::new().unwrap();
    let dump_dir = TempDir::new().unwrap();

    let instance = open_instance(wal_dir.path(), dump_dir.path());
    instance.start().await;

    for _ in 0..5 {
        instance.storage.incr(&key("a")).await.unwrap();
    }
    instance.stop().await;

    // All records are below the cutoff once the dump covers LSN 5.
    instance.dumper.dump(6).await.unwrap();
    assert!(fq_storage::wal::list_segments(wal_dir.path())
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn counter_resets_after_its_window_passes() {
    let wal_dir = TempDir::new().unwrap();
    let dump_dir = TempDir::new().unwrap();

    let instance = open_instance(wal_dir.path(), dump_dir.path());
    instance.start().await;

    let k = BatchKey::new("w", "1").unwrap();
    instance.storage.incr(&k).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1200)).await;

    assert_eq!(instance.storage.incr(&k).await.unwrap(), 1);
    instance.stop().await;
}

#[tokio::test]
async fn async_commit_still_applies_to_the_engine() {
    let wal_dir = TempDir::new().unwrap();
    let dump_dir = TempDir::new().unwrap();

    let (wal_stream_tx, wal_stream_rx) = mpsc::channel(1);
    let engine = Engine::new(DEFAULT_PARTITIONS, Some(wal_stream_rx), None).unwrap();
    let wal = Arc::new(Wal::new(
        wal_dir.path(),
        Duration::from_millis(5),
        100,
        10 << 20,
        wal_stream_tx,
    ));
    let dumper = Dumper::new(Arc::clone(&engine), Some(Arc::clone(&wal)), dump_dir.path());

    // sync_commit off: responses do not wait for fsync.
    let storage = Storage::new(
        engine,
        Some(wal),
        Arc::clone(&dumper),
        Duration::from_secs(10),
        Duration::from_secs(600),
        false,
        false,
    );

    storage.recover().await.unwrap();
    Arc::clone(&storage).start();

    assert_eq!(storage.incr(&key("x")).await.unwrap(), 1);
    assert_eq!(storage.get(&key("x")).await.unwrap(), 1);

    storage.shutdown().await;
    dumper.shutdown().await;

    // The group commit still lands on disk by shutdown.
    let logs = fq_storage::wal::FsReader::new(wal_dir.path())
        .read_logs()
        .unwrap();
    assert_eq!(logs.len(), 1);
}
