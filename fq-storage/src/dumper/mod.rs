//! # Dumper
//!
//! Consistent snapshot writer and reader.
//!
//! A dump cycle drains the engine's dump iterator at a fixed LSN cutoff into
//! batches of up to 1,000 elements, writes them to a temp file, fsyncs and
//! atomically renames it to `current.dump`. Every successful cycle bumps the
//! in-process dump version, which invalidates all open replica read
//! sessions, and then lets the WAL drop segments the snapshot covers.

mod sessions;

pub use sessions::SESSION_TTL;

use std::fs::File;
use std::io::{BufWriter, Cursor, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use fq_core::codec;
use fq_core::error::{Error, Result};
use fq_core::types::{DumpElem, Lsn};
use fq_core::utils::now_unix_nanos;

use crate::engine::Engine;
use crate::wal::Wal;

pub const DUMP_BATCH_SIZE: usize = 1000;
pub const CURRENT_DUMP_FILE_NAME: &str = "current.dump";

/// Maximum concurrent replica read sessions.
pub const MAX_SESSIONS: usize = 10;

use sessions::SessionTable;

struct Cleaner {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

pub struct Dumper {
    engine: Arc<Engine>,
    wal: Option<Arc<Wal>>,
    dir: PathBuf,

    // Writer-exclusive while a new dump file is being produced; read
    // sessions take the shared side when they load `current.dump`.
    dump_file_lock: RwLock<()>,
    dump_version: AtomicU64,
    sessions: Mutex<SessionTable>,
    cleaner: Mutex<Option<Cleaner>>,
}

impl Dumper {
    pub fn new(engine: Arc<Engine>, wal: Option<Arc<Wal>>, dir: impl Into<PathBuf>) -> Arc<Self> {
        let dumper = Arc::new(Self {
            engine,
            wal,
            dir: dir.into(),
            dump_file_lock: RwLock::new(()),
            dump_version: AtomicU64::new(0),
            sessions: Mutex::new(SessionTable::new()),
            cleaner: Mutex::new(None),
        });

        Arc::clone(&dumper).start_session_cleanup();
        dumper
    }

    pub fn current_dump_path(&self) -> PathBuf {
        self.dir.join(CURRENT_DUMP_FILE_NAME)
    }

    pub fn dump_version(&self) -> u64 {
        self.dump_version.load(Ordering::SeqCst)
    }

    /// Produce a snapshot at the `dump_tx` cutoff and replace `current.dump`.
    pub async fn dump(&self, dump_tx: Lsn) -> Result<()> {
        let _guard = self.dump_file_lock.write().await;

        // Open sessions reference the previous file.
        self.invalidate_all_sessions();

        std::fs::create_dir_all(&self.dir)?;
        let temp_path = self.dir.join(format!("dump_{}.dump", now_unix_nanos()));

        let written = self.write_dump_file(&temp_path, dump_tx).await;
        if let Err(e) = written {
            let _ = std::fs::remove_file(&temp_path);
            return Err(e);
        }

        if let Err(e) = std::fs::rename(&temp_path, self.current_dump_path()) {
            let _ = std::fs::remove_file(&temp_path);
            return Err(Error::Dump {
                message: format!("rename dump file: {e}"),
            });
        }

        let version = self.dump_version.fetch_add(1, Ordering::SeqCst) + 1;
        info!(dump_tx, version, "dump file replaced");

        if let Some(wal) = &self.wal {
            wal.remove_past_segments(dump_tx)?;
        }

        Ok(())
    }

    async fn write_dump_file(&self, path: &PathBuf, dump_tx: Lsn) -> Result<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);

        let mut elems = Arc::clone(&self.engine).dump(dump_tx);
        let mut batch: Vec<DumpElem> = Vec::with_capacity(DUMP_BATCH_SIZE);
        let mut total = 0usize;

        while let Some(elem) = elems.recv().await {
            batch.push(elem);
            if batch.len() >= DUMP_BATCH_SIZE {
                write_batch(&mut writer, &batch)?;
                total += batch.len();
                batch.clear();
            }
        }

        if !batch.is_empty() {
            write_batch(&mut writer, &batch)?;
            total += batch.len();
        }

        writer.flush()?;
        writer.get_ref().sync_all()?;
        debug!(dump_tx, total, "dump batches written");

        Ok(())
    }

    /// Load `current.dump` into the engine. Returns the highest LSN present,
    /// or zero for a missing or empty file. A batch that fails to decode is
    /// a hard error.
    pub fn restore(&self) -> Result<Lsn> {
        let data = match std::fs::read(self.current_dump_path()) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        if data.is_empty() {
            return Ok(0);
        }

        let mut last_tx: Lsn = 0;
        let len = data.len() as u64;
        let mut cursor = Cursor::new(data);

        while cursor.position() < len {
            let batch: Vec<DumpElem> = codec::decode_from(&mut cursor).map_err(|e| Error::Dump {
                message: format!("decode dump batch at offset {}: {e}", cursor.position()),
            })?;

            for elem in &batch {
                self.engine.restore_dump_elem(elem);
                if elem.tx > last_tx {
                    last_tx = elem.tx;
                }
            }
        }

        Ok(last_tx)
    }

    /// Stop the periodic session cleanup.
    pub async fn shutdown(&self) {
        let Some(cleaner) = self.cleaner.lock().take() else {
            return;
        };

        let _ = cleaner.shutdown_tx.send(true);
        let _ = cleaner.handle.await;
    }

    fn start_session_cleanup(self: Arc<Self>) {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let dumper = Arc::clone(&self);

        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(sessions::CLEANUP_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => return,
                    _ = tick.tick() => dumper.cleanup_expired_sessions(),
                }
            }
        });

        *self.cleaner.lock() = Some(Cleaner {
            handle,
            shutdown_tx,
        });
    }
}

fn write_batch(writer: &mut BufWriter<File>, batch: &[DumpElem]) -> Result<()> {
    let encoded = codec::encode(&batch)?;
    writer.write_all(&encoded)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::DEFAULT_PARTITIONS;
    use fq_core::types::{BatchKey, TxContext};
    use fq_core::utils::now_unix_secs;
    use tempfile::TempDir;

    fn key(name: &str) -> BatchKey {
        BatchKey::new(name, "600").unwrap()
    }

    fn ctx(tx: Lsn) -> TxContext {
        TxContext {
            tx,
            dump_tx: 0,
            curr_time: now_unix_secs(),
            from_wal: false,
        }
    }

    #[tokio::test]
    async fn dump_then_restore_round_trip() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::new(DEFAULT_PARTITIONS, None, None).unwrap();
        let dumper = Dumper::new(Arc::clone(&engine), None, dir.path());

        engine.incr(ctx(1), &key("a"));
        engine.incr(ctx(2), &key("a"));
        engine.incr(ctx(3), &key("b"));

        dumper.dump(3).await.unwrap();
        assert_eq!(dumper.dump_version(), 1);

        let fresh_engine = Engine::new(DEFAULT_PARTITIONS, None, None).unwrap();
        let fresh_dumper = Dumper::new(Arc::clone(&fresh_engine), None, dir.path());
        let last_tx = fresh_dumper.restore().unwrap();

        assert_eq!(last_tx, 3);
        assert_eq!(fresh_engine.get(&key("a")), (2, true));
        assert_eq!(fresh_engine.get(&key("b")), (1, true));

        dumper.shutdown().await;
        fresh_dumper.shutdown().await;
    }

    #[tokio::test]
    async fn restore_without_dump_returns_zero() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::new(DEFAULT_PARTITIONS, None, None).unwrap();
        let dumper = Dumper::new(engine, None, dir.path());

        assert_eq!(dumper.restore().unwrap(), 0);

        // Zero-length file is treated the same way.
        std::fs::create_dir_all(dir.path()).unwrap();
        std::fs::write(dumper.current_dump_path(), b"").unwrap();
        assert_eq!(dumper.restore().unwrap(), 0);

        dumper.shutdown().await;
    }

    #[tokio::test]
    async fn restore_of_corrupt_dump_fails() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::new(DEFAULT_PARTITIONS, None, None).unwrap();
        let dumper = Dumper::new(engine, None, dir.path());

        std::fs::create_dir_all(dir.path()).unwrap();
        std::fs::write(dumper.current_dump_path(), [0xde, 0xad, 0xbe, 0xef]).unwrap();
        assert!(dumper.restore().is_err());

        dumper.shutdown().await;
    }

    #[tokio::test]
    async fn dump_at_cutoff_excludes_newer_state() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::new(DEFAULT_PARTITIONS, None, None).unwrap();
        let dumper = Dumper::new(Arc::clone(&engine), None, dir.path());

        engine.incr(ctx(1), &key("a"));
        // Newer than the cutoff; the snapshot keeps the LSN 1 state.
        engine.incr(
            TxContext {
                tx: 2,
                dump_tx: 1,
                curr_time: now_unix_secs(),
                from_wal: false,
            },
            &key("a"),
        );

        dumper.dump(1).await.unwrap();

        let fresh_engine = Engine::new(DEFAULT_PARTITIONS, None, None).unwrap();
        let fresh_dumper = Dumper::new(Arc::clone(&fresh_engine), None, dir.path());
        assert_eq!(fresh_dumper.restore().unwrap(), 1);
        assert_eq!(fresh_engine.get(&key("a")), (1, true));

        dumper.shutdown().await;
        fresh_dumper.shutdown().await;
    }
}
