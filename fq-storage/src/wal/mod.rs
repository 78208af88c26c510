//! # Write-Ahead Log
//!
//! Group-committing, segmented mutation log.
//!
//! Producers append records into a shared batch under a mutex. A full batch
//! is handed to the single writer task over a one-slot channel; otherwise a
//! flush-timeout tick picks up whatever accumulated. The writer serializes
//! the batch as one length-prefixed frame, appends it to the active segment
//! (rotating by size first), fsyncs and then resolves every record's write
//! future. Sync-commit callers block on that future; async callers drop it.

mod file;
mod types;

pub use file::{
    list_segments, segment_file_name, segment_last, segment_upper_bound, FsReader, FsWriter,
    MAX_BATCH_ENCODED_SIZE, SEGMENT_PREFIX, SEGMENT_SUFFIX,
};
pub use types::{LogData, PendingLog, WriteFuture};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use fq_core::command::CommandId;
use fq_core::error::{Error, Result};
use fq_core::types::{BatchKey, Lsn, TxContext};

/// Bound on waiting for the writer task to drain at shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

struct Accumulator {
    batch: Mutex<Vec<PendingLog>>,
    batches_tx: mpsc::Sender<Vec<PendingLog>>,
    max_batch_size: usize,
}

struct Worker {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

pub struct Wal {
    accumulator: Arc<Accumulator>,
    batches_rx: Mutex<Option<mpsc::Receiver<Vec<PendingLog>>>>,
    worker: Mutex<Option<Worker>>,
    reader: FsReader,
    directory: PathBuf,
    stream: mpsc::Sender<Vec<LogData>>,
    flush_timeout: Duration,
    max_segment_size: usize,
}

impl Wal {
    pub fn new(
        directory: impl Into<PathBuf>,
        flush_timeout: Duration,
        max_batch_size: usize,
        max_segment_size: usize,
        stream: mpsc::Sender<Vec<LogData>>,
    ) -> Self {
        let directory = directory.into();
        let (batches_tx, batches_rx) = mpsc::channel(1);

        Self {
            accumulator: Arc::new(Accumulator {
                batch: Mutex::new(Vec::new()),
                batches_tx,
                max_batch_size,
            }),
            batches_rx: Mutex::new(Some(batches_rx)),
            worker: Mutex::new(None),
            reader: FsReader::new(directory.clone()),
            directory,
            stream,
            flush_timeout,
            max_segment_size,
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Spawn the writer task. Not called on replica instances, where the
    /// engine is driven by replication instead of local commits.
    pub fn start(&self) {
        let Some(batches_rx) = self.batches_rx.lock().take() else {
            warn!("WAL writer already started");
            return;
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let fs_writer = FsWriter::new(self.directory.clone(), self.max_segment_size);
        let accumulator = Arc::clone(&self.accumulator);
        let flush_timeout = self.flush_timeout;

        let handle = tokio::spawn(writer_loop(
            fs_writer,
            accumulator,
            batches_rx,
            shutdown_rx,
            flush_timeout,
        ));

        *self.worker.lock() = Some(Worker {
            handle,
            shutdown_tx,
        });
    }

    /// Flush the tail batch and stop the writer, bounded by 30 seconds.
    pub async fn shutdown(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };

        let _ = worker.shutdown_tx.send(true);
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, worker.handle)
            .await
            .is_err()
        {
            warn!("WAL shutdown timeout exceeded");
        }
    }

    pub async fn incr(&self, ctx: TxContext, key: &BatchKey) -> WriteFuture {
        let curr_time = format!("{:x}", ctx.curr_time);
        self.push(
            ctx.tx,
            CommandId::Incr,
            vec![key.key.clone(), key.batch_size_str.clone(), curr_time],
        )
        .await
    }

    pub async fn del(&self, ctx: TxContext, key: &BatchKey) -> WriteFuture {
        let curr_time = format!("{:x}", ctx.curr_time);
        self.push(
            ctx.tx,
            CommandId::Del,
            vec![key.key.clone(), key.batch_size_str.clone(), curr_time],
        )
        .await
    }

    pub async fn mdel(&self, ctx: TxContext, keys: &[BatchKey]) -> WriteFuture {
        let mut args = Vec::with_capacity(keys.len() * 2 + 1);
        args.push(format!("{:x}", ctx.curr_time));
        for key in keys {
            args.push(key.key.clone());
            args.push(key.batch_size_str.clone());
        }

        self.push(ctx.tx, CommandId::MDel, args).await
    }

    /// Read every segment, keep records beyond the dump cutoff and stream
    /// them to the engine. Returns the highest LSN on disk, or the cutoff
    /// itself when nothing is newer.
    pub async fn try_recover(&self, dump_last_lsn: Lsn) -> Result<Lsn> {
        let mut logs = self.reader.read_logs()?;
        if logs.is_empty() {
            return Ok(dump_last_lsn);
        }

        let Some(idx) = logs.iter().position(|log| log.lsn > dump_last_lsn) else {
            return Ok(dump_last_lsn);
        };

        let last_lsn = logs.last().map(|log| log.lsn).unwrap_or(dump_last_lsn);
        let tail = logs.split_off(idx);
        debug!(records = tail.len(), last_lsn, "recovering WAL tail");

        self.stream
            .send(tail)
            .await
            .map_err(|_| Error::WriteAheadLog {
                message: "engine WAL stream closed during recovery".to_string(),
                source: None,
            })?;

        Ok(last_lsn)
    }

    /// Delete segments fully covered by the dump at `lsn`.
    pub fn remove_past_segments(&self, lsn: Lsn) -> Result<()> {
        for name in list_segments(&self.directory)? {
            let path = self.directory.join(&name);
            let logs = self.reader.read_segment(&path)?;

            let Some(max_lsn) = logs.iter().map(|log| log.lsn).max() else {
                continue;
            };

            if max_lsn < lsn {
                debug!(segment = %name, max_lsn, "removing superseded WAL segment");
                std::fs::remove_file(&path)?;
            }
        }

        Ok(())
    }

    pub fn reader(&self) -> &FsReader {
        &self.reader
    }

    async fn push(&self, lsn: Lsn, command: CommandId, args: Vec<String>) -> WriteFuture {
        let (pending, future) = PendingLog::new(LogData {
            lsn,
            command_id: command.as_u32(),
            args,
        });

        let handoff = {
            let mut batch = self.accumulator.batch.lock();
            batch.push(pending);
            if batch.len() == self.accumulator.max_batch_size {
                Some(std::mem::take(&mut *batch))
            } else {
                None
            }
        };

        if let Some(batch) = handoff {
            if let Err(err) = self.accumulator.batches_tx.send(batch).await {
                for log in err.0 {
                    log.resolve(Err(Error::WriteAheadLog {
                        message: "WAL writer is not running".to_string(),
                        source: None,
                    }));
                }
            }
        }

        future
    }
}

async fn writer_loop(
    mut fs_writer: FsWriter,
    accumulator: Arc<Accumulator>,
    mut batches_rx: mpsc::Receiver<Vec<PendingLog>>,
    mut shutdown_rx: watch::Receiver<bool>,
    flush_timeout: Duration,
) {
    let mut tick = tokio::time::interval(flush_timeout);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                // Drain handed-off batches, then the accumulated tail.
                while let Ok(batch) = batches_rx.try_recv() {
                    fs_writer.write_batch(batch);
                }
                let tail = std::mem::take(&mut *accumulator.batch.lock());
                fs_writer.write_batch(tail);
                return;
            }
            Some(batch) = batches_rx.recv() => {
                fs_writer.write_batch(batch);
            }
            _ = tick.tick() => {
                let batch = std::mem::take(&mut *accumulator.batch.lock());
                fs_writer.write_batch(batch);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fq_core::utils::now_unix_secs;
    use tempfile::TempDir;

    fn batch_key(name: &str) -> BatchKey {
        BatchKey::new(name, "60").unwrap()
    }

    fn ctx(tx: Lsn) -> TxContext {
        TxContext {
            tx,
            dump_tx: 0,
            curr_time: now_unix_secs(),
            from_wal: false,
        }
    }

    fn new_wal(dir: &Path, stream: mpsc::Sender<Vec<LogData>>) -> Wal {
        Wal::new(dir, Duration::from_millis(5), 100, 10 << 20, stream)
    }

    #[tokio::test]
    async fn append_resolves_after_flush_tick() {
        let dir = TempDir::new().unwrap();
        let (stream_tx, _stream_rx) = mpsc::channel(1);
        let wal = new_wal(dir.path(), stream_tx);
        wal.start();

        let future = wal.incr(ctx(1), &batch_key("a")).await;
        future.wait().await.unwrap();
        wal.shutdown().await;

        let logs = FsReader::new(dir.path()).read_logs().unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].lsn, 1);
        assert_eq!(logs[0].args[1], "60");
    }

    #[tokio::test]
    async fn full_batch_is_handed_off_without_waiting_for_the_tick() {
        let dir = TempDir::new().unwrap();
        let (stream_tx, _stream_rx) = mpsc::channel(1);
        // Batch size 2 with a long flush timeout; only the handoff can
        // resolve the futures quickly.
        let wal = Wal::new(
            dir.path(),
            Duration::from_secs(60),
            2,
            10 << 20,
            stream_tx,
        );
        wal.start();

        let first = wal.incr(ctx(1), &batch_key("a")).await;
        let second = wal.incr(ctx(2), &batch_key("b")).await;

        tokio::time::timeout(Duration::from_secs(5), async {
            first.wait().await.unwrap();
            second.wait().await.unwrap();
        })
        .await
        .expect("group commit should flush a full batch");

        wal.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_flushes_accumulated_records() {
        let dir = TempDir::new().unwrap();
        let (stream_tx, _stream_rx) = mpsc::channel(1);
        let wal = Wal::new(
            dir.path(),
            Duration::from_secs(60),
            100,
            10 << 20,
            stream_tx,
        );
        wal.start();

        let future = wal.del(ctx(5), &batch_key("gone")).await;
        wal.shutdown().await;
        future.wait().await.unwrap();

        let logs = FsReader::new(dir.path()).read_logs().unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].command_id, CommandId::Del.as_u32());
    }

    #[tokio::test]
    async fn recovery_streams_only_records_past_the_cutoff() {
        let dir = TempDir::new().unwrap();
        let (stream_tx, mut stream_rx) = mpsc::channel(1);
        let wal = new_wal(dir.path(), stream_tx);
        wal.start();

        for lsn in 1..=4 {
            wal.incr(ctx(lsn), &batch_key("k")).await.wait().await.unwrap();
        }
        wal.shutdown().await;

        let last = wal.try_recover(2).await.unwrap();
        assert_eq!(last, 4);

        let tail = stream_rx.recv().await.unwrap();
        let lsns: Vec<Lsn> = tail.iter().map(|log| log.lsn).collect();
        assert_eq!(lsns, vec![3, 4]);
    }

    #[tokio::test]
    async fn recovery_of_fully_dumped_wal_returns_the_cutoff() {
        let dir = TempDir::new().unwrap();
        let (stream_tx, _stream_rx) = mpsc::channel(1);
        let wal = new_wal(dir.path(), stream_tx);
        wal.start();
        wal.incr(ctx(1), &batch_key("k")).await.wait().await.unwrap();
        wal.shutdown().await;

        assert_eq!(wal.try_recover(7).await.unwrap(), 7);
        assert_eq!(wal.try_recover(1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn mdel_record_layout() {
        let dir = TempDir::new().unwrap();
        let (stream_tx, _stream_rx) = mpsc::channel(1);
        let wal = new_wal(dir.path(), stream_tx);
        wal.start();

        let context = ctx(9);
        wal.mdel(context, &[batch_key("a"), batch_key("b")])
            .await
            .wait()
            .await
            .unwrap();
        wal.shutdown().await;

        let logs = FsReader::new(dir.path()).read_logs().unwrap();
        assert_eq!(logs.len(), 1);
        let record = &logs[0];
        assert_eq!(record.command_id, CommandId::MDel.as_u32());
        assert_eq!(record.args[0], format!("{:x}", context.curr_time));
        assert_eq!(&record.args[1..], &["a", "60", "b", "60"]);
    }

    #[tokio::test]
    async fn remove_past_segments_keeps_newer_records() {
        let dir = TempDir::new().unwrap();
        let (stream_tx, _stream_rx) = mpsc::channel(1);

        // Two segments: rotate by writing with a 1-byte size cap.
        let mut fs_writer = FsWriter::new(dir.path(), 1);
        for lsn in [1u64, 2] {
            let (log, fut) = PendingLog::new(LogData {
                lsn,
                command_id: CommandId::Incr.as_u32(),
                args: vec!["k".into(), "60".into(), "0".into()],
            });
            fs_writer.write_batch(vec![log]);
            fut.wait().await.unwrap();
            std::thread::sleep(Duration::from_millis(2));
        }

        let wal = new_wal(dir.path(), stream_tx);
        wal.remove_past_segments(2).unwrap();

        let logs = FsReader::new(dir.path()).read_logs().unwrap();
        let lsns: Vec<Lsn> = logs.iter().map(|log| log.lsn).collect();
        assert_eq!(lsns, vec![2]);
    }
}
