//! # Storage Facade
//!
//! Top-level commit coordinator. Owns the LSN allocator and the last-dump
//! LSN, orders every mutation as WAL-then-engine, and drives the background
//! expiry sweep and dump cycle.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use fq_core::error::{Error, Result};
use fq_core::types::{BatchKey, Lsn, TxContext, Value};
use fq_core::utils::now_unix_secs;

use crate::dumper::Dumper;
use crate::engine::Engine;
use crate::wal::Wal;

/// Bound on waiting for background loops to stop.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Storage {
    engine: Arc<Engine>,
    wal: Option<Arc<Wal>>,
    dumper: Arc<Dumper>,

    tx: AtomicU64,
    dump_tx: AtomicU64,

    sync_commit: bool,
    read_only: bool,
    clean_interval: Duration,
    dump_interval: Duration,

    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Storage {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: Arc<Engine>,
        wal: Option<Arc<Wal>>,
        dumper: Arc<Dumper>,
        clean_interval: Duration,
        dump_interval: Duration,
        sync_commit: bool,
        read_only: bool,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);

        Arc::new(Self {
            engine,
            wal,
            dumper,
            tx: AtomicU64::new(0),
            dump_tx: AtomicU64::new(0),
            sync_commit,
            read_only,
            clean_interval,
            dump_interval,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Recover on-disk state: dump first, then the WAL tail past the dump
    /// cutoff. Seeds the LSN allocator with the highest LSN seen.
    pub async fn recover(&self) -> Result<()> {
        let dump_last_lsn = self.dumper.restore()?;
        self.dump_tx.store(dump_last_lsn, Ordering::SeqCst);

        let mut last_lsn = dump_last_lsn;
        if let Some(wal) = &self.wal {
            last_lsn = wal.try_recover(dump_last_lsn).await?;
        }

        self.tx.store(last_lsn.max(dump_last_lsn), Ordering::SeqCst);
        info!(dump_last_lsn, last_lsn, "storage recovered");

        Ok(())
    }

    /// Start the WAL writer and background loops. On a replica only the
    /// expiry sweep runs; replication drives the engine and dumps are the
    /// master's business.
    pub fn start(self: Arc<Self>) {
        if !self.read_only {
            if let Some(wal) = &self.wal {
                wal.start();
            }
        }

        let mut tasks = Vec::new();

        {
            let storage = Arc::clone(&self);
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(storage.clean_interval);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = shutdown_rx.changed() => return,
                        _ = tick.tick() => storage.engine.clean(),
                    }
                }
            }));
        }

        if !self.read_only {
            let storage = Arc::clone(&self);
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                let mut tick = tokio::time::interval(storage.dump_interval);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = shutdown_rx.changed() => return,
                        _ = tick.tick() => {
                            if let Err(e) = storage.dump().await {
                                error!(error = %e, "failed to create dump");
                            }
                        }
                    }
                }
            }));
        }

        self.tasks.lock().extend(tasks);
    }

    /// Stop background loops and the WAL writer, bounded by 30 seconds.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, task).await.is_err() {
                warn!("storage background task exceeded shutdown timeout");
            }
        }

        if let Some(wal) = &self.wal {
            wal.shutdown().await;
        }
    }

    pub async fn incr(&self, key: &BatchKey) -> Result<Value> {
        let ctx = self.begin()?;

        if let Some(wal) = &self.wal {
            let future = wal.incr(ctx, key).await;
            if self.sync_commit {
                future.wait().await?;
            }
        }

        Ok(self.engine.incr(ctx, key))
    }

    pub async fn get(&self, key: &BatchKey) -> Result<Value> {
        let (value, _) = self.engine.get(key);
        Ok(value)
    }

    pub async fn del(&self, key: &BatchKey) -> Result<bool> {
        let ctx = self.begin()?;

        if let Some(wal) = &self.wal {
            let future = wal.del(ctx, key).await;
            if self.sync_commit {
                future.wait().await?;
            }
        }

        Ok(self.engine.del(ctx, key))
    }

    /// Delete several keys under one LSN and one WAL record.
    pub async fn mdel(&self, keys: &[BatchKey]) -> Result<Vec<bool>> {
        let ctx = self.begin()?;

        if let Some(wal) = &self.wal {
            let future = wal.mdel(ctx, keys).await;
            if self.sync_commit {
                future.wait().await?;
            }
        }

        Ok(self.engine.mdel(ctx, keys))
    }

    /// WATCH reads like GET; no subscription protocol is defined yet.
    pub async fn watch(&self, key: &BatchKey) -> Result<Value> {
        self.get(key).await
    }

    /// Snapshot the engine at the current LSN high-water mark.
    pub async fn dump(&self) -> Result<()> {
        let dump_tx = self.tx.load(Ordering::SeqCst);
        self.dump_tx.store(dump_tx, Ordering::SeqCst);

        info!(dump_tx, "start of dump creation");
        self.dumper.dump(dump_tx).await
    }

    pub fn last_lsn(&self) -> Lsn {
        self.tx.load(Ordering::SeqCst)
    }

    pub fn dump_lsn(&self) -> Lsn {
        self.dump_tx.load(Ordering::SeqCst)
    }

    fn begin(&self) -> Result<TxContext> {
        if self.read_only {
            return Err(Error::ReadOnlyReplica);
        }

        Ok(TxContext {
            tx: self.tx.fetch_add(1, Ordering::SeqCst) + 1,
            dump_tx: self.dump_tx.load(Ordering::SeqCst),
            curr_time: now_unix_secs(),
            from_wal: false,
        })
    }
}
