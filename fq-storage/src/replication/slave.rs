//! Replication slave.
//!
//! A single sync loop with two phases. Phase one drains the master's dump
//! through a read session and pushes the batches onto the engine's dump
//! stream; once the final batch is applied (the engine's applied counter
//! catches up) phase two tails the WAL: every sync interval the slave asks
//! for the segment after its last one, persists what it gets, and forwards
//! the records whose LSN it has not yet applied.
//!
//! LSN is the sole dedup authority: re-received segments and overlap between
//! dump and WAL resolve to at-most-once application.

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use fq_core::error::{Error, Result};
use fq_core::types::DumpElem;

use crate::wal::{segment_last, FsReader, LogData};

use super::protocol::{self, DumpResponse, Request, WalResponse, MAX_REPLICATION_MESSAGE_SIZE};
use super::transport::ReplicaClient;

const MAX_SYNC_RETRIES: u32 = 10;
const MAX_RECONNECT_ATTEMPTS: u32 = 5;
const BASE_RETRY_DELAY: Duration = Duration::from_secs(1);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(5 * 60);

pub struct Slave {
    master_address: String,
    sync_interval: Duration,
    idle_timeout: Duration,
    wal_directory: PathBuf,
    fs_reader: FsReader,

    wal_stream: mpsc::Sender<Vec<LogData>>,
    dump_stream: mpsc::Sender<Vec<DumpElem>>,
    dump_applied_rx: watch::Receiver<u64>,

    client: Option<ReplicaClient>,
    session_uuid: String,

    read_dump: bool,
    dump_applied_seen: bool,
    enqueued_dump_batches: u64,
    dump_last_segment_number: u64,

    last_segment_name: String,
    last_applied_lsn: u64,

    consecutive_errors: u32,
}

pub struct SlaveHandle {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl SlaveHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.handle.await;
    }
}

impl Slave {
    /// `last_applied_lsn` seeds the dedup floor with whatever local
    /// recovery already replayed, so re-sent segments do not double-apply
    /// after a restart.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        master_address: impl Into<String>,
        sync_interval: Duration,
        idle_timeout: Duration,
        wal_directory: impl Into<PathBuf>,
        last_applied_lsn: u64,
        wal_stream: mpsc::Sender<Vec<LogData>>,
        dump_stream: mpsc::Sender<Vec<DumpElem>>,
        dump_applied_rx: watch::Receiver<u64>,
    ) -> Self {
        let wal_directory = wal_directory.into();

        // Resume WAL tailing from whatever segment was saved last.
        let last_segment_name = match segment_last(&wal_directory) {
            Ok(name) => name.unwrap_or_default(),
            Err(e) => {
                error!(error = %e, "failed to find last WAL segment");
                String::new()
            }
        };

        Self {
            master_address: master_address.into(),
            sync_interval,
            idle_timeout,
            fs_reader: FsReader::new(wal_directory.clone()),
            wal_directory,
            wal_stream,
            dump_stream,
            dump_applied_rx,
            client: None,
            session_uuid: uuid::Uuid::new_v4().to_string(),
            read_dump: true,
            dump_applied_seen: false,
            enqueued_dump_batches: 0,
            dump_last_segment_number: 0,
            last_segment_name,
            last_applied_lsn,
            consecutive_errors: 0,
        }
    }

    pub fn start(self) -> SlaveHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(self.run(shutdown_rx));

        SlaveHandle {
            shutdown_tx,
            handle,
        }
    }

    async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            master = %self.master_address,
            session_uuid = %self.session_uuid,
            "replication slave started"
        );

        loop {
            if *shutdown_rx.borrow() {
                return;
            }

            if self.read_dump {
                match self.synchronize_dump().await {
                    Ok(()) => self.reset_retry_state(),
                    Err(e) => {
                        if self.handle_sync_error(e, "dump", &mut shutdown_rx).await {
                            return;
                        }
                    }
                }
                continue;
            }

            // The dump must be fully in the engine before WAL records are
            // applied on top of it.
            if !self.dump_applied_seen {
                if self.wait_dump_applied(&mut shutdown_rx).await {
                    return;
                }
                self.dump_applied_seen = true;
                info!("dump fully applied, WAL synchronization starting");
            }

            let delay = self.retry_delay();
            tokio::select! {
                _ = shutdown_rx.changed() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            match self.synchronize_wal().await {
                Ok(()) => self.reset_retry_state(),
                Err(e) => {
                    if self.handle_sync_error(e, "wal", &mut shutdown_rx).await {
                        return;
                    }
                }
            }
        }
    }

    async fn synchronize_dump(&mut self) -> Result<()> {
        let request = Request::dump_request(&self.session_uuid, self.dump_last_segment_number);
        let request_data = protocol::encode(&request)?;

        let response_data = self.send_with_reconnect(&request_data).await?;
        let response: DumpResponse = protocol::decode(&response_data)?;

        if !response.succeed {
            // The session may have been invalidated by a newer dump; restart
            // the sync under a fresh session. Re-received elements are
            // harmless, restore overwrites in place.
            self.session_uuid = uuid::Uuid::new_v4().to_string();
            return Err(Error::Replication {
                message: "master reported dump sync failure".to_string(),
            });
        }

        self.read_dump = !response.end_of_dump;

        if let Some(max_tx) = response.segment_data.iter().map(|elem| elem.tx).max() {
            if max_tx > self.dump_last_segment_number {
                self.dump_last_segment_number = max_tx;
            }
        }

        self.dump_stream
            .send(response.segment_data)
            .await
            .map_err(|_| Error::Replication {
                message: "engine dump stream closed".to_string(),
            })?;
        self.enqueued_dump_batches += 1;

        if response.end_of_dump {
            info!(
                session_uuid = %self.session_uuid,
                last_segment_number = self.dump_last_segment_number,
                "dump synchronization completed, waiting for engine to apply"
            );
        }

        Ok(())
    }

    async fn synchronize_wal(&mut self) -> Result<()> {
        let request = Request::wal_request(&self.last_segment_name);
        let request_data = protocol::encode(&request)?;

        let response_data = self.send_with_reconnect(&request_data).await?;
        let response: WalResponse = protocol::decode(&response_data)?;

        if !response.succeed {
            return Err(Error::Replication {
                message: "master reported WAL sync failure".to_string(),
            });
        }

        if response.segment_name.is_empty() {
            debug!(
                last_segment_name = %self.last_segment_name,
                "no new WAL segments from replication"
            );
            return Ok(());
        }

        self.save_wal_segment(&response.segment_name, &response.segment_data)?;
        self.apply_segment(&response.segment_data, &response.segment_name)
            .await?;
        self.last_segment_name = response.segment_name;

        Ok(())
    }

    async fn apply_segment(&mut self, segment_data: &[u8], segment_name: &str) -> Result<()> {
        let mut logs = self.fs_reader.read_segment_data(segment_data)?;
        logs.sort_by_key(|log| log.lsn);

        let floor = self.dump_last_segment_number.max(self.last_applied_lsn);
        let tail: Vec<LogData> = logs.into_iter().filter(|log| log.lsn > floor).collect();

        let Some(last) = tail.last() else {
            debug!(
                segment_name,
                floor, "skipping replicated segment, all records already applied"
            );
            return Ok(());
        };

        self.last_applied_lsn = last.lsn;
        self.wal_stream
            .send(tail)
            .await
            .map_err(|_| Error::Replication {
                message: "engine WAL stream closed".to_string(),
            })?;

        Ok(())
    }

    fn save_wal_segment(&self, segment_name: &str, segment_data: &[u8]) -> Result<()> {
        std::fs::create_dir_all(&self.wal_directory)?;

        let path = self.wal_directory.join(segment_name);
        std::fs::write(&path, segment_data)?;
        let file = std::fs::OpenOptions::new().read(true).open(&path)?;
        file.sync_all()?;

        Ok(())
    }

    async fn send_with_reconnect(&mut self, request: &[u8]) -> Result<Vec<u8>> {
        if self.client.is_none() {
            self.reconnect().await?;
        }

        let client = self.client.as_ref().expect("client connected");
        match client.send(request).await {
            Ok(response) => Ok(response),
            Err(e) if e.is_network() => {
                warn!(error = %e, "network error during sync, attempting reconnection");
                self.reconnect().await?;
                self.client
                    .as_ref()
                    .expect("client connected")
                    .send(request)
                    .await
            }
            Err(e) => Err(e),
        }
    }

    /// Re-dial the master with exponential backoff. Only one reconnect runs
    /// at a time by construction; the sync loop is single-task.
    async fn reconnect(&mut self) -> Result<()> {
        self.client = None;

        let mut delay = BASE_RETRY_DELAY;
        for attempt in 1..=MAX_RECONNECT_ATTEMPTS {
            match ReplicaClient::connect(
                &self.master_address,
                MAX_REPLICATION_MESSAGE_SIZE,
                self.idle_timeout,
            )
            .await
            {
                Ok(client) => {
                    self.client = Some(client);
                    info!(attempt, "connected to master");
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        attempt,
                        max_attempts = MAX_RECONNECT_ATTEMPTS,
                        delay_ms = delay.as_millis() as u64,
                        "connection attempt failed"
                    );
                }
            }

            if attempt < MAX_RECONNECT_ATTEMPTS {
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(MAX_RETRY_DELAY);
            }
        }

        Err(Error::Replication {
            message: format!("failed to connect after {MAX_RECONNECT_ATTEMPTS} attempts"),
        })
    }

    /// Wait until the engine's applied-batch counter catches up with what
    /// this loop enqueued. Returns true when shutdown interrupted the wait.
    async fn wait_dump_applied(&mut self, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
        loop {
            if *self.dump_applied_rx.borrow() >= self.enqueued_dump_batches {
                return false;
            }

            tokio::select! {
                _ = shutdown_rx.changed() => return true,
                changed = self.dump_applied_rx.changed() => {
                    if changed.is_err() {
                        return true;
                    }
                }
            }
        }
    }

    /// Returns true when shutdown interrupted the backoff sleep.
    async fn handle_sync_error(
        &mut self,
        error: Error,
        sync_kind: &str,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> bool {
        self.consecutive_errors += 1;
        error!(
            error = %error,
            sync_kind,
            consecutive_errors = self.consecutive_errors,
            max_retries = MAX_SYNC_RETRIES,
            "synchronization error"
        );

        if self.consecutive_errors >= MAX_SYNC_RETRIES {
            error!(
                max_retries = MAX_SYNC_RETRIES,
                "max retries reached, entering wait mode"
            );
            let interrupted = tokio::select! {
                _ = shutdown_rx.changed() => true,
                _ = tokio::time::sleep(MAX_RETRY_DELAY) => false,
            };
            self.consecutive_errors = 0;
            return interrupted;
        }

        false
    }

    /// Exponential backoff schedule; the plain sync interval while healthy.
    fn retry_delay(&self) -> Duration {
        if self.consecutive_errors == 0 {
            return self.sync_interval;
        }

        let mut delay = BASE_RETRY_DELAY;
        for _ in 1..self.consecutive_errors.min(10) {
            delay = delay.saturating_mul(2);
            if delay >= MAX_RETRY_DELAY {
                return MAX_RETRY_DELAY;
            }
        }

        delay
    }

    fn reset_retry_state(&mut self) {
        if self.consecutive_errors > 0 {
            info!(
                previous_errors = self.consecutive_errors,
                "synchronization restored, resetting error counter"
            );
            self.consecutive_errors = 0;
        }
    }
}
