//! Replication master.
//!
//! Serves replica requests over the framed transport: dump batches by read
//! session, and WAL segments by name order. One handler covers both kinds;
//! a non-empty session UUID marks a dump request.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};

use fq_core::error::Result;

use crate::dumper::Dumper;
use crate::wal::segment_upper_bound;

use super::protocol::{
    self, DumpRequest, DumpResponse, Request, WalRequest, WalResponse, MAX_REPLICAS,
    MAX_REPLICATION_MESSAGE_SIZE,
};
use super::transport::{read_message, write_message};

pub struct Master {
    address: String,
    wal_directory: PathBuf,
    dumper: Arc<Dumper>,
    idle_timeout: Duration,
}

impl Master {
    pub fn new(
        address: impl Into<String>,
        wal_directory: impl Into<PathBuf>,
        dumper: Arc<Dumper>,
        idle_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            address: address.into(),
            wal_directory: wal_directory.into(),
            dumper,
            idle_timeout,
        })
    }

    /// Accept replica connections until shutdown is signalled.
    pub async fn serve(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) -> Result<()> {
        let listener = TcpListener::bind(&self.address).await?;
        info!(address = %self.address, "replication master listening");

        let replicas = Arc::new(Semaphore::new(MAX_REPLICAS));

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => return Ok(()),
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            error!(error = %e, "failed to accept replica connection");
                            continue;
                        }
                    };

                    let Ok(permit) = Arc::clone(&replicas).try_acquire_owned() else {
                        warn!(%peer, "replica limit reached, rejecting connection");
                        continue;
                    };

                    debug!(%peer, "replica connected");
                    let master = Arc::clone(&self);
                    let conn_shutdown = shutdown_rx.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        master.handle_replica(stream, conn_shutdown).await;
                        debug!(%peer, "replica disconnected");
                    });
                }
            }
        }
    }

    async fn handle_replica(&self, mut stream: TcpStream, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            let request_data = tokio::select! {
                _ = shutdown_rx.changed() => return,
                read = tokio::time::timeout(
                    self.idle_timeout,
                    read_message(&mut stream, MAX_REPLICATION_MESSAGE_SIZE),
                ) => match read {
                    Ok(Ok(data)) => data,
                    // Idle deadline or broken connection closes the session.
                    _ => return,
                },
            };

            let response_data = match self.handle_request(&request_data).await {
                Ok(data) => data,
                Err(e) => {
                    error!(error = %e, "failed to handle replication request");
                    return;
                }
            };

            if let Err(e) =
                write_message(&mut stream, &response_data, MAX_REPLICATION_MESSAGE_SIZE).await
            {
                warn!(error = %e, "failed to write replication response");
                return;
            }
        }
    }

    async fn handle_request(&self, request_data: &[u8]) -> Result<Vec<u8>> {
        let request: Request = protocol::decode(request_data)?;

        if request.is_dump() {
            let response = self.synchronize_dump(&request.dump).await;
            return protocol::encode(&response);
        }

        let response = self.synchronize_wal(&request.wal);
        protocol::encode(&response)
    }

    async fn synchronize_dump(&self, request: &DumpRequest) -> DumpResponse {
        let (elems, has_more) = match self.dumper.get_next_data(&request.session_uuid).await {
            Ok(result) => result,
            Err(e) => {
                error!(
                    error = %e,
                    session_uuid = %request.session_uuid,
                    last_segment_number = request.last_segment_number,
                    "error getting next dump data"
                );
                return DumpResponse {
                    succeed: false,
                    ..Default::default()
                };
            }
        };

        if !has_more && elems.is_empty() {
            debug!(
                session_uuid = %request.session_uuid,
                "dump exhausted, ending dump synchronization"
            );
            return DumpResponse {
                succeed: true,
                end_of_dump: true,
                segment_data: Vec::new(),
            };
        }

        DumpResponse {
            succeed: true,
            end_of_dump: !has_more,
            segment_data: elems,
        }
    }

    fn synchronize_wal(&self, request: &WalRequest) -> WalResponse {
        let next_segment = match segment_upper_bound(&self.wal_directory, &request.last_segment_name)
        {
            Ok(name) => name,
            Err(e) => {
                error!(error = %e, "failed to find WAL segment");
                return WalResponse::default();
            }
        };

        let Some(segment_name) = next_segment else {
            // No newer segment. The slave's last segment may have grown;
            // re-send it in full and let LSN filtering dedup.
            if !request.last_segment_name.is_empty() {
                let last_path = self.wal_directory.join(&request.last_segment_name);
                if let Ok(data) = std::fs::read(&last_path) {
                    debug!(
                        segment_name = %request.last_segment_name,
                        segment_size = data.len(),
                        "re-sending possibly grown segment"
                    );
                    return WalResponse {
                        succeed: true,
                        segment_name: request.last_segment_name.clone(),
                        segment_data: data,
                    };
                }
            }

            debug!(
                last_segment_name = %request.last_segment_name,
                "no new WAL segments to replicate"
            );
            return WalResponse {
                succeed: true,
                ..Default::default()
            };
        };

        let path = self.wal_directory.join(&segment_name);
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) => {
                error!(error = %e, segment_name = %segment_name, "failed to read WAL segment");
                return WalResponse::default();
            }
        };

        info!(
            segment_name = %segment_name,
            last_segment_name = %request.last_segment_name,
            segment_size = data.len(),
            "sending WAL segment to replica"
        );

        WalResponse {
            succeed: true,
            segment_name,
            segment_data: data,
        }
    }
}
