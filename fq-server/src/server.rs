//! TCP text server.
//!
//! Newline-framed request/response loop: one task per accepted connection,
//! a semaphore capping concurrency, and an idle-timeout read deadline per
//! iteration.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};

use fq_core::error::Result;

use crate::database::Database;

pub struct TextServer {
    address: String,
    max_connections: usize,
    idle_timeout: Duration,
}

impl TextServer {
    pub fn new(address: impl Into<String>, max_connections: usize, idle_timeout: Duration) -> Self {
        Self {
            address: address.into(),
            max_connections,
            idle_timeout,
        }
    }

    /// Accept and serve client connections until shutdown is signalled.
    pub async fn serve(
        &self,
        database: Arc<Database>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Result<()> {
        let listener = TcpListener::bind(&self.address).await?;
        info!(address = %self.address, "server listening");

        let connections = Arc::new(Semaphore::new(self.max_connections));

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    info!("server shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            error!(error = %e, "failed to accept connection");
                            continue;
                        }
                    };

                    let Ok(permit) = Arc::clone(&connections).try_acquire_owned() else {
                        warn!(%peer, "connection limit reached, rejecting");
                        continue;
                    };

                    debug!(%peer, "accepted connection");
                    let database = Arc::clone(&database);
                    let idle_timeout = self.idle_timeout;
                    let conn_shutdown = shutdown_rx.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        handle_connection(stream, database, idle_timeout, conn_shutdown).await;
                        debug!(%peer, "connection closed");
                    });
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    database: Arc<Database>,
    idle_timeout: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    loop {
        line.clear();

        let read = tokio::select! {
            _ = shutdown_rx.changed() => return,
            read = tokio::time::timeout(idle_timeout, reader.read_line(&mut line)) => read,
        };

        match read {
            // Idle deadline expired; drop the connection.
            Err(_) => return,
            Ok(Err(e)) => {
                warn!(error = %e, "failed to read request");
                return;
            }
            // EOF: client went away.
            Ok(Ok(0)) => return,
            Ok(Ok(_)) => {}
        }

        let request = line.trim_end_matches(['\r', '\n']);
        if request.is_empty() {
            continue;
        }

        let mut response = database.handle_query(request).await;
        response.push('\n');

        if let Err(e) = write_half.write_all(response.as_bytes()).await {
            warn!(error = %e, "failed to write response");
            return;
        }
    }
}
