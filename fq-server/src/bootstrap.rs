//! Server wiring.
//!
//! Builds the storage stack from configuration, recovers on-disk state,
//! starts replication for the configured role and serves the text protocol
//! until a shutdown signal arrives. Teardown order matters: replication
//! stops before the engine streams close, the WAL writer flushes last.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use fq_core::config::{Config, ReplicaType};
use fq_core::error::{Error, Result};
use fq_storage::dumper::Dumper;
use fq_storage::engine::{Engine, DEFAULT_PARTITIONS};
use fq_storage::replication::{Master, Slave, SlaveHandle};
use fq_storage::storage::Storage;
use fq_storage::wal::Wal;

use crate::database::Database;
use crate::server::TextServer;

pub async fn run(cfg: Config) -> Result<()> {
    let is_slave = cfg.replication.replica_type == ReplicaType::Slave;

    if is_slave && cfg.wal.is_none() {
        return Err(Error::Configuration {
            message: "a slave requires the wal section for segment storage".to_string(),
        });
    }

    let (wal_stream_tx, wal_stream_rx) = mpsc::channel(1);
    let (dump_stream_tx, dump_stream_rx) = mpsc::channel(1);

    let engine = Engine::new(DEFAULT_PARTITIONS, Some(wal_stream_rx), Some(dump_stream_rx))?;

    let wal = cfg.wal.as_ref().map(|wal_cfg| {
        Arc::new(Wal::new(
            &wal_cfg.data_directory,
            wal_cfg.flushing_batch_timeout,
            wal_cfg.flushing_batch_length,
            wal_cfg.max_segment_size,
            wal_stream_tx.clone(),
        ))
    });

    let dumper = Dumper::new(Arc::clone(&engine), wal.clone(), &cfg.dump.directory);

    let sync_commit = cfg
        .wal
        .as_ref()
        .map(|wal_cfg| wal_cfg.sync_commit.is_on())
        .unwrap_or(false);

    let storage = Storage::new(
        Arc::clone(&engine),
        wal.clone(),
        Arc::clone(&dumper),
        cfg.engine.clean_interval,
        cfg.dump.interval,
        sync_commit,
        is_slave,
    );

    info!("recovering storage state");
    storage.recover().await?;
    Arc::clone(&storage).start();

    let (shutdown_tx, _) = watch::channel(false);

    // Replication ships WAL segments; without a WAL there is nothing to
    // replicate.
    let mut slave_handle: Option<SlaveHandle> = None;
    let mut master_task = None;
    match (&wal, is_slave) {
        (Some(wal), false) => {
            let master = Master::new(
                cfg.replication.master_address.clone(),
                wal.directory(),
                Arc::clone(&dumper),
                cfg.replication.sync_interval * 3,
            );
            let shutdown_rx = shutdown_tx.subscribe();
            master_task = Some(tokio::spawn(async move {
                if let Err(e) = master.serve(shutdown_rx).await {
                    error!(error = %e, "replication master failed");
                }
            }));
        }
        (Some(wal), true) => {
            let slave = Slave::new(
                cfg.replication.master_address.clone(),
                cfg.replication.sync_interval,
                cfg.replication.sync_interval * 3,
                wal.directory(),
                storage.last_lsn(),
                wal_stream_tx.clone(),
                dump_stream_tx.clone(),
                engine.dump_applied(),
            );
            slave_handle = Some(slave.start());
        }
        (None, _) => warn!("wal is disabled, replication will not start"),
    }

    let database = Arc::new(Database::new(
        Arc::clone(&storage),
        cfg.network.max_message_size,
    ));
    let server = TextServer::new(
        cfg.network.address.clone(),
        cfg.network.max_connections,
        cfg.network.idle_timeout,
    );

    let server_shutdown_rx = shutdown_tx.subscribe();
    let server_task =
        tokio::spawn(async move { server.serve(database, server_shutdown_rx).await });

    let outcome = tokio::select! {
        _ = shutdown_signal() => {
            info!("shutdown signal received");
            Ok(())
        }
        joined = server_task => match joined {
            Ok(result) => result,
            Err(e) => Err(Error::Internal {
                message: format!("server task failed: {e}"),
            }),
        },
    };

    // Replicas must stop before the engine streams are torn down.
    let _ = shutdown_tx.send(true);
    if let Some(handle) = slave_handle {
        handle.shutdown().await;
    }
    if let Some(task) = master_task {
        let _ = task.await;
    }

    storage.shutdown().await;
    dumper.shutdown().await;
    info!("shutdown complete");

    outcome
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
