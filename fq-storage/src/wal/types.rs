//! WAL record types and the per-record write future.

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use fq_core::error::{Error, Result};
use fq_core::types::Lsn;

/// One logged mutation. `command_id` is a stable `CommandId` wire value;
/// `args` carry `[key, batchSize, currTimeHex]` for INCR/DEL and
/// `[currTimeHex, key1, batchSize1, …]` for MDEL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogData {
    pub lsn: Lsn,
    pub command_id: u32,
    pub args: Vec<String>,
}

/// Resolves once the record's batch has been written and fsynced.
pub struct WriteFuture {
    rx: oneshot::Receiver<Result<()>>,
}

impl WriteFuture {
    pub async fn wait(self) -> Result<()> {
        match self.rx.await {
            Ok(result) => result,
            // Writer dropped the ack without resolving it; only happens when
            // the WAL is torn down mid-flight.
            Err(_) => Err(Error::WriteAheadLog {
                message: "write acknowledgement channel closed".to_string(),
                source: None,
            }),
        }
    }
}

/// A record queued for group commit together with its acknowledgement side.
pub struct PendingLog {
    pub data: LogData,
    ack: oneshot::Sender<Result<()>>,
}

impl PendingLog {
    pub fn new(data: LogData) -> (Self, WriteFuture) {
        let (ack, rx) = oneshot::channel();
        (Self { data, ack }, WriteFuture { rx })
    }

    pub fn resolve(self, result: Result<()>) {
        // The producer may have dropped the future (async commit); that is
        // not an error.
        let _ = self.ack.send(result);
    }
}
