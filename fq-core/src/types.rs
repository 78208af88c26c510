//! # Core Types
//!
//! Fundamental data structures shared by the storage engine, the WAL,
//! the dumper and the replication layer.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Log sequence number of a committed mutation. Strictly increasing on the
/// master; `NO_TX` (zero) means "none".
pub type Lsn = u64;

/// Sentinel LSN for cells that have never been written.
pub const NO_TX: Lsn = 0;

/// Wall-clock seconds used for window math.
pub type TxTime = u32;

/// Counter value.
pub type Value = i64;

/// Maximum key length in bytes.
pub const MAX_KEY_LENGTH: usize = 1024;

pub const MIN_BATCH_SIZE: u64 = 1;
pub const MAX_BATCH_SIZE: u64 = u32::MAX as u64;

/// A validated (key, batch-size) pair addressing one counter cell.
///
/// The decimal form of the batch size is cached at validation time; the WAL
/// encodes it into record arguments on every mutation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BatchKey {
    pub key: String,
    pub batch_size: u32,
    pub batch_size_str: String,
}

impl BatchKey {
    /// Validate raw request arguments into a `BatchKey`.
    pub fn new(key: &str, batch_size_str: &str) -> Result<Self> {
        if key.is_empty() {
            return Err(Error::KeyEmpty);
        }
        if key.len() > MAX_KEY_LENGTH {
            return Err(Error::KeyTooLong);
        }

        let batch_size: u64 = batch_size_str
            .parse()
            .map_err(|_| Error::BatchSizeNotNumber)?;
        if !(MIN_BATCH_SIZE..=MAX_BATCH_SIZE).contains(&batch_size) {
            return Err(Error::InvalidBatchSize { got: batch_size });
        }

        Ok(Self {
            key: key.to_string(),
            batch_size: batch_size as u32,
            batch_size_str: batch_size_str.to_string(),
        })
    }

    /// Build pairs from a flat `[k1, bs1, k2, bs2, …]` argument list.
    pub fn from_pairs(args: &[String]) -> Result<Vec<Self>> {
        if args.len() % 2 != 0 {
            return Err(Error::InvalidArguments);
        }

        let mut keys = Vec::with_capacity(args.len() / 2);
        for pair in args.chunks_exact(2) {
            keys.push(Self::new(&pair[0], &pair[1])?);
        }

        Ok(keys)
    }
}

impl fmt::Display for BatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.key, self.batch_size)
    }
}

/// One counter cell as it appears in a dump file and in replication dump
/// batches. `tx` is the LSN of the last mutation the snapshot observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpElem {
    pub key: String,
    pub batch_size: u32,
    pub value: Value,
    pub tx_at: TxTime,
    pub tx: Lsn,
}

/// Commit-time context threaded through every mutating operation.
///
/// `dump_tx <= tx` always holds; `from_wal` marks replay paths (recovery and
/// replication), where already-expired writes become no-ops.
#[derive(Debug, Clone, Copy, Default)]
pub struct TxContext {
    pub tx: Lsn,
    pub dump_tx: Lsn,
    pub curr_time: TxTime,
    pub from_wal: bool,
}
