//! # In-Memory Engine
//!
//! Partitioned counter store. Requests are fanned out to partitions by an
//! FNV-1a hash of the key; each partition is an independently locked hash
//! table of window-aware counter cells.
//!
//! The engine also owns the consuming side of two optional streams:
//! - a WAL stream carrying replayed log records (crash recovery and
//!   replication tailing),
//! - a dump stream carrying snapshot elements (replica bootstrap).
//!
//! Every applied dump batch bumps a watch counter so the replication slave
//! can tell when the snapshot is fully in memory before tailing the WAL.

mod elem;
mod table;

pub use elem::CounterElem;
pub use table::Partition;

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error};

use fq_core::command::CommandId;
use fq_core::error::{Error, Result};
use fq_core::types::{BatchKey, DumpElem, Lsn, TxContext, TxTime, Value};
use fq_core::utils::now_unix_secs;

use crate::wal::LogData;

/// Grace period past the window end before a cell may be evicted.
pub const EXPIRE_DELTA: TxTime = 60;

/// Partition count of the in-memory engine.
pub const DEFAULT_PARTITIONS: usize = 10;

/// Capacity of the dump iterator channel.
const DUMP_CHANNEL_CAPACITY: usize = 1;

pub fn start_of_batch(curr_time: TxTime, batch_size: TxTime) -> TxTime {
    curr_time / batch_size * batch_size
}

pub fn end_of_batch(curr_time: TxTime, batch_size: TxTime) -> TxTime {
    start_of_batch(curr_time, batch_size) + batch_size - 1
}

/// The window holding `curr_time` has fully passed.
pub fn is_expired(curr_time: TxTime, batch_size: TxTime) -> bool {
    now_unix_secs() > end_of_batch(curr_time, batch_size)
}

/// The window has passed and the grace period elapsed too.
pub fn is_expired_with_delta(curr_time: TxTime, batch_size: TxTime) -> bool {
    now_unix_secs() > end_of_batch(curr_time, batch_size) + EXPIRE_DELTA
}

pub struct Engine {
    partitions: Vec<Partition>,
    dump_applied: watch::Sender<u64>,
}

impl Engine {
    /// Build the engine and spawn consumers for whichever streams are wired.
    pub fn new(
        partitions_number: usize,
        wal_stream: Option<mpsc::Receiver<Vec<LogData>>>,
        dump_stream: Option<mpsc::Receiver<Vec<DumpElem>>>,
    ) -> Result<Arc<Self>> {
        if partitions_number == 0 {
            return Err(Error::Internal {
                message: "partitions number must be positive".to_string(),
            });
        }

        let (dump_applied, _) = watch::channel(0u64);
        let engine = Arc::new(Self {
            partitions: (0..partitions_number).map(|_| Partition::new()).collect(),
            dump_applied,
        });

        if let Some(mut rx) = wal_stream {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                while let Some(logs) = rx.recv().await {
                    engine.apply_logs(&logs);
                }
            });
        }

        if let Some(mut rx) = dump_stream {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                while let Some(batch) = rx.recv().await {
                    engine.apply_dump(&batch);
                }
            });
        }

        Ok(engine)
    }

    pub fn incr(&self, ctx: TxContext, key: &BatchKey) -> Value {
        // Replaying a write whose window already passed must not resurrect
        // the counter.
        if ctx.from_wal && is_expired(ctx.curr_time, key.batch_size as TxTime) {
            return 0;
        }

        let value = self.partition(&key.key).incr(ctx, key);
        debug!(tx = ctx.tx, %key, value, "incr");
        value
    }

    pub fn get(&self, key: &BatchKey) -> (Value, bool) {
        let (value, found) = self.partition(&key.key).get(key, now_unix_secs());
        debug!(%key, value, found, "get");
        (value, found)
    }

    pub fn del(&self, ctx: TxContext, key: &BatchKey) -> bool {
        if ctx.from_wal && is_expired(ctx.curr_time, key.batch_size as TxTime) {
            return false;
        }

        let removed = self.partition(&key.key).del(key);
        debug!(tx = ctx.tx, %key, removed, "del");
        removed
    }

    pub fn mdel(&self, ctx: TxContext, keys: &[BatchKey]) -> Vec<bool> {
        keys.iter().map(|key| self.del(ctx, key)).collect()
    }

    /// Evict expired cells from every partition.
    pub fn clean(&self) {
        let removed: usize = self.partitions.iter().map(Partition::clean).sum();
        if removed > 0 {
            debug!(removed, "engine clean pass");
        }
    }

    /// Stream every non-expired cell's state at the `dump_tx` cutoff.
    ///
    /// Partition entry lists are snapshotted under the partition lock and
    /// emitted without it. Cells whose state is entirely newer than the
    /// cutoff are skipped; a later dump will cover them.
    pub fn dump(self: Arc<Self>, dump_tx: Lsn) -> mpsc::Receiver<DumpElem> {
        let (tx, rx) = mpsc::channel(DUMP_CHANNEL_CAPACITY);
        let engine = self;

        tokio::spawn(async move {
            for partition in &engine.partitions {
                for (key, batch_size, elem) in partition.snapshot() {
                    if is_expired(elem.last_tx_at(), elem.batch_size()) {
                        continue;
                    }

                    let Some((value, tx_at, ver)) = elem.dump_value(dump_tx) else {
                        continue;
                    };

                    let sent = tx
                        .send(DumpElem {
                            key,
                            batch_size,
                            value,
                            tx_at,
                            tx: ver,
                        })
                        .await;
                    if sent.is_err() {
                        return;
                    }
                }
            }
        });

        rx
    }

    /// Insert one dump element, dropping it if its window already passed.
    pub fn restore_dump_elem(&self, elem: &DumpElem) {
        if is_expired(elem.tx_at, elem.batch_size as TxTime) {
            return;
        }

        self.partition(&elem.key).restore(elem);
    }

    /// Observer for the number of dump batches applied via the dump stream.
    pub fn dump_applied(&self) -> watch::Receiver<u64> {
        self.dump_applied.subscribe()
    }

    pub fn len(&self) -> usize {
        self.partitions.iter().map(Partition::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.iter().all(Partition::is_empty)
    }

    fn apply_logs(&self, logs: &[LogData]) {
        for log in logs {
            match CommandId::from_u32(log.command_id) {
                CommandId::Incr => self.apply_incr_from_log(log),
                CommandId::Del => self.apply_del_from_log(log),
                CommandId::MDel => self.apply_mdel_from_log(log),
                other => {
                    error!(command_id = log.command_id, ?other, "unexpected command in WAL record");
                }
            }
        }
    }

    fn apply_incr_from_log(&self, log: &LogData) {
        if log.args.len() < 3 {
            error!(lsn = log.lsn, args = log.args.len(), "short INCR record");
            return;
        }
        match parse_wal_key_and_ctx(log.lsn, &log.args[0], &log.args[1], &log.args[2]) {
            Ok((key, ctx)) => {
                self.incr(ctx, &key);
            }
            Err(e) => error!(lsn = log.lsn, error = %e, "corrupt INCR record"),
        }
    }

    fn apply_del_from_log(&self, log: &LogData) {
        if log.args.len() < 3 {
            error!(lsn = log.lsn, args = log.args.len(), "short DEL record");
            return;
        }
        match parse_wal_key_and_ctx(log.lsn, &log.args[0], &log.args[1], &log.args[2]) {
            Ok((key, ctx)) => {
                self.del(ctx, &key);
            }
            Err(e) => error!(lsn = log.lsn, error = %e, "corrupt DEL record"),
        }
    }

    fn apply_mdel_from_log(&self, log: &LogData) {
        if log.args.is_empty() {
            error!(lsn = log.lsn, "short MDEL record");
            return;
        }
        let curr_time_str = &log.args[0];
        let mut ctx = TxContext::default();
        let mut keys = Vec::with_capacity((log.args.len() - 1) / 2);

        for pair in log.args[1..].chunks_exact(2) {
            match parse_wal_key_and_ctx(log.lsn, &pair[0], &pair[1], curr_time_str) {
                Ok((key, parsed_ctx)) => {
                    keys.push(key);
                    ctx = parsed_ctx;
                }
                Err(e) => {
                    error!(lsn = log.lsn, error = %e, "corrupt MDEL record");
                    return;
                }
            }
        }

        self.mdel(ctx, &keys);
    }

    fn apply_dump(&self, batch: &[DumpElem]) {
        for elem in batch {
            self.restore_dump_elem(elem);
        }

        self.dump_applied.send_modify(|applied| *applied += 1);
    }

    fn partition(&self, key: &str) -> &Partition {
        &self.partitions[self.partition_idx(key)]
    }

    fn partition_idx(&self, key: &str) -> usize {
        fnv1a(key.as_bytes()) as usize % self.partitions.len()
    }
}

fn fnv1a(data: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in data {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// Reconstruct the batch key and commit context from WAL record arguments:
/// decimal batch size, base-16 wall-clock seconds.
fn parse_wal_key_and_ctx(
    lsn: Lsn,
    key: &str,
    batch_size_str: &str,
    curr_time_str: &str,
) -> Result<(BatchKey, TxContext)> {
    let batch_size: u32 = batch_size_str.parse().map_err(|_| Error::WriteAheadLog {
        message: format!("parse batch size {batch_size_str:?}"),
        source: None,
    })?;

    let curr_time = TxTime::from_str_radix(curr_time_str, 16).map_err(|_| Error::WriteAheadLog {
        message: format!("parse curr time {curr_time_str:?}"),
        source: None,
    })?;

    let key = BatchKey {
        key: key.to_string(),
        batch_size,
        batch_size_str: batch_size_str.to_string(),
    };

    let ctx = TxContext {
        tx: lsn,
        dump_tx: 0,
        curr_time,
        from_wal: true,
    };

    Ok((key, ctx))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str, batch_size: u32) -> BatchKey {
        BatchKey::new(name, &batch_size.to_string()).unwrap()
    }

    fn ctx(tx: Lsn, curr_time: TxTime) -> TxContext {
        TxContext {
            tx,
            dump_tx: 0,
            curr_time,
            from_wal: false,
        }
    }

    #[tokio::test]
    async fn incr_get_del_round_trip() {
        let engine = Engine::new(DEFAULT_PARTITIONS, None, None).unwrap();
        let now = now_unix_secs();
        let k = key("foo", 60);

        assert_eq!(engine.incr(ctx(1, now), &k), 1);
        assert_eq!(engine.incr(ctx(2, now), &k), 2);
        assert_eq!(engine.get(&k), (2, true));
        assert!(engine.del(ctx(3, now), &k));
        assert_eq!(engine.get(&k), (0, false));
    }

    #[tokio::test]
    async fn mdel_reports_per_key() {
        let engine = Engine::new(DEFAULT_PARTITIONS, None, None).unwrap();
        let now = now_unix_secs();

        engine.incr(ctx(1, now), &key("a", 60));
        let results = engine.mdel(ctx(2, now), &[key("a", 60), key("b", 60)]);
        assert_eq!(results, vec![true, false]);
    }

    #[tokio::test]
    async fn replayed_expired_write_is_a_noop() {
        let engine = Engine::new(DEFAULT_PARTITIONS, None, None).unwrap();
        let stale = now_unix_secs() - 10_000;
        let k = key("old", 10);

        let replay = TxContext {
            tx: 1,
            dump_tx: 0,
            curr_time: stale,
            from_wal: true,
        };
        assert_eq!(engine.incr(replay, &k), 0);
        assert!(engine.is_empty());
    }

    #[tokio::test]
    async fn wal_stream_replay_applies_records() {
        let (tx, rx) = mpsc::channel(1);
        let engine = Engine::new(DEFAULT_PARTITIONS, Some(rx), None).unwrap();
        let now = now_unix_secs();

        let logs = vec![
            LogData {
                lsn: 1,
                command_id: CommandId::Incr.as_u32(),
                args: vec!["foo".into(), "60".into(), format!("{now:x}")],
            },
            LogData {
                lsn: 2,
                command_id: CommandId::Incr.as_u32(),
                args: vec!["foo".into(), "60".into(), format!("{now:x}")],
            },
        ];
        tx.send(logs).await.unwrap();

        // Consumer runs on the runtime; give it a beat.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(engine.get(&key("foo", 60)), (2, true));
    }

    #[tokio::test]
    async fn mdel_replay_of_absent_keys_is_a_noop() {
        let (tx, rx) = mpsc::channel(1);
        let engine = Engine::new(DEFAULT_PARTITIONS, Some(rx), None).unwrap();
        let now = now_unix_secs();

        let mdel = LogData {
            lsn: 3,
            command_id: CommandId::MDel.as_u32(),
            args: vec![
                format!("{now:x}"),
                "a".into(),
                "60".into(),
                "b".into(),
                "60".into(),
            ],
        };
        tx.send(vec![mdel]).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert!(engine.is_empty());
    }

    #[tokio::test]
    async fn dump_stream_restores_and_signals() {
        let (tx, rx) = mpsc::channel(1);
        let engine = Engine::new(DEFAULT_PARTITIONS, None, Some(rx)).unwrap();
        let mut applied = engine.dump_applied();
        let now = now_unix_secs();

        tx.send(vec![DumpElem {
            key: "x".into(),
            batch_size: 600,
            value: 41,
            tx_at: now,
            tx: 9,
        }])
        .await
        .unwrap();

        applied.changed().await.unwrap();
        assert_eq!(*applied.borrow(), 1);
        assert_eq!(engine.get(&key("x", 600)), (41, true));
    }

    #[tokio::test]
    async fn dump_iterator_respects_cutoff() {
        let engine = Engine::new(DEFAULT_PARTITIONS, None, None).unwrap();
        let now = now_unix_secs();
        let k = key("foo", 600);

        engine.incr(ctx(1, now), &k);
        engine.incr(ctx(2, now), &k);
        // Newer than the cutoff; the snapshot triple keeps the LSN 2 state.
        engine.incr(
            TxContext {
                tx: 3,
                dump_tx: 2,
                curr_time: now,
                from_wal: false,
            },
            &k,
        );

        let mut rx = Arc::clone(&engine).dump(2);
        let elem = rx.recv().await.unwrap();
        assert_eq!(elem.value, 2);
        assert_eq!(elem.tx, 2);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn restore_drops_expired_elements() {
        let engine = Engine::new(DEFAULT_PARTITIONS, None, None).unwrap();

        engine.restore_dump_elem(&DumpElem {
            key: "gone".into(),
            batch_size: 10,
            value: 5,
            tx_at: now_unix_secs() - 10_000,
            tx: 4,
        });

        assert!(engine.is_empty());
    }

    #[test]
    fn window_math() {
        assert_eq!(start_of_batch(1005, 100), 1000);
        assert_eq!(end_of_batch(1005, 100), 1099);
        assert_eq!(start_of_batch(1000, 100), 1000);
    }

    #[test]
    fn fnv1a_matches_reference_vectors() {
        assert_eq!(fnv1a(b""), 0x811c_9dc5);
        assert_eq!(fnv1a(b"a"), 0xe40c_292c);
        assert_eq!(fnv1a(b"foobar"), 0xbf9c_f968);
    }
}
