//! One partition of the engine's hash table.
//!
//! A partition is a plain `HashMap` behind a `RwLock`; per-cell mutation is
//! serialized by the cell's own lock, so the partition lock is only held for
//! map lookups and structural changes.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use fq_core::types::{BatchKey, DumpElem, TxContext, TxTime, Value};

use super::elem::CounterElem;
use super::is_expired_with_delta;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ElemKey {
    key: String,
    batch_size: u32,
}

impl ElemKey {
    fn from_batch_key(key: &BatchKey) -> Self {
        Self {
            key: key.key.clone(),
            batch_size: key.batch_size,
        }
    }
}

#[derive(Debug, Default)]
pub struct Partition {
    entries: RwLock<HashMap<ElemKey, Arc<CounterElem>>>,
}

impl Partition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(&self, ctx: TxContext, key: &BatchKey) -> Value {
        self.get_or_init(key).incr(ctx)
    }

    /// Look up a cell without creating it.
    pub fn get(&self, key: &BatchKey, now: TxTime) -> (Value, bool) {
        let lookup = ElemKey::from_batch_key(key);
        match self.entries.read().get(&lookup) {
            Some(elem) => (elem.value(now), true),
            None => (0, false),
        }
    }

    pub fn del(&self, key: &BatchKey) -> bool {
        let lookup = ElemKey::from_batch_key(key);
        self.entries.write().remove(&lookup).is_some()
    }

    /// Evict cells whose window plus grace period has fully passed.
    pub fn clean(&self) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, elem| !is_expired_with_delta(elem.last_tx_at(), elem.batch_size()));
        before - entries.len()
    }

    /// Copy of the entry list for dump iteration. Emission happens without
    /// the partition lock.
    pub fn snapshot(&self) -> Vec<(String, u32, Arc<CounterElem>)> {
        self.entries
            .read()
            .iter()
            .map(|(k, elem)| (k.key.clone(), k.batch_size, Arc::clone(elem)))
            .collect()
    }

    pub fn restore(&self, elem: &DumpElem) {
        let cell = CounterElem::restored(elem.batch_size, elem.value, elem.tx, elem.tx_at);
        let key = ElemKey {
            key: elem.key.clone(),
            batch_size: elem.batch_size,
        };
        self.entries.write().insert(key, Arc::new(cell));
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn get_or_init(&self, key: &BatchKey) -> Arc<CounterElem> {
        let lookup = ElemKey::from_batch_key(key);

        if let Some(elem) = self.entries.read().get(&lookup) {
            return Arc::clone(elem);
        }

        // Recheck under the exclusive lock; another writer may have won.
        let mut entries = self.entries.write();
        Arc::clone(
            entries
                .entry(lookup)
                .or_insert_with(|| Arc::new(CounterElem::new(key.batch_size))),
        )
    }
}
