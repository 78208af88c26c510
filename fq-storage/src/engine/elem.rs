//! Window-aware counter cell.
//!
//! A cell holds the live counter triple `(value, ver, last_tx_at)` plus a
//! snapshot triple frozen at the most recent dump cutoff that observed it.
//! `dump_value` can therefore serve a value consistent with any cutoff at or
//! after that snapshot while increments keep flowing.

use parking_lot::Mutex;

use fq_core::types::{Lsn, TxContext, TxTime, Value, NO_TX};

use super::start_of_batch;

#[derive(Debug, Clone, Copy)]
struct ElemState {
    value: Value,
    ver: Lsn,
    last_tx_at: TxTime,

    dump_value: Value,
    dump_ver: Lsn,
    dump_last_tx_at: TxTime,
}

#[derive(Debug)]
pub struct CounterElem {
    batch_size: TxTime,
    state: Mutex<ElemState>,
}

impl CounterElem {
    pub fn new(batch_size: u32) -> Self {
        Self {
            batch_size: batch_size as TxTime,
            state: Mutex::new(ElemState {
                value: 0,
                ver: NO_TX,
                last_tx_at: 0,
                dump_value: 0,
                dump_ver: NO_TX,
                dump_last_tx_at: 0,
            }),
        }
    }

    /// Rebuild a cell from a dump element.
    pub fn restored(batch_size: u32, value: Value, ver: Lsn, last_tx_at: TxTime) -> Self {
        let elem = Self::new(batch_size);
        {
            let mut state = elem.state.lock();
            state.value = value;
            state.ver = ver;
            state.last_tx_at = last_tx_at;
        }
        elem
    }

    pub fn batch_size(&self) -> TxTime {
        self.batch_size
    }

    /// Apply one increment under the commit context and return the new value.
    ///
    /// If the cell's last write predates the current window, the counter
    /// restarts from zero. The snapshot triple is refreshed the first time a
    /// new dump cutoff touches the cell: when this very increment is the
    /// cutoff transaction the post-increment state is the snapshot, otherwise
    /// the pre-increment state is.
    pub fn incr(&self, ctx: TxContext) -> Value {
        let batch_starts_at = start_of_batch(ctx.curr_time, self.batch_size);

        let mut state = self.state.lock();

        let mut value = state.value;
        if state.last_tx_at < batch_starts_at {
            value = 0;
        }

        if state.dump_ver != ctx.dump_tx {
            if ctx.tx == ctx.dump_tx {
                state.dump_value = value + 1;
                state.dump_ver = ctx.tx;
                state.dump_last_tx_at = ctx.curr_time;
            } else {
                state.dump_value = state.value;
                state.dump_ver = state.ver;
                state.dump_last_tx_at = state.last_tx_at;
            }
        }

        state.value = value + 1;
        state.ver = ctx.tx;
        state.last_tx_at = ctx.curr_time;

        state.value
    }

    /// Current value as of wall clock `now`; zero once the window containing
    /// the last write has passed.
    pub fn value(&self, now: TxTime) -> Value {
        let state = self.state.lock();
        if state.last_tx_at < start_of_batch(now, self.batch_size) {
            return 0;
        }

        state.value
    }

    /// The cell state as it stood when LSN `dump_tx` committed, or `None`
    /// when both triples are newer than the cutoff.
    pub fn dump_value(&self, dump_tx: Lsn) -> Option<(Value, TxTime, Lsn)> {
        let state = self.state.lock();

        if state.ver <= dump_tx {
            return Some((state.value, state.last_tx_at, state.ver));
        }

        if state.dump_ver <= dump_tx {
            return Some((state.dump_value, state.dump_last_tx_at, state.dump_ver));
        }

        None
    }

    /// Stamp of the last write; expiry checks key off this.
    pub fn last_tx_at(&self) -> TxTime {
        self.state.lock().last_tx_at
    }
}
