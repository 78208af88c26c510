//! # Replication
//!
//! Asynchronous master/slave replication. The master serves the current
//! dump as a resumable byte session plus WAL segments by name order; the
//! slave applies the dump first, then tails the WAL, deduplicating by LSN.

mod master;
mod protocol;
mod slave;
mod transport;

pub use master::Master;
pub use protocol::{
    DumpRequest, DumpResponse, Request, WalRequest, WalResponse, MAX_REPLICAS,
    MAX_REPLICATION_MESSAGE_SIZE,
};
pub use slave::{Slave, SlaveHandle};
pub use transport::ReplicaClient;
