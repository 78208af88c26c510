//! # fq Storage
//!
//! The durable-counter subsystem:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      Storage Facade                      │
//! │        LSN allocation · WAL-then-engine commits          │
//! └───────┬──────────────────┬──────────────────┬────────────┘
//!         │                  │                  │
//!         ▼                  ▼                  ▼
//!   ┌──────────┐      ┌────────────┐     ┌───────────┐
//!   │   WAL    │      │   Engine   │     │  Dumper   │
//!   │ segments │      │ partitions │     │ snapshots │
//!   └──────────┘      └──────┬─────┘     └─────┬─────┘
//!                            │                 │
//!                      WAL / dump        read sessions
//!                        streams               │
//!                            ▲                 ▼
//!                     ┌──────┴─────────────────────┐
//!                     │        Replication         │
//!                     │   master ⇄ slave (LSN)     │
//!                     └────────────────────────────┘
//! ```

pub mod dumper;
pub mod engine;
pub mod replication;
pub mod storage;
pub mod wal;

pub use dumper::Dumper;
pub use engine::Engine;
pub use storage::Storage;
pub use wal::Wal;
