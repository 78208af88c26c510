//! # fq Core
//!
//! Shared foundation for the fq workspace:
//! - Core data types (LSN, window stamp, batch key, dump element)
//! - Error handling
//! - Configuration loading and validation
//! - The stable binary codec used on disk and on the wire
//! - Common utilities

pub mod codec;
pub mod command;
pub mod config;
pub mod error;
pub mod types;
pub mod utils;

// Re-export commonly used types
pub use command::CommandId;
pub use error::{Error, Result};
pub use types::{BatchKey, DumpElem, Lsn, TxContext, TxTime, Value, NO_TX};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
