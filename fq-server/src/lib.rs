//! # fq Server
//!
//! The text command layer over the storage subsystem:
//! - `compute` — query tokenizer and analyzer
//! - `database` — dispatcher and response rendering
//! - `server` — the TCP text protocol server
//! - `client` — the client side of the protocol (used by the CLI)
//! - `bootstrap` — configuration-driven wiring and lifecycle

pub mod bootstrap;
pub mod client;
pub mod compute;
pub mod database;
pub mod server;

pub use client::{FqClient, TcpClient};
pub use database::Database;
pub use server::TextServer;
