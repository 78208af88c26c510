//! # Error Handling
//!
//! Unified error type for all fq operations. Variants are grouped by the
//! subsystem that produces them; client-facing validation errors carry the
//! exact message the text protocol returns after `err|`.

use thiserror::Error;

/// Result type alias for fq operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Primary error type for fq.
#[derive(Error, Debug)]
pub enum Error {
    // Input validation (returned to clients verbatim)
    #[error("invalid command")]
    InvalidCommand,

    #[error("invalid symbol")]
    InvalidSymbol,

    #[error("invalid arguments")]
    InvalidArguments,

    #[error("key cannot be empty")]
    KeyEmpty,

    #[error("key length exceeds maximum")]
    KeyTooLong,

    #[error("batch is not a number")]
    BatchSizeNotNumber,

    #[error("invalid batch size: {got} (must be between 1 and 4294967295)")]
    InvalidBatchSize { got: u64 },

    #[error("message size {size} exceeds maximum {max}")]
    MessageTooLarge { size: usize, max: usize },

    #[error("replica is read-only")]
    ReadOnlyReplica,

    #[error("internal configuration error")]
    InternalConfiguration,

    // Storage
    #[error("WAL error: {message}")]
    WriteAheadLog {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("dump error: {message}")]
    Dump { message: String },

    #[error("dump read session is closed")]
    DumpReadSessionClosed,

    #[error("maximum number of dump sessions ({max}) reached")]
    DumpSessionLimit { max: usize },

    // Replication
    #[error("replication error: {message}")]
    Replication { message: String },

    // System
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },

    #[error("network error: {message}")]
    Network { message: String },

    #[error("codec error: {message}")]
    Codec { message: String },

    #[error("configuration error: {message}")]
    Configuration { message: String },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Transport failures that warrant a reconnect attempt on the
    /// replication client, as opposed to protocol or logic errors.
    pub fn is_network(&self) -> bool {
        match self {
            Error::Network { .. } => true,
            Error::Io { source, .. } => matches!(
                source.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }

    /// Bad input from a client. These are answered over the wire and never
    /// logged at error level.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::InvalidCommand
                | Error::InvalidSymbol
                | Error::InvalidArguments
                | Error::KeyEmpty
                | Error::KeyTooLong
                | Error::BatchSizeNotNumber
                | Error::InvalidBatchSize { .. }
                | Error::MessageTooLarge { .. }
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io {
            message: err.to_string(),
            source: err,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_classification() {
        let timeout: Error =
            std::io::Error::new(std::io::ErrorKind::TimedOut, "deadline").into();
        assert!(timeout.is_network());

        let missing: Error =
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(!missing.is_network());

        assert!(!Error::InvalidCommand.is_network());
    }

    #[test]
    fn validation_errors_render_protocol_messages() {
        assert_eq!(Error::InvalidCommand.to_string(), "invalid command");
        assert_eq!(Error::InvalidArguments.to_string(), "invalid arguments");
        assert!(Error::InvalidArguments.is_validation());
        assert!(!Error::ReadOnlyReplica.is_validation());
    }
}
