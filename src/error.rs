//! Error types at each subsystem boundary.
//!
//! Handler-visible outcomes (`FILE_NOT_EXISTS`, `OPERATION_NOT_PERMITTED`, ...)
//! travel as [`crate::wire::ResponseCode`] values, not as `Error` — they are
//! the protocol's own vocabulary, not failures of this process. The types
//! below cover conditions that are fatal to a connection or to the process.

use std::io;

use thiserror::Error;

/// Failures loading and applying the `key=value` configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid value for `{key}`: {value}")]
    InvalidValue { key: String, value: String },
}

/// Errors that abort a client connection outright (spec protocol errors are
/// reported as response codes first; this is the I/O layer underneath them).
#[derive(Debug, Error)]
pub enum WireError {
    #[error("peer reset the connection")]
    Reset,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Internal storage engine failures. Distinct from the semantic response
/// codes the handlers return on ordinary misuse (missing file, already
/// locked, ...), which are not errors but expected protocol outcomes.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("allocation failure while growing storage state")]
    AllocationFailure,

    #[error("logger sink failed: {0}")]
    LoggerWrite(#[source] io::Error),
}

/// Thread pool submission/lifecycle failures.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("pool is shutting down")]
    ShuttingDown,
}

/// Top-level server bring-up/shutdown failures.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind listener at {path}: {source}")]
    Bind {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to install signal handlers: {0}")]
    Signal(#[source] io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("master event loop failed: {0}")]
    Io(#[from] io::Error),
}
