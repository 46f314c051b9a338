//! Typed errors at the boundaries where the *kind* of failure matters to a
//! caller. Everything above these boundaries (CLI wiring, the REPL loop)
//! propagates with `anyhow`, per the ambient convention this crate follows.

use thiserror::Error;

/// A malformed DME wire frame (`TYPE|TIMESTAMP|SENDER_ID`).
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame is not valid UTF-8")]
    NotUtf8(#[from] std::str::Utf8Error),
    #[error("frame has {0} fields separated by '|', expected 3")]
    FieldCount(usize),
    #[error("unknown message type {0:?}")]
    UnknownKind(String),
    #[error("invalid timestamp {0:?}")]
    InvalidTimestamp(String),
    #[error("sender id {0:?} contains the '|' separator")]
    SenderIdHasSeparator(String),
    #[error("frame exceeds the {max} byte limit")]
    TooLong { max: usize },
}

/// A File Service request that cannot be satisfied.
#[derive(Debug, Error)]
pub enum FileServiceError {
    #[error("No message provided")]
    MissingMessage,
    #[error("Unknown command")]
    UnknownCommand,
}

impl FileServiceError {
    /// Renders the way the wire protocol expects: `ERROR: <reason>`.
    pub fn to_wire(&self) -> String {
        format!("ERROR: {self}")
    }
}

/// A CLI argument that failed to parse into a network endpoint.
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("expected HOST:PORT, got {0:?}")]
    MissingColon(String),
    #[error("invalid port in {0:?}: {1}")]
    BadPort(String, std::num::ParseIntError),
    #[error("could not resolve {0:?} to an address")]
    Unresolvable(String),
}

/// A `--peer ID:HOST:PORT` argument that failed to parse.
#[derive(Debug, Error)]
pub enum PeerSpecError {
    #[error("expected ID:HOST:PORT, got {0:?}")]
    WrongFieldCount(String),
    #[error(transparent)]
    Endpoint(#[from] EndpointError),
}
