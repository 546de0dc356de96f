//! Ambient error types
//!
//! Covers plumbing errors that arise outside the wire protocol and the
//! transport core's own `CoreError` (see `core::error`): configuration
//! loading, key persistence, and other binary-level concerns.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("network error: {0}")]
    Network(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("other error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
