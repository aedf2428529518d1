//! Crate error type.

use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Errors surfaced by record generation and record consumption.
///
/// A population error is stored once in the record slot and handed to every
/// concurrent and subsequent waiter of that population, so the type is
/// cheaply cloneable and all waiters observe the same underlying error.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The generator returned without writing any data and without
    /// including any records. Empty records are not allowed.
    #[error("empty record created")]
    EmptyRecord,

    /// The user generator failed; the original error is carried verbatim.
    #[error("record generation failed: {0}")]
    Generator(Arc<dyn std::error::Error + Send + Sync>),

    /// The deflate encoder failed while compressing generator output.
    #[error("deflate compression failed: {0}")]
    Compression(Arc<io::Error>),

    /// A record stream could not be decoded as JSON.
    #[error("record JSON decoding failed: {0}")]
    Json(Arc<serde_json::Error>),
}

impl Error {
    /// Wrap an arbitrary generator error.
    pub fn generator(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Generator(Arc::from(err.into()))
    }

    /// Shorthand for a message-only generator error.
    pub fn message(msg: impl Into<String>) -> Self {
        Self::generator(msg.into())
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Compression(Arc::new(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(Arc::new(err))
    }
}
