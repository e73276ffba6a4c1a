use std::io;

use thiserror::Error;

/// All errors that can occur while talking to a port.
#[derive(Debug, Error)]
pub enum Error {
    /// Any IO error.
    #[error("IO err: {0}")]
    Io(#[from] io::Error),
    /// The host capability the adapter wraps is missing.
    ///
    /// This is a configuration error, retrying does not help.
    #[error("transport unavailable: {0}")]
    Unavailable(String),
    /// The port was disconnected.
    #[error("port closed")]
    Closed,
    /// A message could not be encoded or decoded.
    #[error("codec err: {0}")]
    Codec(String),
    /// A frame violated the framing rules.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Codec(err.to_string())
    }
}
