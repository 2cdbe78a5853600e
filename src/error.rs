//! wardgate/src/error.rs
//! Error kinds recovered at task boundaries.

use thiserror::Error;

/// Failures of one direction of a proxied connection or of an update
/// exchange. Every variant is logged where it occurs and never crosses a
/// component boundary.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("decode failure: {0}")]
    Decode(String),

    #[error("malformed header: {0:?}")]
    MalformedHeader(String),

    #[error("malformed request line: {0:?}")]
    MalformedRequestLine(String),

    #[error("malformed response line: {0:?}")]
    MalformedResponseLine(String),

    #[error("exchange timed out")]
    Timeout,

    #[error("bad flag pattern: {0}")]
    BadFlagPattern(#[from] regex::Error),
}

impl ProxyError {
    /// Plain end-of-socket conditions are expected teardown, everything
    /// else is worth a louder log line.
    pub fn is_io(&self) -> bool {
        matches!(self, ProxyError::Io(_))
    }
}
