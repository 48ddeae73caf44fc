//! Error types for ducat operations.

use ducat_proto::ProtoError;

/// Alias for `Result<T, ducat::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by link and transaction operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The peer violated the wire protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// An argument failed validation before anything was sent.
    #[error("invalid parameter: {0}")]
    Parameter(&'static str),

    /// The link produced no activity within the configured timeout.
    #[error("timeout on link")]
    Timeout,

    /// The link is down; every transaction it carried has been terminated.
    #[error("link is dead")]
    LinkDead,

    /// An I/O error from the link or a local descriptor.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<ProtoError> for Error {
    fn from(err: ProtoError) -> Self {
        Error::Protocol(err.to_string())
    }
}
