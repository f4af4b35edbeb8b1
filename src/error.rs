use thiserror::Error;

/// Error kinds from spec §7. Propagation policy lives with the callers:
/// wire-format errors on UDP drop the datagram, the same errors on TCP/SCTP
/// trigger a `close_session` feedback request (see `bus::FeedbackMsg`).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("invalid argument: {0}")]
    Arg(String),

    #[error("malformed wire input: {0}")]
    Format(String),

    #[error("value saturated on conversion: {0}")]
    Trunc(String),

    #[error("output buffer too small: needed {needed}, had {available}")]
    Buffer { needed: usize, available: usize },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    Exists(String),

    #[error("operation denied in current state: {0}")]
    Denied(String),

    #[error("allocation failed")]
    NoMem,

    #[error("input source exhausted")]
    Eof,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether this error, when encountered on a reliable transport while
    /// parsing a message for a given session, should close that session
    /// (spec §7 propagation policy).
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, Error::Format(_) | Error::Denied(_))
    }
}
