//! Error types for the bufferd-rpc crate.

use crate::transport::CodecError;

/// Errors surfaced by the connection endpoints
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Connection closed")]
    Disconnected,

    #[error("No answer from the daemon")]
    Timeout,

    #[error("Daemon rejected the connection: {}", .0.as_deref().unwrap_or("no reason"))]
    VersionRejected(Option<String>),

    #[error("Unexpected answer: {0}")]
    UnexpectedAnswer(&'static str),
}

impl Error {
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_protocol_factory() {
        match Error::protocol("unexpected verb") {
            Error::Protocol(message) => assert_eq!(message, "unexpected verb"),
            other => panic!("Expected Protocol error, got {other:?}"),
        }
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("refused"));
    }

    #[test]
    fn test_version_rejected_display() {
        let err = Error::VersionRejected(Some("illegal version".to_string()));
        assert_eq!(
            err.to_string(),
            "Daemon rejected the connection: illegal version"
        );
        assert_eq!(
            Error::VersionRejected(None).to_string(),
            "Daemon rejected the connection: no reason"
        );
    }

    #[test]
    fn test_timeout_display() {
        assert_eq!(Error::Timeout.to_string(), "No answer from the daemon");
    }
}
