//! Error types for the dispatch engine

use transport::{ErrorClass, TransportError};

/// Errors surfaced to callers of the dispatch engine.
///
/// Terminal send failures keep the original transport error (and therefore
/// the remote reply code) so callers can distinguish a message-level
/// rejection from an account-level one.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("send rejected ({class:?}): {source}")]
    SendRejected {
        class: ErrorClass,
        #[source]
        source: TransportError,
    },

    #[error("retry budget exhausted after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: TransportError,
    },

    #[error("task queue is full")]
    QueueFull,

    #[error("dispatch engine is shut down")]
    Shutdown,

    #[error("invalid engine configuration: {0}")]
    InvalidConfig(&'static str),
}

impl Error {
    /// Remote reply code behind this error, if any.
    pub fn code(&self) -> Option<u16> {
        match self {
            Error::SendRejected { source, .. } | Error::RetriesExhausted { source, .. } => {
                source.code()
            }
            _ => None,
        }
    }

    /// Classification of a terminal send failure, if any.
    pub fn class(&self) -> Option<ErrorClass> {
        match self {
            Error::SendRejected { class, .. } => Some(*class),
            Error::RetriesExhausted { source, .. } => source.code().map(transport::classify_code),
            _ => None,
        }
    }
}

/// Result alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_rejected_exposes_code_and_class() {
        let err = Error::SendRejected {
            class: ErrorClass::Degraded,
            source: TransportError::Rejected {
                code: 550,
                message: "sender blocked".into(),
            },
        };
        assert_eq!(err.code(), Some(550));
        assert_eq!(err.class(), Some(ErrorClass::Degraded));
        assert!(err.to_string().contains("550"));
    }

    #[test]
    fn retries_exhausted_classifies_last_code() {
        let err = Error::RetriesExhausted {
            attempts: 11,
            source: TransportError::Rejected {
                code: 421,
                message: "slow down".into(),
            },
        };
        assert_eq!(err.code(), Some(421));
        assert_eq!(err.class(), Some(ErrorClass::Throttled));
        assert!(err.to_string().contains("11 attempts"));
    }

    #[test]
    fn queue_and_shutdown_errors_carry_no_code() {
        assert_eq!(Error::QueueFull.code(), None);
        assert_eq!(Error::Shutdown.code(), None);
        assert_eq!(Error::QueueFull.class(), None);
    }
}
