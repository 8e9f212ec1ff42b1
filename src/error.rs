//! Error types for pagewatch

use thiserror::Error;

/// Result type for pagewatch operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for pagewatch
#[derive(Debug, Error)]
pub enum Error {
    /// A wait exceeded its deadline. Always safe to retry.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// A protocol command failed
    #[error("Protocol error in {method}: {message} (code {code})")]
    Protocol {
        method: String,
        code: i64,
        message: String,
    },

    /// A script evaluation raised a page-side exception
    #[error("Evaluation error: {0}")]
    Evaluation(String),

    /// An invalid regular expression was supplied by the caller
    #[error("Invalid pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// The request was never paused, or has already been resolved
    #[error("Request not intercepted: {0}")]
    NotIntercepted(String),

    /// No tracked socket connection matches
    #[error("Connection not found: {0}")]
    ConnectionNotFound(String),

    /// A stability attempt failed; one entry per failed check
    #[error("Stability checks failed: {}", .failures.join("; "))]
    Stability { failures: Vec<String> },

    /// A step in a sequential socket wait failed
    #[error("Sequence step {step} ({condition}) failed: {source}")]
    SequenceStep {
        step: usize,
        condition: String,
        #[source]
        source: Box<Error>,
    },

    /// The event source channel closed while a component still needed it
    #[error("Event source closed")]
    EventSourceClosed,

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Create a protocol error with full context
    pub fn protocol(method: impl Into<String>, code: i64, message: impl Into<String>) -> Self {
        Self::Protocol {
            method: method.into(),
            code,
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(what: impl Into<String>) -> Self {
        Self::Timeout(what.into())
    }

    /// Create a pattern error
    pub fn pattern(pattern: impl Into<String>, source: regex::Error) -> Self {
        Self::Pattern {
            pattern: pattern.into(),
            source,
        }
    }

    /// Whether this error is deadline-related and safe to retry.
    ///
    /// A [`Error::Stability`] aggregate counts as a timeout when every
    /// underlying check failure was a timeout.
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Timeout(_) => true,
            Error::Stability { failures } => failures
                .iter()
                .all(|f| f.contains("timed out") || f.contains("Timeout")),
            _ => false,
        }
    }

    /// Whether this error indicates a caller/logic bug (state errors)
    pub fn is_state(&self) -> bool {
        matches!(
            self,
            Error::NotIntercepted(_) | Error::ConnectionNotFound(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_classification() {
        assert!(Error::timeout("network idle").is_timeout());
        assert!(!Error::NotIntercepted("42".into()).is_timeout());
        assert!(Error::Stability {
            failures: vec!["network idle timed out".into(), "DOM stability timed out".into()],
        }
        .is_timeout());
        assert!(!Error::Stability {
            failures: vec!["custom check 'ready' failed: boom".into()],
        }
        .is_timeout());
    }

    #[test]
    fn test_state_classification() {
        assert!(Error::NotIntercepted("42".into()).is_state());
        assert!(Error::ConnectionNotFound("ws-1".into()).is_state());
        assert!(!Error::timeout("x").is_state());
    }
}
