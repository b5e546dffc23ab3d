use std::sync::Arc;

use thiserror::Error;

/// Flags carried by a cancellation.
///
/// `revert` restores the entry to the state captured before the fetch
/// started; `silent` suppresses the error dispatch entirely (used when a
/// fetch is replaced by a newer one).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CancelOptions {
    pub revert: bool,
    pub silent: bool,
}

impl CancelOptions {
    /// The default for user-initiated cancellation: roll back to the
    /// pre-fetch snapshot.
    #[must_use]
    pub const fn revert() -> Self {
        Self {
            revert: true,
            silent: false,
        }
    }

    /// Cancellation that neither reverts nor dispatches an error.
    #[must_use]
    pub const fn silent() -> Self {
        Self {
            revert: false,
            silent: true,
        }
    }
}

/// Error type for query and mutation operations.
///
/// The engine does not impose an error taxonomy on user code: failures
/// reported by query and mutation functions travel as messages (or as an
/// arbitrary source error behind [`QueryError::External`]), and the engine
/// adds only the variants it produces itself.
#[derive(Error, Debug, Clone)]
pub enum QueryError {
    /// A failure reported by a user-supplied function.
    #[error("{0}")]
    Message(Arc<str>),

    /// A failure wrapping an arbitrary error value.
    #[error("{0}")]
    External(Arc<dyn std::error::Error + Send + Sync>),

    /// The operation was cancelled before it settled.
    #[error("operation cancelled")]
    Cancelled(CancelOptions),

    /// A fetch was requested but no query function is configured.
    #[error("no query function configured for `{0}`")]
    MissingQueryFn(Arc<str>),
}

impl QueryError {
    /// Creates a message error from anything stringly.
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message(Arc::from(message.into()))
    }

    /// Wraps an arbitrary error value.
    pub fn external(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::External(Arc::new(error))
    }

    /// Returns `true` if this error is a cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// Returns the cancellation flags, if this error is a cancellation.
    #[must_use]
    pub const fn cancel_options(&self) -> Option<CancelOptions> {
        match self {
            Self::Cancelled(options) => Some(*options),
            _ => None,
        }
    }
}

impl PartialEq for QueryError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Message(a), Self::Message(b)) => a == b,
            (Self::External(a), Self::External(b)) => Arc::ptr_eq(a, b),
            (Self::Cancelled(a), Self::Cancelled(b)) => a == b,
            (Self::MissingQueryFn(a), Self::MissingQueryFn(b)) => a == b,
            _ => false,
        }
    }
}

impl From<&str> for QueryError {
    fn from(message: &str) -> Self {
        Self::message(message)
    }
}

impl From<String> for QueryError {
    fn from(message: String) -> Self {
        Self::message(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_display() {
        let err = QueryError::message("boom");
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn test_missing_query_fn_display() {
        let err = QueryError::MissingQueryFn(Arc::from("[\"todos\"]"));
        assert_eq!(
            err.to_string(),
            "no query function configured for `[\"todos\"]`"
        );
    }

    #[test]
    fn test_cancelled_predicates() {
        let err = QueryError::Cancelled(CancelOptions::revert());
        assert!(err.is_cancelled());
        assert_eq!(
            err.cancel_options(),
            Some(CancelOptions {
                revert: true,
                silent: false
            })
        );

        let err = QueryError::message("boom");
        assert!(!err.is_cancelled());
        assert_eq!(err.cancel_options(), None);
    }

    #[test]
    fn test_equality_by_message() {
        assert_eq!(QueryError::message("a"), QueryError::message("a"));
        assert_ne!(QueryError::message("a"), QueryError::message("b"));
        assert_ne!(
            QueryError::message("a"),
            QueryError::Cancelled(CancelOptions::default())
        );
    }
}
