use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// An error that happens while turning a caller supplied key into a [`CacheKey`](crate::CacheKey).
///
/// This is reported before any table entry is created and before the operation is invoked.
#[derive(Debug, Error)]
pub enum KeyError {
    /// The key, or one of its parts, could not be represented as JSON.
    ///
    /// This happens for maps with non-string keys or for `Serialize` implementations that
    /// fail on their own.
    #[error("failed to serialize key")]
    Serialize(#[from] serde_json::Error),
    /// The key serialized fine, but not into a sequence of values.
    #[error("key must serialize to a sequence, got {0}")]
    NotASequence(&'static str),
}

/// The failure shared by every caller of a coalesced operation.
///
/// All waiters on the same entry receive clones of the same error; for
/// [`Operation`](Self::Operation) this means the very same [`Arc`].
#[derive(Error)]
pub enum CallError<E> {
    /// The operation itself failed.
    #[error("{0}")]
    Operation(Arc<E>),
    /// The operation panicked while it was being polled.
    #[error("operation panicked")]
    Panicked,
    /// The outcome was abandoned before the operation ran.
    ///
    /// This happens when the [`Batcher`](crate::Batcher) is dropped while the entry's window
    /// has not elapsed yet.
    #[error("operation was cancelled before it ran")]
    Cancelled,
}

impl<E> CallError<E> {
    /// Returns the error of the operation, if the operation ran and failed.
    pub fn operation(&self) -> Option<&Arc<E>> {
        match self {
            Self::Operation(err) => Some(err),
            _ => None,
        }
    }

    /// A short, static description used for metric tags.
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::Operation(_) => "operation",
            Self::Panicked => "panicked",
            Self::Cancelled => "cancelled",
        }
    }
}

// https://github.com/rust-lang/rust/issues/26925
impl<E> Clone for CallError<E> {
    fn clone(&self) -> Self {
        match self {
            Self::Operation(err) => Self::Operation(Arc::clone(err)),
            Self::Panicked => Self::Panicked,
            Self::Cancelled => Self::Cancelled,
        }
    }
}

impl<E: fmt::Debug> fmt::Debug for CallError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Operation(err) => f.debug_tuple("Operation").field(err).finish(),
            Self::Panicked => f.write_str("Panicked"),
            Self::Cancelled => f.write_str("Cancelled"),
        }
    }
}
