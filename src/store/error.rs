//! Store error type.

use thiserror::Error;

use crate::resilience::retries::Retryable;
use crate::secret::SecretError;

/// Errors raised while reading the remote namespace or its change feed.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// Key absent, or a leaf/directory where the other was expected.
    #[error("key '{key}' not found")]
    NotFound { key: String },

    /// Leaf value or envelope is malformed.
    #[error("failed to decode '{key}': {reason}")]
    Decode { key: String, reason: String },

    /// A sealed read was attempted without a secret box.
    #[error("cannot open sealed value at '{key}': no encryption key configured")]
    EncryptionUnavailable { key: String },

    /// The secret box refused the envelope.
    #[error("cannot open sealed value at '{key}': {source}")]
    Secret {
        key: String,
        #[source]
        source: SecretError,
    },

    /// Communication with the remote store failed.
    #[error("store backend error: {0}")]
    Backend(String),

    /// The change feed ended.
    #[error("change feed closed")]
    FeedClosed,
}

impl StoreError {
    pub fn not_found(key: impl Into<String>) -> Self {
        StoreError::NotFound { key: key.into() }
    }

    pub fn decode(key: impl Into<String>, reason: impl ToString) -> Self {
        StoreError::Decode {
            key: key.into(),
            reason: reason.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

impl Retryable for StoreError {
    fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Backend(_))
    }
}
