//! Error types for the encryption collaborators

use std::io;

use thiserror::Error;

/// Result type for crypto operations
pub type CryptoResult<T> = Result<T, CryptoError>;

/// Errors raised while resolving recipients or encrypting files
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("no key found for fingerprint suffix {0}")]
    RecipientNotFound(String),

    #[error("invalid fingerprint suffix '{0}': expected 8 to 40 hex digits")]
    InvalidFingerprint(String),

    #[error("failed to launch {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: io::Error,
    },

    #[error("gpg exited with {status}: {stderr}")]
    Gpg { status: String, stderr: String },

    #[error("malformed key listing: {0}")]
    Listing(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
