//! Encryption collaborators for encarch
//!
//! The archive core only needs two capabilities from a cryptography stack:
//! resolving a recipient identity from a fingerprint suffix, and encrypting
//! a byte stream to an output file for that recipient. Both are expressed as
//! traits here so the core can be driven by `gpg` in production and by
//! in-process fakes in tests.

pub mod error;
pub mod fingerprint;
pub mod gpg;

use std::io::Read;
use std::path::Path;

pub use error::{CryptoError, CryptoResult};
pub use fingerprint::{is_valid_suffix, matches_suffix};
pub use gpg::{GpgBackend, GpgConfig};

/// Standard suffix of an encrypted artifact (without the leading dot).
pub const ARTIFACT_EXTENSION: &str = "gpg";

/// A resolved recipient identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    /// Full key fingerprint (uppercase hex)
    pub fingerprint: String,
    /// First user id on the key, used for display only
    pub uid: String,
}

impl Recipient {
    pub fn new(fingerprint: impl Into<String>, uid: impl Into<String>) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            uid: uid.into(),
        }
    }
}

impl std::fmt::Display for Recipient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.uid, self.fingerprint)
    }
}

/// Looks up a recipient key by the trailing part of its fingerprint.
pub trait RecipientResolver {
    /// Resolve `suffix` against the keyring.
    ///
    /// Returns `CryptoError::RecipientNotFound` when no key fingerprint ends
    /// with the suffix.
    fn resolve(&self, suffix: &str) -> CryptoResult<Recipient>;
}

/// Encrypts a stream for a recipient into a file.
///
/// Implementations write binary (non-armored) output. They may leave a
/// partially written file at `output` when they fail; callers own cleanup.
pub trait Encryptor {
    fn encrypt_to_file(
        &self,
        source: &mut dyn Read,
        recipient: &Recipient,
        output: &Path,
    ) -> CryptoResult<()>;
}

impl<T: RecipientResolver + ?Sized> RecipientResolver for &T {
    fn resolve(&self, suffix: &str) -> CryptoResult<Recipient> {
        (**self).resolve(suffix)
    }
}

impl<T: Encryptor + ?Sized> Encryptor for &T {
    fn encrypt_to_file(
        &self,
        source: &mut dyn Read,
        recipient: &Recipient,
        output: &Path,
    ) -> CryptoResult<()> {
        (**self).encrypt_to_file(source, recipient, output)
    }
}
