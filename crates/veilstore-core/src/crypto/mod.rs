//! Cryptographic primitives for vault operations.
//!
//! Everything in this module is keyed by a 256-bit secret and uses
//! AES-256-GCM with 96-bit random nonces and 128-bit tags. Two content
//! shapes exist: a single-shot frame (`nonce ‖ ciphertext ‖ tag`) for small
//! payloads, and a self-describing chunked stream for large ones (see
//! [`stream`]). [`file`] composes both into the per-file on-disk framing
//! used by the blob pool.

pub mod aead;
pub mod file;
pub mod keys;
pub mod stream;

use thiserror::Error;

/// Errors that can occur during cryptographic operations.
///
/// Authentication failures are indistinguishable from wrong-key usage by
/// design; callers decide which interpretation to surface.
#[derive(Error, Debug)]
pub enum CryptoError {
    /// The operating system's secure random source failed. Fatal.
    #[error("secure random source unavailable")]
    RandomSourceUnavailable,

    /// An AEAD authentication tag did not verify.
    ///
    /// The ciphertext was produced under a different key, or has been
    /// tampered with or corrupted.
    #[error("authentication tag mismatch - wrong key or corrupted ciphertext")]
    TagMismatch,

    /// A frame was structurally invalid (too short, bad magic, bad lengths).
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// A streaming frame declared a version this implementation does not know.
    #[error("unsupported stream version {0}")]
    UnsupportedVersion(u8),
}

// Re-export commonly used types
pub use keys::{MasterKey, ShareKey, VaultKey};
