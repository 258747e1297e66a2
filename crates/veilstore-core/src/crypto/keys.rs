//! Key material types.
//!
//! All three key types hold exactly 32 bytes and zeroize on drop. `Debug`
//! implementations redact the bytes so keys cannot leak through logging.

use std::fmt;

use rand::TryRngCore;
use ring::digest;
use zeroize::Zeroizing;

use super::CryptoError;

/// The host-supplied vault secret.
///
/// Never persisted; only used to wrap and unwrap the per-vault master key
/// and to encrypt the index file. The fingerprint derived from it addresses
/// the vault on disk and doubles as the log-safe vault identifier.
#[derive(Clone)]
pub struct VaultKey(Zeroizing<[u8; 32]>);

impl VaultKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    pub(crate) fn bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// First 16 bytes of SHA-256 over the key, hex-encoded.
    ///
    /// Used as the index file suffix and everywhere the vault needs a
    /// non-secret identity.
    pub fn fingerprint(&self) -> String {
        let hash = digest::digest(&digest::SHA256, self.0.as_ref());
        hex::encode(&hash.as_ref()[..16])
    }
}

impl fmt::Debug for VaultKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("VaultKey").field(&"[REDACTED]").finish()
    }
}

impl PartialEq for VaultKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_ref() == other.0.as_ref()
    }
}

impl Eq for VaultKey {}

/// The per-vault content key.
///
/// Generated once when a vault is created, stored only wrapped under the
/// current [`VaultKey`] inside the index. Every file payload, thumbnail and
/// header is encrypted under this key, so re-keying a vault only re-wraps
/// 32 bytes.
pub struct MasterKey(Zeroizing<[u8; 32]>);

impl MasterKey {
    /// Generate a fresh master key from the OS random source.
    pub fn random() -> Result<Self, CryptoError> {
        let mut bytes = Zeroizing::new([0u8; 32]);
        rand::rngs::OsRng
            .try_fill_bytes(bytes.as_mut())
            .map_err(|_| CryptoError::RandomSourceUnavailable)?;
        Ok(Self(bytes))
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    pub(crate) fn bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Decrypt a single-shot frame sealed under this key.
    ///
    /// The lazy-thumbnail path: lightweight enumeration hands callers the
    /// master key and raw thumbnail ciphertext, and they open frames on
    /// demand without the key bytes ever being exposed.
    pub fn open_frame(&self, frame: &[u8]) -> Result<Vec<u8>, CryptoError> {
        super::aead::open(&self.0, frame)
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MasterKey").field(&"[REDACTED]").finish()
    }
}

/// A share-phrase-derived key protecting one published snapshot.
///
/// Derived deterministically from the normalised phrase (see
/// [`crate::transfer::phrase`]) so any device holding the phrase arrives at
/// the same key.
pub struct ShareKey(Zeroizing<[u8; 32]>);

impl ShareKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    pub(crate) fn bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for ShareKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ShareKey").field(&"[REDACTED]").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_and_hex() {
        let key = VaultKey::from_bytes([7u8; 32]);
        let fp = key.fingerprint();
        assert_eq!(fp.len(), 32);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(fp, VaultKey::from_bytes([7u8; 32]).fingerprint());
    }

    #[test]
    fn different_keys_have_different_fingerprints() {
        let a = VaultKey::from_bytes([1u8; 32]);
        let b = VaultKey::from_bytes([2u8; 32]);
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn debug_redacts_key_material() {
        let key = VaultKey::from_bytes([0xAB; 32]);
        let rendered = format!("{key:?}");
        assert!(!rendered.contains("ab"));
        assert!(rendered.contains("REDACTED"));
    }

    #[test]
    fn random_master_keys_differ() {
        let a = MasterKey::random().unwrap();
        let b = MasterKey::random().unwrap();
        assert_ne!(a.bytes(), b.bytes());
    }
}
