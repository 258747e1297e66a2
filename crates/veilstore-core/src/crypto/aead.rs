//! Single-shot AEAD, HMAC witness and random bytes.
//!
//! The single-shot frame is `nonce(12) ‖ ciphertext ‖ tag(16)`; the tag is
//! appended to the ciphertext by the cipher. Sealing `n` plaintext bytes
//! always yields `n + 28` frame bytes.

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit},
};
use rand::{RngCore, TryRngCore};
use ring::hmac;
use zeroize::Zeroizing;

use super::CryptoError;

/// Nonce prefix plus tag suffix added by [`seal`].
pub const FRAME_OVERHEAD: usize = NONCE_LEN + TAG_LEN;

pub(crate) const NONCE_LEN: usize = 12;
pub(crate) const TAG_LEN: usize = 16;

/// Encrypt `plaintext` into a self-contained frame under `key`.
pub fn seal(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));

    let mut nonce = [0u8; NONCE_LEN];
    rand::rng().fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::MalformedFrame("encryption failed".to_string()))?;

    let mut frame = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    frame.extend_from_slice(&nonce);
    frame.extend_from_slice(&ciphertext);
    Ok(frame)
}

/// Decrypt a frame produced by [`seal`]. Fails with [`CryptoError::TagMismatch`]
/// if the tag does not verify under `key`.
pub fn open(key: &[u8; 32], frame: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if frame.len() < FRAME_OVERHEAD {
        return Err(CryptoError::MalformedFrame(format!(
            "frame too short: expected at least {FRAME_OVERHEAD} bytes, got {}",
            frame.len()
        )));
    }

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = Nonce::from_slice(&frame[..NONCE_LEN]);

    cipher
        .decrypt(nonce, &frame[NONCE_LEN..])
        .map_err(|_| CryptoError::TagMismatch)
}

/// Exact frame length [`seal`] produces for `plain_len` plaintext bytes.
pub fn sealed_len(plain_len: u64) -> u64 {
    plain_len + FRAME_OVERHEAD as u64
}

/// HMAC-SHA-256 over `data`, used as the backup integrity witness.
pub fn hmac_sha256(key: &[u8; 32], data: &[u8]) -> [u8; 32] {
    let key = hmac::Key::new(hmac::HMAC_SHA256, key);
    let tag = hmac::sign(&key, data);
    let mut out = [0u8; 32];
    out.copy_from_slice(tag.as_ref());
    out
}

/// Cryptographically secure random bytes from the OS source.
///
/// The only fatal crypto error: if the OS cannot produce entropy there is
/// nothing sensible the engine can do.
pub fn random_bytes(len: usize) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let mut bytes = Zeroizing::new(vec![0u8; len]);
    rand::rngs::OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|_| CryptoError::RandomSourceUnavailable)?;
    Ok(bytes)
}

/// Fill a buffer with random bytes from the thread-local CSPRNG.
///
/// Used for nonces, blob fill and secure overwrite, where the per-call
/// fallibility of [`random_bytes`] would be noise.
pub(crate) fn fill_random(buf: &mut [u8]) {
    rand::rng().fill_bytes(buf);
}
