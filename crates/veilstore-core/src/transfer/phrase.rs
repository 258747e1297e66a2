//! Share-phrase derivation.
//!
//! A phrase yields two independent values: a public lookup id (the manifest
//! record name) and the symmetric key protecting the snapshot. Both are
//! computed over the normalised phrase, so case and whitespace differences
//! between devices cannot split a share.
//!
//! Key derivation is PBKDF2-HMAC-SHA-512 with a fixed public salt and a
//! deliberately high iteration count; callers run it off the UI path (see
//! the orchestrators, which push it onto a blocking worker).

use std::num::NonZeroU32;

use ring::{digest, pbkdf2};

use crate::crypto::keys::ShareKey;

/// Fixed public salt for share-key derivation.
pub const SHARE_KEY_SALT: &[u8] = b"vault-share-v1-salt";

/// PBKDF2 iteration count.
pub const PBKDF2_ITERATIONS: NonZeroU32 = NonZeroU32::new(800_000).unwrap();

/// Lowercase, trim, and collapse internal whitespace to single spaces.
pub fn normalize_phrase(raw: &str) -> String {
    raw.to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Deterministic manifest record name: first 128 bits of SHA-256 over the
/// normalised phrase, hex-encoded.
pub fn phrase_vault_id(phrase: &str) -> String {
    let normalized = normalize_phrase(phrase);
    let hash = digest::digest(&digest::SHA256, normalized.as_bytes());
    hex::encode(&hash.as_ref()[..16])
}

/// Derive the 32-byte share key from the phrase. CPU-heavy.
pub fn derive_share_key(phrase: &str) -> ShareKey {
    let normalized = normalize_phrase(phrase);
    let mut out = [0u8; 32];
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA512,
        PBKDF2_ITERATIONS,
        SHARE_KEY_SALT,
        normalized.as_bytes(),
        &mut out,
    );
    ShareKey::from_bytes(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalisation_is_uniform() {
        assert_eq!(normalize_phrase("Alpha Bravo Charlie"), "alpha bravo charlie");
        assert_eq!(normalize_phrase("  alpha   bravo\tcharlie "), "alpha bravo charlie");
        assert_eq!(normalize_phrase("ALPHA BRAVO CHARLIE"), "alpha bravo charlie");
    }

    #[test]
    fn equivalent_phrases_share_an_id() {
        let a = phrase_vault_id("Alpha Bravo Charlie");
        let b = phrase_vault_id("  alpha   bravo charlie");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn distinct_phrases_have_distinct_ids() {
        assert_ne!(
            phrase_vault_id("alpha bravo charlie"),
            phrase_vault_id("alpha bravo delta")
        );
    }

    #[test]
    fn equivalent_phrases_derive_the_same_key() {
        let a = derive_share_key("Alpha Bravo  Charlie");
        let b = derive_share_key("alpha bravo charlie ");
        assert_eq!(a.bytes(), b.bytes());
    }
}
