//! Chunked streaming AEAD.
//!
//! On-disk layout:
//!
//! ```text
//! magic(4) ‖ version(1) ‖ chunk_size_log2(1) ‖ reserved(2)
//! [ chunk_len_u32_le ‖ nonce(12) ‖ ciphertext ‖ tag(16) ]*
//! ```
//!
//! `chunk_len` counts ciphertext bytes only (which equals the plaintext
//! length for GCM), excluding nonce and tag. Each chunk carries an
//! independent random nonce under the same key, with the chunk index bound
//! as associated data so chunks cannot be reordered undetected. A truncated
//! terminal chunk is permitted; no zero-length tail is required. Any tag
//! failure aborts decryption.
//!
//! Peak memory on both paths is bounded by one plaintext chunk.

use std::io::{self, Read, Write};

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use thiserror::Error;
use tracing::trace;

use super::CryptoError;
use super::aead::{NONCE_LEN, TAG_LEN, fill_random};

/// Stream frame magic, `"VSF1"`.
pub const STREAM_MAGIC: [u8; 4] = *b"VSF1";

/// Current stream format version.
pub const STREAM_VERSION: u8 = 1;

/// Default plaintext chunk size: 256 KiB.
pub const DEFAULT_CHUNK_LOG2: u8 = 18;

/// Fixed stream header length.
pub const STREAM_HEADER_LEN: usize = 8;

/// Per-chunk framing overhead: length prefix, nonce and tag.
pub const CHUNK_OVERHEAD: usize = 4 + NONCE_LEN + TAG_LEN;

const MIN_CHUNK_LOG2: u8 = 10;
const MAX_CHUNK_LOG2: u8 = 26;

/// Errors from the streaming codec.
#[derive(Error, Debug)]
pub enum StreamError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("stream io error: {0}")]
    Io(#[from] io::Error),
}

/// Exact ciphertext byte count for `plain_len` bytes of plaintext under the
/// default chunk size. Allocation happens against this before any byte is
/// encrypted.
pub fn encrypted_content_size(plain_len: u64) -> u64 {
    let chunk = 1u64 << DEFAULT_CHUNK_LOG2;
    let chunks = plain_len.div_ceil(chunk).max(1);
    STREAM_HEADER_LEN as u64 + chunks * CHUNK_OVERHEAD as u64 + plain_len
}

/// True if `content` starts with the stream magic.
///
/// A single-shot frame starts with a random nonce, so a false positive has
/// probability 2^-32; the framing accepts that trade for a self-describing
/// layout.
pub fn is_stream(content: &[u8]) -> bool {
    content.len() >= STREAM_HEADER_LEN && content[..4] == STREAM_MAGIC
}

/// Encrypt everything `reader` yields into `writer`. Returns the number of
/// ciphertext bytes written (header included).
pub fn encrypt_stream<R: Read + ?Sized, W: Write + ?Sized>(
    key: &[u8; 32],
    reader: &mut R,
    writer: &mut W,
) -> Result<u64, StreamError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let chunk_size = 1usize << DEFAULT_CHUNK_LOG2;

    writer.write_all(&STREAM_MAGIC)?;
    writer.write_all(&[STREAM_VERSION, DEFAULT_CHUNK_LOG2, 0, 0])?;
    let mut written = STREAM_HEADER_LEN as u64;

    let mut buf = vec![0u8; chunk_size];
    let mut chunk_index: u64 = 0;
    loop {
        let filled = read_up_to(reader, &mut buf)?;
        // An empty input still gets one authenticated empty chunk.
        if filled == 0 && chunk_index > 0 {
            break;
        }

        let mut nonce = [0u8; NONCE_LEN];
        fill_random(&mut nonce);

        let aad = chunk_index.to_le_bytes();
        let sealed = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &buf[..filled],
                    aad: &aad,
                },
            )
            .map_err(|_| CryptoError::MalformedFrame("chunk encryption failed".to_string()))?;

        let chunk_len = (sealed.len() - TAG_LEN) as u32;
        writer.write_all(&chunk_len.to_le_bytes())?;
        writer.write_all(&nonce)?;
        writer.write_all(&sealed)?;
        written += CHUNK_OVERHEAD as u64 + u64::from(chunk_len);

        trace!(chunk = chunk_index, plain = filled, "encrypted chunk");
        chunk_index += 1;
        if filled < chunk_size {
            break;
        }
    }

    Ok(written)
}

/// Decrypt exactly `stream_len` bytes from `reader` into `writer`. Returns
/// the plaintext byte count.
pub fn decrypt_stream<R: Read + ?Sized, W: Write + ?Sized>(
    key: &[u8; 32],
    reader: &mut R,
    stream_len: u64,
    writer: &mut W,
) -> Result<u64, StreamError> {
    let mut limited = reader.take(stream_len);

    let mut header = [0u8; STREAM_HEADER_LEN];
    read_exact_or_malformed(&mut limited, &mut header, "stream header")?;

    if header[..4] != STREAM_MAGIC {
        return Err(CryptoError::MalformedFrame("bad stream magic".to_string()).into());
    }
    if header[4] != STREAM_VERSION {
        return Err(CryptoError::UnsupportedVersion(header[4]).into());
    }
    let chunk_log2 = header[5];
    if !(MIN_CHUNK_LOG2..=MAX_CHUNK_LOG2).contains(&chunk_log2) {
        return Err(
            CryptoError::MalformedFrame(format!("chunk_size_log2 {chunk_log2} out of range"))
                .into(),
        );
    }
    let chunk_size = 1usize << chunk_log2;

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let mut remaining = stream_len - STREAM_HEADER_LEN as u64;
    let mut sealed = Vec::with_capacity(chunk_size + TAG_LEN);
    let mut plain_total: u64 = 0;
    let mut chunk_index: u64 = 0;

    while remaining > 0 {
        if remaining < CHUNK_OVERHEAD as u64 {
            return Err(CryptoError::MalformedFrame(format!(
                "truncated chunk framing: {remaining} trailing bytes"
            ))
            .into());
        }

        let mut len_buf = [0u8; 4];
        read_exact_or_malformed(&mut limited, &mut len_buf, "chunk length")?;
        let chunk_len = u32::from_le_bytes(len_buf) as usize;
        if chunk_len > chunk_size {
            return Err(CryptoError::MalformedFrame(format!(
                "chunk length {chunk_len} exceeds chunk size {chunk_size}"
            ))
            .into());
        }
        if remaining < (CHUNK_OVERHEAD + chunk_len) as u64 {
            return Err(CryptoError::MalformedFrame("truncated terminal chunk".to_string()).into());
        }

        let mut nonce = [0u8; NONCE_LEN];
        read_exact_or_malformed(&mut limited, &mut nonce, "chunk nonce")?;

        sealed.resize(chunk_len + TAG_LEN, 0);
        read_exact_or_malformed(&mut limited, &mut sealed, "chunk ciphertext")?;

        let aad = chunk_index.to_le_bytes();
        let plain = cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &sealed,
                    aad: &aad,
                },
            )
            .map_err(|_| CryptoError::TagMismatch)?;

        writer.write_all(&plain)?;
        plain_total += plain.len() as u64;
        remaining -= (CHUNK_OVERHEAD + chunk_len) as u64;
        chunk_index += 1;
    }

    Ok(plain_total)
}

/// Encrypt an in-memory buffer into the stream format.
pub fn encrypt_in_memory(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, StreamError> {
    let mut out = Vec::with_capacity(encrypted_content_size(plaintext.len() as u64) as usize);
    let mut reader = plaintext;
    encrypt_stream(key, &mut reader, &mut out)?;
    Ok(out)
}

/// Decrypt an in-memory stream buffer.
pub fn decrypt_in_memory(key: &[u8; 32], data: &[u8]) -> Result<Vec<u8>, StreamError> {
    let mut out = Vec::new();
    let mut reader = data;
    decrypt_stream(key, &mut reader, data.len() as u64, &mut out)?;
    Ok(out)
}

fn read_up_to<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn read_exact_or_malformed<R: Read + ?Sized>(
    reader: &mut R,
    buf: &mut [u8],
    what: &str,
) -> Result<(), StreamError> {
    reader.read_exact(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            StreamError::Crypto(CryptoError::MalformedFrame(format!("truncated {what}")))
        } else {
            StreamError::Io(e)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 32] = [0x11; 32];
    const CHUNK: usize = 1 << DEFAULT_CHUNK_LOG2;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn round_trip_boundary_sizes() {
        for len in [0, 1, CHUNK - 1, CHUNK, CHUNK + 1, 3 * CHUNK + 17] {
            let plain = pattern(len);
            let sealed = encrypt_in_memory(&KEY, &plain).unwrap();
            assert_eq!(
                sealed.len() as u64,
                encrypted_content_size(len as u64),
                "size accounting for len {len}"
            );
            let opened = decrypt_in_memory(&KEY, &sealed).unwrap();
            assert_eq!(opened, plain, "round trip for len {len}");
        }
    }

    #[test]
    fn stream_magic_is_detectable() {
        let sealed = encrypt_in_memory(&KEY, b"hello").unwrap();
        assert!(is_stream(&sealed));
        assert!(!is_stream(b"notastream"));
    }

    #[test]
    fn wrong_key_aborts() {
        let sealed = encrypt_in_memory(&KEY, &pattern(CHUNK * 2)).unwrap();
        let result = decrypt_in_memory(&[0x12; 32], &sealed);
        assert!(matches!(
            result,
            Err(StreamError::Crypto(CryptoError::TagMismatch))
        ));
    }

    #[test]
    fn corrupt_middle_chunk_aborts() {
        let mut sealed = encrypt_in_memory(&KEY, &pattern(CHUNK * 2 + 5)).unwrap();
        // Flip a byte inside the second chunk's ciphertext.
        let offset = STREAM_HEADER_LEN + CHUNK_OVERHEAD + CHUNK + CHUNK_OVERHEAD + 10;
        sealed[offset] ^= 0xFF;
        assert!(matches!(
            decrypt_in_memory(&KEY, &sealed),
            Err(StreamError::Crypto(CryptoError::TagMismatch))
        ));
    }

    #[test]
    fn swapped_chunks_fail_authentication() {
        let plain = pattern(CHUNK * 2);
        let sealed = encrypt_in_memory(&KEY, &plain).unwrap();
        let chunk_bytes = CHUNK_OVERHEAD + CHUNK;
        let first = STREAM_HEADER_LEN..STREAM_HEADER_LEN + chunk_bytes;
        let second = STREAM_HEADER_LEN + chunk_bytes..STREAM_HEADER_LEN + 2 * chunk_bytes;

        let mut swapped = sealed.clone();
        swapped[first.clone()].copy_from_slice(&sealed[second.clone()]);
        swapped[second].copy_from_slice(&sealed[first]);

        assert!(matches!(
            decrypt_in_memory(&KEY, &swapped),
            Err(StreamError::Crypto(CryptoError::TagMismatch))
        ));
    }

    #[test]
    fn truncated_stream_is_malformed() {
        let sealed = encrypt_in_memory(&KEY, &pattern(100)).unwrap();
        let truncated = &sealed[..sealed.len() - 5];
        assert!(matches!(
            decrypt_in_memory(&KEY, truncated),
            Err(StreamError::Crypto(CryptoError::MalformedFrame(_)))
        ));
    }

    #[test]
    fn unknown_version_is_rejected() {
        let mut sealed = encrypt_in_memory(&KEY, b"x").unwrap();
        sealed[4] = 9;
        assert!(matches!(
            decrypt_in_memory(&KEY, &sealed),
            Err(StreamError::Crypto(CryptoError::UnsupportedVersion(9)))
        ));
    }

    #[test]
    fn empty_input_writes_one_authenticated_chunk() {
        let sealed = encrypt_in_memory(&KEY, b"").unwrap();
        assert_eq!(sealed.len(), STREAM_HEADER_LEN + CHUNK_OVERHEAD);
        assert_eq!(decrypt_in_memory(&KEY, &sealed).unwrap(), b"");
    }
}
