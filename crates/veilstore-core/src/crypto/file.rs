//! Per-file on-disk framing.
//!
//! Inside a blob every stored file is laid out as:
//!
//! ```text
//! header_size_u32_le ‖ encrypted_header ‖ encrypted_content
//! ```
//!
//! The header is a serialized [`EncryptedFileHeader`] sealed single-shot
//! under the master key. Content at or below [`SINGLE_SHOT_LIMIT`] is one
//! single-shot frame; anything larger uses the chunked stream format from
//! [`super::stream`]. Readers distinguish the two by probing the stream
//! magic at the content offset.

use std::fmt;
use std::io::{self, Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace};
use uuid::Uuid;

use super::keys::MasterKey;
use super::stream::{self, StreamError};
use super::{CryptoError, aead};

/// Content up to this size is sealed in one frame; above it, streamed.
pub const SINGLE_SHOT_LIMIT: u64 = 1024 * 1024;

/// Length of the `header_size` prefix.
pub const HEADER_LEN_PREFIX: usize = 4;

/// Bytes of framing kept in the index as a cheap corruption probe.
pub const HEADER_PREVIEW_LEN: usize = 64;

/// Plaintext metadata protected by the file header frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedFileHeader {
    pub file_id: Uuid,
    pub filename: String,
    pub mime_type: String,
    pub original_size: u64,
    pub created_at: u64,
}

/// Errors from file framing operations.
#[derive(Error, Debug)]
pub enum FileCryptoError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("file framing io error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid file framing: {0}")]
    InvalidFraming(String),
}

impl From<StreamError> for FileCryptoError {
    fn from(e: StreamError) -> Self {
        match e {
            StreamError::Crypto(c) => FileCryptoError::Crypto(c),
            StreamError::Io(io) => FileCryptoError::Io(io),
        }
    }
}

impl From<serde_json::Error> for FileCryptoError {
    fn from(e: serde_json::Error) -> Self {
        FileCryptoError::InvalidFraming(format!("header encoding: {e}"))
    }
}

/// A decrypted file: plaintext metadata plus plaintext content.
pub struct DecryptedFile {
    pub header: EncryptedFileHeader,
    pub content: Vec<u8>,
}

impl fmt::Debug for DecryptedFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecryptedFile")
            .field("header", &self.header)
            .field("content_len", &self.content.len())
            .finish()
    }
}

/// Serialize and seal a header under the master key.
pub fn seal_header(
    header: &EncryptedFileHeader,
    key: &MasterKey,
) -> Result<Vec<u8>, FileCryptoError> {
    let plain = serde_json::to_vec(header)?;
    Ok(aead::seal(key.bytes(), &plain)?)
}

/// Open and deserialize a sealed header frame.
pub fn open_header(frame: &[u8], key: &MasterKey) -> Result<EncryptedFileHeader, FileCryptoError> {
    let plain = aead::open(key.bytes(), frame)?;
    Ok(serde_json::from_slice(&plain)?)
}

/// Exact on-disk content size for `original_size` plaintext bytes.
pub fn content_size(original_size: u64) -> u64 {
    if original_size <= SINGLE_SHOT_LIMIT {
        aead::sealed_len(original_size)
    } else {
        stream::encrypted_content_size(original_size)
    }
}

/// Encrypt content bytes, choosing single-shot or streaming by size.
pub fn encrypt_content(data: &[u8], key: &MasterKey) -> Result<Vec<u8>, FileCryptoError> {
    if data.len() as u64 <= SINGLE_SHOT_LIMIT {
        Ok(aead::seal(key.bytes(), data)?)
    } else {
        Ok(stream::encrypt_in_memory(key.bytes(), data)?)
    }
}

/// Decrypt content bytes, sniffing the stream magic.
pub fn decrypt_content(content: &[u8], key: &MasterKey) -> Result<Vec<u8>, FileCryptoError> {
    if stream::is_stream(content) {
        Ok(stream::decrypt_in_memory(key.bytes(), content)?)
    } else {
        Ok(aead::open(key.bytes(), content)?)
    }
}

/// Assemble the full on-disk framing for an in-memory file.
pub fn encode_file(
    data: &[u8],
    header: &EncryptedFileHeader,
    key: &MasterKey,
) -> Result<Vec<u8>, FileCryptoError> {
    let header_frame = seal_header(header, key)?;
    let content = encrypt_content(data, key)?;

    let mut out =
        Vec::with_capacity(HEADER_LEN_PREFIX + header_frame.len() + content.len());
    out.extend_from_slice(&(header_frame.len() as u32).to_le_bytes());
    out.extend_from_slice(&header_frame);
    out.extend_from_slice(&content);
    Ok(out)
}

/// Decrypt a complete on-disk framing from memory.
pub fn decrypt_file(bytes: &[u8], key: &MasterKey) -> Result<DecryptedFile, FileCryptoError> {
    let (header, content_offset) = split_framing(bytes, key)?;
    let content = decrypt_content(&bytes[content_offset..], key)?;
    debug!(
        original_size = header.original_size,
        "decrypted file content"
    );
    Ok(DecryptedFile { header, content })
}

/// Decrypt only the header of a complete framing.
pub fn decrypt_header_only(
    bytes: &[u8],
    key: &MasterKey,
) -> Result<EncryptedFileHeader, FileCryptoError> {
    let (header, _) = split_framing(bytes, key)?;
    Ok(header)
}

fn split_framing(
    bytes: &[u8],
    key: &MasterKey,
) -> Result<(EncryptedFileHeader, usize), FileCryptoError> {
    if bytes.len() < HEADER_LEN_PREFIX {
        return Err(FileCryptoError::InvalidFraming(format!(
            "framing too short: {} bytes",
            bytes.len()
        )));
    }
    let header_len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    let content_offset = HEADER_LEN_PREFIX + header_len;
    if bytes.len() < content_offset {
        return Err(FileCryptoError::InvalidFraming(format!(
            "declared header length {header_len} exceeds framing of {} bytes",
            bytes.len()
        )));
    }
    let header = open_header(&bytes[HEADER_LEN_PREFIX..content_offset], key)?;
    Ok((header, content_offset))
}

/// Stream-decrypt a framed file from `reader` into a file at `dst`.
///
/// `total_len` is the on-disk framing size. Single-shot content is opened in
/// memory (it is at most [`SINGLE_SHOT_LIMIT`] + overhead); streamed content
/// is decrypted chunk by chunk, so peak memory stays bounded by one
/// plaintext chunk.
pub fn decrypt_file_to_path<R: Read>(
    mut reader: R,
    total_len: u64,
    key: &MasterKey,
    dst: &Path,
) -> Result<EncryptedFileHeader, FileCryptoError> {
    let mut len_buf = [0u8; HEADER_LEN_PREFIX];
    reader.read_exact(&mut len_buf)?;
    let header_len = u32::from_le_bytes(len_buf) as u64;

    if total_len < HEADER_LEN_PREFIX as u64 + header_len {
        return Err(FileCryptoError::InvalidFraming(
            "declared header length exceeds framing".to_string(),
        ));
    }

    let mut header_frame = vec![0u8; header_len as usize];
    reader.read_exact(&mut header_frame)?;
    let header = open_header(&header_frame, key)?;

    let content_len = total_len - HEADER_LEN_PREFIX as u64 - header_len;
    let probe_len = content_len.min(stream::STREAM_HEADER_LEN as u64) as usize;
    let mut probe = vec![0u8; probe_len];
    reader.read_exact(&mut probe)?;

    let mut out = std::fs::File::create(dst)?;
    if stream::is_stream(&probe) {
        trace!("content is streamed, decrypting chunk-wise");
        let mut chained = io::Cursor::new(probe).chain(reader);
        stream::decrypt_stream(key.bytes(), &mut chained, content_len, &mut out)?;
    } else {
        let mut content = probe;
        content.resize(content_len as usize, 0);
        reader.read_exact(&mut content[probe_len..])?;
        let plain = aead::open(key.bytes(), &content)?;
        out.write_all(&plain)?;
    }
    out.sync_all()?;

    Ok(header)
}
