//! Error types for the storage layers.
//!
//! [`StorageError`] is shared by the blob pool, the index manager and the
//! storage engine; the transfer pipelines have their own taxonomies in
//! [`crate::store`] and [`crate::transfer`], re-exported here.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::crypto::CryptoError;
use crate::crypto::file::FileCryptoError;
use crate::keystore::KeyStoreError;

// Re-export the sibling taxonomies
pub use crate::store::StoreError;
pub use crate::transfer::backup::BackupError;
pub use crate::transfer::share::ShareError;

/// Errors from blob-pool, index and engine operations.
#[derive(Error, Debug)]
pub enum StorageError {
    /// The primary container has not been created yet.
    #[error("blob pool not initialized")]
    BlobNotInitialized,

    /// A write to a container or index file failed.
    #[error("write failed at {path}: {source}")]
    Write {
        #[source]
        source: io::Error,
        path: PathBuf,
    },

    /// A read from a container or index file failed.
    #[error("read failed at {path}: {source}")]
    Read {
        #[source]
        source: io::Error,
        path: PathBuf,
    },

    /// A single file is larger than any container can hold.
    #[error("insufficient space: need {needed} bytes, a container holds at most {available}")]
    InsufficientSpace { needed: u64, available: u64 },

    /// No live entry exists for the requested file id.
    #[error("file not found")]
    FileNotFound,

    /// Stored bytes failed authentication or structural checks.
    ///
    /// Poisons only the affected file; enumeration of other entries
    /// continues.
    #[error("corrupted data: {0}")]
    CorruptedData(String),

    /// A non-empty vault already exists at the target key's fingerprint.
    #[error("a vault already exists for the target key")]
    VaultAlreadyExists,

    /// The engine is configured not to grow the pool any further.
    #[error("container expansion not allowed")]
    ExpansionNotAllowed,

    /// Random-overwrite of a byte range failed.
    #[error("secure overwrite failed at {path}: {source}")]
    SecureOverwriteFailed {
        #[source]
        source: io::Error,
        path: PathBuf,
    },

    /// The index file did not decrypt under the supplied key.
    ///
    /// Terminal: either the wrong key was supplied or the index is damaged.
    /// Callers must surface this; it is never papered over with a synthetic
    /// empty index.
    #[error("index decryption failed - wrong key or damaged index")]
    IndexDecryptionFailed,

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("keystore error: {0}")]
    KeyStore(#[from] KeyStoreError),
}

impl StorageError {
    pub(crate) fn read(path: impl Into<PathBuf>, source: io::Error) -> Self {
        StorageError::Read {
            source,
            path: path.into(),
        }
    }

    pub(crate) fn write(path: impl Into<PathBuf>, source: io::Error) -> Self {
        StorageError::Write {
            source,
            path: path.into(),
        }
    }
}

impl From<FileCryptoError> for StorageError {
    fn from(e: FileCryptoError) -> Self {
        match e {
            FileCryptoError::Crypto(CryptoError::RandomSourceUnavailable) => {
                StorageError::Crypto(CryptoError::RandomSourceUnavailable)
            }
            other => StorageError::CorruptedData(other.to_string()),
        }
    }
}
