//! Blob pool: pre-allocated random-filled container files.
//!
//! The pool maintains one primary container (`vault_data.bin`) and any
//! number of expansion containers (`vd_<16-hex>.bin`). Containers are
//! filled with random bytes at creation so unused space is indistinguishable
//! from ciphertext. The primary reserves its final 16 bytes for an
//! XOR-obfuscated cursor footer; expansion cursors live exclusively in the
//! encrypted index.
//!
//! The pool imposes no locking of its own. Callers hold the index lock (or
//! are the compaction writer) while touching ranges referenced by index
//! entries; cross-process writers are not supported.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::crypto::aead;
use crate::error::StorageError;
use crate::keystore::SecureKeyStore;

/// Nominal container size: 50 MiB.
pub const CONTAINER_SIZE: u64 = 50 * 1024 * 1024;

/// Reserved footer bytes at the tail of the primary container.
pub const FOOTER_LEN: u64 = 16;

/// Random fill is written in chunks of this size.
const FILL_CHUNK: usize = 1024 * 1024;

/// Footer magic, `"VLTFOOT1"` as a little-endian u64.
const FOOTER_MAGIC: u64 = u64::from_le_bytes(*b"VLTFOOT1");

/// The primary container's well-known id.
pub const PRIMARY_BLOB_ID: &str = "primary";

/// On-disk name of the primary container.
pub const PRIMARY_FILE_NAME: &str = "vault_data.bin";

/// Transient compaction target, renamed over the primary on success.
pub const COMPACT_FILE_NAME: &str = "vault_data_compact.bin";

/// Describes one container and its write cursor.
///
/// Bytes `[0, cursor)` are live or tombstoned file data; `[cursor,
/// capacity)` are random fill. For the primary, `capacity` excludes the
/// footer reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobDescriptor {
    pub blob_id: String,
    pub file_name: String,
    pub capacity: u64,
    pub cursor: u64,
}

impl BlobDescriptor {
    pub fn is_primary(&self) -> bool {
        self.blob_id == PRIMARY_BLOB_ID
    }

    pub fn free(&self) -> u64 {
        self.capacity.saturating_sub(self.cursor)
    }
}

/// File name for a blob id.
pub fn blob_file_name(blob_id: &str) -> String {
    if blob_id == PRIMARY_BLOB_ID {
        PRIMARY_FILE_NAME.to_string()
    } else {
        format!("vd_{blob_id}.bin")
    }
}

/// The container pool rooted at one documents directory.
pub struct BlobPool {
    root: PathBuf,
    footer_key: [u8; 16],
}

impl BlobPool {
    /// Open the pool at `root`, obtaining the footer-obfuscation key from
    /// the key store. Creates the root directory; the primary container is
    /// created lazily by [`ensure_primary`](Self::ensure_primary).
    pub fn open(root: &Path, keystore: &dyn SecureKeyStore) -> Result<Self, StorageError> {
        std::fs::create_dir_all(root).map_err(|e| StorageError::write(root, e))?;
        let footer_key = keystore.footer_key()?;
        Ok(Self {
            root: root.to_path_buf(),
            footer_key,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn blob_path(&self, blob_id: &str) -> PathBuf {
        self.root.join(blob_file_name(blob_id))
    }

    fn primary_path(&self) -> PathBuf {
        self.root.join(PRIMARY_FILE_NAME)
    }

    pub fn compact_path(&self) -> PathBuf {
        self.root.join(COMPACT_FILE_NAME)
    }

    /// Create the primary container if it does not exist yet: allocate,
    /// fill with random bytes and write a zero cursor. All primary access
    /// funnels through this readiness check.
    #[instrument(level = "debug", skip(self))]
    pub fn ensure_primary(&self) -> Result<(), StorageError> {
        let path = self.primary_path();
        if path.exists() {
            return Ok(());
        }
        info!("creating primary container");
        self.create_random_filled(&path, CONTAINER_SIZE)?;
        self.write_footer(0)?;
        Ok(())
    }

    /// Actual on-disk size of a container. Legacy primaries may be larger
    /// than [`CONTAINER_SIZE`]; all footer math derives from this value.
    pub fn blob_file_size(&self, blob_id: &str) -> Result<u64, StorageError> {
        let path = self.blob_path(blob_id);
        let meta = std::fs::metadata(&path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                StorageError::BlobNotInitialized
            } else {
                StorageError::read(&path, e)
            }
        })?;
        Ok(meta.len())
    }

    /// Usable capacity of the primary: file size minus the footer.
    pub fn primary_capacity(&self) -> Result<u64, StorageError> {
        Ok(self.blob_file_size(PRIMARY_BLOB_ID)?.saturating_sub(FOOTER_LEN))
    }

    /// Build the primary descriptor for the current on-disk file.
    pub fn primary_descriptor(&self, cursor: u64) -> Result<BlobDescriptor, StorageError> {
        Ok(BlobDescriptor {
            blob_id: PRIMARY_BLOB_ID.to_string(),
            file_name: PRIMARY_FILE_NAME.to_string(),
            capacity: self.primary_capacity()?,
            cursor,
        })
    }

    /// Decode the primary's cursor footer.
    ///
    /// The plaintext footer is `cursor_u64_le ‖ magic_u64`, XORed with the
    /// keystore's 16-byte key. A failed magic check reads as cursor 0.
    pub fn read_footer(&self) -> Result<u64, StorageError> {
        let size = self.blob_file_size(PRIMARY_BLOB_ID)?;
        if size < FOOTER_LEN {
            return Ok(0);
        }
        let raw = self.read_range(PRIMARY_BLOB_ID, size - FOOTER_LEN, FOOTER_LEN as usize)?;

        let mut plain = [0u8; 16];
        for (i, b) in raw.iter().enumerate() {
            plain[i] = b ^ self.footer_key[i];
        }
        let magic = u64::from_le_bytes(plain[8..16].try_into().unwrap_or([0; 8]));
        if magic != FOOTER_MAGIC {
            warn!("footer magic mismatch, treating cursor as 0");
            return Ok(0);
        }
        Ok(u64::from_le_bytes(plain[0..8].try_into().unwrap_or([0; 8])))
    }

    /// Encode and write the primary's cursor footer.
    pub fn write_footer(&self, cursor: u64) -> Result<(), StorageError> {
        let size = self.blob_file_size(PRIMARY_BLOB_ID)?;
        if size < FOOTER_LEN {
            return Err(StorageError::BlobNotInitialized);
        }

        let mut plain = [0u8; 16];
        plain[0..8].copy_from_slice(&cursor.to_le_bytes());
        plain[8..16].copy_from_slice(&FOOTER_MAGIC.to_le_bytes());
        for (i, b) in plain.iter_mut().enumerate() {
            *b ^= self.footer_key[i];
        }
        self.write_at(PRIMARY_BLOB_ID, size - FOOTER_LEN, &plain)
    }

    /// Open a container for positioned reads.
    pub fn open_for_read(&self, blob_id: &str) -> Result<File, StorageError> {
        let path = self.blob_path(blob_id);
        File::open(&path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                StorageError::BlobNotInitialized
            } else {
                StorageError::read(&path, e)
            }
        })
    }

    /// Open a container for positioned writes (no truncation).
    pub fn open_for_write(&self, blob_id: &str) -> Result<File, StorageError> {
        let path = self.blob_path(blob_id);
        OpenOptions::new()
            .write(true)
            .open(&path)
            .map_err(|e| {
                if e.kind() == io::ErrorKind::NotFound {
                    StorageError::BlobNotInitialized
                } else {
                    StorageError::write(&path, e)
                }
            })
    }

    /// Read `len` bytes at `offset`.
    pub fn read_range(
        &self,
        blob_id: &str,
        offset: u64,
        len: usize,
    ) -> Result<Vec<u8>, StorageError> {
        let path = self.blob_path(blob_id);
        let mut file = self.open_for_read(blob_id)?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| StorageError::read(&path, e))?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)
            .map_err(|e| StorageError::read(&path, e))?;
        Ok(buf)
    }

    /// Write `bytes` at `offset`.
    pub fn write_at(&self, blob_id: &str, offset: u64, bytes: &[u8]) -> Result<(), StorageError> {
        let path = self.blob_path(blob_id);
        let mut file = self.open_for_write(blob_id)?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| StorageError::write(&path, e))?;
        file.write_all(bytes)
            .map_err(|e| StorageError::write(&path, e))?;
        file.sync_data().map_err(|e| StorageError::write(&path, e))?;
        Ok(())
    }

    /// Create a random-filled expansion container.
    ///
    /// Expansions have no footer, so their capacity equals their file size:
    /// normally [`CONTAINER_SIZE`], grown to `min_capacity` when a single
    /// file would not fit a default container.
    #[instrument(level = "debug", skip(self))]
    pub fn create_expansion(&self, min_capacity: u64) -> Result<BlobDescriptor, StorageError> {
        let capacity = min_capacity.max(CONTAINER_SIZE);
        let mut id_bytes = [0u8; 8];
        aead::fill_random(&mut id_bytes);
        let blob_id = hex::encode(id_bytes);

        let file_name = blob_file_name(&blob_id);
        let path = self.root.join(&file_name);
        self.create_random_filled(&path, capacity)?;
        info!(blob_id = %blob_id, capacity, "created expansion container");

        Ok(BlobDescriptor {
            blob_id,
            file_name,
            capacity,
            cursor: 0,
        })
    }

    /// Allocate a file of `size` random bytes at `path`.
    ///
    /// Fills a `.tmp` sibling in 1 MiB chunks and renames into place, so a
    /// crash mid-fill never leaves a half-filled container under the final
    /// name.
    pub fn create_random_filled(&self, path: &Path, size: u64) -> Result<(), StorageError> {
        let tmp = path.with_extension("bin.tmp");
        {
            let mut file = File::create(&tmp).map_err(|e| StorageError::write(&tmp, e))?;
            let mut chunk = vec![0u8; FILL_CHUNK];
            let mut remaining = size;
            while remaining > 0 {
                let n = remaining.min(FILL_CHUNK as u64) as usize;
                aead::fill_random(&mut chunk[..n]);
                file.write_all(&chunk[..n])
                    .map_err(|e| StorageError::write(&tmp, e))?;
                remaining -= n as u64;
            }
            file.sync_all().map_err(|e| StorageError::write(&tmp, e))?;
        }
        std::fs::rename(&tmp, path).map_err(|e| StorageError::write(path, e))?;
        debug!(path = %path.display(), size, "allocated random-filled container");
        Ok(())
    }

    /// Overwrite `[offset, offset + len)` with cryptographically random
    /// bytes. Used for per-file tombstones and bulk wipe.
    pub fn secure_overwrite(
        &self,
        blob_id: &str,
        offset: u64,
        len: u64,
    ) -> Result<(), StorageError> {
        let path = self.blob_path(blob_id);
        let run = || -> io::Result<()> {
            let mut file = OpenOptions::new().write(true).open(&path)?;
            file.seek(SeekFrom::Start(offset))?;
            let mut chunk = vec![0u8; FILL_CHUNK];
            let mut remaining = len;
            while remaining > 0 {
                let n = remaining.min(FILL_CHUNK as u64) as usize;
                aead::fill_random(&mut chunk[..n]);
                file.write_all(&chunk[..n])?;
                remaining -= n as u64;
            }
            file.sync_data()
        };
        run().map_err(|e| StorageError::SecureOverwriteFailed { source: e, path })
    }

    /// Overwrite several ranges of one container through a single writer.
    /// Batch deletes funnel through this so each container is opened once.
    pub fn secure_overwrite_ranges(
        &self,
        blob_id: &str,
        ranges: &[(u64, u64)],
    ) -> Result<(), StorageError> {
        let path = self.blob_path(blob_id);
        let run = || -> io::Result<()> {
            let mut file = OpenOptions::new().write(true).open(&path)?;
            let mut chunk = vec![0u8; FILL_CHUNK];
            for &(offset, len) in ranges {
                file.seek(SeekFrom::Start(offset))?;
                let mut remaining = len;
                while remaining > 0 {
                    let n = remaining.min(FILL_CHUNK as u64) as usize;
                    aead::fill_random(&mut chunk[..n]);
                    file.write_all(&chunk[..n])?;
                    remaining -= n as u64;
                }
            }
            file.sync_data()
        };
        run().map_err(|e| StorageError::SecureOverwriteFailed { source: e, path })
    }

    /// Delete an expansion container's file.
    pub fn delete_blob_file(&self, blob_id: &str) -> Result<(), StorageError> {
        let path = self.blob_path(blob_id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::write(&path, e)),
        }
    }

    /// All expansion blob ids present on disk, from scanning `vd_*.bin`.
    pub fn expansion_ids_on_disk(&self) -> Result<Vec<String>, StorageError> {
        let mut ids = Vec::new();
        let entries =
            std::fs::read_dir(&self.root).map_err(|e| StorageError::read(&self.root, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| StorageError::read(&self.root, e))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(id) = name.strip_prefix("vd_").and_then(|n| n.strip_suffix(".bin")) {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Rename the compaction target over the primary.
    pub fn promote_compacted(&self) -> Result<(), StorageError> {
        let from = self.compact_path();
        let to = self.primary_path();
        std::fs::rename(&from, &to).map_err(|e| StorageError::write(&to, e))
    }

    pub fn primary_exists(&self) -> bool {
        self.primary_path().exists()
    }
}

impl std::fmt::Debug for BlobPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobPool")
            .field("root", &self.root)
            .field("footer_key", &"[REDACTED]")
            .finish()
    }
}
