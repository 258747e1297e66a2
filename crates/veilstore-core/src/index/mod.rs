//! Encrypted per-vault index management.
//!
//! Each vault's index lives at `vault_index_<fingerprint>.bin`, where the
//! fingerprint is derived from the vault key (see
//! [`VaultKey::fingerprint`]). File contents are one single-shot AEAD frame
//! over the JSON-encoded [`VaultIndex`].
//!
//! A single mutex serialises every load, save and compound operation.
//! Compound operations run inside [`IndexManager::with_index`], which
//! acquires the lock once and hands the closure an [`IndexCtx`]; inner
//! loads and saves go through the context and never re-lock, so the lock
//! does not need to be re-entrant.

pub mod model;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info, instrument, warn};

use crate::crypto::keys::{MasterKey, VaultKey};
use crate::crypto::{CryptoError, aead};
use crate::error::StorageError;
use crate::pool::BlobPool;

pub use model::{CURRENT_INDEX_VERSION, FileEntry, SharePolicy, ShareRecord, VaultIndex};

const INDEX_PREFIX: &str = "vault_index_";
const INDEX_SUFFIX: &str = ".bin";

struct CachedIndex {
    fingerprint: String,
    index: VaultIndex,
}

/// Owns the index cache and the lock discipline for one documents
/// directory.
pub struct IndexManager {
    root: PathBuf,
    pool: Arc<BlobPool>,
    // Single-slot cache: at most one decoded index is held, keyed by the
    // vault-key fingerprint.
    slot: Mutex<Option<CachedIndex>>,
}

impl IndexManager {
    pub fn new(root: &Path, pool: Arc<BlobPool>) -> Self {
        Self {
            root: root.to_path_buf(),
            pool,
            slot: Mutex::new(None),
        }
    }

    /// Run a compound operation under the index lock.
    ///
    /// The closure receives an [`IndexCtx`] scoped to `key`; all loads,
    /// saves and master-key unwraps inside the closure share the one
    /// critical section. Holders must not perform network I/O.
    pub fn with_index<R>(
        &self,
        key: &VaultKey,
        f: impl FnOnce(&mut IndexCtx<'_>) -> Result<R, StorageError>,
    ) -> Result<R, StorageError> {
        let mut guard = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        let mut ctx = IndexCtx {
            root: &self.root,
            pool: &self.pool,
            key,
            fingerprint: key.fingerprint(),
            slot: &mut *guard,
        };
        f(&mut ctx)
    }

    /// Drop the cached index, if any.
    pub fn clear_cache(&self) {
        let mut guard = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        *guard = None;
    }

    /// Drop the cached index only if it belongs to `fingerprint`.
    pub fn invalidate(&self, fingerprint: &str) {
        let mut guard = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if guard
            .as_ref()
            .is_some_and(|c| c.fingerprint == fingerprint)
        {
            *guard = None;
        }
    }

    /// Path of the index file for a fingerprint.
    pub fn index_path(&self, fingerprint: &str) -> PathBuf {
        self.root
            .join(format!("{INDEX_PREFIX}{fingerprint}{INDEX_SUFFIX}"))
    }

    /// All `(fingerprint, path)` pairs of index files on disk.
    pub fn index_files_on_disk(&self) -> Result<Vec<(String, PathBuf)>, StorageError> {
        let mut found = Vec::new();
        let entries =
            std::fs::read_dir(&self.root).map_err(|e| StorageError::read(&self.root, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| StorageError::read(&self.root, e))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(fp) = name
                .strip_prefix(INDEX_PREFIX)
                .and_then(|n| n.strip_suffix(INDEX_SUFFIX))
            {
                found.push((fp.to_string(), entry.path()));
            }
        }
        found.sort();
        Ok(found)
    }

    /// Decrypt and decode the index file for `key`, without touching the
    /// cache or the lock. `Ok(None)` when no file exists.
    pub(crate) fn read_index_file(
        &self,
        key: &VaultKey,
    ) -> Result<Option<VaultIndex>, StorageError> {
        let path = self.index_path(&key.fingerprint());
        read_and_decrypt(&path, key)
    }

    /// Atomically write `index` encrypted under `key`, without touching the
    /// cache or the lock.
    pub(crate) fn write_index_file(
        &self,
        key: &VaultKey,
        index: &VaultIndex,
    ) -> Result<(), StorageError> {
        let path = self.index_path(&key.fingerprint());
        encrypt_and_write(&path, key, index)
    }

    /// Remove the index file for `fingerprint`, ignoring absence.
    pub(crate) fn delete_index_file(&self, fingerprint: &str) -> Result<(), StorageError> {
        let path = self.index_path(fingerprint);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::write(&path, e)),
        }
    }
}

impl std::fmt::Debug for IndexManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexManager")
            .field("root", &self.root)
            .finish()
    }
}

/// One locked critical section over a vault's index.
pub struct IndexCtx<'a> {
    root: &'a Path,
    pool: &'a Arc<BlobPool>,
    key: &'a VaultKey,
    fingerprint: String,
    slot: &'a mut Option<CachedIndex>,
}

impl IndexCtx<'_> {
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn pool(&self) -> &Arc<BlobPool> {
        self.pool
    }

    fn index_path(&self) -> PathBuf {
        self.root
            .join(format!("{INDEX_PREFIX}{}{INDEX_SUFFIX}", self.fingerprint))
    }

    /// Load the index for this context's key, consulting the cache first.
    ///
    /// A missing file means a new vault: a fresh master key is generated
    /// and wrapped, and an empty v3 index is constructed whose primary
    /// cursor comes from the on-disk footer, so legacy container state is
    /// joined seamlessly. A file that fails authentication is
    /// [`StorageError::IndexDecryptionFailed`], never an empty index.
    #[instrument(level = "debug", skip(self), fields(vault = %self.fingerprint))]
    pub fn load(&mut self) -> Result<&mut VaultIndex, StorageError> {
        if self
            .slot
            .as_ref()
            .is_some_and(|c| c.fingerprint == self.fingerprint)
        {
            // Borrow dance: re-take the mutable reference after the check.
            return Ok(&mut self.slot.as_mut().expect("cache slot checked").index);
        }

        let path = self.index_path();
        let index = match read_and_decrypt(&path, self.key)? {
            Some(mut index) => {
                if self.migrate(&mut index)? {
                    encrypt_and_write(&path, self.key, &index)?;
                }
                index
            }
            None => {
                info!(vault = %self.fingerprint, "creating new vault");
                self.new_vault_index()?
            }
        };

        *self.slot = Some(CachedIndex {
            fingerprint: self.fingerprint.clone(),
            index,
        });
        Ok(&mut self.slot.as_mut().expect("cache slot just filled").index)
    }

    /// Persist the cached index atomically and keep the cache current.
    #[instrument(level = "debug", skip(self), fields(vault = %self.fingerprint))]
    pub fn save(&mut self) -> Result<(), StorageError> {
        let cached = self
            .slot
            .as_ref()
            .filter(|c| c.fingerprint == self.fingerprint)
            .ok_or_else(|| {
                StorageError::CorruptedData("save without a loaded index".to_string())
            })?;
        encrypt_and_write(&self.index_path(), self.key, &cached.index)
    }

    /// Unwrap the master key from the loaded index.
    pub fn master_key(&mut self) -> Result<MasterKey, StorageError> {
        let index = self.load()?;
        let wrapped = index
            .wrapped_master_key
            .clone()
            .ok_or_else(|| StorageError::CorruptedData("index has no master key".to_string()))?;
        unwrap_master_key(&wrapped, self.key)
    }

    /// Drop the cache slot (used by destroy paths).
    pub fn invalidate_cache(&mut self) {
        *self.slot = None;
    }

    /// Replace the cache with an index belonging to a different key, after
    /// a rekey has moved the vault to a new fingerprint.
    pub fn cache_as(&mut self, fingerprint: String, index: VaultIndex) {
        *self.slot = Some(CachedIndex { fingerprint, index });
    }

    fn new_vault_index(&self) -> Result<VaultIndex, StorageError> {
        self.pool.ensure_primary()?;
        let cursor = self.pool.read_footer()?;
        let primary = self.pool.primary_descriptor(cursor)?;

        let master = MasterKey::random()?;
        let wrapped = aead::seal(self.key.bytes(), master.bytes())?;

        Ok(VaultIndex {
            version: CURRENT_INDEX_VERSION,
            wrapped_master_key: Some(wrapped),
            total_size: primary.capacity,
            next_offset: cursor,
            blobs: Some(vec![primary]),
            files: Vec::new(),
            shares: Vec::new(),
            is_shared_vault: false,
            share_vault_id: None,
            share_policy: None,
            open_count: 0,
            wrapped_share_key: None,
            remote_version: None,
            custom_name: None,
        })
    }

    /// Run schema migrations in place. Returns whether anything changed.
    fn migrate(&self, index: &mut VaultIndex) -> Result<bool, StorageError> {
        let mut changed = false;

        if index.version <= 1 && index.wrapped_master_key.is_none() {
            info!(vault = %self.fingerprint, "migrating index v1 -> v2: generating master key");
            let master = MasterKey::random()?;
            index.wrapped_master_key = Some(aead::seal(self.key.bytes(), master.bytes())?);
            index.version = 2;
            changed = true;
        }

        if index.version <= 2 && index.blobs.is_none() {
            self.pool.ensure_primary()?;
            let footer_cursor = self.pool.read_footer()?;
            let cursor = footer_cursor.max(index.next_offset);
            info!(
                vault = %self.fingerprint,
                cursor,
                "migrating index v2 -> v3: adopting primary container"
            );
            let primary = self.pool.primary_descriptor(cursor)?;
            index.next_offset = cursor;
            index.total_size = primary.capacity;
            index.blobs = Some(vec![primary]);
            index.version = CURRENT_INDEX_VERSION;
            changed = true;
        }

        Ok(changed)
    }
}

/// Unwrap a sealed master key. Authentication failure here means the index
/// content and its wrap disagree, which is corruption, not a wrong key.
pub(crate) fn unwrap_master_key(
    wrapped: &[u8],
    key: &VaultKey,
) -> Result<MasterKey, StorageError> {
    let plain = aead::open(key.bytes(), wrapped)
        .map_err(|_| StorageError::CorruptedData("master key unwrap failed".to_string()))?;
    let bytes: [u8; 32] = plain.as_slice().try_into().map_err(|_| {
        StorageError::CorruptedData(format!("master key has length {}", plain.len()))
    })?;
    Ok(MasterKey::from_bytes(bytes))
}

fn read_and_decrypt(path: &Path, key: &VaultKey) -> Result<Option<VaultIndex>, StorageError> {
    let ciphertext = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StorageError::read(path, e)),
    };

    let plain = aead::open(key.bytes(), &ciphertext).map_err(|e| match e {
        CryptoError::TagMismatch | CryptoError::MalformedFrame(_) => {
            warn!(path = %path.display(), "index failed authentication");
            StorageError::IndexDecryptionFailed
        }
        other => StorageError::Crypto(other),
    })?;

    let index: VaultIndex = serde_json::from_slice(&plain)
        .map_err(|e| StorageError::CorruptedData(format!("index decode: {e}")))?;
    Ok(Some(index))
}

/// Serialise, encrypt and atomically replace the index file.
///
/// The fresh ciphertext is written to a `.tmp` sibling, read back, decrypted
/// and compared on wrapped-master-key and file count before the rename.
fn encrypt_and_write(path: &Path, key: &VaultKey, index: &VaultIndex) -> Result<(), StorageError> {
    let plain = serde_json::to_vec(index)
        .map_err(|e| StorageError::CorruptedData(format!("index encode: {e}")))?;
    let ciphertext = aead::seal(key.bytes(), &plain)?;

    let tmp = path.with_extension("bin.tmp");
    std::fs::write(&tmp, &ciphertext).map_err(|e| StorageError::write(&tmp, e))?;

    // Verify the write before it becomes authoritative.
    let reread = std::fs::read(&tmp).map_err(|e| StorageError::read(&tmp, e))?;
    let verified: VaultIndex = aead::open(key.bytes(), &reread)
        .map_err(|_| StorageError::CorruptedData("index verify: decrypt failed".to_string()))
        .and_then(|p| {
            serde_json::from_slice(&p)
                .map_err(|e| StorageError::CorruptedData(format!("index verify: decode: {e}")))
        })?;
    if verified.wrapped_master_key != index.wrapped_master_key
        || verified.files.len() != index.files.len()
    {
        let _ = std::fs::remove_file(&tmp);
        return Err(StorageError::CorruptedData(
            "index verify: content mismatch after write".to_string(),
        ));
    }

    std::fs::rename(&tmp, path).map_err(|e| StorageError::write(path, e))?;
    debug!(path = %path.display(), files = index.files.len(), "index saved");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::StaticKeyStore;
    use tempfile::TempDir;

    fn setup(dir: &TempDir) -> IndexManager {
        let pool = Arc::new(BlobPool::open(dir.path(), &StaticKeyStore([3u8; 16])).unwrap());
        IndexManager::new(dir.path(), pool)
    }

    fn key(byte: u8) -> VaultKey {
        VaultKey::from_bytes([byte; 32])
    }

    #[test]
    fn new_vault_has_master_key_and_primary() {
        let dir = TempDir::new().unwrap();
        let mgr = setup(&dir);
        let k = key(1);

        mgr.with_index(&k, |ctx| {
            let index = ctx.load()?;
            assert_eq!(index.version, CURRENT_INDEX_VERSION);
            assert!(index.wrapped_master_key.is_some());
            assert_eq!(index.blob_list().len(), 1);
            assert!(index.blob_list()[0].is_primary());
            assert_eq!(index.blob_list()[0].cursor, 0);
            ctx.master_key()?;
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn save_then_reload_round_trips() {
        let dir = TempDir::new().unwrap();
        let mgr = setup(&dir);
        let k = key(1);

        mgr.with_index(&k, |ctx| {
            let index = ctx.load()?;
            index.custom_name = Some("holiday".to_string());
            ctx.save()
        })
        .unwrap();

        mgr.clear_cache();
        mgr.with_index(&k, |ctx| {
            assert_eq!(ctx.load()?.custom_name.as_deref(), Some("holiday"));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn wrong_key_fails_decryption_not_empty_index() {
        let dir = TempDir::new().unwrap();
        let mgr = setup(&dir);

        mgr.with_index(&key(1), |ctx| {
            ctx.load()?;
            ctx.save()
        })
        .unwrap();
        mgr.clear_cache();

        // The other key has a different fingerprint, so it would normally
        // address a different file. Force a collision by renaming.
        let from = mgr.index_path(&key(1).fingerprint());
        let to = mgr.index_path(&key(2).fingerprint());
        std::fs::rename(from, to).unwrap();

        let result = mgr.with_index(&key(2), |ctx| ctx.load().map(|_| ()));
        assert!(matches!(result, Err(StorageError::IndexDecryptionFailed)));
    }

    #[test]
    fn master_key_survives_reload() {
        let dir = TempDir::new().unwrap();
        let mgr = setup(&dir);
        let k = key(1);

        let first = mgr
            .with_index(&k, |ctx| {
                ctx.load()?;
                ctx.save()?;
                ctx.master_key()
            })
            .unwrap();
        mgr.clear_cache();
        let second = mgr.with_index(&k, |ctx| ctx.master_key()).unwrap();
        assert_eq!(first.bytes(), second.bytes());
    }

    #[test]
    fn v1_index_migrates_to_v3() {
        let dir = TempDir::new().unwrap();
        let mgr = setup(&dir);
        let k = key(1);

        // Hand-write a v1 index file: no master key, no blobs.
        let legacy = serde_json::json!({
            "version": 1,
            "files": [],
            "next_offset": 2048,
            "total_size": 0,
        });
        let ciphertext =
            aead::seal(k.bytes(), legacy.to_string().as_bytes()).unwrap();
        std::fs::write(mgr.index_path(&k.fingerprint()), ciphertext).unwrap();

        mgr.with_index(&k, |ctx| {
            let index = ctx.load()?;
            assert_eq!(index.version, CURRENT_INDEX_VERSION);
            assert!(index.wrapped_master_key.is_some());
            let blobs = index.blob_list();
            assert_eq!(blobs.len(), 1);
            // Footer reads 0; legacy next_offset wins.
            assert_eq!(blobs[0].cursor, 2048);
            Ok(())
        })
        .unwrap();

        // The migration was persisted.
        mgr.clear_cache();
        mgr.with_index(&k, |ctx| {
            assert_eq!(ctx.load()?.version, CURRENT_INDEX_VERSION);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn cache_holds_single_slot() {
        let dir = TempDir::new().unwrap();
        let mgr = setup(&dir);

        mgr.with_index(&key(1), |ctx| {
            ctx.load()?;
            ctx.save()
        })
        .unwrap();
        mgr.with_index(&key(2), |ctx| {
            ctx.load()?;
            ctx.save()
        })
        .unwrap();

        // Loading key(1) again must come from disk, not a stale slot.
        mgr.with_index(&key(1), |ctx| {
            assert!(ctx.load()?.files.is_empty());
            Ok(())
        })
        .unwrap();

        let files = mgr.index_files_on_disk().unwrap();
        assert_eq!(files.len(), 2);
    }

    #[test]
    fn index_files_enumeration_and_delete() {
        let dir = TempDir::new().unwrap();
        let mgr = setup(&dir);
        let k = key(5);

        mgr.with_index(&k, |ctx| {
            ctx.load()?;
            ctx.save()
        })
        .unwrap();

        let fp = k.fingerprint();
        assert!(mgr.index_files_on_disk().unwrap().iter().any(|(f, _)| *f == fp));
        mgr.delete_index_file(&fp).unwrap();
        assert!(mgr.index_files_on_disk().unwrap().is_empty());
        // Deleting again is fine.
        mgr.delete_index_file(&fp).unwrap();
    }
}
