//! The storage engine: public vault operations.
//!
//! [`Engine`] composes the crypto layer, the blob pool and the index
//! manager into the operations the host calls: store, retrieve, delete,
//! enumerate, compact, rekey and destroy. Every operation takes the vault
//! key explicitly; compound work runs inside one
//! [`IndexManager::with_index`] critical section, so readers racing a
//! writer observe either the pre-write or the post-write file set, never a
//! torn one.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::clock;
use crate::crypto::aead;
use crate::crypto::file::{
    self as file_crypto, DecryptedFile, EncryptedFileHeader, HEADER_PREVIEW_LEN,
    SINGLE_SHOT_LIMIT,
};
use crate::crypto::keys::{MasterKey, VaultKey};
use crate::error::StorageError;
use crate::index::{FileEntry, IndexCtx, IndexManager, VaultIndex};
use crate::keystore::SecureKeyStore;
use crate::pool::{BlobDescriptor, BlobPool, CONTAINER_SIZE, FOOTER_LEN, PRIMARY_BLOB_ID};

/// Copy buffer for blob-to-blob moves during compaction.
const COPY_CHUNK: usize = 1024 * 1024;

/// Hard ceiling on a single expansion container, and therefore on the
/// on-disk size of a single stored file.
const MAX_EXPANSION_CAPACITY: u64 = 4 * 1024 * 1024 * 1024;

/// Engine construction parameters.
pub struct EngineConfig {
    /// Documents directory holding containers, index files and staging.
    pub root: PathBuf,
    /// Provider of the footer-obfuscation key.
    pub keystore: Arc<dyn SecureKeyStore>,
    /// Cap on expansion containers; `None` means unlimited.
    pub max_expansion_blobs: Option<usize>,
}

/// Optional metadata attached to a store operation.
#[derive(Debug, Default)]
pub struct StoreOptions {
    /// Pre-generated thumbnail bytes; sealed under the master key.
    pub thumbnail: Option<Vec<u8>>,
    /// Media duration in seconds.
    pub duration: Option<f64>,
    /// Preserve a caller-chosen id (import and restore paths).
    pub file_id: Option<Uuid>,
    /// Capture date of the original.
    pub original_date: Option<u64>,
}

/// One element of a batch store.
#[derive(Debug)]
pub struct StoreBatchItem {
    pub data: Vec<u8>,
    pub filename: String,
    pub mime_type: String,
    pub options: StoreOptions,
}

/// A file retrieved into memory.
#[derive(Debug)]
pub struct RetrievedFile {
    pub header: EncryptedFileHeader,
    pub content: Vec<u8>,
}

/// A file retrieved onto disk. The caller owns (and removes) the temp file.
#[derive(Debug)]
pub struct RetrievedTempFile {
    pub header: EncryptedFileHeader,
    pub temp_path: PathBuf,
}

/// Enumeration view with the thumbnail already decrypted.
#[derive(Debug)]
pub struct FileView {
    pub file_id: Uuid,
    pub filename: Option<String>,
    pub mime_type: Option<String>,
    /// On-disk byte count including framing.
    pub size: u64,
    pub created_at: Option<u64>,
    pub duration: Option<f64>,
    pub original_date: Option<u64>,
    pub thumbnail: Option<Vec<u8>>,
}

/// Enumeration view carrying the raw thumbnail ciphertext, for callers
/// that decrypt lazily (grid UIs).
#[derive(Debug)]
pub struct LightweightFileView {
    pub file_id: Uuid,
    pub filename: Option<String>,
    pub mime_type: Option<String>,
    pub size: u64,
    pub created_at: Option<u64>,
    pub duration: Option<f64>,
    pub original_date: Option<u64>,
    pub encrypted_thumbnail: Option<Vec<u8>>,
}

/// Progress callback: `(done, total)`.
pub type ProgressFn = dyn Fn(usize, usize) + Send + Sync;

/// A published share as the roster records it. The share key itself never
/// leaves the encrypted index.
#[derive(Debug, Clone)]
pub struct ShareView {
    pub share_id: String,
    pub created_at: u64,
    pub policy: crate::index::SharePolicy,
    pub last_synced_at: Option<u64>,
    pub sync_sequence: Option<u64>,
}

/// The storage engine handle. Construct one per process and share it.
pub struct Engine {
    root: PathBuf,
    pool: Arc<BlobPool>,
    index: IndexManager,
    max_expansion_blobs: Option<usize>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self, StorageError> {
        std::fs::create_dir_all(&config.root)
            .map_err(|e| StorageError::write(&config.root, e))?;
        let pool = Arc::new(BlobPool::open(&config.root, config.keystore.as_ref())?);
        let index = IndexManager::new(&config.root, Arc::clone(&pool));
        Ok(Self {
            root: config.root,
            pool,
            index,
            max_expansion_blobs: config.max_expansion_blobs,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub(crate) fn pool(&self) -> &Arc<BlobPool> {
        &self.pool
    }

    pub(crate) fn index_manager(&self) -> &IndexManager {
        &self.index
    }

    // ---------------------------------------------------------------- store

    /// Store an in-memory file. Returns the stable file id.
    #[instrument(level = "info", skip_all, fields(filename, size = data.len()))]
    pub fn store_file(
        &self,
        data: &[u8],
        filename: &str,
        mime_type: &str,
        key: &VaultKey,
        options: StoreOptions,
    ) -> Result<Uuid, StorageError> {
        self.index.with_index(key, |ctx| {
            let mut writers = HashMap::new();
            let id = self.store_one(
                ctx,
                &mut writers,
                Payload::Memory(data),
                filename,
                mime_type,
                options,
            )?;
            ctx.save()?;
            Ok(id)
        })
    }

    /// Store a file from disk, streaming content larger than the
    /// single-shot limit so it is never fully resident.
    #[instrument(level = "info", skip_all, fields(src = %src.display()))]
    pub fn store_file_from_path(
        &self,
        src: &Path,
        filename: &str,
        mime_type: &str,
        key: &VaultKey,
        options: StoreOptions,
    ) -> Result<Uuid, StorageError> {
        let meta = std::fs::metadata(src).map_err(|e| StorageError::read(src, e))?;
        let plain_size = meta.len();

        // Small files take the in-memory path; the framing is identical.
        if plain_size <= SINGLE_SHOT_LIMIT {
            let data = std::fs::read(src).map_err(|e| StorageError::read(src, e))?;
            return self.store_file(&data, filename, mime_type, key, options);
        }

        self.index.with_index(key, |ctx| {
            let mut writers = HashMap::new();
            let id = self.store_one(
                ctx,
                &mut writers,
                Payload::Streamed { src, plain_size },
                filename,
                mime_type,
                options,
            )?;
            ctx.save()?;
            Ok(id)
        })
    }

    /// Store a batch with one index save at the end and one writer per
    /// container.
    #[instrument(level = "info", skip_all, fields(count = batch.len()))]
    pub fn store_files(
        &self,
        batch: Vec<StoreBatchItem>,
        key: &VaultKey,
        on_progress: Option<&ProgressFn>,
    ) -> Result<Vec<Uuid>, StorageError> {
        let total = batch.len();
        self.index.with_index(key, |ctx| {
            let mut writers = HashMap::new();
            let mut ids = Vec::with_capacity(total);
            for (done, item) in batch.into_iter().enumerate() {
                let id = self.store_one(
                    ctx,
                    &mut writers,
                    Payload::Memory(&item.data),
                    &item.filename,
                    &item.mime_type,
                    item.options,
                )?;
                ids.push(id);
                if let Some(progress) = on_progress {
                    progress(done + 1, total);
                }
            }
            ctx.save()?;
            Ok(ids)
        })
    }

    /// Write one file into the pool and append its index entry. Does not
    /// save the index; callers batch that.
    fn store_one(
        &self,
        ctx: &mut IndexCtx<'_>,
        writers: &mut HashMap<String, File>,
        payload: Payload<'_>,
        filename: &str,
        mime_type: &str,
        options: StoreOptions,
    ) -> Result<Uuid, StorageError> {
        let master = ctx.master_key()?;
        self.pool.ensure_primary()?;

        let file_id = options.file_id.unwrap_or_else(Uuid::new_v4);
        let created_at = clock::unix_now();
        let header = EncryptedFileHeader {
            file_id,
            filename: filename.to_string(),
            mime_type: mime_type.to_string(),
            original_size: payload.plain_size(),
            created_at,
        };
        let header_frame = file_crypto::seal_header(&header, &master)?;
        let total = 4 + header_frame.len() as u64 + file_crypto::content_size(header.original_size);

        let (blob_idx, offset) = self.allocate(ctx, total)?;
        let index = ctx.load()?;
        let blob = index.blob_list()[blob_idx].clone();

        let writer = match writers.entry(blob.blob_id.clone()) {
            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::hash_map::Entry::Vacant(e) => {
                e.insert(self.pool.open_for_write(&blob.blob_id)?)
            }
        };
        let blob_path = self.pool.blob_path(&blob.blob_id);
        writer
            .seek(SeekFrom::Start(offset))
            .map_err(|e| StorageError::write(&blob_path, e))?;

        let mut prefix =
            Vec::with_capacity(4 + header_frame.len());
        prefix.extend_from_slice(&(header_frame.len() as u32).to_le_bytes());
        prefix.extend_from_slice(&header_frame);
        writer
            .write_all(&prefix)
            .map_err(|e| StorageError::write(&blob_path, e))?;

        match payload {
            Payload::Memory(data) => {
                let content = file_crypto::encrypt_content(data, &master)?;
                writer
                    .write_all(&content)
                    .map_err(|e| StorageError::write(&blob_path, e))?;
            }
            Payload::Streamed { src, .. } => {
                let mut source = File::open(src).map_err(|e| StorageError::read(src, e))?;
                crate::crypto::stream::encrypt_stream(master.bytes(), &mut source, writer)
                    .map_err(file_crypto::FileCryptoError::from)?;
            }
        }
        writer
            .sync_data()
            .map_err(|e| StorageError::write(&blob_path, e))?;

        let encrypted_thumbnail = options
            .thumbnail
            .as_deref()
            .map(|t| aead::seal(master.bytes(), t))
            .transpose()?;

        let preview_len = (total as usize).min(HEADER_PREVIEW_LEN).min(prefix.len());
        let preview = prefix[..preview_len].to_vec();

        let index = ctx.load()?;
        let blobs = index.blob_list_mut();
        blobs[blob_idx].cursor = offset + total;
        let is_primary = blobs[blob_idx].is_primary();
        let new_cursor = blobs[blob_idx].cursor;
        let blob_id = if is_primary {
            None
        } else {
            Some(blobs[blob_idx].blob_id.clone())
        };

        if is_primary {
            self.pool.write_footer(new_cursor)?;
            index.next_offset = new_cursor;
        }

        index.files.push(FileEntry {
            file_id,
            blob_id,
            offset,
            size: total,
            encrypted_header_preview: preview,
            is_deleted: false,
            encrypted_thumbnail,
            mime_type: Some(mime_type.to_string()),
            filename: Some(filename.to_string()),
            created_at: Some(created_at),
            duration: options.duration,
            original_date: options.original_date,
        });

        debug!(%file_id, offset, size = total, "stored file");
        Ok(file_id)
    }

    /// First-fit allocation in declared container order, expanding the
    /// pool when nothing fits.
    fn allocate(
        &self,
        ctx: &mut IndexCtx<'_>,
        total: u64,
    ) -> Result<(usize, u64), StorageError> {
        let index = ctx.load()?;
        for (i, blob) in index.blob_list().iter().enumerate() {
            if blob.cursor + total <= blob.capacity {
                return Ok((i, blob.cursor));
            }
        }

        if total > MAX_EXPANSION_CAPACITY {
            return Err(StorageError::InsufficientSpace {
                needed: total,
                available: MAX_EXPANSION_CAPACITY,
            });
        }
        let expansions = index.blob_list().len().saturating_sub(1);
        if self
            .max_expansion_blobs
            .is_some_and(|max| expansions >= max)
        {
            return Err(StorageError::ExpansionNotAllowed);
        }

        let descriptor = self.pool.create_expansion(total)?;
        let index = ctx.load()?;
        index.blob_list_mut().push(descriptor);
        Ok((index.blob_list().len() - 1, 0))
    }

    // ------------------------------------------------------------- retrieve

    /// Load a stored file fully into memory.
    #[instrument(level = "info", skip(self, key))]
    pub fn retrieve_file(&self, id: Uuid, key: &VaultKey) -> Result<RetrievedFile, StorageError> {
        self.index.with_index(key, |ctx| {
            let master = ctx.master_key()?;
            let index = ctx.load()?;
            let entry = index.live_entry(&id).ok_or(StorageError::FileNotFound)?;
            let (blob_id, offset, size) =
                (entry.resolved_blob_id().to_string(), entry.offset, entry.size);

            let bytes = self.pool.read_range(&blob_id, offset, size as usize)?;
            let DecryptedFile { header, content } = file_crypto::decrypt_file(&bytes, &master)?;
            Ok(RetrievedFile { header, content })
        })
    }

    /// Stream a stored file to a temp path, bounding memory to one chunk.
    /// The caller owns the returned file and removes it when done.
    #[instrument(level = "info", skip(self, key))]
    pub fn retrieve_to_temp(
        &self,
        id: Uuid,
        key: &VaultKey,
    ) -> Result<RetrievedTempFile, StorageError> {
        self.index.with_index(key, |ctx| {
            let master = ctx.master_key()?;
            let index = ctx.load()?;
            let entry = index.live_entry(&id).ok_or(StorageError::FileNotFound)?;
            let (blob_id, offset, size) =
                (entry.resolved_blob_id().to_string(), entry.offset, entry.size);

            let mut reader = self.pool.open_for_read(&blob_id)?;
            let blob_path = self.pool.blob_path(&blob_id);
            reader
                .seek(SeekFrom::Start(offset))
                .map_err(|e| StorageError::read(&blob_path, e))?;
            let limited = reader.take(size);

            let temp = tempfile::Builder::new()
                .prefix("vs_retrieve_")
                .suffix(".bin")
                .tempfile_in(&self.root)
                .map_err(|e| StorageError::write(&self.root, e))?;
            let temp_path = temp.into_temp_path();

            let header = file_crypto::decrypt_file_to_path(limited, size, &master, &temp_path)?;
            let kept = temp_path
                .keep()
                .map_err(|e| StorageError::write(&self.root, e.error))?;
            Ok(RetrievedTempFile {
                header,
                temp_path: kept,
            })
        })
    }

    // --------------------------------------------------------------- delete

    /// Tombstone a file after random-overwriting its bytes in the pool.
    #[instrument(level = "info", skip(self, key))]
    pub fn delete_file(&self, id: Uuid, key: &VaultKey) -> Result<(), StorageError> {
        self.delete_files(&[id], key, None)
    }

    /// Delete a batch: ranges grouped per container, one overwrite pass per
    /// container, one index save.
    #[instrument(level = "info", skip(self, key, on_progress), fields(count = ids.len()))]
    pub fn delete_files(
        &self,
        ids: &[Uuid],
        key: &VaultKey,
        on_progress: Option<&ProgressFn>,
    ) -> Result<(), StorageError> {
        let total = ids.len();
        self.index.with_index(key, |ctx| {
            let index = ctx.load()?;

            let mut ranges: HashMap<String, Vec<(u64, u64)>> = HashMap::new();
            for id in ids {
                let entry = index.live_entry(id).ok_or(StorageError::FileNotFound)?;
                ranges
                    .entry(entry.resolved_blob_id().to_string())
                    .or_default()
                    .push((entry.offset, entry.size));
            }

            for (blob_id, blob_ranges) in &ranges {
                self.pool.secure_overwrite_ranges(blob_id, blob_ranges)?;
            }

            let index = ctx.load()?;
            for (done, id) in ids.iter().enumerate() {
                if let Some(entry) = index.files.iter_mut().find(|f| f.file_id == *id) {
                    entry.is_deleted = true;
                    entry.encrypted_thumbnail = None;
                }
                if let Some(progress) = on_progress {
                    progress(done + 1, total);
                }
            }
            ctx.save()
        })
    }

    // ---------------------------------------------------------- enumeration

    /// Live entries in store order, thumbnails decrypted.
    ///
    /// A thumbnail that fails authentication poisons only its own entry's
    /// thumbnail; enumeration continues.
    #[instrument(level = "debug", skip_all)]
    pub fn list_files(&self, key: &VaultKey) -> Result<Vec<FileView>, StorageError> {
        self.index.with_index(key, |ctx| {
            let master = ctx.master_key()?;
            let index = ctx.load()?;
            let views = index
                .live_files()
                .map(|entry| {
                    let thumbnail = entry.encrypted_thumbnail.as_deref().and_then(|t| {
                        match aead::open(master.bytes(), t) {
                            Ok(plain) => Some(plain),
                            Err(_) => {
                                warn!(file_id = %entry.file_id, "thumbnail failed authentication");
                                None
                            }
                        }
                    });
                    FileView {
                        file_id: entry.file_id,
                        filename: entry.filename.clone(),
                        mime_type: entry.mime_type.clone(),
                        size: entry.size,
                        created_at: entry.created_at,
                        duration: entry.duration,
                        original_date: entry.original_date,
                        thumbnail,
                    }
                })
                .collect();
            Ok(views)
        })
    }

    /// Live entries with raw thumbnail ciphertext plus the unwrapped master
    /// key, for callers that decrypt lazily.
    #[instrument(level = "debug", skip_all)]
    pub fn list_files_lightweight(
        &self,
        key: &VaultKey,
    ) -> Result<(MasterKey, Vec<LightweightFileView>), StorageError> {
        self.index.with_index(key, |ctx| {
            let master = ctx.master_key()?;
            let index = ctx.load()?;
            let views = index
                .live_files()
                .map(|entry| LightweightFileView {
                    file_id: entry.file_id,
                    filename: entry.filename.clone(),
                    mime_type: entry.mime_type.clone(),
                    size: entry.size,
                    created_at: entry.created_at,
                    duration: entry.duration,
                    original_date: entry.original_date,
                    encrypted_thumbnail: entry.encrypted_thumbnail.clone(),
                })
                .collect();
            Ok((master, views))
        })
    }

    /// Bytes reclaimable by compaction.
    pub fn deleted_space(&self, key: &VaultKey) -> Result<u64, StorageError> {
        self.index
            .with_index(key, |ctx| Ok(ctx.load()?.deleted_space()))
    }

    /// Owner-side share roster, without key material.
    pub fn list_shares(&self, key: &VaultKey) -> Result<Vec<ShareView>, StorageError> {
        self.index.with_index(key, |ctx| {
            Ok(ctx
                .load()?
                .shares
                .iter()
                .map(|s| ShareView {
                    share_id: s.share_id.clone(),
                    created_at: s.created_at,
                    policy: s.share_policy.clone(),
                    last_synced_at: s.last_synced_at,
                    sync_sequence: s.sync_sequence,
                })
                .collect())
        })
    }

    /// Containers and cursors as the index records them, for host
    /// diagnostics.
    pub fn blob_descriptors(
        &self,
        key: &VaultKey,
    ) -> Result<Vec<BlobDescriptor>, StorageError> {
        self.index
            .with_index(key, |ctx| Ok(ctx.load()?.blob_list().to_vec()))
    }

    /// The primary cursor as recorded in the on-disk footer.
    pub fn primary_cursor_on_disk(&self) -> Result<u64, StorageError> {
        self.pool.read_footer()
    }

    // ----------------------------------------------------------------- rekey

    /// Replace the vault key without re-encrypting any content: only the
    /// master key is re-wrapped and the index moves to the new fingerprint.
    #[instrument(level = "info", skip_all)]
    pub fn rekey_vault(&self, old_key: &VaultKey, new_key: &VaultKey) -> Result<(), StorageError> {
        let new_fp = new_key.fingerprint();
        self.index.with_index(old_key, |ctx| {
            let master = ctx.master_key()?;
            let old_fp = ctx.fingerprint().to_string();

            if new_fp != old_fp {
                match self.index.read_index_file(new_key) {
                    Ok(Some(existing)) if existing.files.is_empty() => {
                        // An abandoned empty vault at the target; clear it.
                        self.index.delete_index_file(&new_fp)?;
                    }
                    Ok(Some(_)) => return Err(StorageError::VaultAlreadyExists),
                    Ok(None) => {}
                    // A foreign index we cannot read also blocks the rekey.
                    Err(StorageError::IndexDecryptionFailed) => {
                        return Err(StorageError::VaultAlreadyExists);
                    }
                    Err(e) => return Err(e),
                }
            }

            let mut moved = ctx.load()?.clone();
            moved.wrapped_master_key = Some(aead::seal(new_key.bytes(), master.bytes())?);

            self.index.write_index_file(new_key, &moved)?;
            if new_fp != old_fp {
                self.index.delete_index_file(&old_fp)?;
            }
            ctx.cache_as(new_fp.clone(), moved);
            info!(old = %old_fp, new = %new_fp, "vault rekeyed");
            Ok(())
        })
    }

    // --------------------------------------------------------------- compact

    /// Rewrite the pool without tombstoned bytes.
    ///
    /// Live entries are copied blob-to-blob as raw ciphertext (no
    /// re-encryption) into a fresh random-filled primary and as many fresh
    /// expansions as needed. Old containers are random-overwritten, the
    /// compacted primary renamed into place, and the index rebuilt.
    #[instrument(level = "info", skip_all)]
    pub fn compact(&self, key: &VaultKey) -> Result<VaultIndex, StorageError> {
        self.index.with_index(key, |ctx| {
            let result = self.compact_locked(ctx);
            if result.is_err() {
                // Best effort: drop the half-built compaction target.
                let _ = std::fs::remove_file(self.pool.compact_path());
            }
            result
        })
    }

    fn compact_locked(&self, ctx: &mut IndexCtx<'_>) -> Result<VaultIndex, StorageError> {
        let index = ctx.load()?;
        let live: Vec<FileEntry> = index.live_files().cloned().collect();
        let old_blobs: Vec<BlobDescriptor> = index.blob_list().to_vec();
        info!(
            live = live.len(),
            reclaimable = index.deleted_space(),
            "compacting vault"
        );

        let compact_path = self.pool.compact_path();
        self.pool.create_random_filled(&compact_path, CONTAINER_SIZE)?;

        let mut dest = DestBlob::open(
            &compact_path,
            BlobDescriptor {
                blob_id: PRIMARY_BLOB_ID.to_string(),
                file_name: crate::pool::PRIMARY_FILE_NAME.to_string(),
                capacity: CONTAINER_SIZE - FOOTER_LEN,
                cursor: 0,
            },
        )?;
        let mut finished: Vec<BlobDescriptor> = Vec::new();
        let mut new_files: Vec<FileEntry> = Vec::with_capacity(live.len());

        for entry in &live {
            if dest.descriptor.cursor + entry.size > dest.descriptor.capacity {
                finished.push(dest.finish()?);
                let descriptor = self.pool.create_expansion(entry.size)?;
                dest = DestBlob::open(&self.pool.blob_path(&descriptor.blob_id), descriptor)?;
            }

            let offset = dest.descriptor.cursor;
            self.copy_range(entry, &mut dest)?;

            let mut moved = entry.clone();
            moved.blob_id = if dest.descriptor.is_primary() {
                None
            } else {
                Some(dest.descriptor.blob_id.clone())
            };
            moved.offset = offset;
            new_files.push(moved);
        }
        let primary_cursor = if dest.descriptor.is_primary() {
            dest.descriptor.cursor
        } else {
            finished
                .first()
                .map(|b| b.cursor)
                .unwrap_or(dest.descriptor.cursor)
        };
        finished.push(dest.finish()?);

        // Old containers: wipe used ranges, drop expansion files.
        for blob in &old_blobs {
            self.pool.secure_overwrite(&blob.blob_id, 0, blob.cursor)?;
            if !blob.is_primary() {
                self.pool.delete_blob_file(&blob.blob_id)?;
            }
        }

        self.pool.promote_compacted()?;
        self.pool.write_footer(primary_cursor)?;

        let index = ctx.load()?;
        index.files = new_files;
        index.next_offset = primary_cursor;
        index.blobs = Some(finished);
        let primary_capacity = index.blob_list().first().map(|b| b.capacity);
        if let Some(capacity) = primary_capacity {
            index.total_size = capacity;
        }
        ctx.save()?;
        let rebuilt = ctx.load()?.clone();
        info!(files = rebuilt.files.len(), "compaction complete");
        Ok(rebuilt)
    }

    fn copy_range(&self, entry: &FileEntry, dest: &mut DestBlob) -> Result<(), StorageError> {
        let src_id = entry.resolved_blob_id();
        let src_path = self.pool.blob_path(src_id);
        let mut reader = self.pool.open_for_read(src_id)?;
        reader
            .seek(SeekFrom::Start(entry.offset))
            .map_err(|e| StorageError::read(&src_path, e))?;

        let mut remaining = entry.size;
        let mut buf = vec![0u8; COPY_CHUNK];
        while remaining > 0 {
            let n = remaining.min(COPY_CHUNK as u64) as usize;
            reader
                .read_exact(&mut buf[..n])
                .map_err(|e| StorageError::read(&src_path, e))?;
            dest.file
                .write_all(&buf[..n])
                .map_err(|e| StorageError::write(&dest.path, e))?;
            remaining -= n as u64;
        }
        dest.descriptor.cursor += entry.size;
        Ok(())
    }

    // ------------------------------------------------------------- destroy

    /// Delete every index file and reset the primary cursor. Container
    /// bytes remain as unrecoverable ciphertext.
    #[instrument(level = "info", skip(self))]
    pub fn destroy_all(&self) -> Result<(), StorageError> {
        self.index.clear_cache();
        for (fp, _) in self.index.index_files_on_disk()? {
            self.index.delete_index_file(&fp)?;
        }
        if self.pool.primary_exists() {
            self.pool.write_footer(0)?;
        }
        info!("all vaults destroyed");
        Ok(())
    }

    /// Delete every index file except the one addressed by `preserved`.
    /// The duress surface: one vault survives, the rest become noise.
    #[instrument(level = "info", skip_all)]
    pub fn destroy_all_except(&self, preserved: &VaultKey) -> Result<(), StorageError> {
        let keep = preserved.fingerprint();
        self.index.clear_cache();
        for (fp, _) in self.index.index_files_on_disk()? {
            if fp != keep {
                self.index.delete_index_file(&fp)?;
            }
        }
        Ok(())
    }

    /// Random-overwrite every container's full on-disk size, delete
    /// expansion files and reset the primary cursor.
    #[instrument(level = "info", skip(self))]
    pub fn secure_wipe_all_blobs(&self) -> Result<(), StorageError> {
        self.index.clear_cache();
        if self.pool.primary_exists() {
            let size = self.pool.blob_file_size(PRIMARY_BLOB_ID)?;
            self.pool.secure_overwrite(PRIMARY_BLOB_ID, 0, size)?;
            self.pool.write_footer(0)?;
        }
        for id in self.pool.expansion_ids_on_disk()? {
            let size = self.pool.blob_file_size(&id)?;
            self.pool.secure_overwrite(&id, 0, size)?;
            self.pool.delete_blob_file(&id)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").field("root", &self.root).finish()
    }
}

/// Payload source for a store operation.
enum Payload<'a> {
    Memory(&'a [u8]),
    Streamed { src: &'a Path, plain_size: u64 },
}

impl Payload<'_> {
    fn plain_size(&self) -> u64 {
        match self {
            Payload::Memory(data) => data.len() as u64,
            Payload::Streamed { plain_size, .. } => *plain_size,
        }
    }
}

/// A compaction destination: one open writer plus its descriptor.
struct DestBlob {
    descriptor: BlobDescriptor,
    file: File,
    path: PathBuf,
}

impl DestBlob {
    fn open(path: &Path, descriptor: BlobDescriptor) -> Result<Self, StorageError> {
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|e| StorageError::write(path, e))?;
        Ok(Self {
            descriptor,
            file,
            path: path.to_path_buf(),
        })
    }

    fn finish(self) -> Result<BlobDescriptor, StorageError> {
        self.file
            .sync_data()
            .map_err(|e| StorageError::write(&self.path, e))?;
        Ok(self.descriptor)
    }
}
