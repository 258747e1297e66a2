//! Share pipeline: publish, resume, download, sync, revoke.
//!
//! An owner publishes a snapshot of a vault under a one-time phrase. Every
//! live file is re-encrypted from the master key to the phrase-derived
//! share key, the snapshot is staged to disk, chunked, and uploaded under a
//! claim-once manifest keyed by the phrase's public id. A recipient holding
//! only the phrase fetches the manifest, downloads and decrypts the
//! snapshot, imports it into their own vault (which re-encrypts to that
//! vault's master key), and commits the claim with a single conditional
//! write, so exactly one recipient wins a race.
//!
//! All pipeline inputs are taken by value; a started task keeps running
//! regardless of what happens to the caller's vault session. Network work
//! never happens while the index lock is held.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use ring::digest;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::clock;
use crate::crypto::aead;
use crate::crypto::keys::{ShareKey, VaultKey};
use crate::engine::{Engine, StoreOptions};
use crate::error::StorageError;
use crate::index::{SharePolicy, ShareRecord};
use crate::store::{
    FieldValue, ObjectStore, Query, Record, RecordType, SavePolicy, StoreError, with_retry,
};
use uuid::Uuid;

use super::snapshot::{self, SharedVaultSnapshot, SnapshotFile, SnapshotMetadata};
use super::staging::{self, PendingUploadState, StagingError};
use super::{CancelFlag, ShareStatus, TRANSFER_CHUNK_SIZE, phrase};

/// Manifest schema version written by this implementation. Versions below 2
/// wrapped the concatenated chunks in an extra AEAD envelope; readers still
/// accept that.
pub const MANIFEST_VERSION: i64 = 3;

const SYNC_CACHE_DIR: &str = "share_cache";
const SYNC_CACHE_HASH_FILE: &str = "last_hash";

/// Errors surfaced by the share pipeline.
#[derive(Error, Debug)]
pub enum ShareError {
    #[error("object store not available")]
    NotAvailable,

    #[error("share upload failed: {0}")]
    UploadFailed(String),

    #[error("share download failed: {0}")]
    DownloadFailed(String),

    /// No manifest exists for the phrase.
    #[error("no share exists for this phrase")]
    VaultNotFound,

    #[error("share encryption failed")]
    EncryptionFailed,

    /// Wrong phrase or corrupted remote data; indistinguishable by design.
    #[error("share decryption failed - wrong phrase or corrupted data")]
    DecryptionFailed,

    #[error("invalid share data: {0}")]
    InvalidData(String),

    /// Terminal: another recipient already claimed this share.
    #[error("this share has already been claimed")]
    AlreadyClaimed,

    /// Terminal: the owner revoked this share.
    #[error("this share has been revoked")]
    Revoked,

    #[error("share transfer cancelled")]
    Cancelled,

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Staging(#[from] StagingError),
}

fn upload_err(e: StoreError) -> ShareError {
    match e {
        StoreError::Unavailable => ShareError::NotAvailable,
        other => ShareError::UploadFailed(other.to_string()),
    }
}

fn download_err(e: StoreError) -> ShareError {
    match e {
        StoreError::Unavailable => ShareError::NotAvailable,
        other => ShareError::DownloadFailed(other.to_string()),
    }
}

fn chunk_record_id(share_vault_id: &str, index: u64) -> String {
    format!("{share_vault_id}_chunk_{index}")
}

fn chunk_count_for(len: usize) -> u64 {
    (len as u64).div_ceil(TRANSFER_CHUNK_SIZE as u64).max(1)
}

/// Result of a completed import.
#[derive(Debug)]
pub struct ImportSummary {
    pub share_vault_id: String,
    pub files_imported: usize,
    pub policy: SharePolicy,
}

struct ActiveTask {
    cancel: CancelFlag,
    _handle: JoinHandle<()>,
}

/// Owns the share pipeline for one engine.
pub struct ShareOrchestrator {
    engine: Arc<Engine>,
    store: Arc<dyn ObjectStore>,
    status_tx: watch::Sender<ShareStatus>,
    active: Mutex<Option<ActiveTask>>,
}

impl ShareOrchestrator {
    pub fn new(engine: Arc<Engine>, store: Arc<dyn ObjectStore>) -> Self {
        let (status_tx, _) = watch::channel(ShareStatus::Idle);
        Self {
            engine,
            store,
            status_tx,
            active: Mutex::new(None),
        }
    }

    /// Observe pipeline status.
    pub fn subscribe(&self) -> watch::Receiver<ShareStatus> {
        self.status_tx.subscribe()
    }

    fn set_status(&self, status: ShareStatus) {
        let _ = self.status_tx.send(status);
    }

    fn staging_dir(&self) -> PathBuf {
        self.engine.root().join(staging::SHARE_STAGING_DIR)
    }

    // ---------------------------------------------------------------- upload

    /// Publish a snapshot of the vault under `phrase`. Returns the new
    /// share vault id.
    #[instrument(level = "info", skip_all)]
    pub async fn upload_share(
        &self,
        key: VaultKey,
        phrase: String,
        policy: SharePolicy,
    ) -> Result<String, ShareError> {
        let cancel = CancelFlag::new();
        let result = self.run_upload(key, phrase, policy, &cancel).await;
        match &result {
            Ok(_) => self.set_status(ShareStatus::Complete),
            Err(e) => self.set_status(ShareStatus::Failed(e.to_string())),
        }
        result
    }

    /// Spawn the upload as a detached task, cancelling any prior task.
    pub fn start_upload(self: &Arc<Self>, key: VaultKey, phrase: String, policy: SharePolicy) {
        let cancel = self.replace_active_task();
        let this = Arc::clone(self);
        let flag = cancel.clone();
        let handle = tokio::spawn(async move {
            let result = this.run_upload(key, phrase, policy, &flag).await;
            match result {
                Ok(_) => this.set_status(ShareStatus::Complete),
                Err(e) => this.set_status(ShareStatus::Failed(e.to_string())),
            }
        });
        self.store_active_task(cancel, handle);
    }

    async fn run_upload(
        &self,
        key: VaultKey,
        phrase: String,
        policy: SharePolicy,
        cancel: &CancelFlag,
    ) -> Result<String, ShareError> {
        self.set_status(ShareStatus::Uploading {
            current: 0,
            total: 0,
        });

        // PBKDF2 is CPU-heavy; keep it off the async workers.
        let (phrase_vault_id, share_key) =
            tokio::task::spawn_blocking(move || {
                (phrase::phrase_vault_id(&phrase), phrase::derive_share_key(&phrase))
            })
            .await
            .map_err(|e| ShareError::UploadFailed(format!("key derivation worker: {e}")))?;

        let (snapshot, content_digest) = self.build_snapshot(&key, &share_key, cancel)?;
        let bytes = snapshot::encode(&snapshot)?;

        let id_bytes = aead::random_bytes(16).map_err(StorageError::Crypto)?;
        let share_vault_id = hex::encode(id_bytes.as_slice());
        let policy_json = serde_json::to_vec(&policy)
            .map_err(|e| ShareError::InvalidData(format!("policy encode: {e}")))?;
        let policy_ciphertext = aead::seal(share_key.bytes(), &policy_json)
            .map_err(|_| ShareError::EncryptionFailed)?;

        let state = PendingUploadState {
            share_vault_id: share_vault_id.clone(),
            phrase_vault_id,
            share_key: share_key.bytes().to_vec(),
            chunk_size: TRANSFER_CHUNK_SIZE as u64,
            chunk_count: chunk_count_for(bytes.len()),
            owner_fingerprint: key.fingerprint(),
            manifest_version: MANIFEST_VERSION,
            policy_ciphertext,
            share_policy: policy,
            content_digest,
            created_at: clock::unix_now(),
        };

        // Stage before the first network write: a failure from here on
        // resumes without re-running any crypto.
        let dir = self.staging_dir();
        std::fs::create_dir_all(&dir).map_err(|e| {
            ShareError::Staging(StagingError::Io {
                source: e,
                path: dir.clone(),
            })
        })?;
        let snapshot_path = dir.join(staging::SHARE_SNAPSHOT_FILE);
        std::fs::write(&snapshot_path, &bytes).map_err(|e| {
            ShareError::Staging(StagingError::Io {
                source: e,
                path: snapshot_path,
            })
        })?;
        staging::save_state(&dir, &state)?;

        info!(
            share_vault_id = %state.share_vault_id,
            chunks = state.chunk_count,
            bytes = bytes.len(),
            "share upload staged"
        );

        self.upload_chunks(&state.share_vault_id, &bytes, &HashSet::new(), state.chunk_count, cancel)
            .await?;
        self.save_manifest(&state).await?;
        self.record_share(&key, &state)?;
        self.write_sync_cache(&state.share_vault_id, &state.content_digest)?;
        staging::clear_dir(&dir)?;

        Ok(share_vault_id)
    }

    /// Resume an interrupted upload from staged state.
    ///
    /// All cryptographic outputs are read back from staging; only the
    /// missing chunks and the manifest are written. Returns `Ok(None)` when
    /// nothing is pending.
    #[instrument(level = "info", skip_all)]
    pub async fn resume_pending_upload(
        &self,
        key: VaultKey,
    ) -> Result<Option<String>, ShareError> {
        let dir = self.staging_dir();
        let Some(state) =
            staging::load_state::<PendingUploadState>(&dir, staging::SHARE_STAGING_TTL_SECS)?
        else {
            return Ok(None);
        };

        let snapshot_path = dir.join(staging::SHARE_SNAPSHOT_FILE);
        let bytes = std::fs::read(&snapshot_path).map_err(|e| {
            ShareError::Staging(StagingError::Io {
                source: e,
                path: snapshot_path,
            })
        })?;

        let present = self.present_chunk_indices(&state.share_vault_id).await?;
        info!(
            share_vault_id = %state.share_vault_id,
            present = present.len(),
            total = state.chunk_count,
            "resuming share upload"
        );

        let cancel = CancelFlag::new();
        self.upload_chunks(&state.share_vault_id, &bytes, &present, state.chunk_count, &cancel)
            .await?;
        self.save_manifest(&state).await?;
        self.record_share(&key, &state)?;
        self.write_sync_cache(&state.share_vault_id, &state.content_digest)?;
        staging::clear_dir(&dir)?;

        self.set_status(ShareStatus::Complete);
        Ok(Some(state.share_vault_id))
    }

    /// Re-encrypt every live file and thumbnail from the master key to the
    /// share key.
    ///
    /// Also returns a digest over the plaintext content, used by the
    /// incremental-sync cache: the snapshot's ciphertext is nonce-fresh on
    /// every build, so equality has to be judged on what was encrypted.
    fn build_snapshot(
        &self,
        key: &VaultKey,
        share_key: &ShareKey,
        cancel: &CancelFlag,
    ) -> Result<(SharedVaultSnapshot, String), ShareError> {
        let views = self.engine.list_files(key)?;
        let now = clock::unix_now();
        let mut files = Vec::with_capacity(views.len());
        let mut hasher = digest::Context::new(&digest::SHA256);

        for view in views {
            if cancel.is_cancelled() {
                return Err(ShareError::Cancelled);
            }
            let retrieved = self.engine.retrieve_file(view.file_id, key)?;
            hasher.update(view.file_id.as_bytes());
            hasher.update(retrieved.header.filename.as_bytes());
            hasher.update(retrieved.header.mime_type.as_bytes());
            hasher.update(&retrieved.content);
            if let Some(thumb) = view.thumbnail.as_deref() {
                hasher.update(thumb);
            }

            let ciphertext = aead::seal(share_key.bytes(), &retrieved.content)
                .map_err(|_| ShareError::EncryptionFailed)?;
            let thumbnail = view
                .thumbnail
                .as_deref()
                .map(|t| aead::seal(share_key.bytes(), t))
                .transpose()
                .map_err(|_| ShareError::EncryptionFailed)?;

            files.push(SnapshotFile {
                file_id: view.file_id,
                filename: retrieved.header.filename,
                mime_type: retrieved.header.mime_type,
                ciphertext,
                thumbnail,
                duration: view.duration,
                original_date: view.original_date,
                created_at: view.created_at,
            });
        }

        let snapshot = SharedVaultSnapshot {
            files,
            metadata: SnapshotMetadata {
                owner_fingerprint: key.fingerprint(),
                shared_at: now,
            },
            created_at: now,
            updated_at: now,
        };
        let content_digest = hex::encode(hasher.finish().as_ref());
        Ok((snapshot, content_digest))
    }

    /// Upload every chunk not in `present`, in index order, surfacing
    /// per-chunk progress.
    async fn upload_chunks(
        &self,
        share_vault_id: &str,
        bytes: &[u8],
        present: &HashSet<u64>,
        total: u64,
        cancel: &CancelFlag,
    ) -> Result<(), ShareError> {
        for (index, chunk) in bytes.chunks(TRANSFER_CHUNK_SIZE).enumerate() {
            let index = index as u64;
            if cancel.is_cancelled() {
                return Err(ShareError::Cancelled);
            }
            if present.contains(&index) {
                debug!(index, "chunk already uploaded, skipping");
                self.set_status(ShareStatus::Uploading {
                    current: index + 1,
                    total,
                });
                continue;
            }

            let record = Record::new(
                RecordType::SharedVaultChunk,
                chunk_record_id(share_vault_id, index),
            )
            .with_field("chunkData", FieldValue::Asset(chunk.to_vec()))
            .with_field("chunkIndex", FieldValue::Int(index as i64))
            .with_field("vaultId", FieldValue::Text(share_vault_id.to_string()));

            with_retry(|| self.store.put(record.clone(), SavePolicy::ChangedKeys))
                .await
                .map_err(upload_err)?;

            self.set_status(ShareStatus::Uploading {
                current: index + 1,
                total,
            });
        }
        Ok(())
    }

    /// Write (or update) the manifest record. Claim and revocation flags
    /// are only seeded on first creation, never reset by a re-save.
    async fn save_manifest(&self, state: &PendingUploadState) -> Result<(), ShareError> {
        let existing = with_retry(|| {
            self.store
                .get(RecordType::SharedVault, &state.phrase_vault_id)
        })
        .await
        .map_err(upload_err)?;

        let mut record = Record::new(RecordType::SharedVault, &state.phrase_vault_id)
            .with_field(
                "share_vault_id",
                FieldValue::Text(state.share_vault_id.clone()),
            )
            .with_field("chunk_count", FieldValue::Int(state.chunk_count as i64))
            .with_field("version", FieldValue::Int(state.manifest_version))
            .with_field(
                "owner_fingerprint",
                FieldValue::Text(state.owner_fingerprint.clone()),
            )
            .with_field("updated_at", FieldValue::Timestamp(clock::unix_now()))
            .with_field("policy", FieldValue::Asset(state.policy_ciphertext.clone()));
        if existing.is_none() {
            record.set("claimed", FieldValue::Bool(false));
            record.set("revoked", FieldValue::Bool(false));
        }

        with_retry(|| self.store.put(record.clone(), SavePolicy::ChangedKeys))
            .await
            .map_err(upload_err)?;
        Ok(())
    }

    /// Add a [`ShareRecord`] to the owner's roster, once.
    fn record_share(&self, key: &VaultKey, state: &PendingUploadState) -> Result<(), ShareError> {
        self.engine.index_manager().with_index(key, |ctx| {
            let index = ctx.load()?;
            if index
                .shares
                .iter()
                .any(|s| s.share_id == state.share_vault_id)
            {
                return Ok(());
            }
            index.shares.push(ShareRecord {
                share_id: state.share_vault_id.clone(),
                created_at: state.created_at,
                share_policy: state.share_policy.clone(),
                last_synced_at: Some(clock::unix_now()),
                share_key: state.share_key.clone(),
                sync_sequence: Some(1),
            });
            ctx.save()
        })?;
        Ok(())
    }

    /// Chunk indices already present remotely for a share vault id.
    async fn present_chunk_indices(
        &self,
        share_vault_id: &str,
    ) -> Result<HashSet<u64>, ShareError> {
        let records = with_retry(|| {
            self.store.query(
                Query::all(RecordType::SharedVaultChunk)
                    .field("vaultId", FieldValue::Text(share_vault_id.to_string()))
                    .keys(&["chunkIndex"]),
            )
        })
        .await
        .map_err(upload_err)?;

        Ok(records
            .iter()
            .filter_map(|r| r.int("chunkIndex"))
            .filter_map(|i| u64::try_from(i).ok())
            .collect())
    }

    // --------------------------------------------------------------- import

    /// Download a share by phrase and import it into the local vault under
    /// `key`. Exactly one racing recipient succeeds; the rest see
    /// [`ShareError::AlreadyClaimed`].
    #[instrument(level = "info", skip_all)]
    pub async fn download_and_import(
        &self,
        phrase: String,
        key: VaultKey,
    ) -> Result<ImportSummary, ShareError> {
        let cancel = CancelFlag::new();
        let result = self.run_import(phrase, key, &cancel).await;
        match &result {
            Ok(_) => self.set_status(ShareStatus::ImportComplete),
            Err(e) => self.set_status(ShareStatus::ImportFailed(e.to_string())),
        }
        result
    }

    /// Spawn the import as a detached task, cancelling any prior task.
    pub fn start_import(self: &Arc<Self>, phrase: String, key: VaultKey) {
        let cancel = self.replace_active_task();
        let this = Arc::clone(self);
        let flag = cancel.clone();
        let handle = tokio::spawn(async move {
            let result = this.run_import(phrase, key, &flag).await;
            match result {
                Ok(_) => this.set_status(ShareStatus::ImportComplete),
                Err(e) => this.set_status(ShareStatus::ImportFailed(e.to_string())),
            }
        });
        self.store_active_task(cancel, handle);
    }

    async fn run_import(
        &self,
        phrase: String,
        key: VaultKey,
        cancel: &CancelFlag,
    ) -> Result<ImportSummary, ShareError> {
        self.set_status(ShareStatus::Importing {
            current: 0,
            total: 0,
        });

        let (phrase_vault_id, share_key) =
            tokio::task::spawn_blocking(move || {
                (phrase::phrase_vault_id(&phrase), phrase::derive_share_key(&phrase))
            })
            .await
            .map_err(|e| ShareError::DownloadFailed(format!("key derivation worker: {e}")))?;

        let manifest = with_retry(|| self.store.get(RecordType::SharedVault, &phrase_vault_id))
            .await
            .map_err(download_err)?
            .ok_or(ShareError::VaultNotFound)?;

        if manifest.bool("claimed").unwrap_or(false) {
            return Err(ShareError::AlreadyClaimed);
        }
        if manifest.bool("revoked").unwrap_or(false) {
            return Err(ShareError::Revoked);
        }

        let policy_ct = manifest
            .bytes("policy")
            .ok_or_else(|| ShareError::InvalidData("manifest missing policy".to_string()))?;
        let policy_json = aead::open(share_key.bytes(), policy_ct)
            .map_err(|_| ShareError::DecryptionFailed)?;
        let policy: SharePolicy = serde_json::from_slice(&policy_json)
            .map_err(|e| ShareError::InvalidData(format!("policy decode: {e}")))?;

        let share_vault_id = manifest
            .text("share_vault_id")
            .ok_or_else(|| ShareError::InvalidData("manifest missing share_vault_id".to_string()))?
            .to_string();
        let chunk_count = manifest
            .int("chunk_count")
            .and_then(|c| u64::try_from(c).ok())
            .ok_or_else(|| ShareError::InvalidData("manifest missing chunk_count".to_string()))?;
        let version = manifest.int("version").unwrap_or(1);

        // Chunks are strictly ordered; progress is monotone in the index.
        let mut payload = Vec::new();
        for index in 0..chunk_count {
            if cancel.is_cancelled() {
                return Err(ShareError::Cancelled);
            }
            let id = chunk_record_id(&share_vault_id, index);
            let chunk = with_retry(|| self.store.get(RecordType::SharedVaultChunk, &id))
                .await
                .map_err(download_err)?
                .ok_or_else(|| ShareError::DownloadFailed(format!("missing chunk {index}")))?;
            let data = chunk
                .bytes("chunkData")
                .ok_or_else(|| ShareError::InvalidData(format!("chunk {index} has no data")))?;
            payload.extend_from_slice(data);
            self.set_status(ShareStatus::Importing {
                current: index + 1,
                total: chunk_count,
            });
        }

        // Manifests below version 2 wrapped the chunk concatenation in a
        // legacy outer envelope.
        let payload = if version < 2 {
            aead::open(share_key.bytes(), &payload).map_err(|_| ShareError::DecryptionFailed)?
        } else {
            payload
        };
        let snap = snapshot::decode(&payload)?;

        let total_files = snap.files.len() as u64;
        let mut imported: Vec<Uuid> = Vec::with_capacity(snap.files.len());
        for (done, file) in snap.files.iter().enumerate() {
            if cancel.is_cancelled() {
                self.rollback_import(&imported, &key);
                return Err(ShareError::Cancelled);
            }
            let plain = aead::open(share_key.bytes(), &file.ciphertext)
                .map_err(|_| ShareError::DecryptionFailed)?;
            let thumbnail = file
                .thumbnail
                .as_deref()
                .and_then(|t| aead::open(share_key.bytes(), t).ok());

            let id = self.engine.store_file(
                &plain,
                &file.filename,
                &file.mime_type,
                &key,
                StoreOptions {
                    thumbnail,
                    duration: file.duration,
                    file_id: Some(file.file_id),
                    original_date: file.original_date,
                },
            )?;
            imported.push(id);

            self.set_status(ShareStatus::Importing {
                current: done as u64 + 1,
                total: total_files,
            });
            // Keep the host responsive during large imports.
            tokio::task::yield_now().await;
        }

        self.claim(&manifest, &imported, &key).await?;

        // Remember the share on the recipient side.
        let wrapped_share_key = aead::seal(key.bytes(), share_key.bytes())
            .map_err(StorageError::Crypto)?;
        let remote_version = u64::try_from(version).unwrap_or(0);
        self.engine.index_manager().with_index(&key, |ctx| {
            let index = ctx.load()?;
            index.is_shared_vault = true;
            index.share_vault_id = Some(share_vault_id.clone());
            index.share_policy = Some(policy.clone());
            index.wrapped_share_key = Some(wrapped_share_key.clone());
            index.remote_version = Some(remote_version);
            ctx.save()
        })?;

        info!(share_vault_id = %share_vault_id, files = imported.len(), "share imported");
        Ok(ImportSummary {
            share_vault_id,
            files_imported: imported.len(),
            policy,
        })
    }

    /// Single-write claim commit. A conflict means another recipient won;
    /// the local import is rolled back so the loser's vault is unchanged.
    async fn claim(
        &self,
        manifest: &Record,
        imported: &[Uuid],
        key: &VaultKey,
    ) -> Result<(), ShareError> {
        let mut claim = manifest.clone();
        claim.set("claimed", FieldValue::Bool(true));

        match self.store.put(claim, SavePolicy::IfUnchanged).await {
            Ok(_) => Ok(()),
            Err(StoreError::Conflict { server }) => {
                self.rollback_import(imported, key);
                match server {
                    Some(s) if s.bool("revoked").unwrap_or(false) => Err(ShareError::Revoked),
                    _ => Err(ShareError::AlreadyClaimed),
                }
            }
            Err(e) => {
                self.rollback_import(imported, key);
                Err(download_err(e))
            }
        }
    }

    fn rollback_import(&self, imported: &[Uuid], key: &VaultKey) {
        if imported.is_empty() {
            return;
        }
        warn!(count = imported.len(), "rolling back imported files");
        if let Err(e) = self.engine.delete_files(imported, key, None) {
            warn!(error = %e, "import rollback failed");
        }
    }

    // ----------------------------------------------------------------- sync

    /// Re-publish the vault's current content to an existing share.
    /// Returns `false` when the snapshot is unchanged since the last sync
    /// and nothing was uploaded.
    #[instrument(level = "info", skip_all, fields(share_vault_id = %share_vault_id))]
    pub async fn sync_share(
        &self,
        key: VaultKey,
        share_vault_id: String,
    ) -> Result<bool, ShareError> {
        let record = self.engine.index_manager().with_index(&key, |ctx| {
            Ok(ctx
                .load()?
                .shares
                .iter()
                .find(|s| s.share_id == share_vault_id)
                .cloned())
        })?;
        let record = record.ok_or_else(|| {
            ShareError::InvalidData(format!("no share roster entry for {share_vault_id}"))
        })?;

        let key_bytes: [u8; 32] = record.share_key.as_slice().try_into().map_err(|_| {
            ShareError::InvalidData("roster share key has invalid length".to_string())
        })?;
        let share_key = ShareKey::from_bytes(key_bytes);

        let (snapshot, content_digest) =
            self.build_snapshot(&key, &share_key, &CancelFlag::new())?;
        if self.read_sync_cache(&share_vault_id) == Some(content_digest.clone()) {
            debug!("snapshot unchanged since last sync, skipping upload");
            return Ok(false);
        }
        let bytes = snapshot::encode(&snapshot)?;

        let current_version = record.sync_sequence.unwrap_or(1) as i64;
        self.sync_shared_vault(&share_vault_id, &bytes, current_version)
            .await?;

        self.engine.index_manager().with_index(&key, |ctx| {
            let index = ctx.load()?;
            if let Some(s) = index
                .shares
                .iter_mut()
                .find(|s| s.share_id == share_vault_id)
            {
                s.last_synced_at = Some(clock::unix_now());
                s.sync_sequence = Some(s.sync_sequence.unwrap_or(1) + 1);
            }
            ctx.save()
        })?;
        self.write_sync_cache(&share_vault_id, &content_digest)?;
        Ok(true)
    }

    /// Replace all chunks of a share and bump its manifest version.
    pub async fn sync_shared_vault(
        &self,
        share_vault_id: &str,
        snapshot_bytes: &[u8],
        current_version: i64,
    ) -> Result<(), ShareError> {
        self.delete_chunks(share_vault_id).await?;

        let total = chunk_count_for(snapshot_bytes.len());
        self.upload_chunks(
            share_vault_id,
            snapshot_bytes,
            &HashSet::new(),
            total,
            &CancelFlag::new(),
        )
        .await?;

        let manifest = self
            .manifest_by_share_vault_id(share_vault_id)
            .await?
            .ok_or(ShareError::VaultNotFound)?;
        let mut update = Record::new(RecordType::SharedVault, &manifest.id);
        update.set("chunk_count", FieldValue::Int(total as i64));
        update.set("version", FieldValue::Int(current_version + 1));
        update.set("updated_at", FieldValue::Timestamp(clock::unix_now()));
        with_retry(|| self.store.put(update.clone(), SavePolicy::ChangedKeys))
            .await
            .map_err(upload_err)?;
        Ok(())
    }

    // ------------------------------------------------------ revoke / delete

    /// Mark a share revoked; recipients see [`ShareError::Revoked`].
    #[instrument(level = "info", skip(self))]
    pub async fn revoke(&self, share_vault_id: &str) -> Result<(), ShareError> {
        let manifest = self
            .manifest_by_share_vault_id(share_vault_id)
            .await?
            .ok_or(ShareError::VaultNotFound)?;
        let mut update = Record::new(RecordType::SharedVault, &manifest.id);
        update.set("revoked", FieldValue::Bool(true));
        with_retry(|| self.store.put(update.clone(), SavePolicy::ChangedKeys))
            .await
            .map_err(upload_err)?;
        Ok(())
    }

    /// Remove a share completely: chunks, manifest, roster entry and sync
    /// cache.
    #[instrument(level = "info", skip(self, key))]
    pub async fn delete_share(
        &self,
        key: &VaultKey,
        share_vault_id: &str,
    ) -> Result<(), ShareError> {
        self.delete_chunks(share_vault_id).await?;
        if let Some(manifest) = self.manifest_by_share_vault_id(share_vault_id).await? {
            with_retry(|| self.store.delete(RecordType::SharedVault, &manifest.id))
                .await
                .map_err(upload_err)?;
        }

        self.engine.index_manager().with_index(key, |ctx| {
            let index = ctx.load()?;
            index.shares.retain(|s| s.share_id != share_vault_id);
            ctx.save()
        })?;

        let cache_dir = self.sync_cache_dir(share_vault_id);
        if cache_dir.exists() {
            let _ = std::fs::remove_dir_all(cache_dir);
        }
        Ok(())
    }

    async fn delete_chunks(&self, share_vault_id: &str) -> Result<(), ShareError> {
        let chunks = with_retry(|| {
            self.store.query(
                Query::all(RecordType::SharedVaultChunk)
                    .field("vaultId", FieldValue::Text(share_vault_id.to_string()))
                    .keys(&["chunkIndex"]),
            )
        })
        .await
        .map_err(upload_err)?;

        for chunk in chunks {
            with_retry(|| self.store.delete(RecordType::SharedVaultChunk, &chunk.id))
                .await
                .map_err(upload_err)?;
        }
        Ok(())
    }

    async fn manifest_by_share_vault_id(
        &self,
        share_vault_id: &str,
    ) -> Result<Option<Record>, ShareError> {
        let mut manifests = with_retry(|| {
            self.store.query(
                Query::all(RecordType::SharedVault)
                    .field("share_vault_id", FieldValue::Text(share_vault_id.to_string())),
            )
        })
        .await
        .map_err(upload_err)?;
        Ok(if manifests.is_empty() {
            None
        } else {
            Some(manifests.swap_remove(0))
        })
    }

    // ------------------------------------------------------------ task mgmt

    /// Cancel any running task and hand back a fresh flag for the next one.
    fn replace_active_task(&self) -> CancelFlag {
        let mut active = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(prev) = active.take() {
            prev.cancel.cancel();
        }
        CancelFlag::new()
    }

    fn store_active_task(&self, cancel: CancelFlag, handle: JoinHandle<()>) {
        let mut active = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *active = Some(ActiveTask {
            cancel,
            _handle: handle,
        });
    }

    /// Cooperatively cancel the running task, if any.
    pub fn cancel_active(&self) {
        let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = active.as_ref() {
            task.cancel.cancel();
        }
    }

    // ------------------------------------------------------------ sync cache

    fn sync_cache_dir(&self, share_vault_id: &str) -> PathBuf {
        self.engine
            .root()
            .join(SYNC_CACHE_DIR)
            .join(share_vault_id)
    }

    fn write_sync_cache(&self, share_vault_id: &str, digest: &str) -> Result<(), ShareError> {
        let dir = self.sync_cache_dir(share_vault_id);
        std::fs::create_dir_all(&dir).map_err(|e| {
            ShareError::Staging(StagingError::Io {
                source: e,
                path: dir.clone(),
            })
        })?;
        let path = dir.join(SYNC_CACHE_HASH_FILE);
        std::fs::write(&path, digest).map_err(|e| {
            ShareError::Staging(StagingError::Io { source: e, path })
        })?;
        Ok(())
    }

    fn read_sync_cache(&self, share_vault_id: &str) -> Option<String> {
        std::fs::read_to_string(self.sync_cache_dir(share_vault_id).join(SYNC_CACHE_HASH_FILE))
            .ok()
    }
}

impl std::fmt::Debug for ShareOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShareOrchestrator").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_ids_follow_the_wire_convention() {
        assert_eq!(chunk_record_id("abc123", 0), "abc123_chunk_0");
        assert_eq!(chunk_record_id("abc123", 17), "abc123_chunk_17");
    }

    #[test]
    fn chunk_count_rounds_up_and_never_reads_zero() {
        assert_eq!(chunk_count_for(0), 1);
        assert_eq!(chunk_count_for(1), 1);
        assert_eq!(chunk_count_for(TRANSFER_CHUNK_SIZE), 1);
        assert_eq!(chunk_count_for(TRANSFER_CHUNK_SIZE + 1), 2);
        assert_eq!(chunk_count_for(7 * 1024 * 1024), 4);
    }
}
