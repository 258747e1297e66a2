//! Backup pipeline: stage, upload, schedule, restore.
//!
//! A backup captures the whole on-disk vault state: the used prefix of
//! every container the vault references plus every encrypted index file.
//! The payload is packed into the `VBK2` wire format, sealed under the
//! vault key, witnessed by an HMAC over the ciphertext, and chunked to
//! disk. Staging and upload are separate phases: staging needs the vault
//! key, upload does not, so retries keep working while the vault is locked.
//!
//! Restore accepts both the current chunked v2 format and the legacy v1
//! single-asset form (the entire primary container as one attachment).

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::clock;
use crate::crypto::aead;
use crate::crypto::keys::VaultKey;
use crate::engine::Engine;
use crate::error::StorageError;
use crate::pool::{CONTAINER_SIZE, FOOTER_LEN, PRIMARY_BLOB_ID};
use crate::store::{
    FieldValue, ObjectStore, Query, Record, RecordType, SavePolicy, StoreError, with_retry,
};

use super::staging::{self, PendingBackupState, StagingError};
use super::{BackupStatus, CancelFlag, TRANSFER_CHUNK_SIZE};

/// Backup payload magic, `"VBK2"`.
pub const BACKUP_MAGIC: [u8; 4] = *b"VBK2";

/// Current payload format version.
pub const BACKUP_FORMAT_VERSION: u8 = 2;

/// The manifest record name; one backup per account.
pub const BACKUP_MANIFEST_ID: &str = "current_backup";

/// Staged uploads are retried at most this many times with exponential
/// delays; past it, once a day.
pub const MAX_UPLOAD_RETRIES: u32 = 10;

/// A backup is overdue when the last success is older than this.
pub const BACKUP_OVERDUE_SECS: u64 = 24 * 60 * 60;

const UPLOAD_CONCURRENCY: usize = 4;
const AVAILABILITY_DELAYS_SECS: [u64; 5] = [1, 2, 4, 8, 15];
const LOCKED_RETRY_DELAYS_SECS: [u64; 5] = [15 * 60, 3600, 4 * 3600, 12 * 3600, 24 * 3600];
const BACKUP_META_FILE: &str = "backup_meta.json";

/// Errors surfaced by the backup pipeline.
#[derive(Error, Debug)]
pub enum BackupError {
    #[error("object store not available")]
    NotAvailable,

    /// No backup exists to restore.
    #[error("no backup found")]
    ContainerNotFound,

    #[error("backup upload failed: {0}")]
    UploadFailed(String),

    #[error("backup download failed: {0}")]
    DownloadFailed(String),

    /// A chunk the manifest promises is missing remotely.
    #[error("backup chunk not found")]
    FileNotFound,

    /// The integrity witness did not verify; decryption is not attempted.
    #[error("backup checksum mismatch")]
    ChecksumMismatch,

    #[error("invalid backup payload: {0}")]
    InvalidPayload(String),

    #[error("backup cancelled")]
    Cancelled,

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Staging(#[from] StagingError),
}

fn upload_err(e: StoreError) -> BackupError {
    match e {
        StoreError::Unavailable => BackupError::NotAvailable,
        other => BackupError::UploadFailed(other.to_string()),
    }
}

fn download_err(e: StoreError) -> BackupError {
    match e {
        StoreError::Unavailable => BackupError::NotAvailable,
        other => BackupError::DownloadFailed(other.to_string()),
    }
}

fn chunk_record_id(backup_id: &str, index: u64) -> String {
    format!("{backup_id}_bchunk_{index}")
}

// ---------------------------------------------------------------- payload

/// The unpacked backup payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupPayload {
    /// `(blob_id, used bytes [0, cursor))` per container.
    pub blobs: Vec<(String, Vec<u8>)>,
    /// `(file_name, ciphertext)` per index file.
    pub index_files: Vec<(String, Vec<u8>)>,
}

/// Pack a payload into the `VBK2` wire format. All integers little-endian.
pub fn pack_payload(payload: &BackupPayload) -> Result<Vec<u8>, BackupError> {
    let blob_count = u16::try_from(payload.blobs.len())
        .map_err(|_| BackupError::InvalidPayload("too many blobs".to_string()))?;
    let index_count = u16::try_from(payload.index_files.len())
        .map_err(|_| BackupError::InvalidPayload("too many index files".to_string()))?;

    let mut out = Vec::new();
    out.extend_from_slice(&BACKUP_MAGIC);
    out.push(BACKUP_FORMAT_VERSION);
    out.extend_from_slice(&blob_count.to_le_bytes());
    out.extend_from_slice(&index_count.to_le_bytes());

    for (id, data) in &payload.blobs {
        let id_len = u16::try_from(id.len())
            .map_err(|_| BackupError::InvalidPayload("blob id too long".to_string()))?;
        out.extend_from_slice(&id_len.to_le_bytes());
        out.extend_from_slice(id.as_bytes());
        out.extend_from_slice(&(data.len() as u64).to_le_bytes());
        out.extend_from_slice(data);
    }
    for (name, data) in &payload.index_files {
        let name_len = u16::try_from(name.len())
            .map_err(|_| BackupError::InvalidPayload("index name too long".to_string()))?;
        out.extend_from_slice(&name_len.to_le_bytes());
        out.extend_from_slice(name.as_bytes());
        let data_len = u32::try_from(data.len())
            .map_err(|_| BackupError::InvalidPayload("index file too large".to_string()))?;
        out.extend_from_slice(&data_len.to_le_bytes());
        out.extend_from_slice(data);
    }
    Ok(out)
}

/// Unpack a `VBK2` payload.
pub fn unpack_payload(bytes: &[u8]) -> Result<BackupPayload, BackupError> {
    let mut cursor = Reader::new(bytes);
    let magic = cursor.take(4)?;
    if magic != BACKUP_MAGIC {
        return Err(BackupError::InvalidPayload("bad magic".to_string()));
    }
    let version = cursor.take(1)?[0];
    if version != BACKUP_FORMAT_VERSION {
        return Err(BackupError::InvalidPayload(format!(
            "unsupported payload version {version}"
        )));
    }
    let blob_count = cursor.u16()?;
    let index_count = cursor.u16()?;

    let mut blobs = Vec::with_capacity(blob_count as usize);
    for _ in 0..blob_count {
        let id_len = cursor.u16()? as usize;
        let id = String::from_utf8(cursor.take(id_len)?.to_vec())
            .map_err(|_| BackupError::InvalidPayload("blob id not UTF-8".to_string()))?;
        let data_len = cursor.u64()? as usize;
        blobs.push((id, cursor.take(data_len)?.to_vec()));
    }
    let mut index_files = Vec::with_capacity(index_count as usize);
    for _ in 0..index_count {
        let name_len = cursor.u16()? as usize;
        let name = String::from_utf8(cursor.take(name_len)?.to_vec())
            .map_err(|_| BackupError::InvalidPayload("index name not UTF-8".to_string()))?;
        let data_len = cursor.u32()? as usize;
        index_files.push((name, cursor.take(data_len)?.to_vec()));
    }
    Ok(BackupPayload { blobs, index_files })
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], BackupError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&e| e <= self.bytes.len())
            .ok_or_else(|| BackupError::InvalidPayload("truncated payload".to_string()))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u16(&mut self) -> Result<u16, BackupError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, BackupError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, BackupError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }
}

/// Manifest metadata blob, serialized as JSON into the `metadata` field.
#[derive(Debug, Serialize, Deserialize)]
struct ManifestMetadata {
    checksum: String,
    encrypted_size: u64,
    created_at: u64,
}

/// Persisted scheduling bookkeeping, outside any vault.
#[derive(Debug, Default, Serialize, Deserialize)]
struct BackupMeta {
    #[serde(default)]
    last_success_at: Option<u64>,
    #[serde(default)]
    locked_attempts: u32,
    #[serde(default)]
    last_locked_at: Option<u64>,
}

/// Outcome of a scheduled-backup tick.
#[derive(Debug, PartialEq, Eq)]
pub enum ScheduleDecision {
    /// Disabled, or not overdue yet.
    Skipped,
    /// Staged state existed; the upload phase ran.
    ResumedUpload,
    /// A fresh backup was staged and uploaded.
    StagedAndUploaded,
    /// The vault key was unavailable; the host should retry after the
    /// returned delay.
    RetryLater(Duration),
}

/// Delay before the next upload retry, by attempt count.
pub fn retry_delay(retry_count: u32) -> Duration {
    if retry_count >= MAX_UPLOAD_RETRIES {
        return Duration::from_secs(24 * 60 * 60);
    }
    let exp = retry_count.saturating_sub(1).min(6);
    Duration::from_secs((60u64 << exp).min(3600))
}

struct ActiveTask {
    cancel: CancelFlag,
    _handle: tokio::task::JoinHandle<()>,
}

/// Owns the backup pipeline for one engine.
pub struct BackupOrchestrator {
    engine: Arc<Engine>,
    store: Arc<dyn ObjectStore>,
    status_tx: watch::Sender<BackupStatus>,
    active: Mutex<Option<ActiveTask>>,
}

impl BackupOrchestrator {
    pub fn new(engine: Arc<Engine>, store: Arc<dyn ObjectStore>) -> Self {
        let (status_tx, _) = watch::channel(BackupStatus::Idle);
        Self {
            engine,
            store,
            status_tx,
            active: Mutex::new(None),
        }
    }

    /// Observe pipeline status.
    pub fn subscribe(&self) -> watch::Receiver<BackupStatus> {
        self.status_tx.subscribe()
    }

    fn set_status(&self, status: BackupStatus) {
        let _ = self.status_tx.send(status);
    }

    fn staging_dir(&self) -> PathBuf {
        self.engine.root().join(staging::BACKUP_STAGING_DIR)
    }

    fn meta_path(&self) -> PathBuf {
        self.engine.root().join(BACKUP_META_FILE)
    }

    // ----------------------------------------------------------------- stage

    /// Phase one: pack, encrypt, chunk to disk. Requires the vault key;
    /// after this returns, the upload phase no longer does.
    #[instrument(level = "info", skip_all)]
    pub fn stage_backup(&self, key: &VaultKey) -> Result<PendingBackupState, BackupError> {
        self.set_status(BackupStatus::Staging);

        let payload = self.collect_payload(key)?;
        let packed = pack_payload(&payload)?;
        let ciphertext = aead::seal(key.bytes(), &packed).map_err(StorageError::Crypto)?;
        let checksum = hex::encode(aead::hmac_sha256(key.bytes(), &ciphertext));
        let id_bytes = aead::random_bytes(8).map_err(StorageError::Crypto)?;
        let backup_id = hex::encode(id_bytes.as_slice());

        let dir = self.staging_dir();
        staging::clear_dir(&dir)?;
        std::fs::create_dir_all(&dir).map_err(|e| StagingError::Io {
            source: e,
            path: dir.clone(),
        })?;

        let total_chunks = (ciphertext.len() as u64)
            .div_ceil(TRANSFER_CHUNK_SIZE as u64)
            .max(1);
        for (i, chunk) in ciphertext.chunks(TRANSFER_CHUNK_SIZE).enumerate() {
            let path = dir.join(format!("chunk_{i}.bin"));
            std::fs::write(&path, chunk).map_err(|e| StagingError::Io {
                source: e,
                path: path.clone(),
            })?;
            // Readable after first unlock so background uploads keep working
            // while the UI is locked; owner-only either way.
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600));
            }
        }

        let state = PendingBackupState {
            backup_id,
            total_chunks,
            checksum,
            encrypted_size: ciphertext.len() as u64,
            created_at: clock::unix_now(),
            upload_finished: false,
            manifest_saved: false,
            retry_count: 0,
        };
        staging::save_state(&dir, &state)?;
        info!(
            backup_id = %state.backup_id,
            chunks = total_chunks,
            bytes = state.encrypted_size,
            "backup staged"
        );
        Ok(state)
    }

    /// Read every container prefix the vault references plus every index
    /// file on disk.
    fn collect_payload(&self, key: &VaultKey) -> Result<BackupPayload, BackupError> {
        let blobs = self.engine.index_manager().with_index(key, |ctx| {
            ctx.pool().ensure_primary()?;
            let footer_cursor = ctx.pool().read_footer()?;
            let descriptors = ctx.load()?.blob_list().to_vec();

            let mut blobs = Vec::with_capacity(descriptors.len());
            for blob in &descriptors {
                let cursor = if blob.is_primary() {
                    blob.cursor.max(footer_cursor)
                } else {
                    blob.cursor
                };
                let data = if cursor == 0 {
                    Vec::new()
                } else {
                    ctx.pool().read_range(&blob.blob_id, 0, cursor as usize)?
                };
                blobs.push((blob.blob_id.clone(), data));
            }
            Ok(blobs)
        })?;

        let mut index_files = Vec::new();
        for (_, path) in self.engine.index_manager().index_files_on_disk()? {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .ok_or_else(|| BackupError::InvalidPayload("unnamed index file".to_string()))?;
            let data = std::fs::read(&path).map_err(|e| StorageError::read(&path, e))?;
            index_files.push((name, data));
        }

        Ok(BackupPayload { blobs, index_files })
    }

    // ---------------------------------------------------------------- upload

    /// Phase two: upload staged chunks and commit the manifest. The vault
    /// key is not required. Returns `false` when nothing is staged.
    #[instrument(level = "info", skip(self))]
    pub async fn upload_backup(&self) -> Result<bool, BackupError> {
        let dir = self.staging_dir();
        let Some(state) =
            staging::load_state::<PendingBackupState>(&dir, staging::BACKUP_STAGING_TTL_SECS)?
        else {
            return Ok(false);
        };

        let cancel = CancelFlag::new();
        match self.run_upload(state, &cancel).await {
            Ok(()) => {
                self.set_status(BackupStatus::Complete);
                Ok(true)
            }
            Err(e) => {
                // Staging persists across failures; bump the retry counter
                // so the host's next attempt backs off.
                if let Ok(Some(mut state)) = staging::load_state::<PendingBackupState>(
                    &dir,
                    staging::BACKUP_STAGING_TTL_SECS,
                ) {
                    state.retry_count += 1;
                    let _ = staging::save_state(&dir, &state);
                }
                self.set_status(BackupStatus::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    async fn run_upload(
        &self,
        mut state: PendingBackupState,
        cancel: &CancelFlag,
    ) -> Result<(), BackupError> {
        self.await_availability().await?;
        let dir = self.staging_dir();

        // The previous manifest tells us which chunks to garbage-collect
        // after this backup commits.
        let previous = with_retry(|| self.store.get(RecordType::VaultBackup, BACKUP_MANIFEST_ID))
            .await
            .map_err(upload_err)?;
        let previous_backup_id = previous
            .as_ref()
            .and_then(|m| m.text("backupId"))
            .map(str::to_string);

        if !state.upload_finished {
            let backup_id = state.backup_id.clone();
            let present = self.present_chunk_indices(&backup_id).await?;
            let missing: Vec<u64> =
                (0..state.total_chunks).filter(|i| !present.contains(i)).collect();
            info!(
                backup_id = %backup_id,
                present = present.len(),
                missing = missing.len(),
                "uploading backup chunks"
            );

            let mut done = present.len() as u64;
            let total = state.total_chunks;
            let mut uploads = FuturesUnordered::new();
            let mut pending = missing.into_iter();
            loop {
                while uploads.len() < UPLOAD_CONCURRENCY {
                    match pending.next() {
                        Some(index) => {
                            uploads.push(self.upload_one_chunk(&dir, &backup_id, index));
                        }
                        None => break,
                    }
                }
                match uploads.next().await {
                    Some(result) => {
                        result?;
                        if cancel.is_cancelled() {
                            return Err(BackupError::Cancelled);
                        }
                        done += 1;
                        self.set_status(BackupStatus::Uploading {
                            current: done,
                            total,
                        });
                    }
                    None => break,
                }
            }
            drop(uploads);

            state.upload_finished = true;
            staging::save_state(&dir, &state)?;
        }

        if !state.manifest_saved {
            let metadata = ManifestMetadata {
                checksum: state.checksum.clone(),
                encrypted_size: state.encrypted_size,
                created_at: state.created_at,
            };
            let metadata_bytes = serde_json::to_vec(&metadata)
                .map_err(|e| BackupError::InvalidPayload(format!("metadata encode: {e}")))?;
            let record = Record::new(RecordType::VaultBackup, BACKUP_MANIFEST_ID)
                .with_field("metadata", FieldValue::Bytes(metadata_bytes))
                .with_field("timestamp", FieldValue::Timestamp(clock::unix_now()))
                .with_field("formatVersion", FieldValue::Int(i64::from(BACKUP_FORMAT_VERSION)))
                .with_field("chunkCount", FieldValue::Int(state.total_chunks as i64))
                .with_field("backupId", FieldValue::Text(state.backup_id.clone()));
            with_retry(|| self.store.put(record.clone(), SavePolicy::ChangedKeys))
                .await
                .map_err(upload_err)?;

            state.manifest_saved = true;
            staging::save_state(&dir, &state)?;
        }

        // Garbage-collect the superseded backup's chunks.
        if let Some(prior) = previous_backup_id.filter(|p| *p != state.backup_id) {
            self.delete_chunks_of(&prior).await?;
        }

        staging::clear_dir(&dir)?;
        self.update_meta(|meta| {
            meta.last_success_at = Some(clock::unix_now());
            meta.locked_attempts = 0;
            meta.last_locked_at = None;
        })?;
        info!(backup_id = %state.backup_id, "backup complete");
        Ok(())
    }

    async fn upload_one_chunk(
        &self,
        dir: &std::path::Path,
        backup_id: &str,
        index: u64,
    ) -> Result<(), BackupError> {
        let path = dir.join(format!("chunk_{index}.bin"));
        let data = std::fs::read(&path).map_err(|e| StagingError::Io {
            source: e,
            path: path.clone(),
        })?;

        let record = Record::new(RecordType::VaultBackupChunk, chunk_record_id(backup_id, index))
            .with_field("chunkData", FieldValue::Asset(data))
            .with_field("chunkIndex", FieldValue::Int(index as i64))
            .with_field("backupId", FieldValue::Text(backup_id.to_string()));
        with_retry(|| self.store.put(record.clone(), SavePolicy::ChangedKeys))
            .await
            .map_err(upload_err)?;
        debug!(index, "backup chunk uploaded");
        Ok(())
    }

    async fn present_chunk_indices(
        &self,
        backup_id: &str,
    ) -> Result<std::collections::HashSet<u64>, BackupError> {
        let records = with_retry(|| {
            self.store.query(
                Query::all(RecordType::VaultBackupChunk)
                    .field("backupId", FieldValue::Text(backup_id.to_string()))
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

    async fn delete_chunks_of(&self, backup_id: &str) -> Result<(), BackupError> {
        let chunks = with_retry(|| {
            self.store.query(
                Query::all(RecordType::VaultBackupChunk)
                    .field("backupId", FieldValue::Text(backup_id.to_string()))
                    .keys(&["chunkIndex"]),
            )
        })
        .await
        .map_err(upload_err)?;
        for chunk in chunks {
            with_retry(|| self.store.delete(RecordType::VaultBackupChunk, &chunk.id))
                .await
                .map_err(upload_err)?;
        }
        Ok(())
    }

    /// Wait for the store with short exponential delays, for roughly half a
    /// minute, before giving up.
    async fn await_availability(&self) -> Result<(), BackupError> {
        if self.store.is_available().await {
            return Ok(());
        }
        for secs in AVAILABILITY_DELAYS_SECS {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            if self.store.is_available().await {
                return Ok(());
            }
        }
        Err(BackupError::NotAvailable)
    }

    // -------------------------------------------------------------- schedule

    /// Convenience: stage then upload.
    pub async fn run_backup(&self, key: &VaultKey) -> Result<(), BackupError> {
        self.stage_backup(key)?;
        self.upload_backup().await.map(|_| ())
    }

    /// Spawn stage + upload as a detached task, cancelling any prior task.
    pub fn start_backup(self: &Arc<Self>, key: VaultKey) {
        let cancel = {
            let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(prev) = active.take() {
                prev.cancel.cancel();
            }
            CancelFlag::new()
        };
        let this = Arc::clone(self);
        let flag = cancel.clone();
        let handle = tokio::spawn(async move {
            let result = async {
                this.stage_backup(&key)?;
                let dir = this.staging_dir();
                let state = staging::load_state::<PendingBackupState>(
                    &dir,
                    staging::BACKUP_STAGING_TTL_SECS,
                )?
                .ok_or_else(|| {
                    BackupError::InvalidPayload("staging vanished after stage".to_string())
                })?;
                this.run_upload(state, &flag).await
            }
            .await;
            match result {
                Ok(()) => this.set_status(BackupStatus::Complete),
                Err(e) => this.set_status(BackupStatus::Failed(e.to_string())),
            }
        });
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        *active = Some(ActiveTask {
            cancel,
            _handle: handle,
        });
    }

    /// Cooperatively cancel the running task, if any. Staged state stays on
    /// disk, so a later tick resumes.
    pub fn cancel_active(&self) {
        let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = active.as_ref() {
            task.cancel.cancel();
        }
    }

    /// One scheduled-backup tick. `enabled` is the host-level switch;
    /// `key_provider` yields the vault key when the vault is unlocked.
    #[instrument(level = "info", skip_all)]
    pub async fn run_scheduled<F>(
        &self,
        enabled: bool,
        key_provider: F,
    ) -> Result<ScheduleDecision, BackupError>
    where
        F: FnOnce() -> Option<VaultKey>,
    {
        if !enabled {
            return Ok(ScheduleDecision::Skipped);
        }

        if self.upload_backup().await? {
            return Ok(ScheduleDecision::ResumedUpload);
        }

        let meta = self.read_meta();
        let overdue = meta
            .last_success_at
            .is_none_or(|t| clock::unix_now().saturating_sub(t) >= BACKUP_OVERDUE_SECS);
        if !overdue {
            return Ok(ScheduleDecision::Skipped);
        }

        match key_provider() {
            Some(key) => {
                self.run_backup(&key).await?;
                Ok(ScheduleDecision::StagedAndUploaded)
            }
            None => {
                let attempts = meta.locked_attempts;
                self.update_meta(|m| {
                    m.locked_attempts = attempts + 1;
                    m.last_locked_at = Some(clock::unix_now());
                })?;
                let delay_idx = (attempts as usize).min(LOCKED_RETRY_DELAYS_SECS.len() - 1);
                let delay = Duration::from_secs(LOCKED_RETRY_DELAYS_SECS[delay_idx]);
                debug!(attempts, delay_secs = delay.as_secs(), "vault locked, deferring backup");
                Ok(ScheduleDecision::RetryLater(delay))
            }
        }
    }

    fn read_meta(&self) -> BackupMeta {
        std::fs::read(self.meta_path())
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default()
    }

    fn update_meta(&self, apply: impl FnOnce(&mut BackupMeta)) -> Result<(), BackupError> {
        let mut meta = self.read_meta();
        apply(&mut meta);
        let path = self.meta_path();
        let json = serde_json::to_vec_pretty(&meta)
            .map_err(|e| BackupError::InvalidPayload(format!("meta encode: {e}")))?;
        std::fs::write(&path, json).map_err(|e| StagingError::Io { source: e, path })?;
        Ok(())
    }

    // --------------------------------------------------------------- restore

    /// Fetch the current backup, verify it, and rebuild the on-disk state.
    /// Container tails beyond the backed-up prefix are re-randomised.
    #[instrument(level = "info", skip_all)]
    pub async fn restore(&self, key: &VaultKey) -> Result<(), BackupError> {
        let result = self.run_restore(key).await;
        match &result {
            Ok(()) => self.set_status(BackupStatus::RestoreComplete),
            Err(e) => self.set_status(BackupStatus::RestoreFailed(e.to_string())),
        }
        result
    }

    async fn run_restore(&self, key: &VaultKey) -> Result<(), BackupError> {
        self.set_status(BackupStatus::Restoring {
            current: 0,
            total: 0,
        });

        let manifest = with_retry(|| self.store.get(RecordType::VaultBackup, BACKUP_MANIFEST_ID))
            .await
            .map_err(download_err)?
            .ok_or(BackupError::ContainerNotFound)?;

        let format_version = manifest.int("formatVersion").unwrap_or(1);
        if format_version < 2 {
            return self.restore_v1(&manifest);
        }

        let backup_id = manifest
            .text("backupId")
            .ok_or_else(|| BackupError::InvalidPayload("manifest missing backupId".to_string()))?
            .to_string();
        let chunk_count = manifest
            .int("chunkCount")
            .and_then(|c| u64::try_from(c).ok())
            .ok_or_else(|| BackupError::InvalidPayload("manifest missing chunkCount".to_string()))?;
        let metadata: ManifestMetadata = manifest
            .bytes("metadata")
            .ok_or_else(|| BackupError::InvalidPayload("manifest missing metadata".to_string()))
            .and_then(|b| {
                serde_json::from_slice(b)
                    .map_err(|e| BackupError::InvalidPayload(format!("metadata decode: {e}")))
            })?;

        // Parallel chunk downloads, reassembled in index order.
        let mut downloads = FuturesUnordered::new();
        let mut pending = 0..chunk_count;
        let mut parts: Vec<Option<Vec<u8>>> = vec![None; chunk_count as usize];
        let mut received: u64 = 0;
        loop {
            while downloads.len() < UPLOAD_CONCURRENCY {
                match pending.next() {
                    Some(index) => downloads.push(self.download_one_chunk(&backup_id, index)),
                    None => break,
                }
            }
            match downloads.next().await {
                Some(result) => {
                    let (index, data) = result?;
                    parts[index as usize] = Some(data);
                    received += 1;
                    self.set_status(BackupStatus::Restoring {
                        current: received,
                        total: chunk_count,
                    });
                }
                None => break,
            }
        }
        let mut ciphertext = Vec::with_capacity(metadata.encrypted_size as usize);
        for part in parts {
            ciphertext.extend_from_slice(&part.ok_or(BackupError::FileNotFound)?);
        }

        // Integrity witness first: a corrupted payload is never decrypted.
        let witness = hex::encode(aead::hmac_sha256(key.bytes(), &ciphertext));
        if witness != metadata.checksum {
            warn!("backup checksum mismatch, refusing to decrypt");
            return Err(BackupError::ChecksumMismatch);
        }

        let packed = aead::open(key.bytes(), &ciphertext)
            .map_err(|_| BackupError::InvalidPayload("payload decryption failed".to_string()))?;
        let payload = unpack_payload(&packed)?;

        self.write_restored_state(&payload)?;
        info!(
            blobs = payload.blobs.len(),
            index_files = payload.index_files.len(),
            "restore complete"
        );
        Ok(())
    }

    async fn download_one_chunk(
        &self,
        backup_id: &str,
        index: u64,
    ) -> Result<(u64, Vec<u8>), BackupError> {
        let id = chunk_record_id(backup_id, index);
        let record = with_retry(|| self.store.get(RecordType::VaultBackupChunk, &id))
            .await
            .map_err(download_err)?
            .ok_or(BackupError::FileNotFound)?;
        let data = record
            .bytes("chunkData")
            .ok_or_else(|| BackupError::InvalidPayload(format!("chunk {index} has no data")))?
            .to_vec();
        Ok((index, data))
    }

    /// Legacy restore: the whole primary container as one asset.
    fn restore_v1(&self, manifest: &Record) -> Result<(), BackupError> {
        let data = manifest
            .bytes("data")
            .ok_or_else(|| BackupError::InvalidPayload("v1 manifest missing data".to_string()))?;
        let pool = self.engine.pool();
        let path = pool.blob_path(PRIMARY_BLOB_ID);
        std::fs::write(&path, data).map_err(|e| StorageError::write(&path, e))?;
        self.engine.index_manager().clear_cache();
        Ok(())
    }

    /// Recreate containers at full size with random tails, overwrite the
    /// restored prefixes, and drop index files into place.
    fn write_restored_state(&self, payload: &BackupPayload) -> Result<(), BackupError> {
        let pool = self.engine.pool();
        for (blob_id, data) in &payload.blobs {
            let is_primary = blob_id == PRIMARY_BLOB_ID;
            let min_size = if is_primary {
                data.len() as u64 + FOOTER_LEN
            } else {
                data.len() as u64
            };
            let size = CONTAINER_SIZE.max(min_size);

            let path = pool.blob_path(blob_id);
            pool.create_random_filled(&path, size)?;
            if !data.is_empty() {
                pool.write_at(blob_id, 0, data)?;
            }
            if is_primary {
                pool.write_footer(data.len() as u64)?;
            }
        }

        for (name, data) in &payload.index_files {
            // Names come from the payload; never let them escape the root.
            if name.contains('/') || name.contains('\\') || !name.starts_with("vault_index_") {
                return Err(BackupError::InvalidPayload(format!(
                    "suspicious index file name {name:?}"
                )));
            }
            let path = self.engine.root().join(name);
            let tmp = path.with_extension("bin.tmp");
            std::fs::write(&tmp, data).map_err(|e| StorageError::write(&tmp, e))?;
            std::fs::rename(&tmp, &path).map_err(|e| StorageError::write(&path, e))?;
        }

        self.engine.index_manager().clear_cache();
        Ok(())
    }
}

impl std::fmt::Debug for BackupOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupOrchestrator").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_pack_unpack_round_trip() {
        let payload = BackupPayload {
            blobs: vec![
                (PRIMARY_BLOB_ID.to_string(), vec![0xAA; 1000]),
                ("deadbeefcafef00d".to_string(), vec![0xBB; 500]),
            ],
            index_files: vec![
                ("vault_index_aa.bin".to_string(), vec![1, 2, 3]),
                ("vault_index_bb.bin".to_string(), vec![4, 5]),
            ],
        };
        let packed = pack_payload(&payload).unwrap();
        assert_eq!(&packed[..4], BACKUP_MAGIC);
        assert_eq!(packed[4], BACKUP_FORMAT_VERSION);
        assert_eq!(unpack_payload(&packed).unwrap(), payload);
    }

    #[test]
    fn empty_payload_round_trips() {
        let payload = BackupPayload {
            blobs: vec![],
            index_files: vec![],
        };
        let packed = pack_payload(&payload).unwrap();
        assert_eq!(unpack_payload(&packed).unwrap(), payload);
    }

    #[test]
    fn truncated_payload_is_invalid() {
        let payload = BackupPayload {
            blobs: vec![(PRIMARY_BLOB_ID.to_string(), vec![7; 64])],
            index_files: vec![],
        };
        let packed = pack_payload(&payload).unwrap();
        assert!(matches!(
            unpack_payload(&packed[..packed.len() - 10]),
            Err(BackupError::InvalidPayload(_))
        ));
    }

    #[test]
    fn bad_magic_is_rejected() {
        assert!(matches!(
            unpack_payload(b"NOPE\x02\x00\x00\x00\x00"),
            Err(BackupError::InvalidPayload(_))
        ));
    }

    #[test]
    fn retry_delays_double_then_cap() {
        assert_eq!(retry_delay(1), Duration::from_secs(60));
        assert_eq!(retry_delay(2), Duration::from_secs(120));
        assert_eq!(retry_delay(3), Duration::from_secs(240));
        assert_eq!(retry_delay(7), Duration::from_secs(3600));
        assert_eq!(retry_delay(9), Duration::from_secs(3600));
        // Past the restart limit: daily.
        assert_eq!(retry_delay(10), Duration::from_secs(24 * 60 * 60));
    }
}
