//! Staged transfer state.
//!
//! Both pipelines persist their progress to disk before the first network
//! write, so crypto never re-runs on resume. Each staging directory holds a
//! `state.json` plus payload files; the state carries its creation time and
//! loads past the TTL clear the directory instead of resuming.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_with::{base64::Base64, serde_as};
use thiserror::Error;
use tracing::{debug, warn};

use crate::clock;
use crate::index::SharePolicy;

/// Share staging directory under the engine root.
pub const SHARE_STAGING_DIR: &str = "pending_upload";

/// Staged share snapshot file name.
pub const SHARE_SNAPSHOT_FILE: &str = "svdf_data.bin";

/// Backup staging directory under the engine root.
pub const BACKUP_STAGING_DIR: &str = "pending_backup";

/// State file name inside either staging directory.
pub const STATE_FILE: &str = "state.json";

/// Share staging lifetime.
pub const SHARE_STAGING_TTL_SECS: u64 = 24 * 60 * 60;

/// Backup staging lifetime.
pub const BACKUP_STAGING_TTL_SECS: u64 = 48 * 60 * 60;

#[derive(Error, Debug)]
pub enum StagingError {
    #[error("staging io error at {path}: {source}")]
    Io {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("staging state corrupted: {0}")]
    Corrupted(String),
}

/// Persisted progress of an interrupted share upload.
///
/// Everything expensive is captured here: the derived share key (so resume
/// never re-runs PBKDF2), the sealed policy, and the chunk geometry. The
/// snapshot bytes live next to it in [`SHARE_SNAPSHOT_FILE`].
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingUploadState {
    pub share_vault_id: String,
    pub phrase_vault_id: String,
    #[serde_as(as = "Base64")]
    pub share_key: Vec<u8>,
    pub chunk_size: u64,
    pub chunk_count: u64,
    pub owner_fingerprint: String,
    pub manifest_version: i64,
    #[serde_as(as = "Base64")]
    pub policy_ciphertext: Vec<u8>,
    pub share_policy: SharePolicy,
    /// Digest of the plaintext content, for the incremental-sync cache.
    /// Snapshot ciphertext is nonce-fresh per build, so change detection
    /// has to hash what was encrypted, not the encryption of it.
    pub content_digest: String,
    pub created_at: u64,
}

/// Persisted progress of an interrupted backup.
///
/// The encrypted payload is chunked into `chunk_<i>.bin` siblings; the two
/// phase flags record how far the upload got.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingBackupState {
    pub backup_id: String,
    pub total_chunks: u64,
    /// Hex HMAC-SHA-256 over the payload ciphertext.
    pub checksum: String,
    pub encrypted_size: u64,
    pub created_at: u64,
    pub upload_finished: bool,
    pub manifest_saved: bool,
    pub retry_count: u32,
}

fn io_err(path: &Path, source: std::io::Error) -> StagingError {
    StagingError::Io {
        source,
        path: path.to_path_buf(),
    }
}

/// Write `state` atomically into `dir/state.json`, creating the directory.
pub fn save_state<T: Serialize>(dir: &Path, state: &T) -> Result<(), StagingError> {
    std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
    let path = dir.join(STATE_FILE);
    let json = serde_json::to_vec_pretty(state)
        .map_err(|e| StagingError::Corrupted(format!("state encode: {e}")))?;
    let tmp = dir.join(format!("{STATE_FILE}.tmp"));
    std::fs::write(&tmp, &json).map_err(|e| io_err(&tmp, e))?;
    std::fs::rename(&tmp, &path).map_err(|e| io_err(&path, e))?;
    debug!(path = %path.display(), "staging state saved");
    Ok(())
}

/// Load `dir/state.json` if present and within `ttl_secs` of its
/// `created_at`. An expired state clears the whole directory and reads as
/// absent.
pub fn load_state<T>(dir: &Path, ttl_secs: u64) -> Result<Option<T>, StagingError>
where
    T: serde::de::DeserializeOwned + HasCreatedAt,
{
    let path = dir.join(STATE_FILE);
    let json = match std::fs::read(&path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_err(&path, e)),
    };
    let state: T = serde_json::from_slice(&json)
        .map_err(|e| StagingError::Corrupted(format!("state decode: {e}")))?;

    let age = clock::unix_now().saturating_sub(state.created_at());
    if age > ttl_secs {
        warn!(age, ttl_secs, dir = %dir.display(), "staged state expired, clearing");
        clear_dir(dir)?;
        return Ok(None);
    }
    Ok(Some(state))
}

/// Remove the staging directory and everything in it.
pub fn clear_dir(dir: &Path) -> Result<(), StagingError> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_err(dir, e)),
    }
}

/// Staged states expose their creation instant for TTL checks.
pub trait HasCreatedAt {
    fn created_at(&self) -> u64;
}

impl HasCreatedAt for PendingUploadState {
    fn created_at(&self) -> u64 {
        self.created_at
    }
}

impl HasCreatedAt for PendingBackupState {
    fn created_at(&self) -> u64 {
        self.created_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn backup_state(created_at: u64) -> PendingBackupState {
        PendingBackupState {
            backup_id: "abcd".to_string(),
            total_chunks: 4,
            checksum: "00".repeat(32),
            encrypted_size: 7 * 1024 * 1024,
            created_at,
            upload_finished: false,
            manifest_saved: false,
            retry_count: 0,
        }
    }

    #[test]
    fn save_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let staging = dir.path().join(BACKUP_STAGING_DIR);
        save_state(&staging, &backup_state(clock::unix_now())).unwrap();

        let loaded: PendingBackupState = load_state(&staging, BACKUP_STAGING_TTL_SECS)
            .unwrap()
            .unwrap();
        assert_eq!(loaded.backup_id, "abcd");
        assert_eq!(loaded.total_chunks, 4);
    }

    #[test]
    fn missing_state_reads_as_none() {
        let dir = TempDir::new().unwrap();
        let loaded: Option<PendingBackupState> =
            load_state(&dir.path().join("nowhere"), 60).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn expired_state_clears_the_directory() {
        let dir = TempDir::new().unwrap();
        let staging = dir.path().join(BACKUP_STAGING_DIR);
        let stale = clock::unix_now() - BACKUP_STAGING_TTL_SECS - 60;
        save_state(&staging, &backup_state(stale)).unwrap();
        std::fs::write(staging.join("chunk_0.bin"), b"junk").unwrap();

        let loaded: Option<PendingBackupState> =
            load_state(&staging, BACKUP_STAGING_TTL_SECS).unwrap();
        assert!(loaded.is_none());
        assert!(!staging.exists());
    }
}
