//! Persisted index model.
//!
//! The index is the sole authority for what is live in a vault. It is
//! serialized as JSON and stored as one single-shot AEAD frame under the
//! vault key; binary fields travel as base64. Older vaults carry version 1
//! (no master key, no blob list) or version 2 (no blob list); the manager
//! migrates them forward on load.

use serde::{Deserialize, Serialize};
use serde_with::{base64::Base64, serde_as};
use uuid::Uuid;

use crate::pool::BlobDescriptor;

/// Current index schema version.
pub const CURRENT_INDEX_VERSION: u32 = 3;

/// One stored file: identity, location inside the pool, and optional
/// display metadata. Tombstoned entries keep their slot until compaction.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub file_id: Uuid,
    /// Owning container; `None` means the primary.
    #[serde(default)]
    pub blob_id: Option<String>,
    pub offset: u64,
    /// On-disk byte count including framing.
    pub size: u64,
    /// First 64 bytes of the framing, for cheap corruption checks and
    /// share lookups without touching the pool.
    #[serde_as(as = "Base64")]
    pub encrypted_header_preview: Vec<u8>,
    #[serde(default)]
    pub is_deleted: bool,
    /// Thumbnail ciphertext, sealed under the master key.
    #[serde(default)]
    #[serde_as(as = "Option<Base64>")]
    pub encrypted_thumbnail: Option<Vec<u8>>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub created_at: Option<u64>,
    /// Media duration in seconds, for videos.
    #[serde(default)]
    pub duration: Option<f64>,
    /// Capture date of the original, when known.
    #[serde(default)]
    pub original_date: Option<u64>,
}

impl FileEntry {
    /// Resolved container id (`"primary"` when unset).
    pub fn resolved_blob_id(&self) -> &str {
        self.blob_id
            .as_deref()
            .unwrap_or(crate::pool::PRIMARY_BLOB_ID)
    }
}

/// Constraints a recipient agrees to when opening a share.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharePolicy {
    #[serde(default)]
    pub expires_at: Option<u64>,
    #[serde(default)]
    pub max_opens: Option<u32>,
    #[serde(default)]
    pub allow_screenshots: bool,
    #[serde(default = "default_true")]
    pub allow_downloads: bool,
}

impl Default for SharePolicy {
    fn default() -> Self {
        Self {
            expires_at: None,
            max_opens: None,
            allow_screenshots: false,
            allow_downloads: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Owner-side record of one published share.
///
/// The share key never leaves the encrypted index.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShareRecord {
    pub share_id: String,
    pub created_at: u64,
    pub share_policy: SharePolicy,
    #[serde(default)]
    pub last_synced_at: Option<u64>,
    #[serde_as(as = "Base64")]
    pub share_key: Vec<u8>,
    #[serde(default)]
    pub sync_sequence: Option<u64>,
}

/// The per-vault index.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VaultIndex {
    pub version: u32,
    /// Master key sealed under the current vault key. Absent only in
    /// legacy v1 indexes.
    #[serde(default)]
    #[serde_as(as = "Option<Base64>")]
    pub wrapped_master_key: Option<Vec<u8>>,
    /// Ordered container list; allocation is first-fit in this order.
    /// Absent in v1/v2 indexes.
    #[serde(default)]
    pub blobs: Option<Vec<BlobDescriptor>>,
    #[serde(default)]
    pub files: Vec<FileEntry>,
    /// Legacy scalar; mirrors the primary cursor on v3.
    #[serde(default)]
    pub next_offset: u64,
    /// Legacy scalar; mirrors the primary capacity on v3.
    #[serde(default)]
    pub total_size: u64,
    /// Owner-side share roster.
    #[serde(default)]
    pub shares: Vec<ShareRecord>,
    // Recipient-side shared-vault fields.
    #[serde(default)]
    pub is_shared_vault: bool,
    #[serde(default)]
    pub share_vault_id: Option<String>,
    #[serde(default)]
    pub share_policy: Option<SharePolicy>,
    #[serde(default)]
    pub open_count: u32,
    #[serde(default)]
    #[serde_as(as = "Option<Base64>")]
    pub wrapped_share_key: Option<Vec<u8>>,
    #[serde(default)]
    pub remote_version: Option<u64>,
    #[serde(default)]
    pub custom_name: Option<String>,
}

impl VaultIndex {
    /// Containers in declared order. Empty for unmigrated indexes.
    pub fn blob_list(&self) -> &[BlobDescriptor] {
        self.blobs.as_deref().unwrap_or(&[])
    }

    pub fn blob_list_mut(&mut self) -> &mut Vec<BlobDescriptor> {
        self.blobs.get_or_insert_with(Vec::new)
    }

    /// Live (non-tombstoned) entries in store order.
    pub fn live_files(&self) -> impl Iterator<Item = &FileEntry> {
        self.files.iter().filter(|f| !f.is_deleted)
    }

    /// Find a live entry by id.
    pub fn live_entry(&self, file_id: &Uuid) -> Option<&FileEntry> {
        self.files
            .iter()
            .find(|f| f.file_id == *file_id && !f.is_deleted)
    }

    /// Bytes held by tombstoned entries, reclaimable by compaction.
    pub fn deleted_space(&self) -> u64 {
        self.files
            .iter()
            .filter(|f| f.is_deleted)
            .map(|f| f.size)
            .sum()
    }
}
