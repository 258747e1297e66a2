//! Share snapshot encoding.
//!
//! A snapshot is the unit a share publishes: every live file of the vault,
//! re-encrypted from the master key to the phrase-derived share key, plus
//! owner metadata. The canonical wire form is one version byte followed by
//! JSON; readers additionally accept the legacy bare-JSON form (detected by
//! a leading `{`) produced by earlier releases.

use serde::{Deserialize, Serialize};
use serde_with::{base64::Base64, serde_as};
use uuid::Uuid;

use super::share::ShareError;

/// Canonical snapshot encoding version.
pub const SNAPSHOT_VERSION: u8 = 2;

/// One shared file: metadata in the clear (inside the encrypted snapshot),
/// content and thumbnail each sealed under the share key.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotFile {
    pub file_id: Uuid,
    pub filename: String,
    pub mime_type: String,
    #[serde_as(as = "Base64")]
    pub ciphertext: Vec<u8>,
    #[serde(default)]
    #[serde_as(as = "Option<Base64>")]
    pub thumbnail: Option<Vec<u8>>,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub original_date: Option<u64>,
    #[serde(default)]
    pub created_at: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub owner_fingerprint: String,
    pub shared_at: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SharedVaultSnapshot {
    pub files: Vec<SnapshotFile>,
    pub metadata: SnapshotMetadata,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Encode a snapshot in the canonical form.
pub fn encode(snapshot: &SharedVaultSnapshot) -> Result<Vec<u8>, ShareError> {
    let json = serde_json::to_vec(snapshot)
        .map_err(|e| ShareError::InvalidData(format!("snapshot encode: {e}")))?;
    let mut out = Vec::with_capacity(1 + json.len());
    out.push(SNAPSHOT_VERSION);
    out.extend_from_slice(&json);
    Ok(out)
}

/// Decode a snapshot, auto-detecting the encoding.
pub fn decode(bytes: &[u8]) -> Result<SharedVaultSnapshot, ShareError> {
    let json = match bytes.first() {
        Some(&SNAPSHOT_VERSION) => &bytes[1..],
        // Legacy snapshots were bare JSON.
        Some(b'{') => bytes,
        Some(other) => {
            return Err(ShareError::InvalidData(format!(
                "unknown snapshot encoding (leading byte {other:#04x})"
            )));
        }
        None => return Err(ShareError::InvalidData("empty snapshot".to_string())),
    };
    serde_json::from_slice(json)
        .map_err(|e| ShareError::InvalidData(format!("snapshot decode: {e}")))
}
