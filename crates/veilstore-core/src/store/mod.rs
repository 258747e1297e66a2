//! Abstract object-store capability.
//!
//! The transfer pipelines never talk to a concrete cloud SDK; they depend
//! on this record-oriented capability. Records carry typed fields and at
//! most one binary asset; saves either demand an unchanged server copy
//! (claim semantics) or merge changed keys (manifest updates). Hosts
//! implement [`ObjectStore`] against their platform's store;
//! [`memory::MemoryObjectStore`] is the in-process reference used by tests.

pub mod memory;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

/// Record types the engine reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    /// Share manifest, keyed by the phrase-derived vault id.
    SharedVault,
    /// One ≤2 MiB chunk of a share snapshot.
    SharedVaultChunk,
    /// Backup manifest, keyed by the literal `current_backup`.
    VaultBackup,
    /// One ≤2 MiB chunk of a backup payload.
    VaultBackupChunk,
}

impl RecordType {
    pub fn as_str(self) -> &'static str {
        match self {
            RecordType::SharedVault => "SharedVault",
            RecordType::SharedVaultChunk => "SharedVaultChunk",
            RecordType::VaultBackup => "VaultBackup",
            RecordType::VaultBackupChunk => "VaultBackupChunk",
        }
    }
}

/// A typed record field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Text(String),
    Int(i64),
    Bool(bool),
    Timestamp(u64),
    Bytes(Vec<u8>),
    /// Binary payload uploaded as an attachment.
    Asset(Vec<u8>),
}

/// One remote record.
#[derive(Debug, Clone)]
pub struct Record {
    pub record_type: RecordType,
    pub id: String,
    pub fields: HashMap<String, FieldValue>,
    /// Server-assigned change generation; drives conflict detection.
    pub change_tag: u64,
}

impl Record {
    pub fn new(record_type: RecordType, id: impl Into<String>) -> Self {
        Self {
            record_type,
            id: id.into(),
            fields: HashMap::new(),
            change_tag: 0,
        }
    }

    #[must_use]
    pub fn with_field(mut self, name: &str, value: FieldValue) -> Self {
        self.fields.insert(name.to_string(), value);
        self
    }

    pub fn set(&mut self, name: &str, value: FieldValue) {
        self.fields.insert(name.to_string(), value);
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        match self.fields.get(name) {
            Some(FieldValue::Text(s)) => Some(s),
            _ => None,
        }
    }

    pub fn int(&self, name: &str) -> Option<i64> {
        match self.fields.get(name) {
            Some(FieldValue::Int(v)) => Some(*v),
            Some(FieldValue::Timestamp(v)) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn bool(&self, name: &str) -> Option<bool> {
        match self.fields.get(name) {
            Some(FieldValue::Bool(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn bytes(&self, name: &str) -> Option<&[u8]> {
        match self.fields.get(name) {
            Some(FieldValue::Bytes(b) | FieldValue::Asset(b)) => Some(b),
            _ => None,
        }
    }
}

/// Save behavior for [`ObjectStore::put`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SavePolicy {
    /// Fail with [`StoreError::Conflict`] if the server copy changed since
    /// the record was fetched. Used for one-shot commits (claims).
    IfUnchanged,
    /// Merge the provided fields over whatever the server holds. Used for
    /// manifest upserts that tolerate `serverRecordChanged`.
    ChangedKeys,
}

/// A query over one record type.
#[derive(Debug, Clone)]
pub struct Query {
    pub record_type: RecordType,
    /// Equality predicate on a single field.
    pub field_equals: Option<(String, FieldValue)>,
    /// Restrict returned fields; `None` returns everything. Chunk-presence
    /// probes pass this to avoid downloading assets.
    pub desired_keys: Option<Vec<String>>,
    /// Opaque continuation token from a previous page; `None` starts from
    /// the beginning. Backends that return everything in one page ignore it.
    pub cursor: Option<String>,
}

impl Query {
    pub fn all(record_type: RecordType) -> Self {
        Self {
            record_type,
            field_equals: None,
            desired_keys: None,
            cursor: None,
        }
    }

    #[must_use]
    pub fn field(mut self, name: &str, value: FieldValue) -> Self {
        self.field_equals = Some((name.to_string(), value));
        self
    }

    #[must_use]
    pub fn keys(mut self, keys: &[&str]) -> Self {
        self.desired_keys = Some(keys.iter().map(|k| (*k).to_string()).collect());
        self
    }

    #[must_use]
    pub fn after(mut self, cursor: impl Into<String>) -> Self {
        self.cursor = Some(cursor.into());
        self
    }
}

/// Transport errors.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("object store unavailable")]
    Unavailable,

    #[error("rate limited by object store")]
    RateLimited { retry_after: Option<Duration> },

    /// The server copy changed since it was fetched (`serverRecordChanged`).
    #[error("record changed on server")]
    Conflict { server: Option<Box<Record>> },

    #[error("record not found")]
    NotFound,

    /// Transient failure worth retrying (network blip, zone busy).
    #[error("transient transport failure: {0}")]
    Transient(String),

    /// Terminal transport failure.
    #[error("transport failure: {0}")]
    Failed(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::Unavailable | StoreError::RateLimited { .. } | StoreError::Transient(_)
        )
    }
}

/// The capability the transfer pipelines depend on.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, record_type: RecordType, id: &str) -> Result<Option<Record>, StoreError>;
    async fn put(&self, record: Record, policy: SavePolicy) -> Result<Record, StoreError>;
    async fn query(&self, query: Query) -> Result<Vec<Record>, StoreError>;
    async fn delete(&self, record_type: RecordType, id: &str) -> Result<(), StoreError>;
    async fn is_available(&self) -> bool;
}

/// Retry a small-record operation with exponential backoff (1 s, 2 s) over
/// at most 3 attempts. A server-provided retry-after hint takes precedence
/// over the computed delay.
pub(crate) async fn with_retry<T, F, Fut>(mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, StoreError>>,
{
    const ATTEMPTS: u32 = 3;
    let mut delay = Duration::from_secs(1);
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && attempt + 1 < ATTEMPTS => {
                let wait = match &e {
                    StoreError::RateLimited {
                        retry_after: Some(hint),
                    } => *hint,
                    _ => delay,
                };
                debug!(attempt, wait_ms = wait.as_millis() as u64, "retrying store operation");
                tokio::time::sleep(wait).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn retry_recovers_from_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = with_retry(|| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(StoreError::Transient("blip".to_string()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_gives_up_after_three_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StoreError::Unavailable) }
        })
        .await;
        assert!(matches!(result, Err(StoreError::Unavailable)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn terminal_errors_do_not_retry() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(StoreError::Failed("gone".to_string())) }
        })
        .await;
        assert!(matches!(result, Err(StoreError::Failed(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
