//! In-memory object store.
//!
//! The reference [`ObjectStore`] implementation: one mutex over a record
//! map, so claim commits are naturally atomic. Tests drive the failure
//! paths through the injection knobs; embedding hosts can use it as a
//! local-only backend.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{FieldValue, ObjectStore, Query, Record, RecordType, SavePolicy, StoreError};

#[derive(Default)]
struct Inner {
    records: HashMap<(RecordType, String), Record>,
    next_tag: u64,
    unavailable: bool,
    /// Fail every put once this many have succeeded, until cleared.
    fail_puts_after: Option<u64>,
    puts_succeeded: u64,
}

/// See the module docs.
#[derive(Default)]
pub struct MemoryObjectStore {
    inner: Mutex<Inner>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle availability; unavailable stores fail every operation.
    pub fn set_available(&self, available: bool) {
        self.lock().unavailable = !available;
    }

    /// Let `n` more puts succeed, then fail each subsequent one with a
    /// transient error until [`clear_failures`](Self::clear_failures).
    pub fn fail_puts_after(&self, n: u64) {
        let mut inner = self.lock();
        let base = inner.puts_succeeded;
        inner.fail_puts_after = Some(base + n);
    }

    pub fn clear_failures(&self) {
        self.lock().fail_puts_after = None;
    }

    /// Number of stored records of a type.
    pub fn count(&self, record_type: RecordType) -> usize {
        self.lock()
            .records
            .keys()
            .filter(|(t, _)| *t == record_type)
            .count()
    }

    /// Ids of stored records of a type, sorted.
    pub fn ids(&self, record_type: RecordType) -> Vec<String> {
        let mut ids: Vec<String> = self
            .lock()
            .records
            .keys()
            .filter(|(t, _)| *t == record_type)
            .map(|(_, id)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, record_type: RecordType, id: &str) -> Result<Option<Record>, StoreError> {
        let inner = self.lock();
        if inner.unavailable {
            return Err(StoreError::Unavailable);
        }
        Ok(inner.records.get(&(record_type, id.to_string())).cloned())
    }

    async fn put(&self, mut record: Record, policy: SavePolicy) -> Result<Record, StoreError> {
        let mut inner = self.lock();
        if inner.unavailable {
            return Err(StoreError::Unavailable);
        }
        if inner
            .fail_puts_after
            .is_some_and(|limit| inner.puts_succeeded >= limit)
        {
            return Err(StoreError::Transient("injected put failure".to_string()));
        }

        let key = (record.record_type, record.id.clone());
        match (policy, inner.records.get(&key)) {
            (SavePolicy::IfUnchanged, Some(existing))
                if existing.change_tag != record.change_tag =>
            {
                return Err(StoreError::Conflict {
                    server: Some(Box::new(existing.clone())),
                });
            }
            (SavePolicy::ChangedKeys, Some(existing)) => {
                // Merge the provided keys over the server copy.
                let mut merged = existing.clone();
                for (name, value) in record.fields.drain() {
                    merged.fields.insert(name, value);
                }
                record = merged;
            }
            _ => {}
        }

        inner.next_tag += 1;
        record.change_tag = inner.next_tag;
        inner.records.insert(key, record.clone());
        inner.puts_succeeded += 1;
        Ok(record)
    }

    async fn query(&self, query: Query) -> Result<Vec<Record>, StoreError> {
        let inner = self.lock();
        if inner.unavailable {
            return Err(StoreError::Unavailable);
        }
        let mut results: Vec<Record> = inner
            .records
            .values()
            .filter(|r| r.record_type == query.record_type)
            .filter(|r| match &query.field_equals {
                Some((name, value)) => r.fields.get(name) == Some(value),
                None => true,
            })
            .cloned()
            .collect();

        if let Some(keys) = &query.desired_keys {
            for record in &mut results {
                record.fields.retain(|name, _| keys.contains(name));
            }
        }
        results.sort_by(|a, b| a.id.cmp(&b.id));
        // This backend answers in one page; the cursor is the last record
        // id of the previous page.
        if let Some(cursor) = &query.cursor {
            results.retain(|r| r.id > *cursor);
        }
        Ok(results)
    }

    async fn delete(&self, record_type: RecordType, id: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner.unavailable {
            return Err(StoreError::Unavailable);
        }
        inner.records.remove(&(record_type, id.to_string()));
        Ok(())
    }

    async fn is_available(&self) -> bool {
        !self.lock().unavailable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_round_trip() {
        let store = MemoryObjectStore::new();
        let record = Record::new(RecordType::SharedVault, "m1")
            .with_field("claimed", FieldValue::Bool(false));
        store.put(record, SavePolicy::ChangedKeys).await.unwrap();

        let got = store
            .get(RecordType::SharedVault, "m1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.bool("claimed"), Some(false));
    }

    #[tokio::test]
    async fn if_unchanged_detects_races() {
        let store = MemoryObjectStore::new();
        let saved = store
            .put(
                Record::new(RecordType::SharedVault, "m1")
                    .with_field("claimed", FieldValue::Bool(false)),
                SavePolicy::ChangedKeys,
            )
            .await
            .unwrap();

        // Two readers fetch the same generation.
        let mut first = saved.clone();
        first.set("claimed", FieldValue::Bool(true));
        let mut second = saved.clone();
        second.set("claimed", FieldValue::Bool(true));

        store.put(first, SavePolicy::IfUnchanged).await.unwrap();
        let race = store.put(second, SavePolicy::IfUnchanged).await;
        assert!(matches!(race, Err(StoreError::Conflict { .. })));
    }

    #[tokio::test]
    async fn changed_keys_merges_fields() {
        let store = MemoryObjectStore::new();
        store
            .put(
                Record::new(RecordType::SharedVault, "m1")
                    .with_field("a", FieldValue::Int(1))
                    .with_field("b", FieldValue::Int(2)),
                SavePolicy::ChangedKeys,
            )
            .await
            .unwrap();
        store
            .put(
                Record::new(RecordType::SharedVault, "m1").with_field("b", FieldValue::Int(9)),
                SavePolicy::ChangedKeys,
            )
            .await
            .unwrap();

        let got = store
            .get(RecordType::SharedVault, "m1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.int("a"), Some(1));
        assert_eq!(got.int("b"), Some(9));
    }

    #[tokio::test]
    async fn query_filters_by_field_and_strips_keys() {
        let store = MemoryObjectStore::new();
        for i in 0..3 {
            store
                .put(
                    Record::new(RecordType::SharedVaultChunk, format!("v1_chunk_{i}"))
                        .with_field("vaultId", FieldValue::Text("v1".to_string()))
                        .with_field("chunkIndex", FieldValue::Int(i))
                        .with_field("chunkData", FieldValue::Asset(vec![0; 16])),
                    SavePolicy::ChangedKeys,
                )
                .await
                .unwrap();
        }
        store
            .put(
                Record::new(RecordType::SharedVaultChunk, "v2_chunk_0")
                    .with_field("vaultId", FieldValue::Text("v2".to_string()))
                    .with_field("chunkIndex", FieldValue::Int(0)),
                SavePolicy::ChangedKeys,
            )
            .await
            .unwrap();

        let results = store
            .query(
                Query::all(RecordType::SharedVaultChunk)
                    .field("vaultId", FieldValue::Text("v1".to_string()))
                    .keys(&["chunkIndex"]),
            )
            .await
            .unwrap();
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.bytes("chunkData").is_none()));
    }

    #[tokio::test]
    async fn query_cursor_resumes_after_the_given_id() {
        let store = MemoryObjectStore::new();
        for i in 0..4 {
            store
                .put(
                    Record::new(RecordType::SharedVaultChunk, format!("v1_chunk_{i}"))
                        .with_field("vaultId", FieldValue::Text("v1".to_string())),
                    SavePolicy::ChangedKeys,
                )
                .await
                .unwrap();
        }

        let page = store
            .query(Query::all(RecordType::SharedVaultChunk).after("v1_chunk_1"))
            .await
            .unwrap();
        assert_eq!(
            page.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
            vec!["v1_chunk_2", "v1_chunk_3"]
        );
    }

    #[tokio::test]
    async fn failure_injection_trips_after_threshold() {
        let store = MemoryObjectStore::new();
        store.fail_puts_after(1);

        let ok = store
            .put(Record::new(RecordType::VaultBackupChunk, "c0"), SavePolicy::ChangedKeys)
            .await;
        assert!(ok.is_ok());
        let fail = store
            .put(Record::new(RecordType::VaultBackupChunk, "c1"), SavePolicy::ChangedKeys)
            .await;
        assert!(matches!(fail, Err(StoreError::Transient(_))));

        store.clear_failures();
        assert!(store
            .put(Record::new(RecordType::VaultBackupChunk, "c1"), SavePolicy::ChangedKeys)
            .await
            .is_ok());
    }
}
