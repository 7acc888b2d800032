//! Per-document task records: creation, backoff skipping, attempt history
//! and optimistic-concurrency snapshotting, backed by an embedded
//! transactional key/value store.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sled::Transactional;
use time::OffsetDateTime;

use cataloger_core::{CatalogerError, Document, DocumentMetadata, DocumentTaskKey, ObjectId, Result};

use crate::client::DocumentClient;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    #[serde(with = "time::serde::rfc3339")]
    pub begin: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end: OffsetDateTime,
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentTaskRecord {
    pub id: ObjectId,
    #[serde(with = "time::serde::rfc3339")]
    pub added: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub modified: OffsetDateTime,
    pub original_checksum: String,
    pub archive_checksum: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub record_created: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub record_updated: OffsetDateTime,
    pub retry_count: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub retry_after: OffsetDateTime,
    pub attempts: Vec<Attempt>,
}

impl DocumentTaskRecord {
    fn new(id: ObjectId, added: OffsetDateTime, modified: OffsetDateTime, original_checksum: String, archive_checksum: Option<String>, now: OffsetDateTime) -> Self {
        Self {
            id,
            added,
            modified,
            original_checksum,
            archive_checksum,
            record_created: now,
            record_updated: now,
            retry_count: 0,
            retry_after: now,
            attempts: Vec::new(),
        }
    }
}

/// Snapshot of everything that matters for detecting a concurrent edit,
/// serialized to a canonical, deterministically-ordered form so two
/// snapshots can be compared structurally regardless of field order.
#[derive(Debug, Clone, PartialEq, Serialize)]
struct Snapshot {
    id: ObjectId,
    #[serde(with = "time::serde::rfc3339")]
    added: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    created: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    modified: OffsetDateTime,
    title: String,
    content: String,
    original_checksum: String,
    has_archive_version: bool,
    archive_checksum: Option<String>,
}

impl Snapshot {
    fn capture(doc: &Document, meta: &DocumentMetadata) -> Self {
        Self {
            id: doc.id,
            added: doc.added,
            created: doc.created,
            modified: doc.modified,
            title: doc.title.clone(),
            content: doc.content.clone(),
            original_checksum: meta.original_checksum.clone(),
            has_archive_version: meta.has_archive_version,
            archive_checksum: meta.archive_checksum.clone(),
        }
    }

    /// `serde_json::Value`'s map equality is order-independent, so this is
    /// already a canonical point of comparison: structurally equal
    /// snapshots compare equal regardless of field declaration order.
    fn canonical(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("Snapshot always serializes")
    }
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn get(&self, key: &DocumentTaskKey) -> Result<Option<DocumentTaskRecord>>;
    async fn upsert(&self, key: &DocumentTaskKey, record: &DocumentTaskRecord) -> Result<()>;
    /// Deletes every record whose `record_updated` is older than `cutoff`,
    /// counting and deleting within a single transaction so a pruning pass
    /// is never observed half-applied; returns the number deleted.
    async fn prune_older_than(&self, cutoff: OffsetDateTime) -> Result<usize>;
}

fn updated_index_key(record_updated: OffsetDateTime, primary: &[u8]) -> Vec<u8> {
    let micros = (record_updated.unix_timestamp_nanos() / 1_000) as i64;
    let mut key = Vec::with_capacity(8 + primary.len());
    key.extend_from_slice(&micros.to_be_bytes());
    key.extend_from_slice(primary);
    key
}

/// `sled`-backed store. Task records live in one tree keyed by the
/// byte-exact [`DocumentTaskKey`]; a second tree, keyed by
/// `record_updated || primary_key`, lets the pruner scan in
/// staleness order without a table scan. Both trees are updated in one
/// transaction so they never drift apart.
pub struct SledTaskStore {
    tasks: sled::Tree,
    by_updated: sled::Tree,
}

impl SledTaskStore {
    pub fn open(db: &sled::Db) -> Result<Self> {
        let tasks = db.open_tree("tasks").map_err(|e| CatalogerError::Store(e.to_string()))?;
        let by_updated = db.open_tree("tasks_by_updated").map_err(|e| CatalogerError::Store(e.to_string()))?;
        Ok(Self { tasks, by_updated })
    }
}

#[async_trait]
impl TaskStore for SledTaskStore {
    async fn get(&self, key: &DocumentTaskKey) -> Result<Option<DocumentTaskRecord>> {
        let tasks = self.tasks.clone();
        let key_bytes = key.as_bytes().to_vec();
        tokio::task::spawn_blocking(move || {
            let Some(bytes) = tasks.get(&key_bytes).map_err(|e| CatalogerError::Store(e.to_string()))? else {
                return Ok(None);
            };
            let record: DocumentTaskRecord = serde_json::from_slice(&bytes).map_err(|e| CatalogerError::Store(e.to_string()))?;
            Ok(Some(record))
        })
        .await
        .map_err(|e| CatalogerError::Store(e.to_string()))?
    }

    async fn upsert(&self, key: &DocumentTaskKey, record: &DocumentTaskRecord) -> Result<()> {
        let tasks = self.tasks.clone();
        let by_updated = self.by_updated.clone();
        let key_bytes = key.as_bytes().to_vec();
        let record_bytes = serde_json::to_vec(record).map_err(|e| CatalogerError::Store(e.to_string()))?;
        let new_index_key = updated_index_key(record.record_updated, &key_bytes);

        tokio::task::spawn_blocking(move || {
            (&tasks, &by_updated)
                .transaction(|(tasks_tx, index_tx)| {
                    if let Some(old) = tasks_tx.get(&key_bytes)? {
                        if let Ok(old_record) = serde_json::from_slice::<DocumentTaskRecord>(&old) {
                            let old_index_key = updated_index_key(old_record.record_updated, &key_bytes);
                            index_tx.remove(old_index_key)?;
                        }
                    }
                    tasks_tx.insert(key_bytes.clone(), record_bytes.clone())?;
                    index_tx.insert(new_index_key.clone(), key_bytes.clone())?;
                    Ok(())
                })
                .map_err(|e: sled::transaction::TransactionError<CatalogerError>| CatalogerError::Store(e.to_string()))
        })
        .await
        .map_err(|e| CatalogerError::Store(e.to_string()))?
    }

    async fn prune_older_than(&self, cutoff: OffsetDateTime) -> Result<usize> {
        let tasks = self.tasks.clone();
        let by_updated = self.by_updated.clone();
        let cutoff_key = updated_index_key(cutoff, &[]);

        tokio::task::spawn_blocking(move || {
            // The range scan below only picks *candidates*: it runs outside
            // the transaction, so a concurrent `upsert` could move a record
            // across the cutoff boundary (or retire this exact index entry)
            // in between. Each candidate is re-checked against the live
            // index from inside the transaction before it is counted or
            // removed, so the count and the deletes always come from one
            // consistent snapshot.
            let candidates: Vec<(Vec<u8>, Vec<u8>)> = by_updated
                .range(..cutoff_key)
                .filter_map(|r| r.ok())
                .map(|(k, v)| (k.to_vec(), v.to_vec()))
                .collect();
            if candidates.is_empty() {
                return Ok(0);
            }
            (&tasks, &by_updated)
                .transaction(|(tasks_tx, index_tx)| {
                    let mut deleted = 0usize;
                    for (index_key, primary_key) in &candidates {
                        // Still the same entry we saw during the scan? An
                        // upsert that touched this record would have removed
                        // this exact index key as part of its own
                        // transaction, so a hit here means it's unchanged.
                        if index_tx.get(index_key)?.as_deref() != Some(primary_key.as_slice()) {
                            continue;
                        }
                        tasks_tx.remove(primary_key.clone())?;
                        index_tx.remove(index_key.clone())?;
                        deleted += 1;
                    }
                    Ok(deleted)
                })
                .map_err(|e: sled::transaction::TransactionError<CatalogerError>| CatalogerError::Store(e.to_string()))
        })
        .await
        .map_err(|e| CatalogerError::Store(e.to_string()))?
    }
}

/// In-memory double for tests: same count-then-delete-in-one-pass contract,
/// guarded by a synchronous mutex rather than `sled`'s transactions.
#[derive(Default)]
pub struct MemoryTaskStore {
    records: std::sync::Mutex<BTreeMap<Vec<u8>, DocumentTaskRecord>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn get(&self, key: &DocumentTaskKey) -> Result<Option<DocumentTaskRecord>> {
        Ok(self.records.lock().unwrap().get(key.as_bytes()).cloned())
    }

    async fn upsert(&self, key: &DocumentTaskKey, record: &DocumentTaskRecord) -> Result<()> {
        self.records.lock().unwrap().insert(key.as_bytes().to_vec(), record.clone());
        Ok(())
    }

    async fn prune_older_than(&self, cutoff: OffsetDateTime) -> Result<usize> {
        let mut records = self.records.lock().unwrap();
        let stale: Vec<Vec<u8>> = records
            .iter()
            .filter(|(_, r)| r.record_updated < cutoff)
            .map(|(k, _)| k.clone())
            .collect();
        if stale.is_empty() {
            return Ok(0);
        }
        for key in &stale {
            records.remove(key);
        }
        Ok(stale.len())
    }
}

/// A live handle on a document's task record, produced by [`load_task`].
/// `None` from `load_task` means "skip this document for now" (backoff
/// still active).
pub struct TaskHandle {
    key: DocumentTaskKey,
    record: DocumentTaskRecord,
    baseline: Snapshot,
}

impl TaskHandle {
    pub fn retry_count(&self) -> u32 {
        self.record.retry_count
    }

    /// Re-fetches the document and its metadata and compares them,
    /// field-by-field in canonical form, against the snapshot captured at
    /// `load_task` time.
    pub async fn check_modified(&self, client: &dyn DocumentClient) -> Result<()> {
        let doc = client.get_document(self.record.id).await?;
        let meta = client.get_document_metadata(self.record.id).await?;
        let current = Snapshot::capture(&doc, &meta);
        if current.canonical() != self.baseline.canonical() {
            return Err(CatalogerError::ConcurrentModification(format!("document {} changed since it was loaded", self.record.id)));
        }
        Ok(())
    }

    /// Appends an attempt entry and, on failure, advances the retry
    /// counter and the backoff deadline.
    pub async fn save_result(&mut self, store: &dyn TaskStore, begin: OffsetDateTime, now: OffsetDateTime, err: Option<&CatalogerError>, retry_delay: StdDuration) -> Result<()> {
        let success = err.is_none();
        self.record.attempts.push(Attempt {
            begin,
            end: now,
            success,
            message: err.map(|e| e.to_string()).unwrap_or_default(),
        });
        self.record.record_updated = now;
        if !success {
            self.record.retry_count += 1;
            self.record.retry_after = now + time::Duration::try_from(retry_delay).unwrap_or(time::Duration::ZERO);
        }
        store.upsert(&self.key, &self.record).await
    }
}

/// Loads or creates the task record for `document`, returning `None` if a
/// prior failed attempt's backoff has not elapsed yet.
pub async fn load_task(store: &dyn TaskStore, client: &dyn DocumentClient, document: &Document, now: OffsetDateTime) -> Result<Option<TaskHandle>> {
    let meta = client.get_document_metadata(document.id).await?;
    let key = DocumentTaskKey::new(document.id, document.added, document.modified, &meta.original_checksum, meta.archive_checksum.as_deref());

    let record = match store.get(&key).await? {
        Some(existing) => {
            if existing.retry_after > now {
                return Ok(None);
            }
            existing
        }
        None => DocumentTaskRecord::new(document.id, document.added, document.modified, meta.original_checksum.clone(), meta.archive_checksum.clone(), now),
    };

    let baseline = Snapshot::capture(document, &meta);
    Ok(Some(TaskHandle { key, record, baseline }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MemoryDocumentClient;
    use std::collections::BTreeSet;
    use time::macros::datetime;

    fn doc(id: ObjectId, modified: OffsetDateTime) -> Document {
        Document {
            id,
            added: datetime!(2024-01-01 00:00:00 UTC),
            modified,
            created: None,
            title: "title".to_string(),
            content: "content".to_string(),
            correspondent: None,
            document_type: None,
            storage_path: None,
            tags: BTreeSet::new(),
        }
    }

    fn meta(checksum: &str) -> DocumentMetadata {
        DocumentMetadata {
            original_checksum: checksum.to_string(),
            original_size: 10,
            has_archive_version: false,
            archive_checksum: None,
            archive_size: None,
        }
    }

    #[tokio::test]
    async fn first_load_creates_a_fresh_record() {
        let store = MemoryTaskStore::new();
        let client = MemoryDocumentClient::new();
        let d = doc(1, datetime!(2024-01-02 00:00:00 UTC));
        client.insert_document(d.clone(), meta("abc"));

        let now = datetime!(2024-01-03 00:00:00 UTC);
        let handle = load_task(&store, &client, &d, now).await.unwrap().expect("fresh document is never skipped");
        assert_eq!(handle.retry_count(), 0);
    }

    #[tokio::test]
    async fn backoff_skips_until_retry_after_elapses() {
        let store = MemoryTaskStore::new();
        let client = MemoryDocumentClient::new();
        let d = doc(1, datetime!(2024-01-02 00:00:00 UTC));
        client.insert_document(d.clone(), meta("abc"));

        let t0 = datetime!(2024-01-03 00:00:00 UTC);
        let mut handle = load_task(&store, &client, &d, t0).await.unwrap().unwrap();
        handle
            .save_result(&store, t0, t0, Some(&CatalogerError::Other("boom".into())), StdDuration::from_secs(3600))
            .await
            .unwrap();

        let mid = t0 + time::Duration::minutes(30);
        assert!(load_task(&store, &client, &d, mid).await.unwrap().is_none(), "backoff has not elapsed yet");

        let later = t0 + time::Duration::hours(2);
        assert!(load_task(&store, &client, &d, later).await.unwrap().is_some(), "backoff elapsed");
    }

    #[tokio::test]
    async fn check_modified_detects_any_snapshot_field_change() {
        let store = MemoryTaskStore::new();
        let client = MemoryDocumentClient::new();
        let d = doc(1, datetime!(2024-01-02 00:00:00 UTC));
        client.insert_document(d.clone(), meta("abc"));

        let now = datetime!(2024-01-03 00:00:00 UTC);
        let handle = load_task(&store, &client, &d, now).await.unwrap().unwrap();
        handle.check_modified(&client).await.expect("unchanged document passes");

        let mut changed = client.documents.lock().unwrap().get_mut(&1).unwrap().clone();
        changed.title = "different title".to_string();
        client.documents.lock().unwrap().insert(1, changed);

        let err = handle.check_modified(&client).await.unwrap_err();
        assert!(matches!(err, CatalogerError::ConcurrentModification(_)));
    }

    #[tokio::test]
    async fn check_modified_catches_metadata_only_changes() {
        let store = MemoryTaskStore::new();
        let client = MemoryDocumentClient::new();
        let d = doc(1, datetime!(2024-01-02 00:00:00 UTC));
        client.insert_document(d.clone(), meta("abc"));

        let now = datetime!(2024-01-03 00:00:00 UTC);
        let handle = load_task(&store, &client, &d, now).await.unwrap().unwrap();

        let mut new_meta = meta("abc");
        new_meta.has_archive_version = true;
        client.metadata.lock().unwrap().insert(1, new_meta);

        let err = handle.check_modified(&client).await.unwrap_err();
        assert!(matches!(err, CatalogerError::ConcurrentModification(_)));
    }

    #[tokio::test]
    async fn changing_a_keyed_field_starts_a_brand_new_record() {
        let store = MemoryTaskStore::new();
        let client = MemoryDocumentClient::new();
        let d = doc(1, datetime!(2024-01-02 00:00:00 UTC));
        client.insert_document(d.clone(), meta("abc"));

        let t0 = datetime!(2024-01-03 00:00:00 UTC);
        let mut handle = load_task(&store, &client, &d, t0).await.unwrap().unwrap();
        handle
            .save_result(&store, t0, t0, Some(&CatalogerError::Other("boom".into())), StdDuration::from_secs(3600))
            .await
            .unwrap();

        let mut new_doc = d.clone();
        new_doc.modified = datetime!(2024-02-01 00:00:00 UTC);
        client.insert_document(new_doc.clone(), meta("abc"));

        let soon_after = t0 + time::Duration::minutes(1);
        let fresh = load_task(&store, &client, &new_doc, soon_after).await.unwrap().expect("new key has no backoff yet");
        assert_eq!(fresh.retry_count(), 0);
    }

    #[tokio::test]
    async fn prune_deletes_only_stale_records_in_one_pass() {
        let store = MemoryTaskStore::new();
        let key1 = DocumentTaskKey::new(1, datetime!(2024-01-01 00:00:00 UTC), datetime!(2024-01-01 00:00:00 UTC), "a", None);
        let key2 = DocumentTaskKey::new(2, datetime!(2024-01-01 00:00:00 UTC), datetime!(2024-01-01 00:00:00 UTC), "b", None);

        let old = DocumentTaskRecord::new(1, datetime!(2024-01-01 00:00:00 UTC), datetime!(2024-01-01 00:00:00 UTC), "a".into(), None, datetime!(2024-01-01 00:00:00 UTC));
        let fresh = DocumentTaskRecord::new(2, datetime!(2024-01-01 00:00:00 UTC), datetime!(2024-01-01 00:00:00 UTC), "b".into(), None, datetime!(2024-06-01 00:00:00 UTC));
        store.upsert(&key1, &old).await.unwrap();
        store.upsert(&key2, &fresh).await.unwrap();

        let deleted = store.prune_older_than(datetime!(2024-03-01 00:00:00 UTC)).await.unwrap();
        assert_eq!(deleted, 1);
        assert!(store.get(&key1).await.unwrap().is_none());
        assert!(store.get(&key2).await.unwrap().is_some());
    }

    #[test]
    fn prune_of_empty_store_is_a_noop() {
        let store = MemoryTaskStore::new();
        let rt = tokio::runtime::Runtime::new().unwrap();
        let deleted = rt.block_on(store.prune_older_than(datetime!(2024-01-01 00:00:00 UTC))).unwrap();
        assert_eq!(deleted, 0);
    }
}
