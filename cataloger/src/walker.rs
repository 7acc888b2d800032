//! Paginated, tag-filtered document enumeration with dedup and a bounded
//! worker pool — grounded in the same pattern as a scan engine's bounded
//! task dispatch: a semaphore gates concurrency, an atomic active-count
//! plus a `Notify` drive idle detection, and an RAII guard decrements the
//! count on every exit path including panics.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;

use cataloger_core::{Document, ObjectId, Result};

use crate::client::{DocumentClient, ListDocumentsOptions};

/// Decrements the shared active-task counter and wakes anyone waiting for
/// idle, on every exit path (including a panicking handler).
struct ActiveTaskGuard {
    active: Arc<AtomicUsize>,
    idle_notify: Arc<Notify>,
}

impl Drop for ActiveTaskGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.idle_notify.notify_waiters();
    }
}

/// Enumerates every document tagged `tag_id`, dispatching `handler` for
/// each at most once, with parallelism bounded by `max_parallel`.
///
/// Re-scans the listing from the start whenever a pass observes at least
/// one id it hadn't seen before: patching a document typically removes the
/// tag being filtered on, which shifts page boundaries underneath a
/// naively-paginated scan, so a cheap full re-scan beats bookkeeping a
/// stable cursor.
pub async fn walk_documents<H, Fut>(client: &dyn DocumentClient, tag_id: ObjectId, max_parallel: usize, cancel: CancellationToken, handler: H) -> Result<()>
where
    H: Fn(Document) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let handler = Arc::new(handler);
    let semaphore = Arc::new(Semaphore::new(max_parallel.max(1)));
    let active = Arc::new(AtomicUsize::new(0));
    let idle_notify = Arc::new(Notify::new());
    let mut seen: HashSet<ObjectId> = HashSet::new();
    let mut join_set = tokio::task::JoinSet::new();

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let mut page = 0u64;
        let mut saw_new_id_this_pass = false;

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let result = client
                .list_documents(ListDocumentsOptions {
                    tag_id,
                    page,
                    page_size: 100,
                })
                .await;

            let batch = match result {
                Ok(batch) => batch,
                Err(err) if err.is_cancelled() => break,
                Err(err) => return Err(err),
            };

            for document in batch.documents {
                if !seen.insert(document.id) {
                    continue;
                }
                saw_new_id_this_pass = true;

                let permit = semaphore.clone().acquire_owned().await.expect("semaphore never closed");
                active.fetch_add(1, Ordering::SeqCst);
                let guard = ActiveTaskGuard {
                    active: active.clone(),
                    idle_notify: idle_notify.clone(),
                };
                let handler = handler.clone();
                join_set.spawn(async move {
                    let _permit = permit;
                    let _guard = guard;
                    handler(document).await;
                });
            }

            if !batch.has_more {
                break;
            }
            page += 1;
        }

        if !saw_new_id_this_pass || cancel.is_cancelled() {
            break;
        }
    }

    while join_set.join_next().await.is_some() {}
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{DocumentPage, MemoryDocumentClient, NewObject};
    use async_trait::async_trait;
    use cataloger_core::{DocumentMetadata, ObjectKind};
    use std::collections::BTreeSet;
    use std::sync::Mutex as StdMutex;
    use time::macros::datetime;

    fn doc(id: ObjectId, tag: ObjectId) -> Document {
        Document {
            id,
            added: datetime!(2024-01-01 00:00:00 UTC),
            modified: datetime!(2024-01-01 00:00:00 UTC),
            created: None,
            title: format!("doc {id}"),
            content: String::new(),
            correspondent: None,
            document_type: None,
            storage_path: None,
            tags: [tag].into_iter().collect(),
        }
    }

    #[tokio::test]
    async fn every_matching_document_is_handled_exactly_once() {
        let client = MemoryDocumentClient::new();
        let tag = client.create_object(ObjectKind::Tag, &NewObject { name: "todo".into(), ..Default::default() }).await.unwrap();
        for id in 1..=10 {
            client.insert_document(
                doc(id, tag),
                DocumentMetadata {
                    original_checksum: format!("cs{id}"),
                    original_size: 1,
                    has_archive_version: false,
                    archive_checksum: None,
                    archive_size: None,
                },
            );
        }

        let handled: Arc<StdMutex<Vec<ObjectId>>> = Arc::new(StdMutex::new(Vec::new()));
        let handled_clone = handled.clone();
        walk_documents(&client, tag, 4, CancellationToken::new(), move |d| {
            let handled = handled_clone.clone();
            async move {
                handled.lock().unwrap().push(d.id);
            }
        })
        .await
        .unwrap();

        let mut ids = handled.lock().unwrap().clone();
        ids.sort();
        assert_eq!(ids, (1..=10).collect::<Vec<_>>());
    }

    /// A client double whose listing grows mid-walk: the first pass sees
    /// ids 1..5, and a new id (6) appears once the handler for id 1 starts
    /// running. The walker must still pick it up in a subsequent pass,
    /// without ever handling any id twice.
    struct GrowingListClient {
        inner: MemoryDocumentClient,
        tag: ObjectId,
        grown: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl DocumentClient for GrowingListClient {
        async fn list_documents(&self, opts: ListDocumentsOptions) -> Result<DocumentPage> {
            if !self.grown.swap(true, Ordering::SeqCst) {
                self.inner.insert_document(
                    doc(6, self.tag),
                    DocumentMetadata {
                        original_checksum: "cs6".into(),
                        original_size: 1,
                        has_archive_version: false,
                        archive_checksum: None,
                        archive_size: None,
                    },
                );
            }
            self.inner.list_documents(opts).await
        }
        async fn get_document(&self, id: ObjectId) -> Result<Document> {
            self.inner.get_document(id).await
        }
        async fn get_document_metadata(&self, id: ObjectId) -> Result<DocumentMetadata> {
            self.inner.get_document_metadata(id).await
        }
        async fn patch_document(&self, id: ObjectId, fields: &crate::client::DocumentPatchFields) -> Result<()> {
            self.inner.patch_document(id, fields).await
        }
        async fn download_document(&self, id: ObjectId, variant: cataloger_core::Variant, dest_path: &std::path::Path) -> Result<crate::client::DownloadInfo> {
            self.inner.download_document(id, variant, dest_path).await
        }
        async fn get_current_user(&self) -> Result<crate::client::User> {
            self.inner.get_current_user().await
        }
        async fn list_objects(&self, kind: ObjectKind, name: &str) -> Result<Vec<crate::client::NamedObject>> {
            self.inner.list_objects(kind, name).await
        }
        async fn create_object(&self, kind: ObjectKind, fields: &NewObject) -> Result<ObjectId> {
            self.inner.create_object(kind, fields).await
        }
    }

    #[tokio::test]
    async fn a_pass_that_observes_new_ids_triggers_a_rescan() {
        let inner = MemoryDocumentClient::new();
        let tag = inner.create_object(ObjectKind::Tag, &NewObject { name: "todo".into(), ..Default::default() }).await.unwrap();
        for id in 1..=5 {
            inner.insert_document(
                doc(id, tag),
                DocumentMetadata {
                    original_checksum: format!("cs{id}"),
                    original_size: 1,
                    has_archive_version: false,
                    archive_checksum: None,
                    archive_size: None,
                },
            );
        }
        let client = GrowingListClient {
            inner,
            tag,
            grown: std::sync::atomic::AtomicBool::new(false),
        };

        let handled: Arc<StdMutex<Vec<ObjectId>>> = Arc::new(StdMutex::new(Vec::new()));
        let handled_clone = handled.clone();
        walk_documents(&client, tag, 2, CancellationToken::new(), move |d| {
            let handled = handled_clone.clone();
            async move {
                handled.lock().unwrap().push(d.id);
            }
        })
        .await
        .unwrap();

        let mut ids = handled.lock().unwrap().clone();
        ids.sort();
        let mut unique = ids.clone();
        unique.dedup();
        assert_eq!(ids, unique, "no id handled twice");
        assert_eq!(ids, (1..=6).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn no_documents_completes_immediately() {
        let client = MemoryDocumentClient::new();
        let result = walk_documents(&client, 999, 4, CancellationToken::new(), |_d| async {}).await;
        assert!(result.is_ok());
    }
}
