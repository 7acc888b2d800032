//! Wires the poller, walker, task lifecycle and updater into the
//! cataloging workflow.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use cataloger_core::{ObjectId, ObjectKind, Result};

use crate::client::DocumentClient;
use crate::facter::FacterRegistry;
use crate::poller::{Poller, PollerOptions};
use crate::resolver::ObjectResolver;
use crate::task::{load_task, TaskStore};
use crate::updater::{Updater, UpdaterConfig};
use crate::walker::walk_documents;

pub struct CatalogerConfig {
    pub poll_interval: Duration,
    pub todo_tag_name: String,
    pub failed_tag_name: String,
    pub retries_max: u32,
    pub extract_timeout: Duration,
    pub max_file_size_bytes: u64,
    pub scratch_base_dir: PathBuf,
    pub max_parallel: usize,
}

/// `retry_after` grows geometrically with the attempt count so repeated
/// failures back off without needing a separate retry scheduler.
pub fn retry_delay(poll_interval: Duration, retry_count: u32) -> Duration {
    poll_interval.mul_f64(1.5f64.powi(1 + retry_count as i32))
}

pub struct Cataloger {
    client: Arc<dyn DocumentClient>,
    resolver: Arc<dyn ObjectResolver>,
    store: Arc<dyn TaskStore>,
    facters: Arc<FacterRegistry>,
    config: CatalogerConfig,
    poller: Poller,
    tag_ids: OnceCell<(ObjectId, ObjectId)>,
}

impl Cataloger {
    pub fn new(client: Arc<dyn DocumentClient>, resolver: Arc<dyn ObjectResolver>, store: Arc<dyn TaskStore>, facters: Arc<FacterRegistry>, config: CatalogerConfig) -> Result<Self> {
        let poller = Poller::new(PollerOptions {
            min_delay: config.poll_interval,
            max_delay: config.poll_interval,
            jitter: 0.1,
        })?;
        Ok(Self {
            client,
            resolver,
            store,
            facters,
            config,
            poller,
            tag_ids: OnceCell::new(),
        })
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.poller.cancellation_token()
    }

    pub fn cancel(&self) {
        self.poller.cancel();
    }

    /// A handle producers use to wake the next poll immediately, e.g. right
    /// after the document service reports a consumption event.
    pub fn notify_handle(&self) -> Arc<tokio::sync::Notify> {
        self.poller.notify_handle()
    }

    async fn resolve_tags(&self) -> Result<(ObjectId, ObjectId)> {
        self.tag_ids
            .get_or_try_init(|| async {
                let todo = self.resolver.get_or_create_by_name(ObjectKind::Tag, &self.config.todo_tag_name).await?;
                let failed = self.resolver.get_or_create_by_name(ObjectKind::Tag, &self.config.failed_tag_name).await?;
                Ok::<_, cataloger_core::CatalogerError>((todo, failed))
            })
            .await
            .map(|pair| *pair)
    }

    async fn process_one(&self, document: cataloger_core::Document, todo_tag_id: ObjectId, failed_tag_id: ObjectId) {
        let meta = match self.client.get_document_metadata(document.id).await {
            Ok(meta) => meta,
            Err(err) => {
                tracing::error!(document_id = document.id, error = %err, "failed to fetch metadata, skipping");
                return;
            }
        };

        let now = OffsetDateTime::now_utc();
        let mut task = match load_task(self.store.as_ref(), self.client.as_ref(), &document, now).await {
            Ok(Some(task)) => task,
            Ok(None) => return,
            Err(err) => {
                tracing::error!(document_id = document.id, error = %err, "failed to load task, skipping");
                return;
            }
        };

        let updater_config = UpdaterConfig {
            todo_tag_id,
            failed_tag_id,
            max_file_size_bytes: self.config.max_file_size_bytes,
            extract_timeout: self.config.extract_timeout,
            scratch_base_dir: self.config.scratch_base_dir.clone(),
        };
        let updater = Updater {
            client: self.client.as_ref(),
            resolver: self.resolver.as_ref(),
            facter: self.facters.as_ref(),
            config: &updater_config,
        };

        let last_retry = task.retry_count() >= self.config.retries_max;
        let begin = OffsetDateTime::now_utc();
        let result = updater.run(&document, &meta, &task, last_retry).await;
        let end = OffsetDateTime::now_utc();

        let delay = retry_delay(self.config.poll_interval, task.retry_count());
        if let Err(err) = task.save_result(self.store.as_ref(), begin, end, result.as_ref().err(), delay).await {
            tracing::error!(document_id = document.id, error = %err, "failed to persist task attempt");
        }
    }

    async fn poll_once(self: &Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let (todo_tag_id, failed_tag_id) = self.resolve_tags().await?;
        let this = self.clone();

        walk_documents(self.client.as_ref(), todo_tag_id, self.config.max_parallel, cancel, move |document| {
            let this = this.clone();
            async move {
                this.process_one(document, todo_tag_id, failed_tag_id).await;
            }
        })
        .await
    }

    /// Runs the polling loop until cancelled (via [`Cataloger::cancel`] or
    /// the token from [`Cataloger::cancellation_token`]).
    pub async fn run(self: Arc<Self>) {
        let poll_target = self.clone();
        let delay_target = self.clone();
        self.poller
            .run(
                move |cancel| {
                    let this = poll_target.clone();
                    async move { this.poll_once(cancel).await }
                },
                move || delay_target.config.poll_interval,
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{MemoryDocumentClient, NewObject};
    use crate::resolver::{DefaultOwnership, RemoteResolver};
    use crate::task::MemoryTaskStore;
    use cataloger_core::ObjectKind as Kind;

    #[test]
    fn retry_delay_grows_geometrically() {
        let interval = Duration::from_secs(60);
        let d0 = retry_delay(interval, 0);
        let d1 = retry_delay(interval, 1);
        assert!(d1 > d0);
        assert_eq!(d0, interval.mul_f64(1.5));
        assert_eq!(d1, interval.mul_f64(2.25));
    }

    #[tokio::test]
    async fn resolve_tags_is_memoized() {
        let client = Arc::new(MemoryDocumentClient::new());
        let resolver: Arc<dyn ObjectResolver> = Arc::new(RemoteResolver::new(client.clone(), DefaultOwnership::default()));
        let store: Arc<dyn TaskStore> = Arc::new(MemoryTaskStore::new());
        let facters = Arc::new(FacterRegistry::new());
        let cfg = CatalogerConfig {
            poll_interval: Duration::from_secs(60),
            todo_tag_name: "prog:todo".to_string(),
            failed_tag_name: "prog:failed".to_string(),
            retries_max: 3,
            extract_timeout: Duration::from_secs(300),
            max_file_size_bytes: 10 * 1024 * 1024,
            scratch_base_dir: std::env::temp_dir(),
            max_parallel: 2,
        };
        let cataloger = Cataloger::new(client.clone(), resolver, store, facters, cfg).unwrap();

        let (todo1, failed1) = cataloger.resolve_tags().await.unwrap();
        let (todo2, failed2) = cataloger.resolve_tags().await.unwrap();
        assert_eq!(todo1, todo2);
        assert_eq!(failed1, failed2);
        assert_eq!(client.create_calls.lock().unwrap().iter().filter(|(k, _)| *k == Kind::Tag).count(), 2);
    }

    #[tokio::test]
    async fn poll_once_processes_a_tagged_document_end_to_end() {
        let client = Arc::new(MemoryDocumentClient::new());
        let resolver: Arc<dyn ObjectResolver> = Arc::new(RemoteResolver::new(client.clone(), DefaultOwnership::default()));
        let store: Arc<dyn TaskStore> = Arc::new(MemoryTaskStore::new());
        let facters = Arc::new(FacterRegistry::new());
        let scratch = tempfile::tempdir().unwrap();
        let cfg = CatalogerConfig {
            poll_interval: Duration::from_secs(60),
            todo_tag_name: "prog:todo".to_string(),
            failed_tag_name: "prog:failed".to_string(),
            retries_max: 3,
            extract_timeout: Duration::from_secs(300),
            max_file_size_bytes: 10 * 1024 * 1024,
            scratch_base_dir: scratch.path().to_path_buf(),
            max_parallel: 2,
        };
        let cataloger = Arc::new(Cataloger::new(client.clone(), resolver, store, facters, cfg).unwrap());

        let (todo_tag_id, _) = cataloger.resolve_tags().await.unwrap();
        let doc = cataloger_core::Document {
            id: 1,
            added: OffsetDateTime::now_utc(),
            modified: OffsetDateTime::now_utc(),
            created: None,
            title: "t".to_string(),
            content: "c".to_string(),
            correspondent: None,
            document_type: None,
            storage_path: None,
            tags: [todo_tag_id].into_iter().collect(),
        };
        client.insert_document(
            doc,
            cataloger_core::DocumentMetadata {
                original_checksum: "abc".to_string(),
                original_size: 1,
                has_archive_version: false,
                archive_checksum: None,
                archive_size: None,
            },
        );

        cataloger.poll_once(CancellationToken::new()).await.unwrap();

        let patched = client.get_document(1).await.unwrap();
        assert!(!patched.tags.contains(&todo_tag_id), "empty facts + no facters should still clear the todo tag");
    }
}
