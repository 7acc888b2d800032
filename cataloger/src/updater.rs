//! Orchestrates one processing attempt: size guard, extraction, patch
//! building, optimistic commit, and permanent-failure marking.

use std::path::PathBuf;
use std::time::Duration;

use cataloger_core::{CatalogerError, Document, DocumentMetadata, ObjectId, Result, Variant};

use crate::client::DocumentClient;
use crate::facter::Facter;
use crate::facts_extract::extract_facts;
use crate::patchbuilder::PatchBuilder;
use crate::resolver::ObjectResolver;
use crate::task::TaskHandle;

pub struct UpdaterConfig {
    pub todo_tag_id: ObjectId,
    pub failed_tag_id: ObjectId,
    pub max_file_size_bytes: u64,
    pub extract_timeout: Duration,
    pub scratch_base_dir: PathBuf,
}

pub struct Updater<'a> {
    pub client: &'a dyn DocumentClient,
    pub resolver: &'a dyn ObjectResolver,
    pub facter: &'a dyn Facter,
    pub config: &'a UpdaterConfig,
}

impl<'a> Updater<'a> {
    fn variant_order(meta: &DocumentMetadata) -> Vec<Variant> {
        let mut order = Vec::with_capacity(2);
        if meta.has_archive_version {
            order.push(Variant::Archived);
        }
        order.push(Variant::Original);
        order
    }

    /// One attempt: size guard, extraction, patch build, optimistic commit.
    /// A non-empty patch sent against an unmodified document counts as a
    /// successful run even when the extracted facts were empty (e.g. the
    /// todo/failed tag bookkeeping alone still constitutes progress).
    pub async fn apply_facts(&self, document: &Document, meta: &DocumentMetadata, task: &TaskHandle) -> Result<()> {
        self.check_size(meta)?;

        let facts = extract_facts(
            self.client,
            self.facter,
            document.id,
            &Self::variant_order(meta),
            &self.config.scratch_base_dir,
            self.config.extract_timeout,
        )
        .await?;

        let mut builder = PatchBuilder::new(document);
        if let Some(facts) = &facts {
            if !facts.is_empty() {
                builder.set_facts(facts, self.resolver).await?;
            }
        }
        builder.unset_tag(self.config.todo_tag_id);
        builder.unset_tag(self.config.failed_tag_id);

        let patch = builder.build();
        if !patch.is_empty() {
            task.check_modified(self.client).await?;
            self.client.patch_document(document.id, &patch).await?;
        }
        Ok(())
    }

    fn check_size(&self, meta: &DocumentMetadata) -> Result<()> {
        let mut problems = Vec::new();
        if meta.original_size > self.config.max_file_size_bytes {
            problems.push(format!("original ({} bytes)", meta.original_size));
        }
        if let Some(archive_size) = meta.archive_size {
            if archive_size > self.config.max_file_size_bytes {
                problems.push(format!("archive ({archive_size} bytes)"));
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(CatalogerError::TooLarge(problems.join(", ")))
        }
    }

    /// Unsets the todo tag and sets the failed tag so operators can filter
    /// for triage, guarded by the same optimistic-concurrency check.
    pub async fn mark_failed(&self, document: &Document, task: &TaskHandle) -> Result<()> {
        let mut builder = PatchBuilder::new(document);
        builder.unset_tag(self.config.todo_tag_id);
        builder.set_tag(self.config.failed_tag_id);

        let patch = builder.build();
        if !patch.is_empty() {
            task.check_modified(self.client).await?;
            self.client.patch_document(document.id, &patch).await?;
        }
        Ok(())
    }

    /// Runs one attempt. A permanent failure, or any failure on the last
    /// allowed retry, is converted into a successful `mark_failed` patch
    /// rather than propagated further.
    pub async fn run(&self, document: &Document, meta: &DocumentMetadata, task: &TaskHandle, last_retry: bool) -> Result<()> {
        match self.apply_facts(document, meta, task).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_permanent() || last_retry => {
                tracing::warn!(document_id = document.id, error = %err, permanent = err.is_permanent(), last_retry, "marking document failed");
                self.mark_failed(document, task).await
            }
            Err(err) => Err(err),
        }
    }
}
