//! Two-layer fact extraction: a per-variant download-then-recognize step,
//! and a variant-fallback layer that tries archived before original.

use std::time::Duration;

use cataloger_core::{CatalogerError, Facts, ObjectId, Result, Variant};

use crate::client::DocumentClient;
use crate::facter::Facter;

/// Downloads one variant to a scratch directory under `base_dir`, hands it
/// to `facter`, and always cleans the scratch directory up afterward
/// regardless of outcome.
pub async fn extract_variant_facts(client: &dyn DocumentClient, facter: &dyn Facter, document_id: ObjectId, variant: Variant, base_dir: &std::path::Path, timeout: Duration) -> Result<Option<Facts>> {
    let scratch = tempfile::Builder::new()
        .prefix("cataloger-extract-")
        .tempdir_in(base_dir)
        .map_err(CatalogerError::Io)?;

    let result = tokio::time::timeout(timeout, run_extraction(client, facter, document_id, variant, scratch.path())).await;

    // `TempDir::drop` already removes the directory; this just makes the
    // intent explicit and surfaces cleanup failures instead of ignoring them.
    let cleanup = scratch.close();

    let candidates = match result {
        Ok(inner) => inner?,
        Err(_) => return Err(CatalogerError::Cancelled),
    };
    cleanup.map_err(CatalogerError::Io)?;

    match candidates.len() {
        0 => Ok(None),
        1 => Ok(candidates.into_iter().next()),
        n => Err(CatalogerError::Other(format!("extractor {} returned {n} ambiguous candidates", facter.name()))),
    }
}

async fn run_extraction(client: &dyn DocumentClient, facter: &dyn Facter, document_id: ObjectId, variant: Variant, scratch_dir: &std::path::Path) -> Result<Vec<Facts>> {
    let dest = scratch_dir.join("document");
    client.download_document(document_id, variant, &dest).await?;
    let content = tokio::fs::read_to_string(&dest).await.unwrap_or_default();
    facter.document_facts(&dest, &content).await
}

/// Tries each variant in order; the first to produce non-empty facts wins.
/// An earlier variant's error is logged at debug level and swallowed once a
/// later variant succeeds; if every variant fails, the last error wins.
pub async fn extract_facts(client: &dyn DocumentClient, facter: &dyn Facter, document_id: ObjectId, variants: &[Variant], base_dir: &std::path::Path, timeout: Duration) -> Result<Option<Facts>> {
    let mut last_err: Option<CatalogerError> = None;

    for &variant in variants {
        match extract_variant_facts(client, facter, document_id, variant, base_dir, timeout).await {
            Ok(Some(facts)) if !facts.is_empty() => {
                if let Some(err) = last_err {
                    tracing::debug!(variant = %variant, error = %err, "earlier variant failed, later variant recovered");
                }
                return Ok(Some(facts));
            }
            Ok(_) => continue,
            Err(err) => {
                tracing::debug!(variant = %variant, error = %err, "variant extraction failed, trying next");
                last_err = Some(err);
            }
        }
    }

    match last_err {
        Some(err) => Err(err),
        None => Ok(None),
    }
}
