//! Extractor plugin contract and a startup-time registry of them.
//!
//! Plugins are stateless: given a document they either propose non-empty
//! [`Facts`] or decline. A registry enumerates them for `--list-facters`
//! and for the updater's default variant-scan order.

use async_trait::async_trait;

use cataloger_core::{Facts, Result};

/// A single content recognizer. Implementations live outside this crate in
/// practice; the registry only needs the name and the entry point.
#[async_trait]
pub trait Facter: Send + Sync {
    fn name(&self) -> &str;

    /// Inspects the downloaded document at `path` and proposes zero or more
    /// candidate [`Facts`]. An empty vec means "found nothing"; selecting
    /// among more than one candidate is the caller's job.
    async fn document_facts(&self, path: &std::path::Path, content: &str) -> Result<Vec<Facts>>;
}

#[derive(Default)]
pub struct FacterRegistry {
    facters: Vec<Box<dyn Facter>>,
}

impl FacterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, facter: Box<dyn Facter>) {
        self.facters.push(facter);
    }

    pub fn names(&self) -> Vec<&str> {
        self.facters.iter().map(|f| f.name()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn Facter> {
        self.facters.iter().map(|f| f.as_ref())
    }
}

/// The registry is itself a [`Facter`]: it fans a document out to every
/// registered plugin and returns every non-empty candidate it gets back,
/// letting the same best-of-many selection used for a single plugin's
/// candidates decide whether the overall result is usable.
#[async_trait]
impl Facter for FacterRegistry {
    fn name(&self) -> &str {
        "registry"
    }

    async fn document_facts(&self, path: &std::path::Path, content: &str) -> Result<Vec<Facts>> {
        let mut candidates = Vec::new();
        for facter in self.iter() {
            match facter.document_facts(path, content).await {
                Ok(found) => candidates.extend(found.into_iter().map(|f| f.with_reporter_default(facter.name()))),
                Err(err) => tracing::debug!(facter = facter.name(), error = %err, "facter failed, skipping"),
            }
        }
        Ok(candidates)
    }
}
