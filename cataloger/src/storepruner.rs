//! Independent poller that deletes task records whose `record_updated` is
//! older than a configurable quiet period.

use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use cataloger_core::Result;

use crate::poller::{Poller, PollerOptions};
use crate::task::TaskStore;

pub struct StorePrunerConfig {
    pub poll_interval: Duration,
    pub max_record_age: Duration,
}

impl Default for StorePrunerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3600),
            max_record_age: Duration::from_secs(24 * 3600),
        }
    }
}

pub struct StorePruner {
    store: Arc<dyn TaskStore>,
    config: StorePrunerConfig,
    poller: Poller,
}

impl StorePruner {
    pub fn new(store: Arc<dyn TaskStore>, config: StorePrunerConfig) -> Result<Self> {
        let poller = Poller::new(PollerOptions {
            min_delay: config.poll_interval,
            max_delay: config.poll_interval,
            jitter: 0.0,
        })?;
        Ok(Self { store, config, poller })
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.poller.cancellation_token()
    }

    pub fn cancel(&self) {
        self.poller.cancel();
    }

    async fn prune_once(&self) -> Result<()> {
        let cutoff = OffsetDateTime::now_utc() - time::Duration::try_from(self.config.max_record_age).unwrap_or(time::Duration::ZERO);
        let deleted = self.store.prune_older_than(cutoff).await?;
        if deleted > 0 {
            tracing::info!(deleted, "pruned stale task records");
        }
        Ok(())
    }

    pub async fn run(self: Arc<Self>) {
        let poll_target = self.clone();
        let delay_target = self.clone();
        self.poller
            .run(move |_cancel| { let this = poll_target.clone(); async move { this.prune_once().await } }, move || delay_target.config.poll_interval)
            .await;
    }
}
