//! Interval timer with jittered backoff, external notification and
//! cancellation.
//!
//! The wait phase leans on a property `tokio::sync::Notify` already has:
//! a second `notify_one()` before the first permit is consumed is a no-op,
//! which is exactly the "bounded signal, extra sends dropped" behavior
//! wanted here, so no bespoke channel type is needed.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use cataloger_core::{CatalogerError, Result};

/// Options accepted by [`Poller::new`]. Validated synchronously on
/// construction so a misconfigured poller never starts its loop.
#[derive(Debug, Clone)]
pub struct PollerOptions {
    pub min_delay: Duration,
    /// `Duration::ZERO` means unbounded (no maximum clamp applied).
    pub max_delay: Duration,
    pub jitter: f64,
}

impl Default for PollerOptions {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_secs(1),
            max_delay: Duration::ZERO,
            jitter: 0.0,
        }
    }
}

impl PollerOptions {
    fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(CatalogerError::InvalidArgument(format!(
                "jitter must be in [0, 1], got {}",
                self.jitter
            )));
        }
        if self.max_delay != Duration::ZERO && self.max_delay < self.min_delay {
            return Err(CatalogerError::InvalidArgument(
                "max_delay must be zero (unbounded) or >= min_delay".to_string(),
            ));
        }
        Ok(())
    }

    fn clamp(&self, requested: Duration) -> Duration {
        let lower = requested.max(self.min_delay);
        if self.max_delay == Duration::ZERO {
            lower
        } else {
            lower.min(self.max_delay)
        }
    }

    fn jittered(&self, clamped: Duration) -> Duration {
        if self.jitter == 0.0 {
            return clamped;
        }
        let factor = rand::rng().random_range(-0.5..0.5) * self.jitter;
        let scaled = clamped.as_secs_f64() * (1.0 + factor);
        Duration::from_secs_f64(scaled.max(0.0))
    }
}

/// Repeatedly runs a poll function until the poller's [`CancellationToken`]
/// is cancelled.
#[derive(Debug)]
pub struct Poller {
    options: PollerOptions,
    notify: std::sync::Arc<Notify>,
    cancel: CancellationToken,
}

impl Poller {
    pub fn new(options: PollerOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            options,
            notify: std::sync::Arc::new(Notify::new()),
            cancel: CancellationToken::new(),
        })
    }

    /// A handle producers use to wake the poller immediately, e.g. right
    /// after posting a consumption event upstream. Sending when a signal is
    /// already pending is a no-op — coalescing is inherent to `Notify`.
    pub fn notify_handle(&self) -> std::sync::Arc<Notify> {
        self.notify.clone()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Runs `poll` repeatedly. `next_delay` is invoked once per iteration,
    /// after `poll` returns, to compute the requested delay before sleeping.
    ///
    /// `poll` receives a clone of the poller's cancellation token so a
    /// long-running poll (e.g. an in-flight HTTP call) can observe
    /// cancellation and wind down gracefully instead of being forcibly
    /// aborted.
    pub async fn run<PollF, PollFut, NextDelayF>(&self, mut poll: PollF, mut next_delay: NextDelayF)
    where
        PollF: FnMut(CancellationToken) -> PollFut,
        PollFut: Future<Output = Result<()>>,
        NextDelayF: FnMut() -> Duration,
    {
        loop {
            if self.cancel.is_cancelled() {
                return;
            }

            match poll(self.cancel.clone()).await {
                Ok(()) => {}
                Err(err) if err.is_cancelled() => return,
                Err(err) => tracing::error!(error = %err, "poll iteration failed"),
            }

            if self.cancel.is_cancelled() {
                return;
            }

            let requested = next_delay();
            let actual = self.options.jittered(self.options.clamp(requested));

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = self.notify.notified() => continue,
                _ = tokio::time::sleep(actual) => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn rejects_jitter_out_of_range() {
        let err = Poller::new(PollerOptions {
            jitter: 1.5,
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, CatalogerError::InvalidArgument(_)));

        let err = Poller::new(PollerOptions {
            jitter: -0.1,
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, CatalogerError::InvalidArgument(_)));
    }

    #[test]
    fn rejects_max_delay_below_min_delay() {
        let err = Poller::new(PollerOptions {
            min_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(1),
            jitter: 0.0,
        })
        .unwrap_err();
        assert!(matches!(err, CatalogerError::InvalidArgument(_)));
    }

    #[test]
    fn clamp_respects_min_and_max() {
        let opts = PollerOptions {
            min_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
            jitter: 0.0,
        };
        assert_eq!(opts.clamp(Duration::from_secs(1)), Duration::from_secs(2));
        assert_eq!(opts.clamp(Duration::from_secs(20)), Duration::from_secs(10));
        assert_eq!(opts.clamp(Duration::from_secs(5)), Duration::from_secs(5));
    }

    #[test]
    fn zero_max_delay_is_unbounded() {
        let opts = PollerOptions {
            min_delay: Duration::from_secs(1),
            max_delay: Duration::ZERO,
            jitter: 0.0,
        };
        assert_eq!(opts.clamp(Duration::from_secs(1_000_000)), Duration::from_secs(1_000_000));
    }

    #[test]
    fn jitter_bounds_property() {
        let opts = PollerOptions {
            min_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: 0.4,
        };
        let requested = Duration::from_secs(100);
        for _ in 0..2000 {
            let actual = opts.jittered(opts.clamp(requested));
            let lower = requested.as_secs_f64() * (1.0 - opts.jitter / 2.0);
            let upper = requested.as_secs_f64() * (1.0 + opts.jitter / 2.0);
            let got = actual.as_secs_f64();
            assert!(got >= lower - 1e-9 && got <= upper + 1e-9, "{got} not in [{lower}, {upper}]");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_the_loop() {
        let poller = Poller::new(PollerOptions {
            min_delay: Duration::from_millis(10),
            max_delay: Duration::ZERO,
            jitter: 0.0,
        })
        .unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        let cancel = poller.cancellation_token();
        let count_clone = count.clone();

        let handle = tokio::spawn(async move {
            poller
                .run(
                    move |_cancel| {
                        let count = count_clone.clone();
                        async move {
                            count.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        }
                    },
                    || Duration::from_millis(10),
                )
                .await;
        });

        tokio::time::advance(Duration::from_millis(25)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("poller should stop promptly after cancellation")
            .unwrap();

        assert!(count.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn notify_wakes_poller_immediately_and_coalesces() {
        let poller = Poller::new(PollerOptions {
            min_delay: Duration::from_secs(3600),
            max_delay: Duration::ZERO,
            jitter: 0.0,
        })
        .unwrap();

        let notify = poller.notify_handle();
        // Fire two notifications before the poller starts waiting: they must
        // coalesce into at most one extra immediate poll.
        notify.notify_one();
        notify.notify_one();

        let count = Arc::new(AtomicUsize::new(0));
        let cancel = poller.cancellation_token();
        let count_clone = count.clone();

        let handle = tokio::spawn(async move {
            poller
                .run(
                    move |_cancel| {
                        let count = count_clone.clone();
                        async move {
                            count.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        }
                    },
                    || Duration::from_secs(3600),
                )
                .await;
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();

        // First poll runs immediately at loop start; the single coalesced
        // notify permit buys exactly one more before the (very long) sleep
        // would otherwise fire.
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
