//! Liveness probe for the active subscription.
//!
//! A subscription on a half-dead TCP connection can sit silently forever,
//! so while subscribed the manager periodically opens a short-lived client
//! and publishes a timestamped heartbeat on the active channel. This is a
//! probe, not a receiver: only the publish result is checked, never whether
//! the heartbeat came back through the subscription.

use std::future::Future;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};

use crate::scheduler::TimerSlot;
use crate::transport::{publish_once, Endpoint, Transport};

/// Heartbeat message body for `at`.
#[must_use]
pub fn heartbeat_payload(at: DateTime<Utc>) -> String {
    format!("heartbeat {}", at.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// Publish one heartbeat on `channel` through a fresh client.
///
/// # Errors
///
/// Returns an error if the broker cannot be reached or refuses the publish.
pub async fn probe(transport: &dyn Transport, endpoint: &Endpoint, channel: &str) -> Result<()> {
    publish_once(transport, endpoint, channel, &heartbeat_payload(Utc::now()))
        .await
        .with_context(|| format!("Liveness probe on {channel} via {endpoint} failed"))
}

/// Periodic probe runner with a single timer slot.
#[derive(Debug)]
pub struct LivenessChecker {
    slot: TimerSlot,
    transport: Arc<dyn Transport>,
    start_delay: Duration,
    interval: Duration,
}

impl LivenessChecker {
    /// Create a stopped checker.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, start_delay: Duration, interval: Duration) -> Self {
        Self {
            slot: TimerSlot::new("liveness"),
            transport,
            start_delay,
            interval,
        }
    }

    /// Start probing `channel` after the start delay, replacing any running
    /// checker.
    ///
    /// On the first failed probe the checker stops itself and awaits
    /// `on_failure` with the probe error.
    pub fn start<F, Fut>(&self, endpoint: Endpoint, channel: String, on_failure: F)
    where
        F: Fn(anyhow::Error) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        log::debug!(
            "[Liveness] Probing {} every {:?} (first in {:?})",
            channel,
            self.interval,
            self.start_delay
        );
        let transport = Arc::clone(&self.transport);
        let on_failure = Arc::new(on_failure);
        self.slot
            .schedule_repeating(self.start_delay, self.interval, move || {
                let transport = Arc::clone(&transport);
                let endpoint = endpoint.clone();
                let channel = channel.clone();
                let on_failure = Arc::clone(&on_failure);
                async move {
                    match probe(transport.as_ref(), &endpoint, &channel).await {
                        Ok(()) => {
                            log::trace!("[Liveness] {} ok", channel);
                            ControlFlow::Continue(())
                        }
                        Err(e) => {
                            log::warn!("[Liveness] {:#}", e);
                            on_failure(e).await;
                            ControlFlow::Break(())
                        }
                    }
                }
            });
    }

    /// Stop probing. Returns `true` if a checker was running.
    pub fn stop(&self) -> bool {
        self.slot.cancel()
    }

    /// Returns `true` while a checker is scheduled or running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.slot.is_pending()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryBroker;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_heartbeat_payload_format() {
        let at = DateTime::parse_from_rfc3339("2026-01-02T03:04:05.678Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(heartbeat_payload(at), "heartbeat 2026-01-02T03:04:05.678Z");
    }

    #[tokio::test]
    async fn test_probe_publishes_heartbeat() {
        let broker = MemoryBroker::new();
        probe(&broker, &Endpoint::new("h", 1), "c1").await.unwrap();

        let published = broker.published_to("c1");
        assert_eq!(published.len(), 1);
        assert!(published[0].starts_with("heartbeat "));
    }

    #[tokio::test(start_paused = true)]
    async fn test_checker_probes_on_schedule() {
        let broker = MemoryBroker::new();
        let checker = LivenessChecker::new(
            Arc::new(broker.clone()),
            Duration::from_secs(1),
            Duration::from_secs(10),
        );
        checker.start(Endpoint::new("h", 1), "c1".into(), |_| async {});

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(broker.published_to("c1").is_empty());

        // Probes at 1s and 11s.
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(broker.published_to("c1").len(), 2);

        assert!(checker.stop());
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(broker.published_to("c1").len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_checker_stops_after_first_failure() {
        let broker = MemoryBroker::new();
        broker.set_reachable(false);
        let failures = Arc::new(AtomicUsize::new(0));

        let checker = LivenessChecker::new(
            Arc::new(broker.clone()),
            Duration::from_secs(1),
            Duration::from_secs(10),
        );
        let f = Arc::clone(&failures);
        checker.start(Endpoint::new("h", 1), "c1".into(), move |_| {
            let f = Arc::clone(&f);
            async move {
                f.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(failures.load(Ordering::SeqCst), 1);
        assert!(!checker.is_running());
    }
}
