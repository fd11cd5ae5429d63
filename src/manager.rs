//! Connection manager: the subscription lifecycle state machine.
//!
//! Owns the [`ConnectionRegistry`], the pending target, and three timer
//! slots (debounce, reconnect, liveness). Decides when to open a
//! connection, detects loss, tears down, and retries.
//!
//! # State Machine
//!
//! ```text
//!            attempt_connect            on_subscribe
//!   Idle ─────────────────► Connecting ─────────────► Subscribed
//!    ▲                          │                         │
//!    │ disconnect               │ connect/subscribe       │ subscription ended
//!    │                          │ failed                  │ or liveness failed
//!    │                          ▼                         ▼
//!    └──────────────────── Reconnecting ◄─────────────────┘
//!                               │
//!                               │ backoff elapsed → attempt_connect
//!                               ▼
//!                           Connecting
//! ```
//!
//! # Serialization
//!
//! The registry sits behind one async mutex. `attempt_connect` holds it
//! across the transport connect, so an in-flight connect always completes
//! before a concurrent teardown can clear the registry. Callbacks from
//! subscription and liveness tasks carry their record id and are ignored
//! once that record is gone.
//!
//! # Retry
//!
//! Both failure paths (subscription ended, liveness probe failed) share one
//! reconnect slot with a fixed backoff. Scheduling a retry replaces any
//! pending one, so failures never stack duplicate attempts.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use async_trait::async_trait;

use crate::config::Timings;
use crate::constants::{
    STATUS_FAIL_TO_CONNECT, STATUS_FAIL_TO_RECONNECT, STATUS_FAIL_TO_SEND,
    STATUS_TRY_TO_RECONNECT,
};
use crate::events::{Event, Notifier};
use crate::liveness::LivenessChecker;
use crate::registry::{ConnectionRegistry, ConnectionState};
use crate::scheduler::TimerSlot;
use crate::transport::{
    publish_once, Endpoint, SubscriptionHandler, Target, Transport, TransportClient,
};

/// Handle to the connection manager. Clones share the same state.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("timings", &self.inner.timings)
            .field("pending", &self.inner.pending_target())
            .finish_non_exhaustive()
    }
}

struct Inner {
    timings: Timings,
    default_endpoint: Endpoint,
    transport: Arc<dyn Transport>,
    notifier: Arc<dyn Notifier>,
    registry: tokio::sync::Mutex<ConnectionRegistry>,
    pending: Mutex<Option<Target>>,
    debounce: TimerSlot,
    reconnect: TimerSlot,
    liveness: LivenessChecker,
    /// Set by `shutdown`; no connect attempt starts afterwards.
    shutting_down: AtomicBool,
}

impl ConnectionManager {
    /// Create an idle manager.
    ///
    /// `default_endpoint` is used for publishes until the first CONNECT
    /// sets a pending target.
    #[must_use]
    pub fn new(
        timings: Timings,
        default_endpoint: Endpoint,
        transport: Arc<dyn Transport>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let liveness = LivenessChecker::new(
            Arc::clone(&transport),
            timings.liveness_start_delay,
            timings.liveness_interval,
        );
        Self {
            inner: Arc::new(Inner {
                timings,
                default_endpoint,
                transport,
                notifier,
                registry: tokio::sync::Mutex::new(ConnectionRegistry::new()),
                pending: Mutex::new(None),
                debounce: TimerSlot::new("debounce"),
                reconnect: TimerSlot::new("reconnect"),
                liveness,
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    /// Record `target` as pending and connect to it once the debounce
    /// window elapses without a newer CONNECT or DISCONNECT.
    ///
    /// Must be called from within a tokio runtime.
    pub fn request_connect(&self, target: Target) {
        log::info!("[Manager] Connect requested: {}", target);
        self.inner.set_pending(target);
        self.inner.schedule_debounced_connect();
    }

    /// Disconnect once the debounce window elapses without a newer CONNECT
    /// or DISCONNECT.
    ///
    /// Must be called from within a tokio runtime.
    pub fn request_disconnect(&self) {
        log::info!("[Manager] Disconnect requested");
        self.inner.schedule_debounced_disconnect();
    }

    /// Publish `payload` on `channel` through a short-lived client against
    /// the current endpoint. Independent of subscription state.
    ///
    /// # Errors
    ///
    /// Returns the transport error. A `"fail to send"` event has already
    /// been emitted by then; the failure never affects the subscription.
    pub async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let endpoint = self.inner.current_endpoint();
        self.inner.publish_to(&endpoint, channel, payload).await
    }

    /// Connect to the pending target now, bypassing the debounce.
    pub async fn attempt_connect(&self) {
        self.inner.attempt_connect().await;
    }

    /// Close the active connection. With `reconnect`, connect to the pending
    /// target immediately afterwards.
    pub async fn teardown(&self, reconnect: bool) {
        self.inner.teardown(reconnect).await;
    }

    /// Cancel every timer and close the active connection.
    ///
    /// Terminal: connect attempts already waiting on the registry when this
    /// is called, and any requested later, are dropped.
    pub async fn shutdown(&self) {
        log::info!("[Manager] Shutting down");
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        self.inner.debounce.cancel();
        self.inner.reconnect.cancel();
        self.inner.teardown(false).await;
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> ConnectionState {
        self.inner.registry.lock().await.state()
    }

    /// Channel of the active record, if any.
    pub async fn active_channel(&self) -> Option<String> {
        self.inner.registry.lock().await.channel().map(ToString::to_string)
    }

    /// Number of records in the registry (0 or 1).
    pub async fn record_count(&self) -> usize {
        self.inner.registry.lock().await.len()
    }

    /// Whether the connecting flag is set.
    pub async fn is_connecting(&self) -> bool {
        self.inner.registry.lock().await.is_connecting()
    }

    /// Most recently requested target.
    #[must_use]
    pub fn pending_target(&self) -> Option<Target> {
        self.inner.pending_target()
    }

    /// Whether a failure-triggered reconnect is waiting to fire.
    #[must_use]
    pub fn is_reconnect_scheduled(&self) -> bool {
        self.inner.reconnect.is_pending()
    }

    /// Whether the liveness checker is running.
    #[must_use]
    pub fn is_liveness_running(&self) -> bool {
        self.inner.liveness.is_running()
    }
}

impl Inner {
    fn pending(&self) -> MutexGuard<'_, Option<Target>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pending_target(&self) -> Option<Target> {
        self.pending().clone()
    }

    fn set_pending(&self, target: Target) {
        *self.pending() = Some(target);
    }

    fn current_endpoint(&self) -> Endpoint {
        self.pending()
            .as_ref()
            .map_or_else(|| self.default_endpoint.clone(), |t| t.endpoint.clone())
    }

    fn notify(&self, event: Event) {
        self.notifier.notify(event);
    }

    // ========================================================================
    // Timers
    //
    // Everything that spawns a future calling back into `Inner` lives in a
    // plain fn so the async fns never have to prove their own `Send`.
    // ========================================================================

    fn schedule_debounced_connect(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        self.debounce.schedule(self.timings.debounce, async move {
            inner.attempt_connect().await;
        });
    }

    fn schedule_debounced_disconnect(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        self.debounce.schedule(self.timings.debounce, async move {
            inner.disconnect().await;
        });
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        log::info!(
            "[Manager] Reconnect scheduled in {:?}",
            self.timings.reconnect_backoff
        );
        let inner = Arc::clone(self);
        self.reconnect
            .schedule(self.timings.reconnect_backoff, async move {
                log::info!("[Manager] Reconnect backoff elapsed");
                inner.attempt_connect().await;
            });
    }

    fn start_liveness(self: &Arc<Self>, id: u64, target: &Target) {
        let inner = Arc::clone(self);
        self.liveness.start(
            target.endpoint.clone(),
            target.channel.clone(),
            move |error| {
                let inner = Arc::clone(&inner);
                async move { inner.on_liveness_failed(id, &error).await }
            },
        );
    }

    fn spawn_subscription(
        self: &Arc<Self>,
        id: u64,
        client: Arc<dyn TransportClient>,
        target: Target,
    ) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let handler = RecordHandler {
                inner: Arc::clone(&inner),
                id,
                target,
            };
            let result = client.subscribe(&handler.target.channel, &handler).await;
            inner.on_subscription_ended(id, result).await;
        });
    }

    fn spawn_publish(self: &Arc<Self>, endpoint: Endpoint, channel: String, payload: String) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            // Failure already surfaced as an event.
            let _ = inner.publish_to(&endpoint, &channel, &payload).await;
        });
    }

    // ========================================================================
    // Operations
    // ========================================================================

    async fn publish_to(&self, endpoint: &Endpoint, channel: &str, payload: &str) -> Result<()> {
        let result = publish_once(self.transport.as_ref(), endpoint, channel, payload).await;
        if let Err(e) = &result {
            log::warn!("[Manager] Publish to {} via {} failed: {:#}", channel, endpoint, e);
            self.notify(Event::unknown(STATUS_FAIL_TO_SEND));
        }
        result
    }

    async fn attempt_connect(self: &Arc<Self>) {
        let mut registry = self.registry.lock().await;
        self.attempt_connect_locked(&mut registry).await;
    }

    async fn attempt_connect_locked(self: &Arc<Self>, registry: &mut ConnectionRegistry) {
        if self.shutting_down.load(Ordering::SeqCst) {
            log::debug!("[Manager] Connect skipped, shutting down");
            return;
        }

        let Some(target) = self.pending_target() else {
            log::warn!("[Manager] Connect attempted with no target");
            return;
        };

        // Channel switch: tear down and continue with a clean registry.
        if let Some(current) = registry.channel() {
            if current != target.channel {
                log::info!(
                    "[Manager] Switching channel {} -> {}",
                    current,
                    target.channel
                );
                self.teardown_locked(registry);
            }
        }

        if !registry.try_begin_connect() {
            log::info!("[Manager] Already connected: {}", target);
            self.spawn_publish(
                target.endpoint.clone(),
                target.channel.clone(),
                format!("already connected. {target}"),
            );
            return;
        }

        if !registry.is_empty() {
            log::error!(
                "[Manager] Registry holds {} record(s) at connect time; a previous teardown left state behind",
                registry.len()
            );
        }

        // This attempt supersedes any retry still waiting.
        self.reconnect.cancel();

        log::info!("[Manager] Connecting to {}", target);
        let client = match self.transport.connect(&target.endpoint).await {
            Ok(client) => client,
            Err(e) => {
                log::warn!("[Manager] Failed to open {}: {:#}", target.endpoint, e);
                self.fail_and_schedule_locked(registry, STATUS_FAIL_TO_CONNECT);
                return;
            }
        };

        let (id, displaced) = registry.insert(
            Arc::clone(&client),
            target.channel.clone(),
            target.endpoint.clone(),
        );
        if let Some(old) = displaced {
            old.client.close();
            self.notify(Event::unsubscribed(&old.channel));
        }
        registry.set_state(ConnectionState::Connecting);
        self.spawn_subscription(id, client, target);
    }

    async fn teardown(self: &Arc<Self>, reconnect: bool) {
        let mut registry = self.registry.lock().await;
        self.teardown_locked(&mut registry);
        if reconnect {
            self.attempt_connect_locked(&mut registry).await;
        }
    }

    async fn disconnect(self: &Arc<Self>) {
        // An explicit disconnect also ends any retry cycle.
        self.reconnect.cancel();
        self.teardown(false).await;
    }

    fn teardown_locked(&self, registry: &mut ConnectionRegistry) {
        self.liveness.stop();
        registry.clear_connecting();
        if let Some(mut record) = registry.take() {
            record.client.close();
            record.connected = false;
            log::info!(
                "[Manager] Closed {} ({})",
                record.channel,
                record.endpoint
            );
            self.notify(Event::unsubscribed(&record.channel));
        }
        registry.set_state(ConnectionState::Idle);
    }

    fn fail_and_schedule_locked(self: &Arc<Self>, registry: &mut ConnectionRegistry, status: &str) {
        self.notify(Event::unknown(status));
        self.notify(Event::unknown(STATUS_TRY_TO_RECONNECT));
        self.teardown_locked(registry);
        registry.set_state(ConnectionState::Reconnecting);
        self.schedule_reconnect();
    }

    // ========================================================================
    // Callbacks
    // ========================================================================

    async fn on_subscribed(self: &Arc<Self>, id: u64, target: &Target) {
        let mut registry = self.registry.lock().await;
        if !registry.mark_connected(id) {
            log::debug!("[Manager] Ignoring subscribe confirmation for stale record {}", id);
            return;
        }
        registry.set_state(ConnectionState::Subscribed);
        self.notify(Event::subscribed(&target.channel));
        self.spawn_publish(
            target.endpoint.clone(),
            target.channel.clone(),
            format!("successfully connected. {target}"),
        );
        self.start_liveness(id, target);
    }

    async fn on_subscription_ended(self: &Arc<Self>, id: u64, result: Result<()>) {
        let mut registry = self.registry.lock().await;
        if !registry.is_current(id) {
            log::debug!("[Manager] Subscription for record {} ended after teardown", id);
            return;
        }
        match result {
            Ok(()) => log::warn!("[Manager] Subscription for record {} ended by broker", id),
            Err(e) => log::warn!("[Manager] Subscription for record {} lost: {:#}", id, e),
        }
        self.fail_and_schedule_locked(&mut registry, STATUS_FAIL_TO_CONNECT);
    }

    async fn on_liveness_failed(self: &Arc<Self>, id: u64, error: &anyhow::Error) {
        let mut registry = self.registry.lock().await;
        if !registry.is_current(id) {
            log::debug!("[Manager] Liveness failure for stale record {}: {:#}", id, error);
            return;
        }
        self.fail_and_schedule_locked(&mut registry, STATUS_FAIL_TO_RECONNECT);
    }
}

/// Subscription callbacks bound to one registry record.
struct RecordHandler {
    inner: Arc<Inner>,
    id: u64,
    target: Target,
}

#[async_trait]
impl SubscriptionHandler for RecordHandler {
    async fn on_subscribe(&self, _channel: &str) {
        self.inner.on_subscribed(self.id, &self.target).await;
    }

    async fn on_message(&self, channel: &str, payload: String) {
        self.inner.notify(Event::new(channel, payload));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ChannelNotifier;
    use crate::transport::MemoryBroker;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn setup() -> (ConnectionManager, MemoryBroker, UnboundedReceiver<Event>) {
        let broker = MemoryBroker::new();
        let (notifier, rx) = ChannelNotifier::channel();
        let manager = ConnectionManager::new(
            Timings::default(),
            Endpoint::new("h", 6379),
            Arc::new(broker.clone()),
            Arc::new(notifier),
        );
        (manager, broker, rx)
    }

    /// Next event that is not a liveness heartbeat.
    async fn next_event(rx: &mut UnboundedReceiver<Event>) -> Event {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(120), rx.recv())
                .await
                .expect("timed out waiting for event")
                .expect("notifier dropped");
            if !event.data.starts_with("heartbeat ") {
                return event;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_connect_subscribes_and_confirms() {
        let (manager, broker, mut rx) = setup();
        manager.request_connect(Target::new("h", 6379, "c1"));

        assert_eq!(next_event(&mut rx).await, Event::new("c1", "c1 subscribed"));
        assert_eq!(
            next_event(&mut rx).await,
            Event::new("c1", "successfully connected. c1 - h:6379")
        );
        assert_eq!(manager.state().await, ConnectionState::Subscribed);
        assert_eq!(manager.record_count().await, 1);
        assert!(manager.is_connecting().await);
        assert_eq!(broker.subscribe_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_schedules_retry() {
        let (manager, broker, mut rx) = setup();
        broker.set_reachable(false);
        manager.request_connect(Target::new("h", 6379, "c1"));

        assert_eq!(next_event(&mut rx).await, Event::unknown("fail to connect"));
        assert_eq!(next_event(&mut rx).await, Event::unknown("try to reconnect"));
        assert_eq!(manager.state().await, ConnectionState::Reconnecting);
        assert!(manager.is_reconnect_scheduled());
        assert!(!manager.is_connecting().await);
        assert_eq!(manager.record_count().await, 0);

        broker.set_reachable(true);
        assert_eq!(next_event(&mut rx).await, Event::new("c1", "c1 subscribed"));
        assert!(!manager.is_reconnect_scheduled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_continue_without_limit() {
        let (manager, broker, mut rx) = setup();
        broker.set_reachable(false);
        manager.request_connect(Target::new("h", 6379, "c1"));

        for _ in 0..5 {
            assert_eq!(next_event(&mut rx).await, Event::unknown("fail to connect"));
            assert_eq!(next_event(&mut rx).await, Event::unknown("try to reconnect"));
        }
        assert!(manager.is_reconnect_scheduled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscription_loss_tears_down_then_reconnects() {
        let (manager, broker, mut rx) = setup();
        manager.request_connect(Target::new("h", 6379, "c1"));
        next_event(&mut rx).await;
        next_event(&mut rx).await;

        assert_eq!(broker.sever_subscriptions(), 1);
        assert_eq!(next_event(&mut rx).await, Event::unknown("fail to connect"));
        assert_eq!(next_event(&mut rx).await, Event::unknown("try to reconnect"));
        assert_eq!(next_event(&mut rx).await, Event::new("c1", "c1 unsubscribed"));
        assert!(!manager.is_liveness_running());

        let started = tokio::time::Instant::now();
        assert_eq!(next_event(&mut rx).await, Event::new("c1", "c1 subscribed"));
        assert!(started.elapsed() >= Duration::from_secs(30));
        assert_eq!(broker.subscribe_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_teardown_does_not_trigger_retry() {
        let (manager, broker, mut rx) = setup();
        manager.request_connect(Target::new("h", 6379, "c1"));
        next_event(&mut rx).await;
        next_event(&mut rx).await;

        manager.teardown(false).await;
        assert_eq!(next_event(&mut rx).await, Event::new("c1", "c1 unsubscribed"));

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(manager.state().await, ConnectionState::Idle);
        assert!(!manager.is_reconnect_scheduled());
        assert_eq!(broker.active_subscribers("c1"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_failure_emits_event_and_keeps_subscription() {
        let (manager, broker, mut rx) = setup();
        broker.set_reachable(false);
        assert!(manager.publish("c9", "x").await.is_err());
        assert_eq!(next_event(&mut rx).await, Event::unknown("fail to send"));
        assert_eq!(manager.state().await, ConnectionState::Idle);
        assert!(!manager.is_reconnect_scheduled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_pending_debounce() {
        let (manager, broker, mut rx) = setup();
        manager.request_connect(Target::new("h", 6379, "c1"));
        manager.shutdown().await;

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(broker.connections_opened(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drops_connect_waiting_on_registry() {
        let (manager, broker, mut rx) = setup();
        broker.set_connect_delay(Duration::from_secs(3));
        manager.request_connect(Target::new("h", 6379, "c1"));
        // Debounce fired; the first connect now holds the registry.
        tokio::time::sleep(Duration::from_millis(600)).await;

        let waiting = manager.clone();
        let reconnect = tokio::spawn(async move { waiting.teardown(true).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        manager.shutdown().await;
        reconnect.await.unwrap();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(broker.connections_opened(), 1);
        assert_eq!(manager.record_count().await, 0);
        assert!(!manager.is_connecting().await);
        assert_eq!(next_event(&mut rx).await, Event::unsubscribed("c1"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_connect_after_shutdown() {
        let (manager, broker, _rx) = setup();
        manager.shutdown().await;
        manager.request_connect(Target::new("h", 6379, "c1"));
        manager.attempt_connect().await;

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(broker.connections_opened(), 0);
        assert_eq!(manager.state().await, ConnectionState::Idle);
    }
}
