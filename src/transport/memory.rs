//! In-process pub/sub broker.
//!
//! [`MemoryBroker`] implements [`Transport`] without any network I/O, so the
//! connection state machine can be driven deterministically (including under
//! `tokio::time::pause`). It exposes fault injection for the two failure
//! modes the manager cares about:
//!
//! - [`MemoryBroker::set_reachable`] - connects and publishes start failing
//! - [`MemoryBroker::sever_subscriptions`] - live subscriptions end with an error
//!
//! [`MemoryBroker::set_connect_delay`] adds latency to every connect, to hold
//! an attempt in flight while other commands arrive.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{Endpoint, SubscriptionHandler, Transport, TransportClient};

#[derive(Debug)]
enum Delivery {
    Message(String),
    Sever,
}

#[derive(Debug)]
struct Subscriber {
    channel: String,
    tx: mpsc::UnboundedSender<Delivery>,
}

#[derive(Debug)]
struct BrokerState {
    reachable: bool,
    connect_delay: Duration,
    subscribers: HashMap<u64, Subscriber>,
    next_subscriber: u64,
    connections_opened: usize,
    subscribe_calls: usize,
    published: Vec<(String, String)>,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self {
            reachable: true,
            connect_delay: Duration::ZERO,
            subscribers: HashMap::new(),
            next_subscriber: 0,
            connections_opened: 0,
            subscribe_calls: 0,
            published: Vec::new(),
        }
    }
}

/// Shared in-process broker. Clones refer to the same broker.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    /// Create an empty, reachable broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make connects, subscribes and publishes succeed or fail.
    pub fn set_reachable(&self, reachable: bool) {
        self.state().reachable = reachable;
    }

    /// Delay every subsequent connect by `delay`.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.state().connect_delay = delay;
    }

    /// End every live subscription with a connection error.
    ///
    /// Returns the number of subscriptions severed.
    pub fn sever_subscriptions(&self) -> usize {
        let mut state = self.state();
        let count = state.subscribers.len();
        for (_, sub) in state.subscribers.drain() {
            let _ = sub.tx.send(Delivery::Sever);
        }
        count
    }

    /// Total clients opened, including short-lived publish clients.
    #[must_use]
    pub fn connections_opened(&self) -> usize {
        self.state().connections_opened
    }

    /// Total `subscribe` calls that reached the broker.
    #[must_use]
    pub fn subscribe_calls(&self) -> usize {
        self.state().subscribe_calls
    }

    /// Live subscriptions on `channel`.
    #[must_use]
    pub fn active_subscribers(&self, channel: &str) -> usize {
        self.state()
            .subscribers
            .values()
            .filter(|s| s.channel == channel)
            .count()
    }

    /// Every accepted publish as `(channel, payload)`, in order.
    #[must_use]
    pub fn published(&self) -> Vec<(String, String)> {
        self.state().published.clone()
    }

    /// Payloads accepted on `channel`, in order.
    #[must_use]
    pub fn published_to(&self, channel: &str) -> Vec<String> {
        self.state()
            .published
            .iter()
            .filter(|(c, _)| c == channel)
            .map(|(_, p)| p.clone())
            .collect()
    }

    fn remove_subscriber(&self, id: u64) {
        self.state().subscribers.remove(&id);
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn TransportClient>> {
        let delay = self.state().connect_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state();
        if !state.reachable {
            anyhow::bail!("Connection refused: {endpoint}");
        }
        state.connections_opened += 1;
        Ok(Arc::new(MemoryClient {
            broker: self.clone(),
            endpoint: endpoint.clone(),
            closed: CancellationToken::new(),
        }))
    }
}

/// Client handed out by [`MemoryBroker`].
#[derive(Debug)]
pub struct MemoryClient {
    broker: MemoryBroker,
    endpoint: Endpoint,
    closed: CancellationToken,
}

/// Removes the subscriber entry however the subscribe call exits.
struct SubscriberGuard<'a> {
    broker: &'a MemoryBroker,
    id: u64,
}

impl Drop for SubscriberGuard<'_> {
    fn drop(&mut self) {
        self.broker.remove_subscriber(self.id);
    }
}

#[async_trait]
impl TransportClient for MemoryClient {
    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        if self.closed.is_cancelled() {
            anyhow::bail!("Client for {} is closed", self.endpoint);
        }
        let mut state = self.broker.state();
        if !state.reachable {
            anyhow::bail!("Connection reset: {}", self.endpoint);
        }
        state
            .published
            .push((channel.to_string(), payload.to_string()));
        for sub in state.subscribers.values().filter(|s| s.channel == channel) {
            let _ = sub.tx.send(Delivery::Message(payload.to_string()));
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str, handler: &dyn SubscriptionHandler) -> Result<()> {
        let (id, mut rx) = {
            let mut state = self.broker.state();
            if !state.reachable {
                anyhow::bail!("Connection reset: {}", self.endpoint);
            }
            state.subscribe_calls += 1;
            let id = state.next_subscriber;
            state.next_subscriber += 1;
            let (tx, rx) = mpsc::unbounded_channel();
            state.subscribers.insert(
                id,
                Subscriber {
                    channel: channel.to_string(),
                    tx,
                },
            );
            (id, rx)
        };
        let _guard = SubscriberGuard {
            broker: &self.broker,
            id,
        };

        handler.on_subscribe(channel).await;

        loop {
            tokio::select! {
                biased;
                () = self.closed.cancelled() => return Ok(()),
                delivery = rx.recv() => match delivery {
                    Some(Delivery::Message(payload)) => handler.on_message(channel, payload).await,
                    Some(Delivery::Sever) | None => {
                        anyhow::bail!("Subscription to {channel} on {} severed", self.endpoint)
                    }
                },
            }
        }
    }

    fn close(&self) {
        self.closed.cancel();
    }
}
