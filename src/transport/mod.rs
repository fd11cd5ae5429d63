//! Pub/sub transport abstraction.
//!
//! The connection manager is written against the [`Transport`] and
//! [`TransportClient`] traits so the state machine does not depend on a
//! concrete broker client.
//!
//! # Architecture
//!
//! ```text
//! Transport (trait)                    TransportClient (trait)
//!     │  connect(endpoint) ──────────►     │  publish(channel, payload)
//!     │                                    │  subscribe(channel, handler)  (blocks)
//!     ├── RedisTransport                   │  close()
//!     └── MemoryBroker (in-process)        │
//! ```
//!
//! `subscribe` holds its task until the subscription ends. An `Ok` return
//! means the client was closed or the broker ended the subscription
//! cleanly; an `Err` means the connection was lost. Either way, the return
//! is the only signal the manager uses to detect loss.

pub mod memory;
pub mod redis;

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

pub use memory::MemoryBroker;
pub use self::redis::RedisTransport;

/// Broker address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// Hostname or IP address.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl Endpoint {
    /// Create an endpoint.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A requested subscription: where to connect and which channel to follow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Broker address.
    pub endpoint: Endpoint,
    /// Channel to subscribe to.
    pub channel: String,
}

impl Target {
    /// Create a target.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16, channel: impl Into<String>) -> Self {
        Self {
            endpoint: Endpoint::new(host, port),
            channel: channel.into(),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.channel, self.endpoint)
    }
}

/// Callbacks invoked by [`TransportClient::subscribe`].
#[async_trait]
pub trait SubscriptionHandler: Send + Sync {
    /// The broker confirmed the subscription.
    async fn on_subscribe(&self, channel: &str);

    /// A message arrived on the subscribed channel.
    async fn on_message(&self, channel: &str, payload: String);
}

/// An open connection to a broker.
#[async_trait]
pub trait TransportClient: Send + Sync + fmt::Debug {
    /// Publish `payload` on `channel`.
    ///
    /// # Errors
    ///
    /// Returns an error if the client is closed or the broker rejects or
    /// fails to acknowledge the publish.
    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;

    /// Subscribe to `channel` and hold the calling task until the
    /// subscription ends.
    ///
    /// # Errors
    ///
    /// Returns an error if the subscription could not be established or the
    /// connection was lost while subscribed. Returns `Ok(())` after
    /// [`close`](Self::close).
    async fn subscribe(&self, channel: &str, handler: &dyn SubscriptionHandler) -> Result<()>;

    /// Close the client. Any running `subscribe` call returns `Ok(())`.
    fn close(&self);
}

/// Factory for broker connections.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Open a new client against `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker is unreachable.
    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn TransportClient>>;
}

/// Open a short-lived client, publish once, and close it.
///
/// # Errors
///
/// Returns an error if either the connect or the publish fails.
pub async fn publish_once(
    transport: &dyn Transport,
    endpoint: &Endpoint,
    channel: &str,
    payload: &str,
) -> Result<()> {
    let client = transport.connect(endpoint).await?;
    let result = client.publish(channel, payload).await;
    client.close();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_display() {
        assert_eq!(Endpoint::new("h", 6379).to_string(), "h:6379");
    }

    #[test]
    fn test_target_display() {
        assert_eq!(Target::new("h", 1, "c1").to_string(), "c1 - h:1");
    }

    #[tokio::test]
    async fn test_publish_once_reaches_broker() {
        let broker = MemoryBroker::new();
        publish_once(&broker, &Endpoint::new("h", 1), "c1", "hi")
            .await
            .unwrap();
        assert_eq!(broker.published_to("c1"), vec!["hi".to_string()]);
    }

    #[tokio::test]
    async fn test_publish_once_fails_when_unreachable() {
        let broker = MemoryBroker::new();
        broker.set_reachable(false);
        let result = publish_once(&broker, &Endpoint::new("h", 1), "c1", "hi").await;
        assert!(result.is_err());
    }
}
