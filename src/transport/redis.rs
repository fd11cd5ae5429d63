//! Redis pub/sub transport.
//!
//! Publishes go through a multiplexed connection; each `subscribe` call
//! opens its own dedicated pub/sub connection and holds it until the
//! message stream ends or the client is closed.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio_util::sync::CancellationToken;

use super::{Endpoint, SubscriptionHandler, Transport, TransportClient};
use crate::constants::CONNECT_TIMEOUT;

/// [`Transport`] backed by a Redis server.
#[derive(Debug, Clone)]
pub struct RedisTransport {
    /// Bound on connect and publish round-trips.
    timeout: Duration,
}

impl Default for RedisTransport {
    fn default() -> Self {
        Self::new(CONNECT_TIMEOUT)
    }
}

impl RedisTransport {
    /// Create a transport whose connects and publishes give up after `timeout`.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

fn redis_url(endpoint: &Endpoint) -> String {
    format!("redis://{}:{}/", endpoint.host, endpoint.port)
}

#[async_trait]
impl Transport for RedisTransport {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn TransportClient>> {
        let client = redis::Client::open(redis_url(endpoint))
            .with_context(|| format!("Invalid redis endpoint {endpoint}"))?;

        let conn = tokio::time::timeout(self.timeout, client.get_multiplexed_async_connection())
            .await
            .with_context(|| format!("Timed out connecting to {endpoint}"))?
            .with_context(|| format!("Failed to open redis connection to {endpoint}"))?;

        log::debug!("[Redis] Connected to {}", endpoint);

        Ok(Arc::new(RedisClient {
            endpoint: endpoint.clone(),
            client,
            conn,
            timeout: self.timeout,
            closed: CancellationToken::new(),
        }))
    }
}

/// Open Redis connection.
pub struct RedisClient {
    endpoint: Endpoint,
    client: redis::Client,
    conn: MultiplexedConnection,
    timeout: Duration,
    closed: CancellationToken,
}

impl fmt::Debug for RedisClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisClient")
            .field("endpoint", &self.endpoint)
            .field("closed", &self.closed.is_cancelled())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl TransportClient for RedisClient {
    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        if self.closed.is_cancelled() {
            anyhow::bail!("Client for {} is closed", self.endpoint);
        }

        let mut conn = self.conn.clone();
        let receivers: i64 = tokio::time::timeout(self.timeout, conn.publish(channel, payload))
            .await
            .with_context(|| format!("Publish to {channel} on {} timed out", self.endpoint))?
            .with_context(|| format!("Publish to {channel} on {} failed", self.endpoint))?;

        log::trace!("[Redis] Published to {} ({} receivers)", channel, receivers);
        Ok(())
    }

    async fn subscribe(&self, channel: &str, handler: &dyn SubscriptionHandler) -> Result<()> {
        let mut pubsub = tokio::time::timeout(self.timeout, self.client.get_async_pubsub())
            .await
            .with_context(|| format!("Timed out opening pub/sub to {}", self.endpoint))?
            .with_context(|| format!("Failed to open pub/sub to {}", self.endpoint))?;

        pubsub
            .subscribe(channel)
            .await
            .with_context(|| format!("SUBSCRIBE {channel} on {} failed", self.endpoint))?;

        handler.on_subscribe(channel).await;

        let messages = pubsub.on_message();
        tokio::pin!(messages);

        loop {
            tokio::select! {
                biased;
                () = self.closed.cancelled() => {
                    log::debug!("[Redis] Subscription to {} closed locally", channel);
                    return Ok(());
                }
                msg = messages.next() => match msg {
                    Some(msg) => match msg.get_payload::<String>() {
                        Ok(payload) => handler.on_message(channel, payload).await,
                        Err(e) => log::warn!("[Redis] Dropping undecodable payload on {}: {}", channel, e),
                    },
                    None => anyhow::bail!("Subscription to {channel} on {} ended", self.endpoint),
                },
            }
        }
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_url() {
        assert_eq!(
            redis_url(&Endpoint::new("10.0.0.2", 6380)),
            "redis://10.0.0.2:6380/"
        );
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_fails() {
        // Port 1 is never a Redis server; the connect must fail, not hang.
        let transport = RedisTransport::new(Duration::from_millis(500));
        let result = transport.connect(&Endpoint::new("127.0.0.1", 1)).await;
        assert!(result.is_err());
    }
}
