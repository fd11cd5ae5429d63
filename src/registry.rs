//! Connection registry and lifecycle state.
//!
//! The registry holds zero or one [`ConnectionRecord`] together with the
//! "connecting" flag and the current [`ConnectionState`]. It has no lock of
//! its own: the [`ConnectionManager`](crate::manager::ConnectionManager)
//! owns it behind a single async mutex, which serializes every mutation of
//! the record and the flag.

use std::fmt;
use std::sync::Arc;

use crate::transport::{Endpoint, TransportClient};

/// Lifecycle state of the managed subscription.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    /// Nothing open, nothing scheduled by a failure.
    #[default]
    Idle,
    /// A client is open and the subscribe call is in flight.
    Connecting,
    /// The broker confirmed the subscription.
    Subscribed,
    /// A failure tore the connection down and a retry is scheduled.
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Subscribed => "subscribed",
            Self::Reconnecting => "reconnecting",
        };
        f.write_str(s)
    }
}

/// The single active connection.
#[derive(Debug)]
pub struct ConnectionRecord {
    /// Registry-assigned id. Callbacks carry it to detect that they outlived
    /// their record.
    pub id: u64,
    /// Open client, exclusively owned by this record until closed.
    pub client: Arc<dyn TransportClient>,
    /// Subscribed channel. Never changes for the life of the record.
    pub channel: String,
    /// Endpoint the client was opened against.
    pub endpoint: Endpoint,
    /// Set once the broker confirms the subscription.
    pub connected: bool,
}

/// Holder of at most one [`ConnectionRecord`].
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    record: Option<ConnectionRecord>,
    connecting: bool,
    state: ConnectionState,
    next_id: u64,
}

impl ConnectionRegistry {
    /// Create an empty registry in the `Idle` state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records held (0 or 1).
    #[must_use]
    pub fn len(&self) -> usize {
        usize::from(self.record.is_some())
    }

    /// Returns `true` if no record is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.record.is_none()
    }

    /// Channel of the held record, if any.
    #[must_use]
    pub fn channel(&self) -> Option<&str> {
        self.record.as_ref().map(|r| r.channel.as_str())
    }

    /// Returns `true` if `id` names the record currently held.
    #[must_use]
    pub fn is_current(&self, id: u64) -> bool {
        self.record.as_ref().is_some_and(|r| r.id == id)
    }

    /// Whether a connect sequence is in flight or established.
    #[must_use]
    pub fn is_connecting(&self) -> bool {
        self.connecting
    }

    /// Test-and-set the connecting flag.
    ///
    /// Returns `true` if the flag was clear and is now set by this call.
    pub fn try_begin_connect(&mut self) -> bool {
        if self.connecting {
            return false;
        }
        self.connecting = true;
        true
    }

    /// Clear the connecting flag.
    pub fn clear_connecting(&mut self) {
        self.connecting = false;
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Move to `state`, logging the transition.
    pub fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            log::info!("[Registry] {} -> {}", self.state, state);
            self.state = state;
        }
    }

    /// Insert a new record and return its id.
    ///
    /// If a record is already held, it is displaced and returned alongside
    /// the id so the caller can close its client; the registry never holds
    /// more than one.
    pub fn insert(
        &mut self,
        client: Arc<dyn TransportClient>,
        channel: String,
        endpoint: Endpoint,
    ) -> (u64, Option<ConnectionRecord>) {
        self.next_id += 1;
        let id = self.next_id;
        let displaced = self.record.replace(ConnectionRecord {
            id,
            client,
            channel,
            endpoint,
            connected: false,
        });
        if let Some(old) = &displaced {
            log::error!(
                "[Registry] Record {} ({}) displaced by record {}",
                old.id,
                old.channel,
                id
            );
        }
        (id, displaced)
    }

    /// Mark record `id` as connected.
    ///
    /// Returns `false` if `id` is no longer the held record.
    pub fn mark_connected(&mut self, id: u64) -> bool {
        match self.record.as_mut() {
            Some(record) if record.id == id => {
                record.connected = true;
                true
            }
            _ => false,
        }
    }

    /// Remove and return the held record, leaving the registry empty.
    pub fn take(&mut self) -> Option<ConnectionRecord> {
        self.record.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryBroker, Transport};

    async fn client() -> Arc<dyn TransportClient> {
        MemoryBroker::new()
            .connect(&Endpoint::new("h", 1))
            .await
            .unwrap()
    }

    #[test]
    fn test_connecting_flag_is_test_and_set() {
        let mut registry = ConnectionRegistry::new();
        assert!(registry.try_begin_connect());
        assert!(!registry.try_begin_connect());
        registry.clear_connecting();
        assert!(registry.try_begin_connect());
    }

    #[tokio::test]
    async fn test_insert_and_take() {
        let mut registry = ConnectionRegistry::new();
        assert!(registry.is_empty());

        let (id, displaced) = registry.insert(client().await, "c1".into(), Endpoint::new("h", 1));
        assert!(displaced.is_none());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.channel(), Some("c1"));
        assert!(registry.is_current(id));

        assert!(registry.mark_connected(id));

        let record = registry.take().unwrap();
        assert_eq!(record.id, id);
        assert!(record.connected);
        assert!(registry.is_empty());
        assert!(!registry.is_current(id));
    }

    #[tokio::test]
    async fn test_insert_never_holds_two_records() {
        let mut registry = ConnectionRegistry::new();
        let (first, _) = registry.insert(client().await, "c1".into(), Endpoint::new("h", 1));
        let (second, displaced) =
            registry.insert(client().await, "c2".into(), Endpoint::new("h", 1));

        assert_eq!(displaced.map(|r| r.id), Some(first));
        assert_eq!(registry.len(), 1);
        assert!(registry.is_current(second));
        assert!(!registry.mark_connected(first));
    }

    #[test]
    fn test_state_defaults_to_idle() {
        let mut registry = ConnectionRegistry::new();
        assert_eq!(registry.state(), ConnectionState::Idle);
        registry.set_state(ConnectionState::Connecting);
        assert_eq!(registry.state(), ConnectionState::Connecting);
        assert_eq!(ConnectionState::Reconnecting.to_string(), "reconnecting");
    }
}
