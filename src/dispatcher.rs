//! Inbound commands and their dispatch onto the connection manager.
//!
//! Hosts send [`Command`] values to a [`CommandDispatcher`], either directly
//! through [`CommandDispatcher::dispatch`] or over a `tokio::sync::mpsc`
//! channel drained by [`CommandDispatcher::run`] (actor pattern).
//!
//! # Wire Form
//!
//! ```text
//! {"command":"CONNECT","host":"127.0.0.1","port":6379,"channel":"c1"}
//! {"command":"DISCONNECT"}
//! {"command":"SEND","channel":"c1","data":"hello"}
//! ```
//!
//! CONNECT and DISCONNECT are debounced by the manager and share one
//! debounce window. SEND is never debounced and does not depend on the
//! subscription state.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::constants::NO_DATA_PLACEHOLDER;
use crate::manager::ConnectionManager;
use crate::transport::Target;

/// Command accepted from the host. Fire-and-forget: no reply is sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "UPPERCASE")]
pub enum Command {
    /// Subscribe to `channel` on `host:port`.
    Connect {
        /// Broker host.
        host: String,
        /// Broker port.
        port: u16,
        /// Channel to follow.
        channel: String,
    },
    /// Drop the subscription.
    Disconnect,
    /// Publish `data` on `channel`.
    Send {
        /// Target channel.
        channel: String,
        /// Payload. Missing data publishes a placeholder.
        #[serde(default)]
        data: Option<String>,
    },
}

impl Command {
    /// Build a CONNECT command.
    pub fn connect(host: impl Into<String>, port: u16, channel: impl Into<String>) -> Self {
        Self::Connect {
            host: host.into(),
            port,
            channel: channel.into(),
        }
    }

    /// Build a SEND command.
    pub fn send(channel: impl Into<String>, data: Option<String>) -> Self {
        Self::Send {
            channel: channel.into(),
            data,
        }
    }

    /// Parse one command from its JSON wire form.
    ///
    /// # Errors
    ///
    /// Returns an error if `line` is not valid JSON or names an unknown
    /// command.
    pub fn parse_json(line: &str) -> Result<Self> {
        serde_json::from_str(line.trim()).with_context(|| format!("Invalid command: {line}"))
    }
}

/// Routes commands to a [`ConnectionManager`].
#[derive(Debug, Clone)]
pub struct CommandDispatcher {
    manager: ConnectionManager,
}

impl CommandDispatcher {
    /// Create a dispatcher for `manager`.
    #[must_use]
    pub fn new(manager: ConnectionManager) -> Self {
        Self { manager }
    }

    /// The manager commands are routed to.
    #[must_use]
    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    /// Handle one command without blocking.
    ///
    /// Must be called from within a tokio runtime.
    pub fn dispatch(&self, command: Command) {
        log::debug!("[Dispatcher] {:?}", command);
        match command {
            Command::Connect {
                host,
                port,
                channel,
            } => self.manager.request_connect(Target::new(host, port, channel)),
            Command::Disconnect => self.manager.request_disconnect(),
            Command::Send { channel, data } => {
                let payload = data.unwrap_or_else(|| NO_DATA_PLACEHOLDER.to_string());
                let manager = self.manager.clone();
                tokio::spawn(async move {
                    // Failure already surfaced as an event.
                    let _ = manager.publish(&channel, &payload).await;
                });
            }
        }
    }

    /// Dispatch commands from `rx` until every sender is dropped.
    pub async fn run(&self, mut rx: mpsc::Receiver<Command>) {
        log::info!("[Dispatcher] Started");
        while let Some(command) = rx.recv().await {
            self.dispatch(command);
        }
        log::info!("[Dispatcher] Command channel closed");
    }
}
