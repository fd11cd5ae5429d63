//! sublink - keeps exactly one Redis pub/sub subscription alive.
//!
//! A host sends CONNECT, DISCONNECT and SEND commands; the crate maintains a
//! single subscription, relays its messages back as events, probes it for
//! liveness, and reconnects after failures.
//!
//! # Architecture
//!
//! - **Dispatcher** - Parses and routes inbound commands
//! - **Manager** - Lifecycle state machine, owns the registry and timers
//! - **Registry** - At most one open connection plus the connecting flag
//! - **Liveness** - Periodic heartbeat publish while subscribed
//! - **Transport** - Broker abstraction (Redis, in-process)
//! - **Events** - Outbound notifications to the host
//!
//! # Modules
//!
//! - [`dispatcher`] - Command wire form and routing
//! - [`manager`] - Connection manager
//! - [`transport`] - Transport traits and implementations
//! - [`config`] - Configuration loading/saving

pub mod config;
pub mod constants;
pub mod dispatcher;
pub mod events;
pub mod liveness;
pub mod manager;
pub mod registry;
pub mod scheduler;
pub mod transport;

// Re-export commonly used types
pub use config::{Config, Timings};
pub use dispatcher::{Command, CommandDispatcher};
pub use events::{ChannelNotifier, Event, Notifier};
pub use manager::ConnectionManager;
pub use registry::ConnectionState;
pub use transport::{Endpoint, MemoryBroker, RedisTransport, Target, Transport};
