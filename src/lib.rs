//! Cablegrid - Action Cable-compatible WebSocket gateway
//!
//! Terminates long-lived WebSocket connections, multiplexes channel
//! subscriptions over them, delegates authentication and channel logic to
//! an application [`controller::Controller`], and fans pub/sub broadcasts
//! out to subscribed sessions.
//!
//! ## Architecture
//!
//! ```text
//! Client (WS) → Session → Node → Controller (app)
//!                  ↑        ↓
//!            Hub fan-out ← PubSub adapter
//! ```
//!
//! The hub is the process-wide registry (sessions, identifier groups,
//! stream memberships) owned by a single coordinator task; the node hosts
//! the command state machine and the shutdown protocol; the disconnect
//! queue rate-limits the application's Disconnect callbacks.

pub mod config;
pub mod controller;
pub mod disconnect;
pub mod hub;
pub mod identity;
pub mod metrics;
pub mod node;
pub mod protocol;
pub mod pubsub;
pub mod router;
pub mod server;
pub mod session;
pub mod streams;
pub mod subscriptions;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::Config;
pub use controller::{CommandResult, ConnectResult, Controller, Status};
pub use disconnect::{DisconnectQueue, Disconnector, NoopDisconnector};
pub use hub::Hub;
pub use node::{Node, NodeError};
pub use protocol::{Message, PubSubMessage, RemoteDisconnectMessage, StreamMessage};
pub use pubsub::{Handler, MemorySubscriber, Subscriber};
pub use session::{Session, SessionEnv};
