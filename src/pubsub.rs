//! Pub/sub seams
//!
//! Broadcast adapters live out of process (Redis, NATS, an HTTP ingress);
//! this module defines what they talk to. An adapter receives raw
//! payloads from its bus and hands them to the [`Handler`]; the node does
//! the parsing and fan-out.
//!
//! The in-process [`MemorySubscriber`] is the single-node adapter used in
//! development and tests: publishes loop straight back into the handler.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

/// Consumer of raw pub/sub payloads. Implemented by the node.
pub trait Handler: Send + Sync {
    fn handle_pubsub(&self, raw: &[u8]);
}

/// A broadcast adapter lifecycle.
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn start(&self) -> anyhow::Result<()>;
    async fn shutdown(&self) -> anyhow::Result<()>;
}

/// Single-node in-process adapter: no external bus, publishes go straight
/// to the handler.
pub struct MemorySubscriber {
    handler: Arc<dyn Handler>,
}

impl MemorySubscriber {
    pub fn new(handler: Arc<dyn Handler>) -> Self {
        Self { handler }
    }

    /// Feed a payload into the server as if it came from the bus.
    pub fn publish(&self, raw: &[u8]) {
        self.handler.handle_pubsub(raw);
    }
}

#[async_trait]
impl Subscriber for MemorySubscriber {
    async fn start(&self) -> anyhow::Result<()> {
        info!("in-memory broadcast adapter initialized (single-node only)");
        Ok(())
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
