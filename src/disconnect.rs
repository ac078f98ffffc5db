//! Delayed disconnect handling
//!
//! When a session closes, the application wants its Disconnect callback —
//! but a deploy restart closes thousands of sessions at once, so the
//! callbacks are queued and drained at a bounded rate instead of being
//! fired inline.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::node::Node;
use crate::session::{Session, SessionEnv};

/// Everything the Disconnect callback needs, captured at enqueue time so
/// the call stays correct even after the session is torn down.
#[derive(Debug, Clone)]
pub struct DisconnectEntry {
    pub sid: String,
    pub identifiers: String,
    pub env: SessionEnv,
    pub channels: Vec<String>,
}

impl DisconnectEntry {
    pub async fn from_session(session: &Session) -> Self {
        let state = session.state.lock().await;
        Self {
            sid: session.sid().to_string(),
            identifiers: session.identifiers(),
            env: state.env.clone(),
            channels: state.subscriptions.channels(),
        }
    }
}

/// Schedules Disconnect callbacks for closed sessions.
#[async_trait]
pub trait Disconnector: Send + Sync {
    async fn enqueue(&self, session: Arc<Session>) -> anyhow::Result<()>;
    fn size(&self) -> usize;
    async fn shutdown(&self) -> anyhow::Result<()>;
}

/// No-op variant used when the Disconnect callback is disabled.
pub struct NoopDisconnector;

#[async_trait]
impl Disconnector for NoopDisconnector {
    async fn enqueue(&self, _session: Arc<Session>) -> anyhow::Result<()> {
        Ok(())
    }

    fn size(&self) -> usize {
        0
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct QueueInner {
    entries: VecDeque<DisconnectEntry>,
    /// Sids queued or mid-callback; a second enqueue for one of them is a
    /// no-op.
    pending: HashSet<String>,
}

/// Rate-limited, deduplicated FIFO of Disconnect callbacks.
pub struct DisconnectQueue {
    node: Weak<Node>,
    inner: StdMutex<QueueInner>,
    notify: Notify,
    rate: u32,
    shutdown_timeout: Duration,
    closed: AtomicBool,
}

impl DisconnectQueue {
    pub fn new(node: &Arc<Node>, rate: u32, shutdown_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            node: Arc::downgrade(node),
            inner: StdMutex::new(QueueInner::default()),
            notify: Notify::new(),
            rate: rate.max(1),
            shutdown_timeout,
            closed: AtomicBool::new(false),
        })
    }

    fn tick_period(&self) -> Duration {
        Duration::from_secs(1) / self.rate
    }

    /// Start the worker draining the queue at the configured rate.
    pub fn run(self: &Arc<Self>) {
        let queue = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(queue.tick_period());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                let entry = loop {
                    if queue.closed.load(Ordering::SeqCst) {
                        return;
                    }
                    if let Some(entry) = queue.pop() {
                        break entry;
                    }
                    queue.notify.notified().await;
                };

                ticker.tick().await;
                queue.execute(&entry).await;
            }
        });
    }

    fn pop(&self) -> Option<DisconnectEntry> {
        self.inner.lock().unwrap().entries.pop_front()
    }

    async fn execute(&self, entry: &DisconnectEntry) {
        if let Some(node) = self.node.upgrade() {
            node.disconnect_now(entry).await;
        }
        self.inner.lock().unwrap().pending.remove(&entry.sid);
    }
}

#[async_trait]
impl Disconnector for DisconnectQueue {
    async fn enqueue(&self, session: Arc<Session>) -> anyhow::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            anyhow::bail!("disconnect queue is closed");
        }

        let entry = DisconnectEntry::from_session(&session).await;

        {
            let mut inner = self.inner.lock().unwrap();
            if !inner.pending.insert(entry.sid.clone()) {
                debug!(sid = %entry.sid, "disconnect already pending");
                return Ok(());
            }
            inner.entries.push_back(entry);
        }

        self.notify.notify_one();
        Ok(())
    }

    fn size(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.notify.notify_one();

        let remaining = self.size();
        if remaining == 0 {
            return Ok(());
        }

        info!(remaining, "draining disconnect queue");

        let drain = async {
            let mut ticker = tokio::time::interval(self.tick_period());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            while let Some(entry) = self.pop() {
                ticker.tick().await;
                self.execute(&entry).await;
            }
        };

        if tokio::time::timeout(self.shutdown_timeout, drain).await.is_err() {
            warn!(
                remaining = self.size(),
                "disconnect queue shutdown timed out, entries dropped"
            );
        }

        Ok(())
    }
}
