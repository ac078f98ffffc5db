//! WebSocket session
//!
//! A session owns one client connection: its request env, its subscription
//! index and its outbound queue. I/O runs as two pumps — the read pump
//! feeds decoded commands to the node, the write pump drains the outbound
//! queue with a per-write deadline. The session itself is transport
//! agnostic; the socket halves are injected through the
//! [`ConnectionReader`]/[`ConnectionWriter`] traits.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, warn};

use crate::config::TimestampPrecision;
use crate::metrics::Metrics;
use crate::node::{
    METRICS_DATA_RCVD, METRICS_DATA_SENT, METRICS_FAILED_SENT_MSG, METRICS_FAILED_CLIENT_MSG,
    METRICS_CLIENT_MSG, METRICS_SENT_MSG, Node,
};
use crate::protocol::{self, CLOSE_INTERNAL_SERVER_ERR, CLOSE_NORMAL};
use crate::subscriptions::SubscriptionState;

/// Outbound queue capacity per session. Overflow marks the client as slow
/// and schedules it for disconnection.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Request-scoped state forwarded to the application on every call.
#[derive(Debug, Clone, Default)]
pub struct SessionEnv {
    pub url: String,
    pub headers: HashMap<String, String>,
    /// Connection-level state, patched by `cstate` replies.
    pub cstate: HashMap<String, String>,
    /// Per-channel state, patched by `istate` replies.
    pub istate: HashMap<String, HashMap<String, String>>,
}

impl SessionEnv {
    pub fn new(url: String, headers: HashMap<String, String>) -> Self {
        Self {
            url,
            headers,
            cstate: HashMap::new(),
            istate: HashMap::new(),
        }
    }

    pub fn merge_connection_state(&mut self, patch: &HashMap<String, String>) {
        for (key, value) in patch {
            self.cstate.insert(key.clone(), value.clone());
        }
    }

    pub fn merge_channel_state(&mut self, channel: &str, patch: &HashMap<String, String>) {
        let state = self.istate.entry(channel.to_string()).or_default();
        for (key, value) in patch {
            state.insert(key.clone(), value.clone());
        }
    }

    pub fn channel_state(&self, channel: &str) -> Option<&HashMap<String, String>> {
        self.istate.get(channel)
    }
}

/// State guarded by the session's command lock.
#[derive(Debug, Default)]
pub struct SessionState {
    pub env: SessionEnv,
    pub subscriptions: SubscriptionState,
}

/// Outbound queue entries.
#[derive(Debug, Clone)]
pub enum SessionMessage {
    Frame(Arc<str>),
    Close { code: u16, reason: String },
}

/// Transport errors surfaced by the connection halves.
#[derive(Debug, thiserror::Error)]
#[error("connection error: {0}")]
pub struct ConnectionError(pub String);

/// Read half of a client connection. Returns complete data frames;
/// control frames are the transport's business.
#[async_trait]
pub trait ConnectionReader: Send {
    /// Next data frame, or `None` once the peer has closed.
    async fn read(&mut self) -> Result<Option<Vec<u8>>, ConnectionError>;
}

/// Write half of a client connection.
#[async_trait]
pub trait ConnectionWriter: Send {
    async fn write(&mut self, frame: &[u8]) -> Result<(), ConnectionError>;
    async fn close(&mut self, code: u16, reason: &str);
}

pub struct Session {
    sid: String,
    identifiers: StdMutex<String>,
    /// The command lock: serializes subscription-index and channel-state
    /// mutations. Never held across a controller call.
    pub(crate) state: Mutex<SessionState>,
    sender: mpsc::Sender<SessionMessage>,
    close_cmd: StdMutex<Option<(u16, String)>>,
    close_notify: Notify,
    connected: AtomicBool,
    closed: AtomicBool,
    metrics: Arc<Metrics>,
}

impl Session {
    pub fn new(
        sid: String,
        env: SessionEnv,
        metrics: Arc<Metrics>,
    ) -> (Arc<Self>, mpsc::Receiver<SessionMessage>) {
        Self::with_queue_capacity(sid, env, metrics, OUTBOUND_QUEUE_CAPACITY)
    }

    pub fn with_queue_capacity(
        sid: String,
        env: SessionEnv,
        metrics: Arc<Metrics>,
        capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<SessionMessage>) {
        let (sender, receiver) = mpsc::channel(capacity);

        let session = Arc::new(Self {
            sid,
            identifiers: StdMutex::new(String::new()),
            state: Mutex::new(SessionState {
                env,
                subscriptions: SubscriptionState::new(),
            }),
            sender,
            close_cmd: StdMutex::new(None),
            close_notify: Notify::new(),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            metrics,
        });

        (session, receiver)
    }

    pub fn sid(&self) -> &str {
        &self.sid
    }

    pub fn identifiers(&self) -> String {
        self.identifiers.lock().unwrap().clone()
    }

    /// Set after a successful authentication.
    pub fn set_identifiers(&self, identifiers: String) {
        *self.identifiers.lock().unwrap() = identifiers;
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn mark_connected(&self) {
        self.connected.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn env_snapshot(&self) -> SessionEnv {
        self.state.lock().await.env.clone()
    }

    /// Enqueue a frame for delivery. Non-blocking: a full queue means the
    /// client cannot keep up, so the frame is dropped and the session is
    /// scheduled for disconnection.
    pub fn transmit(&self, frame: impl Into<Arc<str>>) {
        if self.is_closed() {
            return;
        }

        match self.sender.try_send(SessionMessage::Frame(frame.into())) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.metrics.counter_increment(METRICS_FAILED_SENT_MSG);
                warn!(sid = %self.sid, "outbound queue full, disconnecting slow client");
                self.disconnect("slow client", CLOSE_INTERNAL_SERVER_ERR);
            }
            Err(TrySendError::Closed(_)) => {
                debug!(sid = %self.sid, "transmit after write pump exit");
            }
        }
    }

    /// Close the connection. Queued frames are flushed first when the
    /// queue has room for the close marker. Idempotent.
    pub fn disconnect(&self, reason: &str, code: u16) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        debug!(sid = %self.sid, reason, code, "session closing");
        *self.close_cmd.lock().unwrap() = Some((code, reason.to_string()));

        let close = SessionMessage::Close {
            code,
            reason: reason.to_string(),
        };
        if self.sender.try_send(close).is_err() {
            // Queue full or pump gone: skip the flush and close directly.
            self.close_notify.notify_one();
        }
    }

    /// Transmit a final frame (typically a disconnect notice), then close.
    pub fn disconnect_with_message(&self, frame: &str, reason: &str, code: u16) {
        if !self.is_closed() {
            let _ = self
                .sender
                .try_send(SessionMessage::Frame(Arc::from(frame)));
        }
        self.disconnect(reason, code);
    }

    /// Read loop: decode frames and hand commands to the node. Runs until
    /// the peer closes or the surrounding task is cancelled.
    pub async fn read_pump<R: ConnectionReader>(
        self: Arc<Self>,
        node: Arc<Node>,
        mut reader: R,
    ) {
        loop {
            match reader.read().await {
                Ok(Some(frame)) => {
                    self.metrics.counter_add(METRICS_DATA_RCVD, frame.len() as u64);

                    match protocol::parse_command(&frame) {
                        Ok(msg) => {
                            self.metrics.counter_increment(METRICS_CLIENT_MSG);
                            if let Err(err) = node.handle_command(&self, msg).await {
                                self.metrics.counter_increment(METRICS_FAILED_CLIENT_MSG);
                                error!(sid = %self.sid, error = %err, "command failed");
                            }
                        }
                        Err(err) => {
                            self.metrics.counter_increment(METRICS_FAILED_CLIENT_MSG);
                            warn!(sid = %self.sid, error = %err, "malformed client frame");
                        }
                    }
                }
                Ok(None) => {
                    debug!(sid = %self.sid, "client closed connection");
                    break;
                }
                Err(err) => {
                    debug!(sid = %self.sid, error = %err, "read failed");
                    break;
                }
            }
        }
    }

    /// Write loop: drain the outbound queue onto the socket. Exits on the
    /// close marker, a forced close, or a write failure.
    pub async fn write_pump<W: ConnectionWriter>(
        self: Arc<Self>,
        mut receiver: mpsc::Receiver<SessionMessage>,
        mut writer: W,
        write_timeout: Duration,
    ) {
        loop {
            tokio::select! {
                _ = self.close_notify.notified() => {
                    let cmd = self.close_cmd.lock().unwrap().take();
                    let (code, reason) = cmd.unwrap_or((CLOSE_NORMAL, String::new()));
                    writer.close(code, &reason).await;
                    break;
                }
                next = receiver.recv() => match next {
                    Some(SessionMessage::Frame(frame)) => {
                        match tokio::time::timeout(write_timeout, writer.write(frame.as_bytes()))
                            .await
                        {
                            Ok(Ok(())) => {
                                self.metrics.counter_increment(METRICS_SENT_MSG);
                                self.metrics
                                    .counter_add(METRICS_DATA_SENT, frame.len() as u64);
                            }
                            Ok(Err(err)) => {
                                debug!(sid = %self.sid, error = %err, "write failed");
                                self.closed.store(true, Ordering::SeqCst);
                                break;
                            }
                            Err(_) => {
                                debug!(sid = %self.sid, "write timed out");
                                self.closed.store(true, Ordering::SeqCst);
                                break;
                            }
                        }
                    }
                    Some(SessionMessage::Close { code, reason }) => {
                        writer.close(code, &reason).await;
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    /// Heartbeat loop: enqueue a ping frame every `interval`.
    pub async fn ping_loop(
        self: Arc<Self>,
        interval: Duration,
        precision: TimestampPrecision,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if self.is_closed() {
                break;
            }
            self.transmit(protocol::ping_message(precision.now()));
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("sid", &self.sid)
            .field("connected", &self.is_connected())
            .field("closed", &self.is_closed())
            .finish()
    }
}
