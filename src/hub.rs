//! Connection hub
//!
//! Process-wide registry of sessions, identifier groups and stream
//! memberships, plus the broadcast fan-out engine. A single coordinator
//! task owns the indices exclusively; every mutation and query goes
//! through its command channel, which makes operations linearizable per
//! session id. Fan-out work is handed to a fixed pool of workers; a
//! session is pinned to a worker by sid hash so broadcasts to one session
//! are never reordered.

use std::collections::{HashMap, HashSet, hash_map::DefaultHasher};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::protocol::{
    self, CLOSE_NORMAL, REMOTE_DISCONNECT_REASON, RemoteDisconnectMessage, StreamMessage,
};
use crate::session::Session;

enum HubCommand {
    AddSession(Arc<Session>),
    RemoveSession {
        sid: String,
        done: Option<oneshot::Sender<()>>,
    },
    Subscribe {
        sid: String,
        stream: String,
        channel: String,
    },
    Unsubscribe {
        sid: String,
        stream: String,
        channel: String,
    },
    UnsubscribeChannel {
        sid: String,
        channel: String,
    },
    Broadcast(StreamMessage),
    RemoteDisconnect(RemoteDisconnectMessage),
    Sizes {
        reply: oneshot::Sender<HubSizes>,
    },
    DisconnectAll {
        reason: String,
        reconnect: bool,
        code: u16,
        done: oneshot::Sender<usize>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HubSizes {
    /// Number of registered sessions.
    pub sessions: usize,
    /// Number of distinct identifier strings.
    pub uniq: usize,
    /// Number of streams with at least one subscriber.
    pub streams: usize,
}

struct FanoutJob {
    session: Arc<Session>,
    payloads: Vec<Arc<str>>,
}

/// Handle to the hub coordinator. Cheap to clone.
#[derive(Clone)]
pub struct Hub {
    tx: mpsc::UnboundedSender<HubCommand>,
}

impl Hub {
    /// Start the coordinator and `pool_size` fan-out workers.
    pub fn new(pool_size: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(run_coordinator(rx, pool_size.max(1)));

        Self { tx }
    }

    fn send(&self, command: HubCommand) {
        if self.tx.send(command).is_err() {
            debug!("hub is shut down, operation dropped");
        }
    }

    pub fn add_session(&self, session: Arc<Session>) {
        self.send(HubCommand::AddSession(session));
    }

    /// Remove a session and wait until the indices reflect it.
    pub async fn remove_session(&self, sid: &str) {
        let (done, ack) = oneshot::channel();
        self.send(HubCommand::RemoveSession {
            sid: sid.to_string(),
            done: Some(done),
        });
        let _ = ack.await;
    }

    /// Deferred removal: enqueue and return immediately.
    pub fn remove_session_later(&self, sid: &str) {
        self.send(HubCommand::RemoveSession {
            sid: sid.to_string(),
            done: None,
        });
    }

    pub fn subscribe_session(&self, sid: &str, stream: &str, channel: &str) {
        self.send(HubCommand::Subscribe {
            sid: sid.to_string(),
            stream: stream.to_string(),
            channel: channel.to_string(),
        });
    }

    pub fn unsubscribe_session(&self, sid: &str, stream: &str, channel: &str) {
        self.send(HubCommand::Unsubscribe {
            sid: sid.to_string(),
            stream: stream.to_string(),
            channel: channel.to_string(),
        });
    }

    pub fn unsubscribe_session_from_channel(&self, sid: &str, channel: &str) {
        self.send(HubCommand::UnsubscribeChannel {
            sid: sid.to_string(),
            channel: channel.to_string(),
        });
    }

    pub fn broadcast_message(&self, message: StreamMessage) {
        self.send(HubCommand::Broadcast(message));
    }

    pub fn remote_disconnect(&self, message: RemoteDisconnectMessage) {
        self.send(HubCommand::RemoteDisconnect(message));
    }

    pub async fn sizes(&self) -> HubSizes {
        let (reply, response) = oneshot::channel();
        self.send(HubCommand::Sizes { reply });
        response.await.unwrap_or_default()
    }

    pub async fn size(&self) -> usize {
        self.sizes().await.sessions
    }

    pub async fn uniq_size(&self) -> usize {
        self.sizes().await.uniq
    }

    pub async fn streams_size(&self) -> usize {
        self.sizes().await.streams
    }

    /// Send a disconnect frame to every session and close it. Returns the
    /// number of sessions notified.
    pub async fn disconnect_all(&self, reason: &str, reconnect: bool, code: u16) -> usize {
        let (done, ack) = oneshot::channel();
        self.send(HubCommand::DisconnectAll {
            reason: reason.to_string(),
            reconnect,
            code,
            done,
        });
        ack.await.unwrap_or(0)
    }

    /// Stop accepting operations and drain in-flight fan-out work.
    pub async fn shutdown(&self) {
        let (done, ack) = oneshot::channel();
        self.send(HubCommand::Shutdown { done });
        let _ = ack.await;
    }
}

#[derive(Default)]
struct HubRegistry {
    /// sid -> session
    by_sid: HashMap<String, Arc<Session>>,
    /// identifiers -> sids sharing them
    by_identifier: HashMap<String, HashSet<String>>,
    /// stream -> sid -> channels subscribed through
    streams: HashMap<String, HashMap<String, HashSet<String>>>,
    /// Reverse of `streams`, for O(1) session removal.
    session_streams: HashMap<String, HashMap<String, HashSet<String>>>,
}

impl HubRegistry {
    fn add_session(&mut self, session: Arc<Session>) {
        let sid = session.sid().to_string();
        let identifiers = session.identifiers();

        if !identifiers.is_empty() {
            self.by_identifier
                .entry(identifiers)
                .or_default()
                .insert(sid.clone());
        }

        debug!(sid = %sid, "session registered");
        self.by_sid.insert(sid, session);
    }

    fn remove_session(&mut self, sid: &str) {
        let Some(session) = self.by_sid.remove(sid) else {
            return;
        };

        let identifiers = session.identifiers();
        if !identifiers.is_empty()
            && let Some(sids) = self.by_identifier.get_mut(&identifiers)
        {
            sids.remove(sid);
            if sids.is_empty() {
                self.by_identifier.remove(&identifiers);
            }
        }

        if let Some(channels) = self.session_streams.remove(sid) {
            for streams in channels.into_values() {
                for stream in streams {
                    self.drop_stream_membership(&stream, sid, None);
                }
            }
        }

        debug!(sid = %sid, "session removed");
    }

    fn subscribe(&mut self, sid: &str, stream: &str, channel: &str) {
        if !self.by_sid.contains_key(sid) {
            warn!(sid = %sid, stream, "subscribe for unknown session");
            return;
        }

        self.streams
            .entry(stream.to_string())
            .or_default()
            .entry(sid.to_string())
            .or_default()
            .insert(channel.to_string());

        self.session_streams
            .entry(sid.to_string())
            .or_default()
            .entry(channel.to_string())
            .or_default()
            .insert(stream.to_string());

        debug!(sid = %sid, stream, channel, "stream subscription added");
    }

    fn unsubscribe(&mut self, sid: &str, stream: &str, channel: &str) {
        self.drop_stream_membership(stream, sid, Some(channel));

        if let Some(channels) = self.session_streams.get_mut(sid)
            && let Some(streams) = channels.get_mut(channel)
        {
            streams.remove(stream);
            if streams.is_empty() {
                channels.remove(channel);
            }
        }
    }

    fn unsubscribe_channel(&mut self, sid: &str, channel: &str) {
        let streams = self
            .session_streams
            .get_mut(sid)
            .and_then(|channels| channels.remove(channel))
            .unwrap_or_default();

        for stream in streams {
            self.drop_stream_membership(&stream, sid, Some(channel));
        }
    }

    /// Remove a `(stream, sid)` membership; with a channel given only that
    /// channel is dropped, otherwise the whole per-sid entry goes.
    fn drop_stream_membership(&mut self, stream: &str, sid: &str, channel: Option<&str>) {
        let Some(members) = self.streams.get_mut(stream) else {
            return;
        };

        match channel {
            Some(channel) => {
                if let Some(channels) = members.get_mut(sid) {
                    channels.remove(channel);
                    if channels.is_empty() {
                        members.remove(sid);
                    }
                }
            }
            None => {
                members.remove(sid);
            }
        }

        if members.is_empty() {
            self.streams.remove(stream);
            debug!(stream, "removed empty stream");
        }
    }

    fn sizes(&self) -> HubSizes {
        HubSizes {
            sessions: self.by_sid.len(),
            uniq: self.by_identifier.len(),
            streams: self.streams.len(),
        }
    }
}

async fn run_coordinator(mut rx: mpsc::UnboundedReceiver<HubCommand>, pool_size: usize) {
    let mut registry = HubRegistry::default();

    let mut workers: Vec<mpsc::UnboundedSender<FanoutJob>> = Vec::with_capacity(pool_size);
    let mut worker_handles: Vec<JoinHandle<()>> = Vec::with_capacity(pool_size);

    for _ in 0..pool_size {
        let (job_tx, mut job_rx) = mpsc::unbounded_channel::<FanoutJob>();
        workers.push(job_tx);
        worker_handles.push(tokio::spawn(async move {
            while let Some(job) = job_rx.recv().await {
                for payload in job.payloads {
                    job.session.transmit(payload);
                }
            }
        }));
    }

    let mut shutdown_ack: Option<oneshot::Sender<()>> = None;

    while let Some(command) = rx.recv().await {
        match command {
            HubCommand::AddSession(session) => registry.add_session(session),
            HubCommand::RemoveSession { sid, done } => {
                registry.remove_session(&sid);
                if let Some(done) = done {
                    let _ = done.send(());
                }
            }
            HubCommand::Subscribe {
                sid,
                stream,
                channel,
            } => registry.subscribe(&sid, &stream, &channel),
            HubCommand::Unsubscribe {
                sid,
                stream,
                channel,
            } => registry.unsubscribe(&sid, &stream, &channel),
            HubCommand::UnsubscribeChannel { sid, channel } => {
                registry.unsubscribe_channel(&sid, &channel)
            }
            HubCommand::Broadcast(message) => {
                dispatch_broadcast(&registry, &workers, &message);
            }
            HubCommand::RemoteDisconnect(message) => {
                let sids: Vec<String> = registry
                    .by_identifier
                    .get(&message.identifier)
                    .map(|sids| sids.iter().cloned().collect())
                    .unwrap_or_default();

                debug!(
                    identifier = %message.identifier,
                    sessions = sids.len(),
                    "remote disconnect"
                );

                let frame =
                    protocol::disconnect_message(REMOTE_DISCONNECT_REASON, message.reconnect);

                for sid in sids {
                    if let Some(session) = registry.by_sid.get(&sid) {
                        session.disconnect_with_message(
                            &frame,
                            REMOTE_DISCONNECT_REASON,
                            CLOSE_NORMAL,
                        );
                    }
                    registry.remove_session(&sid);
                }
            }
            HubCommand::Sizes { reply } => {
                let _ = reply.send(registry.sizes());
            }
            HubCommand::DisconnectAll {
                reason,
                reconnect,
                code,
                done,
            } => {
                let frame = protocol::disconnect_message(&reason, reconnect);
                for session in registry.by_sid.values() {
                    session.disconnect_with_message(&frame, &reason, code);
                }
                let _ = done.send(registry.by_sid.len());
            }
            HubCommand::Shutdown { done } => {
                // Stop accepting operations; workers drain what was already
                // dispatched once their channels close below.
                rx.close();
                shutdown_ack = Some(done);
                break;
            }
        }
    }

    drop(workers);
    for handle in worker_handles {
        let _ = handle.await;
    }
    debug!("hub stopped");

    if let Some(done) = shutdown_ack {
        let _ = done.send(());
    }
}

fn dispatch_broadcast(
    registry: &HubRegistry,
    workers: &[mpsc::UnboundedSender<FanoutJob>],
    message: &StreamMessage,
) {
    let Some(members) = registry.streams.get(&message.stream) else {
        debug!(stream = %message.stream, "no subscribers for broadcast");
        return;
    };

    // One envelope per channel identifier, shared between recipients.
    let mut envelopes: HashMap<&str, Arc<str>> = HashMap::new();

    for (sid, channels) in members {
        let Some(session) = registry.by_sid.get(sid) else {
            continue;
        };

        let payloads: Vec<Arc<str>> = channels
            .iter()
            .map(|channel| {
                Arc::clone(envelopes.entry(channel.as_str()).or_insert_with(|| {
                    Arc::from(protocol::stream_envelope(channel, &message.data))
                }))
            })
            .collect();

        let worker = &workers[worker_index(sid, workers.len())];
        let _ = worker.send(FanoutJob {
            session: Arc::clone(session),
            payloads,
        });
    }

    debug!(stream = %message.stream, receivers = members.len(), "broadcast dispatched");
}

fn worker_index(sid: &str, pool_size: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    sid.hash(&mut hasher);
    (hasher.finish() as usize) % pool_size
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::sync::mpsc::Receiver;
    use tokio::time::timeout;

    use crate::session::{SessionEnv, SessionMessage};
    use crate::test_support::new_metrics;

    fn new_session(sid: &str, identifiers: &str) -> (Arc<Session>, Receiver<SessionMessage>) {
        let (session, receiver) =
            Session::new(sid.to_string(), SessionEnv::default(), new_metrics());
        if !identifiers.is_empty() {
            session.set_identifiers(identifiers.to_string());
        }
        (session, receiver)
    }

    async fn next_frame(receiver: &mut Receiver<SessionMessage>) -> String {
        match timeout(Duration::from_secs(1), receiver.recv()).await {
            Ok(Some(SessionMessage::Frame(frame))) => frame.to_string(),
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_add_and_remove_session() {
        let hub = Hub::new(2);
        let (session, _rx) = new_session("s1", "user/1");

        hub.add_session(session);
        assert_eq!(hub.size().await, 1);
        assert_eq!(hub.uniq_size().await, 1);

        hub.remove_session("s1").await;
        assert_eq!(hub.size().await, 0);
        assert_eq!(hub.uniq_size().await, 0);

        // Idempotent
        hub.remove_session("s1").await;
        assert_eq!(hub.size().await, 0);
    }

    #[tokio::test]
    async fn test_uniq_size_counts_distinct_identifiers() {
        let hub = Hub::new(2);
        let (a, _ra) = new_session("s1", "user/1");
        let (b, _rb) = new_session("s2", "user/1");
        let (c, _rc) = new_session("s3", "");

        hub.add_session(a);
        hub.add_session(b);
        hub.add_session(c);

        assert_eq!(hub.size().await, 3);
        // The anonymous session never lands in the identifier index
        assert_eq!(hub.uniq_size().await, 1);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_each_channel_once() {
        let hub = Hub::new(2);
        let (session, mut rx) = new_session("s1", "user/1");
        hub.add_session(session);

        hub.subscribe_session("s1", "room_1", "chat");
        hub.subscribe_session("s1", "room_1", "chat");
        hub.subscribe_session("s1", "room_1", "presence");

        hub.broadcast_message(StreamMessage {
            stream: "room_1".to_string(),
            data: r#"{"text":"hi"}"#.to_string(),
        });

        let first = next_frame(&mut rx).await;
        let second = next_frame(&mut rx).await;

        let mut identifiers: Vec<String> = [first, second]
            .iter()
            .map(|frame| {
                let value: serde_json::Value = serde_json::from_str(frame).unwrap();
                value["identifier"].as_str().unwrap().to_string()
            })
            .collect();
        identifiers.sort();
        assert_eq!(identifiers, vec!["chat", "presence"]);

        // The duplicate subscribe produced no extra delivery
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsubscribed_session_misses_broadcast() {
        let hub = Hub::new(2);
        let (a, mut rx_a) = new_session("s1", "");
        let (b, mut rx_b) = new_session("s2", "");
        hub.add_session(a);
        hub.add_session(b);

        hub.subscribe_session("s1", "room_1", "chat");
        hub.subscribe_session("s2", "room_1", "chat");
        hub.unsubscribe_session("s1", "room_1", "chat");

        hub.broadcast_message(StreamMessage {
            stream: "room_1".to_string(),
            data: "1".to_string(),
        });

        let frame = next_frame(&mut rx_b).await;
        assert!(frame.contains("\"message\":1"));
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_subscribe_unsubscribe_roundtrip_restores_state() {
        let hub = Hub::new(2);
        let (session, _rx) = new_session("s1", "");
        hub.add_session(session);

        assert_eq!(hub.streams_size().await, 0);

        hub.subscribe_session("s1", "room_1", "chat");
        assert_eq!(hub.streams_size().await, 1);

        hub.unsubscribe_session("s1", "room_1", "chat");
        assert_eq!(hub.streams_size().await, 0);

        // Unknown unsubscribe is a no-op
        hub.unsubscribe_session("s1", "room_1", "chat");
        assert_eq!(hub.streams_size().await, 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_channel_drops_all_its_streams() {
        let hub = Hub::new(2);
        let (session, _rx) = new_session("s1", "");
        hub.add_session(session);

        hub.subscribe_session("s1", "room_1", "chat");
        hub.subscribe_session("s1", "room_2", "chat");
        hub.subscribe_session("s1", "room_1", "presence");

        hub.unsubscribe_session_from_channel("s1", "chat");

        // room_2 had only the chat channel; room_1 keeps presence
        assert_eq!(hub.streams_size().await, 1);
    }

    #[tokio::test]
    async fn test_remove_session_drops_stream_memberships() {
        let hub = Hub::new(2);
        let (session, _rx) = new_session("s1", "");
        hub.add_session(session);

        hub.subscribe_session("s1", "room_1", "chat");
        hub.subscribe_session("s1", "room_2", "chat");

        hub.remove_session("s1").await;

        assert_eq!(hub.streams_size().await, 0);

        hub.broadcast_message(StreamMessage {
            stream: "room_1".to_string(),
            data: "1".to_string(),
        });
        assert_eq!(hub.size().await, 0);
    }

    #[tokio::test]
    async fn test_remote_disconnect_closes_matching_sessions() {
        let hub = Hub::new(2);
        let (a, mut rx_a) = new_session("s1", "user/42");
        let (b, mut rx_b) = new_session("s2", "user/42");
        let (c, rx_c) = new_session("s3", "user/7");
        hub.add_session(a.clone());
        hub.add_session(b.clone());
        hub.add_session(c.clone());

        hub.remote_disconnect(RemoteDisconnectMessage {
            identifier: "user/42".to_string(),
            reconnect: true,
        });

        for rx in [&mut rx_a, &mut rx_b] {
            let frame = next_frame(rx).await;
            assert_eq!(
                frame,
                r#"{"type":"disconnect","reason":"remote","reconnect":true}"#
            );
        }
        assert!(a.is_closed());
        assert!(b.is_closed());
        assert!(!c.is_closed());
        drop(rx_c);

        assert_eq!(hub.size().await, 1);
    }

    #[tokio::test]
    async fn test_disconnect_all() {
        let hub = Hub::new(2);
        let (a, mut rx_a) = new_session("s1", "");
        hub.add_session(a.clone());

        let notified = hub
            .disconnect_all(protocol::SERVER_RESTART_REASON, true, protocol::CLOSE_GOING_AWAY)
            .await;

        assert_eq!(notified, 1);
        let frame = next_frame(&mut rx_a).await;
        assert_eq!(
            frame,
            r#"{"type":"disconnect","reason":"server_restart","reconnect":true}"#
        );
        assert!(a.is_closed());
    }

    #[tokio::test]
    async fn test_operations_after_shutdown_are_dropped() {
        let hub = Hub::new(2);
        hub.shutdown().await;

        let (session, _rx) = new_session("s1", "");
        hub.add_session(session);
        assert_eq!(hub.size().await, 0);
    }
}
