//! Application node
//!
//! Ties the hub, the controller and the disconnector together. Hosts the
//! per-command state machine (subscribe/unsubscribe/perform), the reply
//! application logic, the pub/sub entry point and the graceful shutdown
//! protocol.

use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::controller::{CallResult, CommandResult, ConnectResult, Controller, Status};
use crate::disconnect::{DisconnectEntry, Disconnector};
use crate::hub::Hub;
use crate::metrics::Metrics;
use crate::protocol::{
    self, CLOSE_GOING_AWAY, CLOSE_INTERNAL_SERVER_ERR, CLOSE_NORMAL, Message, PubSubMessage,
    RemoteDisconnectMessage, SERVER_RESTART_REASON, StreamMessage,
};
use crate::session::Session;

pub(crate) const METRICS_GOROUTINES: &str = "goroutines_num";
pub(crate) const METRICS_MEM_SYS: &str = "mem_sys_bytes";
pub(crate) const METRICS_CLIENTS_NUM: &str = "clients_num";
pub(crate) const METRICS_UNIQ_CLIENTS_NUM: &str = "clients_uniq_num";
pub(crate) const METRICS_STREAMS_NUM: &str = "broadcast_streams_num";
pub(crate) const METRICS_DISCONNECT_QUEUE: &str = "disconnect_queue_size";

pub(crate) const METRICS_FAILED_AUTHS: &str = "failed_auths_total";
pub(crate) const METRICS_CLIENT_MSG: &str = "client_msg_total";
pub(crate) const METRICS_FAILED_CLIENT_MSG: &str = "failed_client_msg_total";
pub(crate) const METRICS_BROADCAST_MSG: &str = "broadcast_msg_total";
pub(crate) const METRICS_FAILED_BROADCAST_MSG: &str = "failed_broadcast_msg_total";

pub(crate) const METRICS_SENT_MSG: &str = "server_msg_total";
pub(crate) const METRICS_FAILED_SENT_MSG: &str = "failed_server_msg_total";

pub(crate) const METRICS_DATA_SENT: &str = "data_sent_total";
pub(crate) const METRICS_DATA_RCVD: &str = "data_rcvd_total";

/// Command handling errors. Protocol-level errors keep the connection
/// alive; the read pump only logs them.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("already subscribed to {0}")]
    AlreadySubscribed(String),
    #[error("unknown subscription {0}")]
    UnknownSubscription(String),
    #[error("perform data must be a string, got {0}")]
    InvalidPerformData(String),
    #[error(transparent)]
    Controller(#[from] anyhow::Error),
    #[error("already shut down")]
    AlreadyShutDown,
}

pub struct Node {
    config: Arc<Config>,
    metrics: Arc<Metrics>,
    hub: Hub,
    controller: Arc<dyn Controller>,
    disconnector: OnceLock<Arc<dyn Disconnector>>,
    shutdown_tx: watch::Sender<bool>,
    closed: StdMutex<bool>,
}

impl Node {
    pub fn new(
        controller: Arc<dyn Controller>,
        metrics: Arc<Metrics>,
        config: Arc<Config>,
    ) -> Arc<Self> {
        register_metrics(&metrics);

        let hub = Hub::new(config.hub_gopool_size);
        let (shutdown_tx, _) = watch::channel(false);

        Arc::new(Self {
            config,
            metrics,
            hub,
            controller,
            disconnector: OnceLock::new(),
            shutdown_tx,
            closed: StdMutex::new(false),
        })
    }

    /// Spawn the background stats collector.
    pub fn start(self: &Arc<Self>) {
        self.spawn_stats_collector();
    }

    pub fn set_disconnector(&self, disconnector: Arc<dyn Disconnector>) {
        if self.disconnector.set(disconnector).is_err() {
            warn!("disconnector is already set");
        }
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Receiver flipping to `true` once shutdown begins.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Dispatch a decoded client command.
    pub async fn handle_command(
        &self,
        session: &Arc<Session>,
        msg: Message,
    ) -> Result<(), NodeError> {
        debug!(sid = %session.sid(), command = %msg.command, "incoming command");

        match msg.command.as_str() {
            "subscribe" => self.subscribe(session, &msg).await.map(|_| ()),
            "unsubscribe" => self.unsubscribe(session, &msg).await.map(|_| ()),
            "message" => self.perform(session, &msg).await.map(|_| ()),
            other => Err(NodeError::UnknownCommand(other.to_string())),
        }
    }

    /// Parse a raw pub/sub payload and apply it.
    pub fn handle_pubsub(&self, raw: &[u8]) {
        match protocol::parse_pubsub(raw) {
            Ok(PubSubMessage::Stream(message)) => self.broadcast(message),
            Ok(PubSubMessage::Disconnect(message)) => self.remote_disconnect(message),
            Err(err) => {
                self.metrics.counter_increment(METRICS_FAILED_BROADCAST_MSG);
                warn!(
                    error = %err,
                    payload = %String::from_utf8_lossy(raw),
                    "failed to parse pub/sub message"
                );
            }
        }
    }

    /// Authenticate the session against the application. On success the
    /// session joins the hub; on failure reply transmissions are still
    /// delivered before the connection closes.
    pub async fn authenticate(
        &self,
        session: &Arc<Session>,
    ) -> Result<ConnectResult, NodeError> {
        let env = session.env_snapshot().await;

        let reply = match self.controller.authenticate(session.sid(), &env).await {
            Ok(reply) => reply,
            Err(err) => {
                error!(sid = %session.sid(), error = %err, "authentication transport error");
                session.disconnect("Auth Error", CLOSE_INTERNAL_SERVER_ERR);
                return Err(NodeError::Controller(err));
            }
        };

        match reply.status {
            Status::Success => {
                session.set_identifiers(reply.identifiers.clone());
                session.mark_connected();
                self.hub.add_session(Arc::clone(session));
                debug!(sid = %session.sid(), identifiers = %reply.identifiers, "authenticated");
            }
            Status::Failure => {
                self.metrics.counter_increment(METRICS_FAILED_AUTHS);
            }
            Status::Error => {
                error!(sid = %session.sid(), "authentication failed on the application side");
            }
        }

        self.handle_call_reply(session, &reply.to_call_result()).await;

        if reply.status != Status::Success {
            session.disconnect("Auth Failed", CLOSE_NORMAL);
        }

        Ok(reply)
    }

    /// Subscribe the session to a channel.
    pub async fn subscribe(
        &self,
        session: &Arc<Session>,
        msg: &Message,
    ) -> Result<CommandResult, NodeError> {
        let env = {
            let state = session.state.lock().await;
            if state.subscriptions.has_channel(&msg.identifier) {
                return Err(NodeError::AlreadySubscribed(msg.identifier.clone()));
            }
            state.env.clone()
        };

        let identifiers = session.identifiers();

        let reply = self
            .controller
            .subscribe(session.sid(), &env, &identifiers, &msg.identifier)
            .await
            .map_err(|err| {
                error!(sid = %session.sid(), channel = %msg.identifier, error = %err, "subscribe error");
                NodeError::Controller(err)
            })?;

        match reply.status {
            Status::Success => {
                let mut state = session.state.lock().await;
                state.subscriptions.add_channel(msg.identifier.clone());
                debug!(sid = %session.sid(), channel = %msg.identifier, "subscribed");
            }
            Status::Error => {
                error!(sid = %session.sid(), channel = %msg.identifier, "subscribe rejected with error");
            }
            Status::Failure => {}
        }

        self.handle_command_reply(session, &msg.identifier, &reply)
            .await;

        Ok(reply)
    }

    /// Unsubscribe the session from a channel.
    pub async fn unsubscribe(
        &self,
        session: &Arc<Session>,
        msg: &Message,
    ) -> Result<CommandResult, NodeError> {
        let env = {
            let state = session.state.lock().await;
            if !state.subscriptions.has_channel(&msg.identifier) {
                return Err(NodeError::UnknownSubscription(msg.identifier.clone()));
            }
            state.env.clone()
        };

        let identifiers = session.identifiers();

        let mut reply = self
            .controller
            .unsubscribe(session.sid(), &env, &identifiers, &msg.identifier)
            .await
            .map_err(|err| {
                error!(sid = %session.sid(), channel = %msg.identifier, error = %err, "unsubscribe error");
                NodeError::Controller(err)
            })?;

        if reply.status == Status::Error {
            error!(sid = %session.sid(), channel = %msg.identifier, "unsubscribe rejected with error");
        } else {
            // Always drop every stream of the channel, whatever the reply says
            reply.stop_all_streams = true;

            let mut state = session.state.lock().await;
            state.subscriptions.remove_channel(&msg.identifier);
            debug!(sid = %session.sid(), channel = %msg.identifier, "unsubscribed");
        }

        self.handle_command_reply(session, &msg.identifier, &reply)
            .await;

        Ok(reply)
    }

    /// Execute a channel action.
    pub async fn perform(
        &self,
        session: &Arc<Session>,
        msg: &Message,
    ) -> Result<CommandResult, NodeError> {
        let data = msg
            .data
            .as_str()
            .ok_or_else(|| NodeError::InvalidPerformData(msg.data.to_string()))?;

        let env = {
            let state = session.state.lock().await;
            if !state.subscriptions.has_channel(&msg.identifier) {
                return Err(NodeError::UnknownSubscription(msg.identifier.clone()));
            }
            state.env.clone()
        };

        let identifiers = session.identifiers();

        let reply = self
            .controller
            .perform(session.sid(), &env, &identifiers, &msg.identifier, data)
            .await
            .map_err(|err| {
                error!(sid = %session.sid(), channel = %msg.identifier, error = %err, "perform error");
                NodeError::Controller(err)
            })?;

        if reply.status == Status::Error {
            error!(sid = %session.sid(), channel = %msg.identifier, "perform rejected with error");
        }

        self.handle_command_reply(session, &msg.identifier, &reply)
            .await;

        Ok(reply)
    }

    /// Fan a stream message out to its subscribers.
    ///
    /// Broadcasts carried in controller replies loop back through this
    /// method; nothing bounds that recursion, the application is trusted
    /// not to broadcast in cycles.
    pub fn broadcast(&self, message: StreamMessage) {
        self.metrics.counter_increment(METRICS_BROADCAST_MSG);
        debug!(stream = %message.stream, "incoming broadcast");
        self.hub.broadcast_message(message);
    }

    /// Close every session bound to the identifiers string.
    pub fn remote_disconnect(&self, message: RemoteDisconnectMessage) {
        self.metrics.counter_increment(METRICS_BROADCAST_MSG);
        debug!(identifier = %message.identifier, "incoming remote disconnect");
        self.hub.remote_disconnect(message);
    }

    /// Unregister a closed session and schedule its Disconnect callback.
    pub async fn disconnect(&self, session: &Arc<Session>) -> anyhow::Result<()> {
        self.hub.remove_session_later(session.sid());

        match self.disconnector.get() {
            Some(disconnector) => disconnector.enqueue(Arc::clone(session)).await,
            None => Ok(()),
        }
    }

    /// Invoke the application Disconnect callback for a queued entry.
    pub async fn disconnect_now(&self, entry: &DisconnectEntry) {
        debug!(
            sid = %entry.sid,
            identifiers = %entry.identifiers,
            channels = entry.channels.len(),
            "disconnect"
        );

        if let Err(err) = self
            .controller
            .disconnect(&entry.sid, &entry.env, &entry.identifiers, &entry.channels)
            .await
        {
            error!(sid = %entry.sid, error = %err, "disconnect error");
        }
    }

    /// Stop every subsystem: notify sessions, drain the hub, flush the
    /// disconnect queue, shut the controller down. Idempotent — a second
    /// call returns an error.
    pub async fn shutdown(&self) -> Result<(), NodeError> {
        {
            let mut closed = self.closed.lock().unwrap();
            if *closed {
                return Err(NodeError::AlreadyShutDown);
            }
            *closed = true;
        }

        let _ = self.shutdown_tx.send(true);

        let active = self.hub.size().await;
        if active > 0 {
            info!(active, "closing active connections");
            self.hub
                .disconnect_all(SERVER_RESTART_REASON, true, CLOSE_GOING_AWAY)
                .await;

            // Let write pumps flush and closed sessions reach the
            // disconnect queue before it drains.
            tokio::time::sleep(Duration::from_secs(1)).await;
            info!("all active connections closed");
        }

        self.hub.shutdown().await;

        if let Some(disconnector) = self.disconnector.get()
            && let Err(err) = disconnector.shutdown().await
        {
            warn!(error = %err, "disconnector shutdown failed");
        }

        if let Err(err) = self.controller.shutdown().await {
            warn!(error = %err, "controller shutdown failed");
        }

        Ok(())
    }

    /// Apply command-scoped reply effects, in order: stopped streams,
    /// stream additions, channel state, then the call-level effects.
    async fn handle_command_reply(
        &self,
        session: &Arc<Session>,
        identifier: &str,
        reply: &CommandResult,
    ) {
        let sid = session.sid();

        {
            let mut state = session.state.lock().await;

            if reply.stop_all_streams {
                self.hub.unsubscribe_session_from_channel(sid, identifier);
                state.subscriptions.remove_channel_streams(identifier);
            } else {
                for stream in &reply.stopped_streams {
                    self.hub.unsubscribe_session(sid, stream, identifier);
                    state.subscriptions.remove_channel_stream(identifier, stream);
                }
            }

            for stream in &reply.streams {
                self.hub.subscribe_session(sid, stream, identifier);
                state
                    .subscriptions
                    .add_channel_stream(identifier, stream.clone());
            }

            if let Some(istate) = &reply.istate {
                state.env.merge_channel_state(identifier, istate);
            }
        }

        self.handle_call_reply(session, &reply.to_call_result())
            .await;

        if reply.disconnect {
            session.disconnect("Command Failed", CLOSE_INTERNAL_SERVER_ERR);
        }
    }

    /// Apply call-level reply effects: connection state, transmissions,
    /// then broadcasts.
    async fn handle_call_reply(&self, session: &Arc<Session>, reply: &CallResult) {
        if let Some(cstate) = &reply.cstate {
            let mut state = session.state.lock().await;
            state.env.merge_connection_state(cstate);
        }

        for transmission in &reply.transmissions {
            session.transmit(transmission.clone());
        }

        for broadcast in &reply.broadcasts {
            self.broadcast(broadcast.clone());
        }
    }

    fn spawn_stats_collector(self: &Arc<Self>) {
        let node = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let period = Duration::from_secs(node.config.stats_refresh_interval.max(1));

            loop {
                tokio::select! {
                    _ = tokio::time::sleep(period) => node.collect_stats_once().await,
                    _ = shutdown.changed() => return,
                }
            }
        });
    }

    async fn collect_stats_once(&self) {
        self.metrics.gauge_set(METRICS_GOROUTINES, alive_tasks());
        self.metrics.gauge_set(METRICS_MEM_SYS, memory_usage_bytes());

        let sizes = self.hub.sizes().await;
        self.metrics.gauge_set(METRICS_CLIENTS_NUM, sizes.sessions as u64);
        self.metrics.gauge_set(METRICS_UNIQ_CLIENTS_NUM, sizes.uniq as u64);
        self.metrics.gauge_set(METRICS_STREAMS_NUM, sizes.streams as u64);

        let queue_size = self
            .disconnector
            .get()
            .map(|disconnector| disconnector.size())
            .unwrap_or(0);
        self.metrics
            .gauge_set(METRICS_DISCONNECT_QUEUE, queue_size as u64);
    }
}

impl crate::pubsub::Handler for Node {
    fn handle_pubsub(&self, raw: &[u8]) {
        Node::handle_pubsub(self, raw);
    }
}

fn alive_tasks() -> u64 {
    tokio::runtime::Handle::try_current()
        .map(|handle| handle.metrics().num_alive_tasks() as u64)
        .unwrap_or(0)
}

#[cfg(target_os = "linux")]
fn memory_usage_bytes() -> u64 {
    std::fs::read_to_string("/proc/self/statm")
        .ok()
        .and_then(|statm| {
            statm
                .split_whitespace()
                .next()
                .and_then(|pages| pages.parse::<u64>().ok())
        })
        .map(|pages| pages * 4096)
        .unwrap_or(0)
}

#[cfg(not(target_os = "linux"))]
fn memory_usage_bytes() -> u64 {
    0
}

pub(crate) fn register_metrics(metrics: &Metrics) {
    metrics.register_gauge(METRICS_GOROUTINES, "The number of alive async tasks");
    metrics.register_gauge(
        METRICS_MEM_SYS,
        "The total bytes of memory obtained from the OS",
    );
    metrics.register_gauge(METRICS_CLIENTS_NUM, "The number of active clients");
    metrics.register_gauge(
        METRICS_UNIQ_CLIENTS_NUM,
        "The number of unique clients (with respect to connection identifiers)",
    );
    metrics.register_gauge(
        METRICS_STREAMS_NUM,
        "The number of active broadcasting streams",
    );
    metrics.register_gauge(METRICS_DISCONNECT_QUEUE, "The size of delayed disconnect");

    metrics.register_counter(
        METRICS_FAILED_AUTHS,
        "The total number of failed authentication attempts",
    );
    metrics.register_counter(
        METRICS_CLIENT_MSG,
        "The total number of received messages from clients",
    );
    metrics.register_counter(
        METRICS_FAILED_CLIENT_MSG,
        "The total number of unrecognized messages received from clients",
    );
    metrics.register_counter(
        METRICS_BROADCAST_MSG,
        "The total number of messages received through PubSub (for broadcast)",
    );
    metrics.register_counter(
        METRICS_FAILED_BROADCAST_MSG,
        "The total number of unrecognized messages received through PubSub",
    );
    metrics.register_counter(
        METRICS_SENT_MSG,
        "The total number of messages sent to clients",
    );
    metrics.register_counter(
        METRICS_FAILED_SENT_MSG,
        "The total number of messages failed to send to clients",
    );
    metrics.register_counter(METRICS_DATA_SENT, "The total amount of bytes sent to clients");
    metrics.register_counter(
        METRICS_DATA_RCVD,
        "The total amount of bytes received from clients",
    );
}
