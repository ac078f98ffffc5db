//! Shared test doubles: a scripted controller and channel-backed
//! connection halves.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::controller::{CommandResult, ConnectResult, Controller};
use crate::metrics::Metrics;
use crate::node::register_metrics;
use crate::session::{ConnectionError, ConnectionReader, ConnectionWriter, SessionEnv};

/// Metrics registry with the full node metric surface registered.
pub fn new_metrics() -> Arc<Metrics> {
    let metrics = Metrics::new();
    register_metrics(&metrics);
    metrics
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerCall {
    Authenticate { sid: String },
    Subscribe { sid: String, channel: String },
    Unsubscribe { sid: String, channel: String },
    Perform { sid: String, channel: String, data: String },
    Disconnect { sid: String, channels: Vec<String> },
}

/// Controller double: records calls and replays scripted replies.
/// Unscripted calls answer with plain success.
#[derive(Default)]
pub struct MockController {
    calls: Mutex<Vec<ControllerCall>>,
    connect_replies: Mutex<VecDeque<anyhow::Result<ConnectResult>>>,
    command_replies: Mutex<VecDeque<anyhow::Result<CommandResult>>>,
}

impl MockController {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_connect(&self, reply: anyhow::Result<ConnectResult>) {
        self.connect_replies.lock().unwrap().push_back(reply);
    }

    pub fn push_command(&self, reply: anyhow::Result<CommandResult>) {
        self.command_replies.lock().unwrap().push_back(reply);
    }

    pub fn calls(&self) -> Vec<ControllerCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn perform_calls(&self) -> usize {
        self.calls()
            .into_iter()
            .filter(|call| matches!(call, ControllerCall::Perform { .. }))
            .count()
    }

    fn record(&self, call: ControllerCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn next_connect(&self) -> anyhow::Result<ConnectResult> {
        self.connect_replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(ConnectResult::success(String::new())))
    }

    fn next_command(&self) -> anyhow::Result<CommandResult> {
        self.command_replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(CommandResult::success()))
    }
}

#[async_trait]
impl Controller for MockController {
    async fn authenticate(&self, sid: &str, _env: &SessionEnv) -> anyhow::Result<ConnectResult> {
        self.record(ControllerCall::Authenticate {
            sid: sid.to_string(),
        });
        self.next_connect()
    }

    async fn subscribe(
        &self,
        sid: &str,
        _env: &SessionEnv,
        _identifiers: &str,
        channel: &str,
    ) -> anyhow::Result<CommandResult> {
        self.record(ControllerCall::Subscribe {
            sid: sid.to_string(),
            channel: channel.to_string(),
        });
        self.next_command()
    }

    async fn unsubscribe(
        &self,
        sid: &str,
        _env: &SessionEnv,
        _identifiers: &str,
        channel: &str,
    ) -> anyhow::Result<CommandResult> {
        self.record(ControllerCall::Unsubscribe {
            sid: sid.to_string(),
            channel: channel.to_string(),
        });
        self.next_command()
    }

    async fn perform(
        &self,
        sid: &str,
        _env: &SessionEnv,
        _identifiers: &str,
        channel: &str,
        data: &str,
    ) -> anyhow::Result<CommandResult> {
        self.record(ControllerCall::Perform {
            sid: sid.to_string(),
            channel: channel.to_string(),
            data: data.to_string(),
        });
        self.next_command()
    }

    async fn disconnect(
        &self,
        sid: &str,
        _env: &SessionEnv,
        _identifiers: &str,
        channels: &[String],
    ) -> anyhow::Result<()> {
        self.record(ControllerCall::Disconnect {
            sid: sid.to_string(),
            channels: channels.to_vec(),
        });
        Ok(())
    }
}

/// Reader double: replays a fixed list of frames, then reports EOF.
pub struct ScriptedReader {
    frames: VecDeque<Vec<u8>>,
}

impl ScriptedReader {
    pub fn new(frames: Vec<Vec<u8>>) -> Self {
        Self {
            frames: frames.into(),
        }
    }
}

#[async_trait]
impl ConnectionReader for ScriptedReader {
    async fn read(&mut self) -> Result<Option<Vec<u8>>, ConnectionError> {
        Ok(self.frames.pop_front())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedFrame {
    Data(String),
    Close { code: u16, reason: String },
}

/// Writer double: forwards everything written to a channel.
pub struct RecordingWriter {
    tx: mpsc::UnboundedSender<RecordedFrame>,
}

impl RecordingWriter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RecordedFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ConnectionWriter for RecordingWriter {
    async fn write(&mut self, frame: &[u8]) -> Result<(), ConnectionError> {
        self.tx
            .send(RecordedFrame::Data(
                String::from_utf8_lossy(frame).to_string(),
            ))
            .map_err(|_| ConnectionError("recording channel closed".to_string()))
    }

    async fn close(&mut self, code: u16, reason: &str) {
        let _ = self.tx.send(RecordedFrame::Close {
            code,
            reason: reason.to_string(),
        });
    }
}
