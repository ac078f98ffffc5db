//! Application controller seam
//!
//! The gateway never implements channel logic itself: authentication,
//! subscription authorization and actions are delegated to a [`Controller`].
//! Implementations are injected at construction time — an RPC client, the
//! signed-streams fastlane, or the channel router that dispatches between
//! them.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::protocol::StreamMessage;
use crate::session::SessionEnv;

/// Application-level reply status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Transport succeeded but the application failed to process the call.
    Error,
    Success,
    /// The application rejected the call (auth failure, subscription reject).
    Failure,
}

/// Effects shared by connect and command replies.
#[derive(Debug, Clone, Default)]
pub struct CallResult {
    pub transmissions: Vec<String>,
    pub broadcasts: Vec<StreamMessage>,
    pub cstate: Option<HashMap<String, String>>,
}

/// Reply to an authentication call.
#[derive(Debug, Clone)]
pub struct ConnectResult {
    pub status: Status,
    pub identifiers: String,
    pub transmissions: Vec<String>,
    pub broadcasts: Vec<StreamMessage>,
    pub cstate: Option<HashMap<String, String>>,
}

impl ConnectResult {
    pub fn success(identifiers: String) -> Self {
        Self {
            status: Status::Success,
            identifiers,
            transmissions: Vec::new(),
            broadcasts: Vec::new(),
            cstate: None,
        }
    }

    pub fn failure() -> Self {
        Self {
            status: Status::Failure,
            identifiers: String::new(),
            transmissions: Vec::new(),
            broadcasts: Vec::new(),
            cstate: None,
        }
    }

    pub fn with_transmissions(mut self, transmissions: Vec<String>) -> Self {
        self.transmissions = transmissions;
        self
    }

    pub fn to_call_result(&self) -> CallResult {
        CallResult {
            transmissions: self.transmissions.clone(),
            broadcasts: self.broadcasts.clone(),
            cstate: self.cstate.clone(),
        }
    }
}

/// Reply to a subscribe/unsubscribe/perform call.
///
/// All effect fields are optional and may be present independent of
/// status; the node applies them in a fixed order (stopped streams, stream
/// additions, state patches, transmissions, broadcasts).
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub status: Status,
    pub disconnect: bool,
    pub stop_all_streams: bool,
    pub streams: Vec<String>,
    pub stopped_streams: Vec<String>,
    pub transmissions: Vec<String>,
    pub broadcasts: Vec<StreamMessage>,
    pub cstate: Option<HashMap<String, String>>,
    pub istate: Option<HashMap<String, String>>,
}

impl CommandResult {
    pub fn success() -> Self {
        Self {
            status: Status::Success,
            disconnect: false,
            stop_all_streams: false,
            streams: Vec::new(),
            stopped_streams: Vec::new(),
            transmissions: Vec::new(),
            broadcasts: Vec::new(),
            cstate: None,
            istate: None,
        }
    }

    pub fn failure() -> Self {
        Self {
            status: Status::Failure,
            ..Self::success()
        }
    }

    pub fn error() -> Self {
        Self {
            status: Status::Error,
            ..Self::success()
        }
    }

    pub fn with_streams(mut self, streams: Vec<String>) -> Self {
        self.streams = streams;
        self
    }

    pub fn with_transmissions(mut self, transmissions: Vec<String>) -> Self {
        self.transmissions = transmissions;
        self
    }

    pub fn to_call_result(&self) -> CallResult {
        CallResult {
            transmissions: self.transmissions.clone(),
            broadcasts: self.broadcasts.clone(),
            cstate: self.cstate.clone(),
        }
    }
}

/// The application the gateway serves.
///
/// Errors returned from these methods are transport failures (the
/// application could not be reached); application-level failures are
/// expressed through the reply status.
#[async_trait]
pub trait Controller: Send + Sync {
    async fn start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn authenticate(&self, sid: &str, env: &SessionEnv) -> anyhow::Result<ConnectResult>;

    async fn subscribe(
        &self,
        sid: &str,
        env: &SessionEnv,
        identifiers: &str,
        channel: &str,
    ) -> anyhow::Result<CommandResult>;

    async fn unsubscribe(
        &self,
        sid: &str,
        env: &SessionEnv,
        identifiers: &str,
        channel: &str,
    ) -> anyhow::Result<CommandResult>;

    async fn perform(
        &self,
        sid: &str,
        env: &SessionEnv,
        identifiers: &str,
        channel: &str,
        data: &str,
    ) -> anyhow::Result<CommandResult>;

    async fn disconnect(
        &self,
        sid: &str,
        env: &SessionEnv,
        identifiers: &str,
        channels: &[String],
    ) -> anyhow::Result<()>;
}
