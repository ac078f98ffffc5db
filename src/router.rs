//! Channel router
//!
//! Dispatches subscribe/unsubscribe/perform calls to specialized
//! in-process controllers by the channel class named inside the
//! identifier JSON. Authentication and disconnect always go to the
//! default controller — channel classes only exist once a connection is
//! established.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::controller::{CommandResult, ConnectResult, Controller};
use crate::session::SessionEnv;

/// Extract the `"channel"` field from a channel identifier.
pub fn channel_class(identifier: &str) -> Option<String> {
    serde_json::from_str::<serde_json::Value>(identifier)
        .ok()?
        .get("channel")?
        .as_str()
        .map(str::to_string)
}

pub struct RouterController {
    routes: HashMap<String, Arc<dyn Controller>>,
    default: Arc<dyn Controller>,
}

impl RouterController {
    pub fn new(default: Arc<dyn Controller>) -> Self {
        Self {
            routes: HashMap::new(),
            default,
        }
    }

    /// Register a controller for a channel class. Replaces any previous
    /// route for the same class.
    pub fn route(&mut self, channel: &str, controller: Arc<dyn Controller>) {
        debug!(channel, "channel route registered");
        self.routes.insert(channel.to_string(), controller);
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn routes(&self) -> Vec<String> {
        let mut routes: Vec<String> = self.routes.keys().cloned().collect();
        routes.sort();
        routes
    }

    fn resolve(&self, identifier: &str) -> &Arc<dyn Controller> {
        channel_class(identifier)
            .and_then(|class| self.routes.get(&class))
            .unwrap_or(&self.default)
    }
}

#[async_trait]
impl Controller for RouterController {
    async fn start(&self) -> anyhow::Result<()> {
        self.default.start().await
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        self.default.shutdown().await
    }

    async fn authenticate(&self, sid: &str, env: &SessionEnv) -> anyhow::Result<ConnectResult> {
        self.default.authenticate(sid, env).await
    }

    async fn subscribe(
        &self,
        sid: &str,
        env: &SessionEnv,
        identifiers: &str,
        channel: &str,
    ) -> anyhow::Result<CommandResult> {
        self.resolve(channel)
            .subscribe(sid, env, identifiers, channel)
            .await
    }

    async fn unsubscribe(
        &self,
        sid: &str,
        env: &SessionEnv,
        identifiers: &str,
        channel: &str,
    ) -> anyhow::Result<CommandResult> {
        self.resolve(channel)
            .unsubscribe(sid, env, identifiers, channel)
            .await
    }

    async fn perform(
        &self,
        sid: &str,
        env: &SessionEnv,
        identifiers: &str,
        channel: &str,
        data: &str,
    ) -> anyhow::Result<CommandResult> {
        self.resolve(channel)
            .perform(sid, env, identifiers, channel, data)
            .await
    }

    async fn disconnect(
        &self,
        sid: &str,
        env: &SessionEnv,
        identifiers: &str,
        channels: &[String],
    ) -> anyhow::Result<()> {
        self.default
            .disconnect(sid, env, identifiers, channels)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::Status;
    use crate::test_support::MockController;

    #[test]
    fn test_channel_class_extraction() {
        assert_eq!(
            channel_class(r#"{"channel":"ChatChannel","room":"1"}"#),
            Some("ChatChannel".to_string())
        );
        assert_eq!(channel_class(r#"{"room":"1"}"#), None);
        assert_eq!(channel_class("not json"), None);
    }

    #[tokio::test]
    async fn test_routes_by_channel_class() {
        let default = MockController::new();
        let turbo = MockController::new();
        turbo.push_command(Ok(CommandResult::failure()));

        let mut router = RouterController::new(default.clone());
        router.route("Turbo::StreamsChannel", turbo.clone());

        assert!(!router.is_empty());
        assert_eq!(router.routes(), vec!["Turbo::StreamsChannel"]);

        let reply = router
            .subscribe(
                "s1",
                &SessionEnv::default(),
                "",
                r#"{"channel":"Turbo::StreamsChannel"}"#,
            )
            .await
            .unwrap();

        assert_eq!(reply.status, Status::Failure);
        assert_eq!(turbo.calls().len(), 1);
        assert!(default.calls().is_empty());
    }

    #[tokio::test]
    async fn test_unrouted_channel_goes_to_default() {
        let default = MockController::new();
        let mut router = RouterController::new(default.clone());
        router.route("Turbo::StreamsChannel", MockController::new());

        router
            .subscribe(
                "s1",
                &SessionEnv::default(),
                "",
                r#"{"channel":"ChatChannel"}"#,
            )
            .await
            .unwrap();

        assert_eq!(default.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_authenticate_always_hits_default() {
        let default = MockController::new();
        let mut router = RouterController::new(default.clone());
        router.route("Turbo::StreamsChannel", MockController::new());

        router
            .authenticate("s1", &SessionEnv::default())
            .await
            .unwrap();

        assert_eq!(default.calls().len(), 1);
    }
}
