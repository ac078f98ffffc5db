//! Token-based identification
//!
//! An [`Identifier`] resolves an identity token carried by the request
//! (header, query param, cookie — the implementation's choice) into an
//! identifiers string. [`IdentifiableController`] runs it ahead of the
//! wrapped controller so identified connections never pay the
//! authentication round-trip.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::controller::{CommandResult, ConnectResult, Controller};
use crate::protocol::{self, UNAUTHORIZED_REASON};
use crate::session::SessionEnv;

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("identity token rejected: {0}")]
    Rejected(String),
}

/// Resolves an identity token from the request env.
pub trait Identifier: Send + Sync {
    /// `Ok(Some(identifiers))` — token present and valid;
    /// `Ok(None)` — no token in the request;
    /// `Err` — token present but invalid.
    fn identify(&self, sid: &str, env: &SessionEnv) -> Result<Option<String>, IdentityError>;
}

/// Controller wrapper that authenticates via an [`Identifier`] first.
pub struct IdentifiableController {
    controller: Arc<dyn Controller>,
    identifier: Arc<dyn Identifier>,
    /// Reject tokenless connections instead of falling back to the
    /// wrapped controller.
    enforced: bool,
}

impl IdentifiableController {
    pub fn new(
        controller: Arc<dyn Controller>,
        identifier: Arc<dyn Identifier>,
        enforced: bool,
    ) -> Self {
        Self {
            controller,
            identifier,
            enforced,
        }
    }

    fn unauthorized() -> ConnectResult {
        ConnectResult::failure()
            .with_transmissions(vec![protocol::disconnect_message(UNAUTHORIZED_REASON, false)])
    }
}

#[async_trait]
impl Controller for IdentifiableController {
    async fn start(&self) -> anyhow::Result<()> {
        self.controller.start().await
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        self.controller.shutdown().await
    }

    async fn authenticate(&self, sid: &str, env: &SessionEnv) -> anyhow::Result<ConnectResult> {
        match self.identifier.identify(sid, env) {
            Ok(Some(identifiers)) => {
                debug!(sid, identifiers = %identifiers, "identified by token");
                Ok(ConnectResult::success(identifiers)
                    .with_transmissions(vec![protocol::welcome_message()]))
            }
            Ok(None) if self.enforced => Ok(Self::unauthorized()),
            Ok(None) => self.controller.authenticate(sid, env).await,
            Err(err) => {
                debug!(sid, error = %err, "identification failed");
                Ok(Self::unauthorized())
            }
        }
    }

    async fn subscribe(
        &self,
        sid: &str,
        env: &SessionEnv,
        identifiers: &str,
        channel: &str,
    ) -> anyhow::Result<CommandResult> {
        self.controller.subscribe(sid, env, identifiers, channel).await
    }

    async fn unsubscribe(
        &self,
        sid: &str,
        env: &SessionEnv,
        identifiers: &str,
        channel: &str,
    ) -> anyhow::Result<CommandResult> {
        self.controller
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
        self.controller
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
        self.controller
            .disconnect(sid, env, identifiers, channels)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::Status;
    use crate::test_support::MockController;

    struct HeaderIdentifier;

    impl Identifier for HeaderIdentifier {
        fn identify(&self, _sid: &str, env: &SessionEnv) -> Result<Option<String>, IdentityError> {
            match env.headers.get("x-user-token").map(String::as_str) {
                Some("valid") => Ok(Some("user/42".to_string())),
                Some(other) => Err(IdentityError::Rejected(other.to_string())),
                None => Ok(None),
            }
        }
    }

    fn env_with_token(token: Option<&str>) -> SessionEnv {
        let mut env = SessionEnv::default();
        if let Some(token) = token {
            env.headers
                .insert("x-user-token".to_string(), token.to_string());
        }
        env
    }

    #[tokio::test]
    async fn test_valid_token_short_circuits() {
        let inner = MockController::new();
        let controller =
            IdentifiableController::new(inner.clone(), Arc::new(HeaderIdentifier), false);

        let reply = controller
            .authenticate("s1", &env_with_token(Some("valid")))
            .await
            .unwrap();

        assert_eq!(reply.status, Status::Success);
        assert_eq!(reply.identifiers, "user/42");
        assert!(reply.transmissions[0].contains("welcome"));
        // The wrapped controller was never consulted
        assert!(inner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_token_rejects() {
        let inner = MockController::new();
        let controller =
            IdentifiableController::new(inner.clone(), Arc::new(HeaderIdentifier), false);

        let reply = controller
            .authenticate("s1", &env_with_token(Some("forged")))
            .await
            .unwrap();

        assert_eq!(reply.status, Status::Failure);
        assert!(reply.transmissions[0].contains(UNAUTHORIZED_REASON));
    }

    #[tokio::test]
    async fn test_missing_token_falls_back() {
        let inner = MockController::new();
        inner.push_connect(Ok(ConnectResult::success("user/7".to_string())));
        let controller =
            IdentifiableController::new(inner.clone(), Arc::new(HeaderIdentifier), false);

        let reply = controller
            .authenticate("s1", &env_with_token(None))
            .await
            .unwrap();

        assert_eq!(reply.identifiers, "user/7");
        assert_eq!(inner.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_token_enforced_rejects() {
        let inner = MockController::new();
        let controller =
            IdentifiableController::new(inner.clone(), Arc::new(HeaderIdentifier), true);

        let reply = controller
            .authenticate("s1", &env_with_token(None))
            .await
            .unwrap();

        assert_eq!(reply.status, Status::Failure);
        assert!(inner.calls().is_empty());
    }
}
