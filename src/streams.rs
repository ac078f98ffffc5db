//! Signed streams fastlane
//!
//! Subscriptions to signed (or explicitly public) streams are resolved
//! in-process, without an application round-trip. Stream names are
//! verified with Rails' MessageVerifier algorithm:
//!
//! 1. Encode: Base64(JSON(stream_name))
//! 2. Digest: HMAC-SHA256 over the encoded part
//! 3. Format: `${encoded}--${digest_hex}`
//!
//! Two channel classes are supported: `$pubsub` (public or signed stream
//! names) and `Turbo::StreamsChannel`.

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::controller::{CommandResult, ConnectResult, Controller};
use crate::protocol;
use crate::session::SessionEnv;

type HmacSha256 = Hmac<Sha256>;

/// Channel class for ad-hoc signed/public stream subscriptions.
pub const PUBSUB_CHANNEL: &str = "$pubsub";
/// Channel class used by Turbo Streams.
pub const TURBO_CHANNEL: &str = "Turbo::StreamsChannel";

/// Rails-compatible HMAC message verifier.
pub struct MessageVerifier {
    key: Vec<u8>,
}

impl MessageVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            key: secret.as_bytes().to_vec(),
        }
    }

    /// Verify a signed stream name and return the embedded stream.
    pub fn verify(&self, signed: &str) -> Result<String, VerifyError> {
        let (encoded, signature) = signed
            .split_once("--")
            .ok_or(VerifyError::InvalidFormat)?;
        if signature.contains("--") {
            return Err(VerifyError::InvalidFormat);
        }

        let mut mac =
            HmacSha256::new_from_slice(&self.key).map_err(|_| VerifyError::InvalidKey)?;
        mac.update(encoded.as_bytes());
        let expected = hex::encode(mac.finalize().into_bytes());

        if !bool::from(expected.as_bytes().ct_eq(signature.as_bytes())) {
            return Err(VerifyError::InvalidSignature);
        }

        let json = String::from_utf8(BASE64.decode(encoded)?)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Produce a signed stream name the way Rails would.
    pub fn sign(&self, stream: &str) -> Result<String, VerifyError> {
        let encoded = BASE64.encode(serde_json::to_string(stream)?.as_bytes());

        let mut mac =
            HmacSha256::new_from_slice(&self.key).map_err(|_| VerifyError::InvalidKey)?;
        mac.update(encoded.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());

        Ok(format!("{}--{}", encoded, signature))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("invalid signed stream format")]
    InvalidFormat,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("invalid key")]
    InvalidKey,
    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("utf8 error: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Deserialize)]
struct PubSubIdentifier {
    #[serde(default)]
    stream_name: Option<String>,
    #[serde(default)]
    signed_stream_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TurboIdentifier {
    signed_stream_name: String,
}

fn confirm(channel: &str, stream: String) -> CommandResult {
    CommandResult::success()
        .with_streams(vec![stream])
        .with_transmissions(vec![protocol::confirmation_message(channel)])
}

fn reject(channel: &str) -> CommandResult {
    CommandResult::failure().with_transmissions(vec![protocol::rejection_message(channel)])
}

/// `$pubsub` fastlane controller.
///
/// Doubles as the default controller in standalone deployments: every
/// connection is accepted and identified by its sid, channel subscriptions
/// are granted only for verifiable (or public) streams.
pub struct StreamsController {
    verifier: Option<MessageVerifier>,
    public: bool,
}

impl StreamsController {
    pub fn new(secret: Option<&str>, public: bool) -> Self {
        Self {
            verifier: secret.map(MessageVerifier::new),
            public,
        }
    }

    fn resolve(&self, channel: &str) -> Result<String, StreamError> {
        let request: PubSubIdentifier =
            serde_json::from_str(channel).map_err(StreamError::Identifier)?;

        if let Some(stream) = request.stream_name {
            if !self.public {
                return Err(StreamError::PublicNotAllowed);
            }
            debug!(stream = %stream, "public stream subscription");
            return Ok(stream);
        }

        if let Some(signed) = request.signed_stream_name {
            let verifier = self.verifier.as_ref().ok_or(StreamError::NoSecret)?;
            let stream = verifier.verify(&signed)?;
            debug!(stream = %stream, "verified signed stream");
            return Ok(stream);
        }

        Err(StreamError::MissingStream)
    }
}

#[async_trait]
impl Controller for StreamsController {
    async fn authenticate(&self, sid: &str, _env: &SessionEnv) -> anyhow::Result<ConnectResult> {
        Ok(ConnectResult::success(sid.to_string())
            .with_transmissions(vec![protocol::welcome_message()]))
    }

    async fn subscribe(
        &self,
        sid: &str,
        _env: &SessionEnv,
        _identifiers: &str,
        channel: &str,
    ) -> anyhow::Result<CommandResult> {
        match self.resolve(channel) {
            Ok(stream) => Ok(confirm(channel, stream)),
            Err(err) => {
                debug!(sid, channel, error = %err, "stream subscription rejected");
                Ok(reject(channel))
            }
        }
    }

    async fn unsubscribe(
        &self,
        _sid: &str,
        _env: &SessionEnv,
        _identifiers: &str,
        _channel: &str,
    ) -> anyhow::Result<CommandResult> {
        let mut reply = CommandResult::success();
        reply.stop_all_streams = true;
        Ok(reply)
    }

    async fn perform(
        &self,
        _sid: &str,
        _env: &SessionEnv,
        _identifiers: &str,
        _channel: &str,
        _data: &str,
    ) -> anyhow::Result<CommandResult> {
        // Stream channels carry no actions
        Ok(CommandResult::error())
    }

    async fn disconnect(
        &self,
        _sid: &str,
        _env: &SessionEnv,
        _identifiers: &str,
        _channels: &[String],
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Turbo Streams fastlane controller. Subscribe-only; always routed, so
/// it never sees connection-level calls.
pub struct TurboStreamsController {
    verifier: MessageVerifier,
}

impl TurboStreamsController {
    pub fn new(key: &str) -> Self {
        Self {
            verifier: MessageVerifier::new(key),
        }
    }
}

#[async_trait]
impl Controller for TurboStreamsController {
    async fn authenticate(&self, _sid: &str, _env: &SessionEnv) -> anyhow::Result<ConnectResult> {
        anyhow::bail!("turbo streams controller does not authenticate connections")
    }

    async fn subscribe(
        &self,
        sid: &str,
        _env: &SessionEnv,
        _identifiers: &str,
        channel: &str,
    ) -> anyhow::Result<CommandResult> {
        let parsed: Result<TurboIdentifier, _> = serde_json::from_str(channel);

        match parsed.map_err(StreamError::Identifier).and_then(|request| {
            self.verifier
                .verify(&request.signed_stream_name)
                .map_err(StreamError::Verify)
        }) {
            Ok(stream) => {
                debug!(stream = %stream, "verified turbo stream");
                Ok(confirm(channel, stream))
            }
            Err(err) => {
                debug!(sid, channel, error = %err, "turbo subscription rejected");
                Ok(reject(channel))
            }
        }
    }

    async fn unsubscribe(
        &self,
        _sid: &str,
        _env: &SessionEnv,
        _identifiers: &str,
        _channel: &str,
    ) -> anyhow::Result<CommandResult> {
        let mut reply = CommandResult::success();
        reply.stop_all_streams = true;
        Ok(reply)
    }

    async fn perform(
        &self,
        _sid: &str,
        _env: &SessionEnv,
        _identifiers: &str,
        _channel: &str,
        _data: &str,
    ) -> anyhow::Result<CommandResult> {
        Ok(CommandResult::error())
    }

    async fn disconnect(
        &self,
        _sid: &str,
        _env: &SessionEnv,
        _identifiers: &str,
        _channels: &[String],
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
enum StreamError {
    #[error("malformed channel identifier: {0}")]
    Identifier(#[source] serde_json::Error),
    #[error("missing stream name or signed stream")]
    MissingStream,
    #[error("public streams are not allowed")]
    PublicNotAllowed,
    #[error("no streams secret configured")]
    NoSecret,
    #[error(transparent)]
    Verify(#[from] VerifyError),
}
