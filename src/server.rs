//! HTTP/WebSocket front end
//!
//! One axum router serves the WebSocket endpoints and the health check.
//! An upgraded socket turns into a session: split the socket, start the
//! write pump, authenticate, then run the read pump until either side
//! goes away.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use axum::extract::State;
use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::http::{HeaderMap, Uri};
use axum::response::Response;
use axum::routing::get;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tracing::{debug, info};
use uuid::Uuid;

use crate::controller::Status;
use crate::node::Node;
use crate::protocol::{self, CLOSE_NORMAL};
use crate::session::{ConnectionError, ConnectionReader, ConnectionWriter, Session, SessionEnv};

/// Bind the configured address and serve until the node shuts down.
pub async fn run(node: Arc<Node>) -> anyhow::Result<()> {
    let addr = format!("{}:{}", node.config().host, node.config().port);
    let listener = TcpListener::bind(&addr).await?;

    for path in &node.config().paths {
        info!(addr = %addr, path = %path, "handling WebSocket connections");
    }
    info!(addr = %addr, path = %node.config().health_path, "handling health requests");

    let mut shutdown = node.shutdown_signal();
    let app = router(node);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;

    Ok(())
}

pub fn router(node: Arc<Node>) -> Router {
    let mut app = Router::new();
    for path in &node.config().paths {
        app = app.route(path, get(ws_upgrade));
    }
    app = app.route(&node.config().health_path, get(health));
    app.with_state(node)
}

async fn health() -> &'static str {
    "ok"
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    uri: Uri,
    headers: HeaderMap,
    State(node): State<Arc<Node>>,
) -> Response {
    let config = node.config();
    let env = request_env(&uri, &headers, &config.headers, &config.cookies);

    ws.protocols(protocol::SUBPROTOCOLS)
        .max_message_size(config.max_message_size)
        .write_buffer_size(config.write_buffer_size)
        .on_upgrade(move |socket| handle_socket(socket, node, env))
}

async fn handle_socket(socket: WebSocket, node: Arc<Node>, env: SessionEnv) {
    let sid = Uuid::new_v4().to_string();
    debug!(sid = %sid, url = %env.url, "connection accepted");

    let (sink, stream) = socket.split();
    let (session, receiver) = Session::new(sid, env, Arc::clone(node.metrics()));

    let config = node.config();
    let mut write_task = tokio::spawn(session.clone().write_pump(
        receiver,
        SocketWriter { sink },
        config.write_timeout(),
    ));

    let authenticated = matches!(
        node.authenticate(&session).await,
        Ok(reply) if reply.status == Status::Success
    );

    if !authenticated {
        // The node already scheduled the close; let the pump flush it.
        let _ = write_task.await;
        return;
    }

    let ping_task = tokio::spawn(session.clone().ping_loop(
        config.ping_interval(),
        config.ping_timestamp_precision,
    ));

    tokio::select! {
        _ = session.clone().read_pump(Arc::clone(&node), SocketReader { stream }) => {
            session.disconnect("Closed", CLOSE_NORMAL);
            let _ = write_task.await;
        }
        _ = &mut write_task => {}
    }

    ping_task.abort();

    if let Err(err) = node.disconnect(&session).await {
        debug!(sid = %session.sid(), error = %err, "disconnect enqueue failed");
    }

    debug!(sid = %session.sid(), "connection finished");
}

struct SocketReader {
    stream: SplitStream<WebSocket>,
}

#[async_trait]
impl ConnectionReader for SocketReader {
    async fn read(&mut self) -> Result<Option<Vec<u8>>, ConnectionError> {
        while let Some(next) = self.stream.next().await {
            match next {
                Ok(WsMessage::Text(text)) => return Ok(Some(text.as_bytes().to_vec())),
                Ok(WsMessage::Binary(data)) => return Ok(Some(data.to_vec())),
                Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) => continue,
                Ok(WsMessage::Close(_)) => return Ok(None),
                Err(err) => return Err(ConnectionError(err.to_string())),
            }
        }
        Ok(None)
    }
}

struct SocketWriter {
    sink: SplitSink<WebSocket, WsMessage>,
}

#[async_trait]
impl ConnectionWriter for SocketWriter {
    async fn write(&mut self, frame: &[u8]) -> Result<(), ConnectionError> {
        let text = String::from_utf8_lossy(frame).into_owned();
        self.sink
            .send(WsMessage::Text(text.into()))
            .await
            .map_err(|err| ConnectionError(err.to_string()))
    }

    async fn close(&mut self, code: u16, reason: &str) {
        let frame = CloseFrame {
            code,
            reason: reason.to_string().into(),
        };
        let _ = self.sink.send(WsMessage::Close(Some(frame))).await;
    }
}

/// Build the session env from the upgrade request: full URL plus the
/// allowlisted headers (with the cookie filter applied).
fn request_env(
    uri: &Uri,
    headers: &HeaderMap,
    allowlist: &[String],
    cookie_filter: &[String],
) -> SessionEnv {
    let mut filtered = HashMap::new();

    for name in allowlist {
        let name = name.to_lowercase();
        if let Some(value) = headers.get(name.as_str()).and_then(|value| value.to_str().ok()) {
            let value = if name == "cookie" && !cookie_filter.is_empty() {
                filter_cookies(value, cookie_filter)
            } else {
                value.to_string()
            };
            filtered.insert(name, value);
        }
    }

    SessionEnv::new(request_url(uri, headers), filtered)
}

fn request_url(uri: &Uri, headers: &HeaderMap) -> String {
    let scheme = header_str(headers, "x-forwarded-proto").unwrap_or("http");
    let host = header_str(headers, "x-forwarded-host")
        .or_else(|| header_str(headers, "host"))
        .unwrap_or("localhost");
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());

    format!("{}://{}{}", scheme, host, path)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn filter_cookies(cookie_header: &str, allowed: &[String]) -> String {
    let allowed: HashSet<&str> = allowed.iter().map(String::as_str).collect();

    cookie_header
        .split(';')
        .map(str::trim)
        .filter(|pair| {
            pair.split_once('=')
                .is_some_and(|(key, _)| allowed.contains(key.trim()))
        })
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::config::Config;
    use crate::test_support::{MockController, new_metrics};

    fn test_node() -> Arc<Node> {
        Node::new(
            MockController::new(),
            new_metrics(),
            Arc::new(Config::default()),
        )
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = router(test_node());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_cable_endpoint_requires_upgrade() {
        let app = router(test_node());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/cable")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_ne!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_request_env_filters_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("host", "cable.example.com".parse().unwrap());
        headers.insert("cookie", "session=abc; theme=dark".parse().unwrap());
        headers.insert("x-api-key", "secret".parse().unwrap());

        let env = request_env(
            &"/cable?token=1".parse().unwrap(),
            &headers,
            &["cookie".to_string()],
            &[],
        );

        assert_eq!(env.url, "http://cable.example.com/cable?token=1");
        assert_eq!(env.headers.get("cookie").unwrap(), "session=abc; theme=dark");
        assert!(!env.headers.contains_key("x-api-key"));
    }

    #[test]
    fn test_request_env_applies_cookie_filter() {
        let mut headers = HeaderMap::new();
        headers.insert("cookie", "session=abc; theme=dark; _ga=xyz".parse().unwrap());

        let env = request_env(
            &"/cable".parse().unwrap(),
            &headers,
            &["cookie".to_string()],
            &["session".to_string()],
        );

        assert_eq!(env.headers.get("cookie").unwrap(), "session=abc");
    }

    #[test]
    fn test_request_url_honors_forwarded_proto() {
        let mut headers = HeaderMap::new();
        headers.insert("host", "internal".parse().unwrap());
        headers.insert("x-forwarded-proto", "https".parse().unwrap());
        headers.insert("x-forwarded-host", "cable.example.com".parse().unwrap());

        assert_eq!(
            request_url(&"/cable".parse().unwrap(), &headers),
            "https://cable.example.com/cable"
        );
    }
}
