//! Cablegrid server binary
//!
//! Wires the pieces together: configuration from flags/env, logging,
//! controller chain (signed streams + channel router), node, disconnect
//! queue, broadcast adapter and the HTTP/WebSocket front end.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use cablegrid::config::{Config, ConfigError};
use cablegrid::controller::Controller;
use cablegrid::disconnect::{DisconnectQueue, Disconnector, NoopDisconnector};
use cablegrid::metrics::Metrics;
use cablegrid::node::Node;
use cablegrid::pubsub::{Handler, MemorySubscriber, Subscriber};
use cablegrid::router::RouterController;
use cablegrid::server;
use cablegrid::streams::{PUBSUB_CHANNEL, StreamsController, TURBO_CHANNEL, TurboStreamsController};

#[derive(Parser, Debug)]
#[command(name = "cablegrid")]
#[command(about = "Action Cable-compatible WebSocket server")]
#[command(version)]
struct Args {
    /// Server host
    #[arg(long, default_value = "localhost")]
    host: String,

    /// Server port
    #[arg(long, env = "CABLEGRID_PORT", default_value_t = 8080)]
    port: u16,

    /// WebSocket endpoint path (comma-separated for multiple)
    #[arg(long, default_value = "/cable")]
    path: String,

    /// HTTP health endpoint path
    #[arg(long, default_value = "/health")]
    health_path: String,

    /// Headers to forward to the application (comma-separated)
    #[arg(long, default_value = "cookie")]
    headers: String,

    /// Cookie keys to forward, default is all
    #[arg(long = "proxy-cookies")]
    proxy_cookies: Option<String>,

    /// Broadcast fan-out worker count
    #[arg(long, default_value_t = 16)]
    hub_gopool_size: usize,

    /// How often to refresh the server stats (seconds)
    #[arg(long, default_value_t = 5)]
    stats_refresh_interval: u64,

    /// Ping period (seconds)
    #[arg(long, default_value_t = 3)]
    ping_interval: u64,

    /// Ping timestamp precision: s, ms or ns
    #[arg(long, default_value = "s")]
    ping_timestamp_precision: String,

    /// Max Disconnect calls per second
    #[arg(long, default_value_t = 100)]
    disconnect_rate: u32,

    /// Graceful shutdown timeout for the disconnect queue (seconds)
    #[arg(long, default_value_t = 5)]
    disconnect_timeout: u64,

    /// Disable the Disconnect callback
    #[arg(long)]
    disable_disconnect: bool,

    /// Socket read buffer size (bytes)
    #[arg(long, default_value_t = 1024)]
    read_buffer_size: usize,

    /// Socket write buffer size (bytes)
    #[arg(long, default_value_t = 1024)]
    write_buffer_size: usize,

    /// Max inbound message size (bytes)
    #[arg(long, default_value_t = 65536)]
    max_message_size: usize,

    /// How often to log a metrics snapshot (seconds, 0 disables)
    #[arg(long, default_value_t = 0)]
    metrics_rotate_interval: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log format (text or json)
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Enable debug mode (more verbose logging)
    #[arg(long)]
    debug: bool,

    /// Secret for verifying signed stream names
    #[arg(long, env = "CABLEGRID_STREAMS_SECRET")]
    streams_secret: Option<String>,

    /// Allow subscriptions to unsigned stream names
    #[arg(long)]
    public_streams: bool,

    /// Secret for Turbo Streams subscriptions
    #[arg(long, env = "CABLEGRID_TURBO_RAILS_KEY")]
    turbo_rails_key: Option<String>,
}

impl Args {
    fn into_config(self) -> Result<Config, ConfigError> {
        let mut config = Config {
            host: self.host,
            port: self.port,
            paths: split_list(&self.path),
            health_path: self.health_path,
            headers: split_list(&self.headers.to_lowercase()),
            cookies: self
                .proxy_cookies
                .as_deref()
                .map(split_list)
                .unwrap_or_default(),
            hub_gopool_size: self.hub_gopool_size,
            stats_refresh_interval: self.stats_refresh_interval,
            ping_interval: self.ping_interval,
            ping_timestamp_precision: self.ping_timestamp_precision.parse()?,
            disconnect_rate: self.disconnect_rate,
            disconnect_timeout: self.disconnect_timeout,
            disable_disconnect: self.disable_disconnect,
            read_buffer_size: self.read_buffer_size,
            write_buffer_size: self.write_buffer_size,
            max_message_size: self.max_message_size,
            metrics_rotate_interval: self.metrics_rotate_interval,
            log_level: self.log_level,
            log_format: self.log_format,
            debug: self.debug,
            streams_secret: self.streams_secret,
            public_streams: self.public_streams,
            turbo_rails_key: self.turbo_rails_key,
            ..Config::default()
        };

        if config.debug {
            config.log_level = "debug".to_string();
            config.log_format = "text".to_string();
        }

        Ok(config)
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn init_logging(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.log_format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Assemble the controller chain: the signed-streams controller as the
/// default, with fastlane routes for the stream channel classes.
fn build_controller(config: &Config) -> Arc<dyn Controller> {
    let streams: Arc<dyn Controller> = Arc::new(StreamsController::new(
        config.streams_secret.as_deref(),
        config.public_streams,
    ));

    let mut router = RouterController::new(Arc::clone(&streams));
    if config.streams_secret.is_some() || config.public_streams {
        router.route(PUBSUB_CHANNEL, Arc::clone(&streams));
    }
    if let Some(key) = &config.turbo_rails_key {
        router.route(TURBO_CHANNEL, Arc::new(TurboStreamsController::new(key)));
    }

    if router.is_empty() {
        streams
    } else {
        info!(routes = ?router.routes(), "using channel router");
        Arc::new(router)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Arc::new(args.into_config()?);
    config.validate()?;
    init_logging(&config);

    info!(version = env!("CARGO_PKG_VERSION"), "starting cablegrid");

    let metrics = Metrics::new();
    let controller = build_controller(&config);
    controller.start().await?;

    let node = Node::new(controller, Arc::clone(&metrics), Arc::clone(&config));
    node.start();

    let disconnector: Arc<dyn Disconnector> = if config.disable_disconnect {
        Arc::new(NoopDisconnector)
    } else {
        let queue = DisconnectQueue::new(
            &node,
            config.disconnect_rate,
            Duration::from_secs(config.disconnect_timeout),
        );
        queue.run();
        queue
    };
    node.set_disconnector(disconnector);

    let handler: Arc<dyn Handler> = node.clone();
    let subscriber = MemorySubscriber::new(handler);
    subscriber.start().await?;

    if config.metrics_rotate_interval > 0 {
        metrics.spawn_log_rotation(
            Duration::from_secs(config.metrics_rotate_interval),
            node.shutdown_signal(),
        );
    }

    let signal_node = Arc::clone(&node);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutting down...");
            if let Err(err) = signal_node.shutdown().await {
                warn!(error = %err, "shutdown failed");
            }
        }
    });

    server::run(node).await?;

    subscriber.shutdown().await?;
    info!("cablegrid stopped");
    Ok(())
}
