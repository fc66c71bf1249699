//! Tandem Daemon (tandemd)
//!
//! The collaborative text sync server.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (WebSocket on 1234)
//! tandemd
//!
//! # Custom port and presence timeout
//! tandemd --port 7000 --awareness-timeout-ms 15000
//!
//! # With Prometheus metrics
//! tandemd --metrics-port 9100
//!
//! # With configuration file
//! tandemd --config /etc/tandem/tandem.toml
//! ```
//!
//! Clients connect to `ws://host:port/<room>?userId=<id>`.

mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use tandem_protocol::Codec;
use tandem_transport::{BrokerConfig, Metrics, MetricsServer, RateLimitConfig, RoomBroker, WebSocketServer};

use crate::config::{FileConfig, Settings};

/// Tandem Daemon - collaborative text sync server
#[derive(Parser, Debug)]
#[command(name = "tandemd")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port to listen on
    #[arg(long, env = "PORT")]
    port: Option<u16>,

    /// Bind address
    #[arg(long, env = "TANDEM_BIND")]
    bind: Option<String>,

    /// Configuration file path
    #[arg(short, long, env = "TANDEM_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "TANDEM_LOG_LEVEL")]
    log_level: Option<String>,

    /// Payloads larger than this are lz4 compressed (0 = never)
    #[arg(long, env = "TANDEM_COMPRESSION_THRESHOLD")]
    compression_threshold: Option<usize>,

    /// Largest accepted frame, before and after decompression
    #[arg(long, env = "TANDEM_MAX_FRAME_SIZE")]
    max_frame_size: Option<usize>,

    /// Presence entries without a heartbeat for this long are dropped
    #[arg(long, env = "TANDEM_AWARENESS_TIMEOUT_MS")]
    awareness_timeout_ms: Option<u64>,

    /// Interval of the presence sweep and tombstone compaction task
    #[arg(long, env = "TANDEM_SWEEP_INTERVAL_MS")]
    sweep_interval_ms: Option<u64>,

    /// Tombstone count above which a room is compacted
    #[arg(long, env = "TANDEM_COMPACT_THRESHOLD")]
    compact_threshold: Option<usize>,

    /// Disconnect clients that leave a ping unanswered this long
    #[arg(long, env = "TANDEM_KEEPALIVE_TIMEOUT_MS")]
    keepalive_timeout_ms: Option<u64>,

    /// Frames queued for one client before it is dropped as stalled
    #[arg(long, env = "TANDEM_OUTBOUND_QUEUE")]
    outbound_queue: Option<usize>,

    /// Rate limit: max frames per second per connection (0 = disabled)
    #[arg(long, env = "TANDEM_RATE_LIMIT")]
    rate_limit: Option<u32>,

    /// Rate limit burst size (default: 2x rate limit)
    #[arg(long, env = "TANDEM_RATE_BURST")]
    rate_burst: Option<u32>,

    /// Serve Prometheus metrics on this port
    #[arg(long, env = "TANDEM_METRICS_PORT")]
    metrics_port: Option<u16>,
}

impl Args {
    fn overrides(&self) -> FileConfig {
        FileConfig {
            bind: self.bind.clone(),
            port: self.port,
            compression_threshold: self.compression_threshold,
            max_frame_size: self.max_frame_size,
            awareness_timeout_ms: self.awareness_timeout_ms,
            sweep_interval_ms: self.sweep_interval_ms,
            compact_threshold: self.compact_threshold,
            keepalive_timeout_ms: self.keepalive_timeout_ms,
            outbound_queue: self.outbound_queue,
            rate_limit: self.rate_limit,
            rate_burst: self.rate_burst,
            metrics_port: self.metrics_port,
            log_level: self.log_level.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let file = match &args.config {
        Some(path) => FileConfig::load_from(path)?,
        None => FileConfig::default(),
    };
    let settings = Settings::resolve(args.overrides(), file)?;

    // Initialize logging
    let level = match settings.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    print_banner();

    let broker_config = BrokerConfig {
        codec: Codec::new(settings.compression_threshold, settings.max_frame_size),
        awareness_timeout: settings.awareness_timeout,
        compact_threshold: settings.compact_threshold,
        outbound_capacity: settings.outbound_queue,
    };
    let mut broker = RoomBroker::new(broker_config);

    let mut handles = Vec::new();

    if let Some(metrics_addr) = settings.metrics_addr()? {
        let metrics = Arc::new(Metrics::new()?);
        broker = broker.with_metrics(metrics.clone());
        let server = MetricsServer::new(metrics, metrics_addr);
        handles.push(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!(error = %e, "Metrics server error");
            }
        }));
    }
    let broker = Arc::new(broker);

    let rate_limit_config = if settings.rate_limit > 0 {
        info!(rate = settings.rate_limit, burst = settings.rate_burst, "Rate limiting enabled");
        Some(RateLimitConfig::new(settings.rate_limit, settings.rate_burst))
    } else {
        None
    };

    let listen_addr = settings.listen_addr()?;
    info!(
        addr = %listen_addr,
        compression_threshold = settings.compression_threshold,
        max_frame_size = settings.max_frame_size,
        awareness_timeout_ms = settings.awareness_timeout.as_millis() as u64,
        keepalive_timeout_ms = settings.keepalive_timeout.as_millis() as u64,
        metrics = settings.metrics_port.is_some(),
        "Starting Tandem daemon"
    );

    let mut ws_server = WebSocketServer::new(broker.clone(), listen_addr).with_keepalive(settings.keepalive_timeout);
    if let Some(rl) = rate_limit_config {
        ws_server = ws_server.with_rate_limit(rl);
    }
    handles.push(tokio::spawn(async move {
        if let Err(e) = ws_server.run().await {
            error!(error = %e, "WebSocket server error");
        }
    }));

    // Presence expiry and tombstone compaction
    let sweep_broker = broker.clone();
    let sweep_interval = settings.sweep_interval;
    handles.push(tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_interval);
        loop {
            interval.tick().await;
            let expired = sweep_broker.sweep_awareness(Instant::now());
            if expired > 0 {
                tracing::debug!(expired, "Sweep: expired presence entries");
            }
            sweep_broker.compact_rooms();
        }
    }));

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    broker.shutdown();
    // give connection tasks a moment to flush their close frames
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    for handle in handles {
        handle.abort();
    }

    Ok(())
}

fn print_banner() {
    println!(
        r#"
  ╔╦╗╔═╗╔╗╔╔╦╗╔═╗╔╦╗
   ║ ╠═╣║║║ ║║║╣ ║║║
   ╩ ╩ ╩╝╚╝═╩╝╚═╝╩ ╩
  Collaborative text sync
  Version {}
"#,
        env!("CARGO_PKG_VERSION")
    );
}
