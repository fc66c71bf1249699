//! Prometheus metrics for Tandem
//!
//! Metrics are exposed in Prometheus text format via a minimal HTTP
//! endpoint, next to a `/health` probe.

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::error::TransportResult;

/// Tandem metrics collector
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,

    // Connection metrics
    pub connections_total: IntCounter,
    pub connections_active: IntGauge,
    pub evictions: IntCounter,

    // Room metrics
    pub rooms_active: IntGauge,

    // Frame metrics
    pub frames_received: IntCounterVec,
    pub updates_broadcast: IntCounter,
    pub protocol_violations: IntCounter,
    pub rate_limited_frames: IntCounter,
    pub stalled_connections: IntCounter,

    // Presence and compaction
    pub awareness_expired: IntCounter,
    pub tombstones_collected: IntCounter,
}

impl Metrics {
    /// Create and register every collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let connections_total = IntCounter::new("tandem_connections_total", "Total number of connections")?;
        let connections_active = IntGauge::new("tandem_connections_active", "Number of open connections")?;
        let evictions = IntCounter::new(
            "tandem_evictions_total",
            "Sessions closed because the same user reconnected",
        )?;
        let rooms_active = IntGauge::new("tandem_rooms_active", "Number of rooms in memory")?;
        let frames_received = IntCounterVec::new(
            Opts::new("tandem_frames_received_total", "Frames received by kind"),
            &["kind"],
        )?;
        let updates_broadcast = IntCounter::new(
            "tandem_updates_broadcast_total",
            "Document updates queued to peers",
        )?;
        let protocol_violations = IntCounter::new(
            "tandem_protocol_violations_total",
            "Connections closed for malformed or rejected frames",
        )?;
        let rate_limited_frames = IntCounter::new(
            "tandem_rate_limited_frames_total",
            "Frames delayed by the per-connection rate limit",
        )?;
        let stalled_connections = IntCounter::new(
            "tandem_stalled_connections_total",
            "Connections closed after an unanswered keepalive ping",
        )?;
        let awareness_expired = IntCounter::new(
            "tandem_awareness_expired_total",
            "Presence entries expired without heartbeat",
        )?;
        let tombstones_collected = IntCounter::new(
            "tandem_tombstones_collected_total",
            "Tombstones whose content was released",
        )?;

        registry.register(Box::new(connections_total.clone()))?;
        registry.register(Box::new(connections_active.clone()))?;
        registry.register(Box::new(evictions.clone()))?;
        registry.register(Box::new(rooms_active.clone()))?;
        registry.register(Box::new(frames_received.clone()))?;
        registry.register(Box::new(updates_broadcast.clone()))?;
        registry.register(Box::new(protocol_violations.clone()))?;
        registry.register(Box::new(rate_limited_frames.clone()))?;
        registry.register(Box::new(stalled_connections.clone()))?;
        registry.register(Box::new(awareness_expired.clone()))?;
        registry.register(Box::new(tombstones_collected.clone()))?;

        Ok(Self {
            registry,
            connections_total,
            connections_active,
            evictions,
            rooms_active,
            frames_received,
            updates_broadcast,
            protocol_violations,
            rate_limited_frames,
            stalled_connections,
            awareness_expired,
            tombstones_collected,
        })
    }

    pub fn record_connection(&self) {
        self.connections_total.inc();
        self.connections_active.inc();
    }

    pub fn record_disconnection(&self) {
        self.connections_active.dec();
    }

    /// Export metrics in Prometheus text format
    pub fn export(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            error!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

/// HTTP server for the metrics endpoint
pub struct MetricsServer {
    metrics: Arc<Metrics>,
    addr: SocketAddr,
}

impl MetricsServer {
    pub fn new(metrics: Arc<Metrics>, addr: SocketAddr) -> Self {
        Self { metrics, addr }
    }

    pub async fn run(&self) -> TransportResult<()> {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "Metrics server listening on http://{}/metrics", self.addr);

        loop {
            match listener.accept().await {
                Ok((mut stream, _)) => {
                    let metrics = self.metrics.clone();

                    tokio::spawn(async move {
                        let mut buf = [0u8; 1024];
                        let n = match stream.read(&mut buf).await {
                            Ok(n) if n > 0 => n,
                            _ => return,
                        };
                        let response = Self::respond(&metrics, &String::from_utf8_lossy(&buf[..n]));
                        let _ = stream.write_all(response.as_bytes()).await;
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept metrics connection");
                }
            }
        }
    }

    fn respond(metrics: &Metrics, request: &str) -> String {
        if request.starts_with("GET /metrics") || request.starts_with("GET / ") {
            let body = metrics.export();
            format!(
                "HTTP/1.1 200 OK\r\n\
                 Content-Type: text/plain; version=0.0.4; charset=utf-8\r\n\
                 Content-Length: {}\r\n\
                 \r\n\
                 {}",
                body.len(),
                body
            )
        } else if request.starts_with("GET /health") {
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 2\r\n\r\nOK".to_string()
        } else {
            "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n".to_string()
        }
    }
}
