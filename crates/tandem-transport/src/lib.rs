//! Tandem Transport Layer
//!
//! Rooms, sessions and the network surface of the sync server:
//! - Room Broker: process-wide room registry with exactly-once creation
//! - Session Manager: one live session per user and room, with eviction
//! - Connection Handler: per-connection sync state machine
//! - WebSocket: browser-compatible transport (default feature)
//! - Metrics: Prometheus metrics (optional feature)

#[cfg(feature = "metrics")]
macro_rules! observe {
    ($broker:expr, |$m:ident| $body:expr) => {
        if let Some($m) = $broker.metrics() {
            $body;
        }
    };
}

#[cfg(not(feature = "metrics"))]
macro_rules! observe {
    ($broker:expr, |$m:ident| $body:expr) => {};
}

pub mod broker;
pub mod error;
pub mod handler;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod rate_limit;
pub mod room;
pub mod session;
#[cfg(feature = "websocket")]
pub mod websocket;

pub use broker::{BrokerConfig, BrokerStats, RoomBroker};
pub use error::{TransportError, TransportResult};
pub use handler::{ConnectionHandler, ConnectionState, Flow};
#[cfg(feature = "metrics")]
pub use metrics::{Metrics, MetricsServer};
pub use rate_limit::{RateLimitConfig, RateLimiter};
pub use room::{validate_room_name, Joined, Room, RoomStats, DEFAULT_ROOM};
pub use session::{ConnectionHandle, Outbound, Session, SessionManager, DEFAULT_OUTBOUND_CAPACITY};
#[cfg(feature = "websocket")]
pub use websocket::{parse_target, ConnectionTarget, WebSocketServer, DEFAULT_KEEPALIVE_TIMEOUT};
