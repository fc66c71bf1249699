//! Room broker
//!
//! Process-wide map from room name to room. Rooms are created lazily on the
//! first join (exactly once per name, even under concurrent joins) and torn
//! down when their last session leaves.

use crate::room::{Joined, Room};
use crate::session::{ConnectionHandle, Outbound, DEFAULT_OUTBOUND_CAPACITY};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tandem_core::DEFAULT_AWARENESS_TIMEOUT;
use tandem_protocol::Codec;
use tokio::sync::mpsc;
use tracing::{debug, info};

#[cfg(feature = "metrics")]
use crate::metrics::Metrics;

/// Tombstone count above which a room is compacted
pub const DEFAULT_COMPACT_THRESHOLD: usize = 10_000;

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub codec: Codec,
    pub awareness_timeout: Duration,
    pub compact_threshold: usize,
    /// Frames a connection may have queued before it is closed as stalled
    pub outbound_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            codec: Codec::default(),
            awareness_timeout: DEFAULT_AWARENESS_TIMEOUT,
            compact_threshold: DEFAULT_COMPACT_THRESHOLD,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerStats {
    pub rooms: usize,
    pub sessions: usize,
}

pub struct RoomBroker {
    rooms: DashMap<String, Arc<Room>>,
    config: BrokerConfig,
    next_connection: AtomicU64,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<Metrics>>,
}

impl RoomBroker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            rooms: DashMap::new(),
            config,
            next_connection: AtomicU64::new(1),
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    #[cfg(feature = "metrics")]
    pub fn metrics(&self) -> Option<&Arc<Metrics>> {
        self.metrics.as_ref()
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn codec(&self) -> Codec {
        self.config.codec
    }

    /// Handle for a new connection, sized by the configured queue capacity
    pub fn new_handle(&self) -> (ConnectionHandle, mpsc::Receiver<Outbound>) {
        ConnectionHandle::with_capacity(self.next_connection_id(), self.config.outbound_capacity)
    }

    /// Allocate a process-unique connection id
    pub fn next_connection_id(&self) -> u64 {
        self.next_connection.fetch_add(1, Ordering::Relaxed)
    }

    /// Look up a live room without creating it
    pub fn get(&self, name: &str) -> Option<Arc<Room>> {
        self.rooms.get(name).map(|room| room.value().clone())
    }

    /// Resolve `name`, creating the room on first use
    pub fn get_or_create(&self, name: &str) -> Arc<Room> {
        if let Some(room) = self.rooms.get(name) {
            return room.value().clone();
        }
        self.rooms
            .entry(name.to_string())
            .or_insert_with(|| {
                info!(room = %name, "Room created");
                observe!(self, |m| m.rooms_active.inc());
                // compression is applied per connection by the transport
                Arc::new(Room::new(name, self.config.codec.uncompressed()))
            })
            .value()
            .clone()
    }

    /// Resolve the room and register a session in it. Retries when the
    /// resolved room was retired concurrently.
    pub fn join(&self, name: &str, user_id: Option<&str>, handle: ConnectionHandle) -> (Arc<Room>, Joined) {
        loop {
            let room = self.get_or_create(name);
            if let Some(joined) = room.join(user_id, handle.clone()) {
                if joined.evicted.is_some() {
                    observe!(self, |m| m.evictions.inc());
                }
                return (room, joined);
            }
            debug!(room = %name, "Joined a retiring room, retrying");
            self.remove_exact(&room);
        }
    }

    /// Tear `room` down if it has no sessions left. A later join for the
    /// same name creates a fresh room with an empty document.
    pub fn release_if_empty(&self, room: &Arc<Room>) -> bool {
        if !room.retire_if_empty() {
            return false;
        }
        if self.remove_exact(room) {
            info!(room = %room.name(), "Room released");
        }
        true
    }

    /// Expire stale presence in every room
    pub fn sweep_awareness(&self, now: Instant) -> usize {
        let timeout = self.config.awareness_timeout;
        let expired: usize = self
            .snapshot()
            .iter()
            .map(|room| room.sweep_awareness(now, timeout))
            .sum();
        observe!(self, |m| m.awareness_expired.inc_by(expired as u64));
        expired
    }

    /// Collect tombstone content in rooms above the compaction threshold
    pub fn compact_rooms(&self) -> usize {
        let threshold = self.config.compact_threshold;
        let collected: usize = self
            .snapshot()
            .iter()
            .map(|room| room.compact(threshold))
            .sum();
        if collected > 0 {
            info!(collected, "Tombstone compaction finished");
        }
        observe!(self, |m| m.tombstones_collected.inc_by(collected as u64));
        collected
    }

    pub fn stats(&self) -> BrokerStats {
        let rooms = self.snapshot();
        BrokerStats {
            rooms: rooms.len(),
            sessions: rooms.iter().map(|room| room.session_count()).sum(),
        }
    }

    pub fn room_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.rooms.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    /// Close every connection in every room
    pub fn shutdown(&self) {
        let rooms = self.snapshot();
        info!(rooms = rooms.len(), "Closing all rooms");
        for room in rooms {
            room.close_all();
        }
    }

    fn snapshot(&self) -> Vec<Arc<Room>> {
        self.rooms.iter().map(|entry| entry.value().clone()).collect()
    }

    fn remove_exact(&self, room: &Arc<Room>) -> bool {
        let removed = self
            .rooms
            .remove_if(room.name(), |_, current| Arc::ptr_eq(current, room))
            .is_some();
        if removed {
            observe!(self, |m| m.rooms_active.dec());
        }
        removed
    }
}

impl Default for RoomBroker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}
