//! Rooms
//!
//! A room owns one document, one awareness registry and the sessions
//! connected to it. All mutation and fan-out for a room happens under its
//! write lock; fan-out only pushes into per-connection queues, so the lock
//! is never held across I/O.

use crate::error::{TransportError, TransportResult};
use crate::session::{ConnectionHandle, Session, SessionManager};
use bytes::Bytes;
use parking_lot::RwLock;
use std::time::{Duration, Instant};
use tandem_core::{
    AwarenessChange, AwarenessRegistry, AwarenessUpdate, Document, DocumentStats, ReplicaId, StateVector, Update,
};
use tandem_protocol::{Codec, Message};
use tracing::{debug, info, warn};

/// Room used when the connection path is empty
pub const DEFAULT_ROOM: &str = "default-room";

/// Longest accepted room name, in bytes
pub const MAX_ROOM_NAME_LEN: usize = 512;

/// Replica id of the server's document. The server never authors edits.
const SERVER_REPLICA: ReplicaId = 0;

/// Check that `name` is usable as a room name
pub fn validate_room_name(name: &str) -> TransportResult<()> {
    if name.is_empty() {
        return Err(TransportError::InvalidRoomName("empty".into()));
    }
    if name.len() > MAX_ROOM_NAME_LEN {
        return Err(TransportError::InvalidRoomName(format!(
            "{} bytes exceeds {}",
            name.len(),
            MAX_ROOM_NAME_LEN
        )));
    }
    if name.chars().any(char::is_control) {
        return Err(TransportError::InvalidRoomName("contains control characters".into()));
    }
    Ok(())
}

struct RoomState {
    document: Document,
    awareness: AwarenessRegistry,
    sessions: SessionManager,
    /// Set once the room was released; nobody may join anymore
    retired: bool,
}

/// Result of a successful join
#[derive(Debug)]
pub struct Joined {
    pub session: Session,
    /// Previous session of the same user, already closed
    pub evicted: Option<Session>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomStats {
    pub sessions: usize,
    pub present_users: usize,
    pub document: DocumentStats,
}

pub struct Room {
    name: String,
    codec: Codec,
    state: RwLock<RoomState>,
}

impl Room {
    pub fn new(name: impl Into<String>, codec: Codec) -> Self {
        Self {
            name: name.into(),
            codec,
            state: RwLock::new(RoomState {
                document: Document::new(SERVER_REPLICA),
                awareness: AwarenessRegistry::new(),
                sessions: SessionManager::new(),
                retired: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a session and queue its greeting (our state vector and the
    /// current presence snapshot). Returns `None` when the room was retired.
    pub fn join(&self, user_id: Option<&str>, handle: ConnectionHandle) -> Option<Joined> {
        let mut state = self.state.write();
        if state.retired {
            return None;
        }

        let (session, evicted) = state.sessions.register(user_id, handle);

        let sync = self.codec.encode(&Message::SyncStep1(state.document.state_vector()));
        session.handle.send(sync);
        let snapshot = state.awareness.encode_all();
        if !snapshot.is_empty() {
            session.handle.send(self.codec.encode(&Message::Awareness(snapshot)));
        }

        info!(
            room = %self.name,
            user = %session.user_id,
            conn = session.id,
            sessions = state.sessions.len(),
            "Session joined"
        );
        Some(Joined { session, evicted })
    }

    /// Answer a client's state vector with everything it is missing
    pub fn sync_step1(&self, session: &Session, client_state: &StateVector) -> TransportResult<usize> {
        let mut state = self.state.write();
        if !state.sessions.is_current(session) {
            return Err(TransportError::Evicted);
        }
        let diff = state.document.compute_diff(client_state);
        let ops = diff.len();
        session.handle.send(self.codec.encode(&Message::SyncStep2(diff)));
        state.sessions.acknowledge(session, client_state);
        debug!(room = %self.name, conn = session.id, ops, "Sent sync step 2");
        Ok(ops)
    }

    /// Validate and apply a document update from `session`, then queue
    /// `frame` to every other session. Nothing is applied when validation
    /// fails. Returns the number of recipients.
    pub fn apply_update(&self, session: &Session, update: &Update, frame: &Bytes) -> TransportResult<usize> {
        let mut state = self.state.write();
        if !state.sessions.is_current(session) {
            return Err(TransportError::Evicted);
        }

        state.document.validate(update)?;
        let changes = state.document.apply_remote_update(update)?;
        state.sessions.acknowledge(session, &update.covered());

        if changes.is_empty() {
            debug!(room = %self.name, conn = session.id, duplicates = changes.duplicates, "Update carried nothing new");
            return Ok(0);
        }
        let recipients = state.sessions.broadcast(frame, Some(session.id));
        debug!(
            room = %self.name,
            conn = session.id,
            inserted = changes.inserted,
            deleted = changes.deleted,
            recipients,
            "Applied update"
        );
        Ok(recipients)
    }

    /// Apply a presence delta from `session`. A session may only speak for
    /// its own user; other entries are dropped. Accepted entries are
    /// re-stamped with the room's clock and queued to every other session.
    pub fn apply_awareness(
        &self,
        session: &Session,
        update: &AwarenessUpdate,
        now: Instant,
    ) -> TransportResult<AwarenessChange> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        if !state.sessions.is_current(session) {
            return Err(TransportError::Evicted);
        }

        let mut change = AwarenessChange::default();
        let mut outgoing = AwarenessUpdate::default();
        for entry in &update.entries {
            if entry.user_id != session.user_id {
                warn!(room = %self.name, conn = session.id, claimed = %entry.user_id, "Dropping presence for another user");
                continue;
            }
            if !state
                .sessions
                .accept_client_clock(session, entry.clock, entry.state.is_none())
            {
                continue;
            }
            let (one, delta) = match &entry.state {
                Some(presence) => state.awareness.set_local(&session.user_id, presence.clone(), now),
                None => state.awareness.remove_local(&session.user_id),
            };
            change.added.extend(one.added);
            change.updated.extend(one.updated);
            change.removed.extend(one.removed);
            outgoing.entries.extend(delta.entries);
        }

        if !outgoing.is_empty() {
            let frame = self.codec.encode(&Message::Awareness(outgoing));
            state.sessions.broadcast(&frame, Some(session.id));
        }
        Ok(change)
    }

    /// Unregister `session`. When it still owned its user, the user's
    /// presence is removed and the removal broadcast. Returns the number of
    /// sessions left.
    pub fn leave(&self, session: &Session) -> usize {
        let mut state = self.state.write();
        if state.sessions.unregister(session) {
            let (change, removal) = state.awareness.remove_local(&session.user_id);
            if !change.is_empty() {
                let frame = self.codec.encode(&Message::Awareness(removal));
                state.sessions.broadcast(&frame, None);
            }
            info!(room = %self.name, user = %session.user_id, conn = session.id, "Session left");
        }
        state.sessions.len()
    }

    /// Expire silent users and broadcast their removal
    pub fn sweep_awareness(&self, now: Instant, timeout: Duration) -> usize {
        let mut state = self.state.write();
        let (change, removal) = state.awareness.sweep(now, timeout);
        if change.is_empty() {
            return 0;
        }
        let frame = self.codec.encode(&Message::Awareness(removal));
        state.sessions.broadcast(&frame, None);
        info!(room = %self.name, expired = change.removed.len(), "Expired stale presence");
        change.removed.len()
    }

    /// Release tombstone content once every connected client has seen the
    /// deletion. Only runs above `threshold` tombstones.
    pub fn compact(&self, threshold: usize) -> usize {
        let mut state = self.state.write();
        if state.document.tombstone_count() <= threshold {
            return 0;
        }
        let Some(stable) = state.sessions.stable_state() else {
            return 0;
        };
        let collected = state.document.compact(&stable);
        if collected > 0 {
            info!(room = %self.name, collected, "Compacted tombstones");
        }
        collected
    }

    /// Mark the room retired if it has no sessions
    pub fn retire_if_empty(&self) -> bool {
        let mut state = self.state.write();
        if state.retired {
            return true;
        }
        if state.sessions.is_empty() {
            state.retired = true;
        }
        state.retired
    }

    /// Send a close frame to every session and close their handles
    pub fn close_all(&self) {
        let state = self.state.read();
        let goodbye = self.codec.encode(&Message::Close);
        state.sessions.close_all(&goodbye);
    }

    pub fn session_count(&self) -> usize {
        self.state.read().sessions.len()
    }

    pub fn session_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.state.read().sessions.iter().map(|s| s.id).collect();
        ids.sort_unstable();
        ids
    }

    pub fn text(&self) -> String {
        self.state.read().document.current_text()
    }

    pub fn presence_users(&self) -> Vec<String> {
        let mut users: Vec<String> = self.state.read().awareness.get_all().into_keys().collect();
        users.sort();
        users
    }

    pub fn stats(&self) -> RoomStats {
        let state = self.state.read();
        RoomStats {
            sessions: state.sessions.len(),
            present_users: state.awareness.len(),
            document: state.document.stats(),
        }
    }
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room").field("name", &self.name).finish()
    }
}
