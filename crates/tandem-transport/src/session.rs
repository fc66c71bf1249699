//! Sessions and duplicate-session eviction
//!
//! A `ConnectionHandle` is the room's view of one connection: a bounded
//! queue of outbound frames plus a close flag. The `SessionManager` keeps at
//! most one live session per user id inside a room.

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tandem_core::StateVector;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Frames a connection may have queued before it counts as stalled
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 1024;

/// Item queued for the connection's writer
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Frame(Bytes),
    Close,
}

#[derive(Debug)]
struct HandleInner {
    id: u64,
    tx: mpsc::Sender<Outbound>,
    closed: AtomicBool,
    closing: Notify,
}

/// Cloneable sending side of a connection
///
/// Frames are never dropped silently: a peer whose queue is full is closed
/// instead, and resynchronises through the sync handshake when it
/// reconnects.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    inner: Arc<HandleInner>,
}

impl ConnectionHandle {
    /// Create a handle with the default queue capacity and the receiver its
    /// writer task drains
    pub fn new(id: u64) -> (Self, mpsc::Receiver<Outbound>) {
        Self::with_capacity(id, DEFAULT_OUTBOUND_CAPACITY)
    }

    pub fn with_capacity(id: u64, capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        // one slot stays free for the close marker
        let (tx, rx) = mpsc::channel(capacity.max(1) + 1);
        let handle = Self {
            inner: Arc::new(HandleInner {
                id,
                tx,
                closed: AtomicBool::new(false),
                closing: Notify::new(),
            }),
        };
        (handle, rx)
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Queue a frame. Returns false when the connection is closed. A full
    /// queue closes the connection.
    pub fn send(&self, frame: Bytes) -> bool {
        if self.is_closed() {
            return false;
        }
        if self.inner.tx.capacity() <= 1 {
            return self.overflow();
        }
        match self.inner.tx.try_send(Outbound::Frame(frame)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => self.overflow(),
            Err(TrySendError::Closed(_)) => false,
        }
    }

    fn overflow(&self) -> bool {
        warn!(conn = self.inner.id, "Outbound queue full, closing stalled connection");
        self.close();
        false
    }

    /// Ask the writer to close the connection. Only the first call has an
    /// effect; returns whether this call closed the handle.
    pub fn close(&self) -> bool {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let _ = self.inner.tx.try_send(Outbound::Close);
        self.inner.closing.notify_one();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst) || self.inner.tx.is_closed()
    }

    /// Resolves once the handle is closed, even when the close marker could
    /// not be queued
    pub async fn closed(&self) {
        if self.inner.closed.load(Ordering::SeqCst) {
            return;
        }
        self.inner.closing.notified().await;
    }
}

/// One connection's binding to a room and a user identity
#[derive(Debug, Clone)]
pub struct Session {
    /// Process-unique, equal to the connection handle id
    pub id: u64,
    pub user_id: String,
    /// No user id was supplied; the session never evicts anybody
    pub anonymous: bool,
    pub handle: ConnectionHandle,
}

#[derive(Debug)]
struct SessionEntry {
    session: Session,
    /// Document state the client is known to hold
    acked: StateVector,
    /// Last awareness clock the client itself sent
    client_clock: Option<u64>,
}

/// Sessions of one room, keyed by user id
#[derive(Debug, Default)]
pub struct SessionManager {
    sessions: HashMap<String, SessionEntry>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a session for `user_id`, closing the previous session of the
    /// same user before the new one is visible. Returns the new session and
    /// the evicted one, if any.
    pub fn register(&mut self, user_id: Option<&str>, handle: ConnectionHandle) -> (Session, Option<Session>) {
        let (user_id, anonymous) = match user_id {
            Some(user) if !user.is_empty() => (user.to_string(), false),
            _ => (format!("anonymous-{}", handle.id()), true),
        };

        let evicted = self.sessions.remove(&user_id).map(|entry| {
            entry.session.handle.close();
            info!(
                user = %user_id,
                conn = entry.session.id,
                replaced_by = handle.id(),
                "Evicted previous session"
            );
            entry.session
        });

        let session = Session {
            id: handle.id(),
            user_id: user_id.clone(),
            anonymous,
            handle,
        };
        self.sessions.insert(
            user_id,
            SessionEntry {
                session: session.clone(),
                acked: StateVector::new(),
                client_clock: None,
            },
        );
        (session, evicted)
    }

    /// Remove `session` if it is still the installed session for its user.
    /// A late close from an evicted connection never removes its successor.
    pub fn unregister(&mut self, session: &Session) -> bool {
        if !self.is_current(session) {
            debug!(user = %session.user_id, conn = session.id, "Ignoring unregister of replaced session");
            return false;
        }
        self.sessions.remove(&session.user_id);
        true
    }

    pub fn is_current(&self, session: &Session) -> bool {
        self.sessions
            .get(&session.user_id)
            .map(|entry| entry.session.id == session.id)
            .unwrap_or(false)
    }

    pub fn get(&self, user_id: &str) -> Option<&Session> {
        self.sessions.get(user_id).map(|entry| &entry.session)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values().map(|entry| &entry.session)
    }

    /// Queue `frame` to every session except `except`. Returns the number
    /// of sessions that accepted it.
    pub fn broadcast(&self, frame: &Bytes, except: Option<u64>) -> usize {
        self.iter()
            .filter(|session| Some(session.id) != except)
            .filter(|session| session.handle.send(frame.clone()))
            .count()
    }

    /// Record that the client of `session` holds at least `state`
    pub fn acknowledge(&mut self, session: &Session, state: &StateVector) {
        if let Some(entry) = self.current_entry(session) {
            entry.acked.merge(state);
        }
    }

    /// Document state every connected client is known to hold
    pub fn stable_state(&self) -> Option<StateVector> {
        let mut entries = self.sessions.values();
        let first = entries.next()?.acked.clone();
        Some(entries.fold(first, |acc, entry| acc.meet(&entry.acked)))
    }

    /// Accept an awareness clock sent by the client of `session`. Clocks
    /// must grow; an equal clock is only accepted for a removal.
    pub fn accept_client_clock(&mut self, session: &Session, clock: u64, removal: bool) -> bool {
        let Some(entry) = self.current_entry(session) else {
            return false;
        };
        let accepted = match entry.client_clock {
            None => true,
            Some(last) => clock > last || (clock == last && removal),
        };
        if accepted {
            entry.client_clock = Some(clock);
        }
        accepted
    }

    /// Close every session, used at shutdown
    pub fn close_all(&self, goodbye: &Bytes) {
        for session in self.iter() {
            session.handle.send(goodbye.clone());
            session.handle.close();
        }
    }

    fn current_entry(&mut self, session: &Session) -> Option<&mut SessionEntry> {
        self.sessions
            .get_mut(&session.user_id)
            .filter(|entry| entry.session.id == session.id)
    }
}
