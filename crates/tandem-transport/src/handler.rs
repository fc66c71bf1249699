//! Connection handler - per-connection sync state machine
//!
//! ```text
//! Connecting -> Syncing -> Active -> Closed
//! ```
//!
//! The handler is transport agnostic: it consumes raw frames and produces
//! outbound frames through the session's `ConnectionHandle`.

use crate::broker::RoomBroker;
use crate::error::{TransportError, TransportResult};
use crate::room::{validate_room_name, Room};
use crate::session::{ConnectionHandle, Session};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Instant;
use tandem_protocol::{Codec, Message};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Syncing,
    Active,
    Closed,
}

/// What the transport loop should do after a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

/// Handles a single client connection
pub struct ConnectionHandler {
    broker: Arc<RoomBroker>,
    room: Arc<Room>,
    session: Session,
    codec: Codec,
    state: ConnectionState,
}

impl ConnectionHandler {
    /// Resolve the room, evict any previous session of the same user and
    /// register this connection. The greeting is queued on `handle`.
    pub fn connect(
        broker: Arc<RoomBroker>,
        room_name: &str,
        user_id: Option<&str>,
        handle: ConnectionHandle,
    ) -> TransportResult<Self> {
        let mut state = ConnectionState::Connecting;
        validate_room_name(room_name)?;
        debug!(room = %room_name, conn = handle.id(), ?state, "Resolving room");

        let (room, joined) = broker.join(room_name, user_id, handle);
        state = ConnectionState::Syncing;
        observe!(broker, |m| m.record_connection());

        // frames are queued plain; the transport compresses per peer
        let codec = broker.codec().uncompressed();
        Ok(Self {
            broker,
            room,
            session: joined.session,
            codec,
            state,
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn room(&self) -> &Arc<Room> {
        &self.room
    }

    /// Process one inbound frame. Protocol violations close the connection
    /// and leave the room untouched.
    pub fn process(&mut self, frame: &[u8]) -> Flow {
        if self.state == ConnectionState::Closed {
            return Flow::Close;
        }

        match self.dispatch(frame) {
            Ok(flow) => {
                if flow == Flow::Close {
                    self.close();
                }
                flow
            }
            Err(TransportError::Evicted) => {
                debug!(room = %self.room.name(), conn = self.session.id, "Dropping frame from replaced session");
                self.close();
                Flow::Close
            }
            Err(e) => {
                warn!(
                    room = %self.room.name(),
                    user = %self.session.user_id,
                    conn = self.session.id,
                    error = %e,
                    "Protocol violation, closing connection"
                );
                observe!(self.broker, |m| m.protocol_violations.inc());
                self.close();
                Flow::Close
            }
        }
    }

    fn dispatch(&mut self, frame: &[u8]) -> TransportResult<Flow> {
        let message = self.codec.decode(frame)?;
        observe!(self.broker, |m| m
            .frames_received
            .with_label_values(&[message.kind().as_str()])
            .inc());

        match message {
            Message::SyncStep1(client_state) => {
                self.room.sync_step1(&self.session, &client_state)?;
            }
            Message::SyncStep2(update) => {
                // peers only ever receive incremental updates
                let forward = self.codec.encode(&Message::Update(update.clone()));
                let recipients = self.room.apply_update(&self.session, &update, &forward)?;
                observe!(self.broker, |m| m.updates_broadcast.inc_by(recipients as u64));
                if self.state == ConnectionState::Syncing {
                    self.state = ConnectionState::Active;
                    debug!(room = %self.room.name(), conn = self.session.id, "Initial sync complete");
                }
            }
            Message::Update(update) => {
                let forward = Bytes::copy_from_slice(frame);
                let recipients = self.room.apply_update(&self.session, &update, &forward)?;
                observe!(self.broker, |m| m.updates_broadcast.inc_by(recipients as u64));
            }
            Message::Awareness(update) => {
                self.room.apply_awareness(&self.session, &update, Instant::now())?;
            }
            Message::Close => {
                debug!(room = %self.room.name(), conn = self.session.id, "Client requested close");
                return Ok(Flow::Close);
            }
        }
        Ok(Flow::Continue)
    }

    /// Leave the room. Idempotent; runs on clean close, transport error
    /// and drop alike.
    pub fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.state = ConnectionState::Closed;

        self.session.handle.close();
        let remaining = self.room.leave(&self.session);
        if remaining == 0 {
            self.broker.release_if_empty(&self.room);
        }
        observe!(self.broker, |m| m.record_disconnection());
        info!(
            room = %self.room.name(),
            user = %self.session.user_id,
            conn = self.session.id,
            "Connection closed"
        );
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Outbound;
    use tandem_core::{AwarenessEntry, AwarenessUpdate, Document, UserPresence};
    use tokio::sync::mpsc::Receiver;

    struct Client {
        handler: ConnectionHandler,
        rx: Receiver<Outbound>,
        doc: Document,
    }

    impl Client {
        fn connect(broker: &Arc<RoomBroker>, room: &str, user: Option<&str>, replica: u64) -> Self {
            let (handle, rx) = ConnectionHandle::new(broker.next_connection_id());
            let handler = ConnectionHandler::connect(broker.clone(), room, user, handle).unwrap();
            Self {
                handler,
                rx,
                doc: Document::new(replica),
            }
        }

        /// Apply everything queued for this client; returns whether a close
        /// was requested
        fn pump(&mut self) -> bool {
            let codec = Codec::default();
            let mut closed = false;
            while let Ok(item) = self.rx.try_recv() {
                match item {
                    Outbound::Frame(frame) => match codec.decode(&frame).unwrap() {
                        Message::SyncStep2(update) | Message::Update(update) => {
                            self.doc.apply_remote_update(&update).unwrap();
                        }
                        _ => {}
                    },
                    Outbound::Close => closed = true,
                }
            }
            closed
        }

        fn send(&mut self, message: &Message) -> Flow {
            let frame = Codec::default().encode(message);
            self.handler.process(&frame)
        }

        fn type_text(&mut self, pos: usize, text: &str) -> Flow {
            let update = self.doc.apply_local_insert(pos, text).unwrap();
            self.send(&Message::Update(update))
        }
    }

    #[test]
    fn test_handshake_reaches_active() {
        let broker = Arc::new(RoomBroker::default());
        let mut client = Client::connect(&broker, "r1", Some("u1"), 1);
        assert_eq!(client.handler.state(), ConnectionState::Syncing);

        let sv = client.doc.state_vector();
        assert_eq!(client.send(&Message::SyncStep1(sv)), Flow::Continue);
        let own = client.doc.encode_state_as_update();
        assert_eq!(client.send(&Message::SyncStep2(own)), Flow::Continue);
        assert_eq!(client.handler.state(), ConnectionState::Active);
    }

    #[test]
    fn test_two_clients_converge() {
        let broker = Arc::new(RoomBroker::default());
        let mut a = Client::connect(&broker, "r1", Some("a"), 1);
        let mut b = Client::connect(&broker, "r1", Some("b"), 2);
        a.pump();
        b.pump();

        // concurrent edits at the same position
        assert_eq!(a.type_text(0, "hi"), Flow::Continue);
        let concurrent = b.doc.apply_local_insert(0, "yo").unwrap();
        assert_eq!(b.send(&Message::Update(concurrent)), Flow::Continue);
        a.pump();
        b.pump();

        assert_eq!(a.doc.current_text(), "hiyo");
        assert_eq!(b.doc.current_text(), a.doc.current_text());
        assert_eq!(a.handler.room().text(), a.doc.current_text());
    }

    #[test]
    fn test_late_joiner_catches_up_through_sync() {
        let broker = Arc::new(RoomBroker::default());
        let mut a = Client::connect(&broker, "r1", Some("a"), 1);
        a.type_text(0, "hello world");

        let mut late = Client::connect(&broker, "r1", Some("late"), 2);
        let sv = late.doc.state_vector();
        late.send(&Message::SyncStep1(sv));
        late.pump();
        assert_eq!(late.doc.current_text(), "hello world");
    }

    #[test]
    fn test_malformed_frame_closes_only_offender() {
        let broker = Arc::new(RoomBroker::default());
        let mut good = Client::connect(&broker, "r1", Some("good"), 1);
        let mut bad = Client::connect(&broker, "r1", Some("bad"), 2);
        good.type_text(0, "safe");

        assert_eq!(bad.handler.process(&[0, 2, 0xff, 0xff]), Flow::Close);
        assert_eq!(bad.handler.state(), ConnectionState::Closed);
        assert!(bad.pump());

        assert_eq!(good.handler.state(), ConnectionState::Syncing);
        assert_eq!(good.handler.room().text(), "safe");
        assert_eq!(good.handler.room().session_count(), 1);
        assert_eq!(good.type_text(4, "!"), Flow::Continue);
    }

    #[test]
    fn test_conflicting_operation_is_a_violation() {
        let broker = Arc::new(RoomBroker::default());
        let mut a = Client::connect(&broker, "r1", Some("a"), 1);
        a.type_text(0, "x");

        // same id, different character
        let mut forger = Client::connect(&broker, "r1", Some("forger"), 1);
        let forged = forger.doc.apply_local_insert(0, "y").unwrap();
        assert_eq!(forger.send(&Message::Update(forged)), Flow::Close);
        assert_eq!(a.handler.room().text(), "x");
    }

    #[test]
    fn test_reconnect_closes_old_handle() {
        let broker = Arc::new(RoomBroker::default());
        let mut h1 = Client::connect(&broker, "r1", Some("u1"), 1);
        let h2 = Client::connect(&broker, "r1", Some("u1"), 2);

        assert!(h1.pump());
        let room = h2.handler.room().clone();
        assert_eq!(room.session_ids(), vec![h2.handler.session().id]);

        // the old connection's frames are refused, then it cleans up
        assert_eq!(h1.type_text(0, "stale"), Flow::Close);
        drop(h1);
        assert_eq!(room.session_ids(), vec![h2.handler.session().id]);
        assert_eq!(room.text(), "");
        assert!(broker.get("r1").is_some());
    }

    #[test]
    fn test_close_is_idempotent_and_releases_room() {
        let broker = Arc::new(RoomBroker::default());
        let mut a = Client::connect(&broker, "r1", Some("a"), 1);
        let presence = AwarenessUpdate {
            entries: vec![AwarenessEntry {
                user_id: "a".into(),
                clock: 1,
                state: Some(UserPresence::named("A")),
            }],
        };
        a.send(&Message::Awareness(presence));

        assert_eq!(a.send(&Message::Close), Flow::Close);
        a.handler.close();
        a.handler.close();
        assert_eq!(a.handler.process(&[0, 4]), Flow::Close);
        assert!(broker.get("r1").is_none());
        assert_eq!(broker.stats().rooms, 0);
    }

    #[test]
    fn test_drop_leaves_room() {
        let broker = Arc::new(RoomBroker::default());
        let a = Client::connect(&broker, "r1", Some("a"), 1);
        let b = Client::connect(&broker, "r1", None, 2);
        let room = a.handler.room().clone();
        assert_eq!(room.session_count(), 2);
        drop(a);
        assert_eq!(room.session_count(), 1);
        drop(b);
        assert!(broker.get("r1").is_none());
    }

    #[test]
    fn test_invalid_room_name_rejected() {
        let broker = Arc::new(RoomBroker::default());
        let (handle, _rx) = ConnectionHandle::new(1);
        assert!(matches!(
            ConnectionHandler::connect(broker, "bad\u{7}", None, handle),
            Err(TransportError::InvalidRoomName(_))
        ));
    }
}
