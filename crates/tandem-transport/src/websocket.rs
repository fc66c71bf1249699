//! WebSocket transport for Tandem
//!
//! Clients connect to `ws://host:port/<room>?userId=<id>`. Every binary
//! message carries exactly one protocol frame. Adding `compress=lz4` to the
//! query opts the client into LZ4-compressed frames from the server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{accept_hdr_async_with_config, tungstenite::Message};
use tracing::{debug, error, info, warn};
use url::Url;

use tandem_protocol::Codec;

use crate::broker::RoomBroker;
use crate::error::{TransportError, TransportResult};
use crate::handler::{ConnectionHandler, Flow};
use crate::rate_limit::{RateLimitConfig, RateLimiter};
use crate::room::{validate_room_name, DEFAULT_ROOM};
use crate::session::Outbound;

/// A peer must answer a ping within this long
pub const DEFAULT_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(30);

/// Room and user requested by a connecting client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionTarget {
    pub room: String,
    pub user_id: Option<String>,
    /// Client accepts LZ4-compressed frames
    pub compress: bool,
}

/// Parse the request target of the upgrade request
pub fn parse_target(uri: &str) -> TransportResult<ConnectionTarget> {
    let url = Url::parse(&format!("ws://localhost{}", uri))
        .map_err(|e| TransportError::InvalidTarget(format!("{}: {}", uri, e)))?;

    let path = url.path();
    let raw = path.strip_prefix('/').unwrap_or(path);
    let room = urlencoding::decode(raw)
        .map_err(|e| TransportError::InvalidRoomName(e.to_string()))?
        .into_owned();
    let room = if room.is_empty() { DEFAULT_ROOM.to_string() } else { room };
    validate_room_name(&room)?;

    let mut user_id = None;
    let mut compress = false;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "userId" if !value.is_empty() => user_id = Some(value.into_owned()),
            "compress" => match value.as_ref() {
                "lz4" => compress = true,
                "" | "none" => compress = false,
                other => {
                    return Err(TransportError::InvalidTarget(format!("unsupported compression {:?}", other)));
                }
            },
            _ => {}
        }
    }

    Ok(ConnectionTarget { room, user_id, compress })
}

/// WebSocket Server for Tandem
pub struct WebSocketServer {
    broker: Arc<RoomBroker>,
    addr: SocketAddr,
    rate_limit: Option<RateLimitConfig>,
    keepalive: Duration,
}

impl WebSocketServer {
    pub fn new(broker: Arc<RoomBroker>, addr: SocketAddr) -> Self {
        Self {
            broker,
            addr,
            rate_limit: None,
            keepalive: DEFAULT_KEEPALIVE_TIMEOUT,
        }
    }

    /// Limit the frames each connection may send
    pub fn with_rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.rate_limit = Some(config);
        self
    }

    /// Ping every `timeout` and drop peers that have not answered the
    /// previous ping. Also bounds how long a single write may block.
    pub fn with_keepalive(mut self, timeout: Duration) -> Self {
        self.keepalive = timeout;
        self
    }

    /// Bind the configured address and serve forever
    pub async fn run(&self) -> TransportResult<()> {
        let listener = TcpListener::bind(self.addr).await?;
        info!(addr = %self.addr, "Tandem WebSocket server listening");
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> TransportResult<()> {
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let broker = self.broker.clone();
                    let rate_limit = self.rate_limit;
                    let keepalive = self.keepalive;

                    tokio::spawn(async move {
                        if let Err(e) =
                            Self::handle_connection(stream, peer_addr, broker, rate_limit, keepalive).await
                        {
                            warn!(peer = %peer_addr, error = %e, "WebSocket connection error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        peer_addr: SocketAddr,
        broker: Arc<RoomBroker>,
        rate_limit: Option<RateLimitConfig>,
        keepalive: Duration,
    ) -> TransportResult<()> {
        let codec = broker.codec();
        // the codec limit covers the whole frame, header included
        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(codec.max_frame_size());
        ws_config.max_frame_size = Some(codec.max_frame_size());

        let mut target = None;
        let ws_stream = accept_hdr_async_with_config(
            stream,
            |request: &Request, response: Response| match parse_target(&request.uri().to_string()) {
                Ok(parsed) => {
                    target = Some(parsed);
                    Ok(response)
                }
                Err(e) => {
                    let mut rejection = ErrorResponse::new(Some(e.to_string()));
                    *rejection.status_mut() = StatusCode::BAD_REQUEST;
                    Err(rejection)
                }
            },
            Some(ws_config),
        )
        .await?;
        let target = target.ok_or_else(|| TransportError::InvalidTarget("missing request target".into()))?;

        let (handle, mut outbound) = broker.new_handle();
        let closer = handle.clone();
        let mut handler =
            ConnectionHandler::connect(broker.clone(), &target.room, target.user_id.as_deref(), handle)?;
        let conn = handler.session().id;
        let (mut write, mut read) = ws_stream.split();
        let mut limiter = rate_limit.map(RateLimiter::new);

        let mut pings = interval_at(Instant::now() + keepalive, keepalive);
        pings.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut awaiting_pong = false;

        info!(
            peer = %peer_addr,
            room = %target.room,
            user = %handler.session().user_id,
            conn,
            compress = target.compress,
            "WebSocket client connected"
        );

        loop {
            tokio::select! {
                // Frames from the client
                msg = read.next() => {
                    if matches!(msg, Some(Ok(_))) {
                        awaiting_pong = false;
                    }
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            if let Some(limiter) = limiter.as_mut() {
                                if !limiter.try_acquire() {
                                    observe!(broker, |m| m.rate_limited_frames.inc());
                                    debug!(conn, "Rate limited, delaying frame");
                                    tokio::time::sleep(limiter.wait_time()).await;
                                    limiter.try_acquire();
                                }
                            }
                            if handler.process(&data) == Flow::Close {
                                break;
                            }
                        }
                        Some(Ok(Message::Text(_))) => {
                            warn!(conn, "Text frames are not part of the protocol, closing connection");
                            observe!(broker, |m| m.protocol_violations.inc());
                            break;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if !send_within(&mut write, Message::Pong(data), keepalive).await {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            info!(conn, "WebSocket client disconnected");
                            break;
                        }
                        Some(Ok(_)) => {
                            // Pong and raw frames only prove liveness
                        }
                        Some(Err(e)) => {
                            warn!(conn, error = %e, "WebSocket read error");
                            break;
                        }
                    }
                }

                // Frames queued by the room
                item = outbound.recv() => {
                    match item {
                        Some(Outbound::Frame(frame)) => {
                            let Some(message) = outgoing(&codec, &frame, target.compress, conn) else {
                                break;
                            };
                            if !send_within(&mut write, message, keepalive).await {
                                warn!(conn, "WebSocket write failed or stalled, closing connection");
                                break;
                            }
                        }
                        Some(Outbound::Close) | None => {
                            debug!(conn, "Connection closed by server");
                            break;
                        }
                    }
                }

                // Closed without room for the close marker
                _ = closer.closed() => {
                    debug!(conn, "Connection handle closed");
                    break;
                }

                _ = pings.tick() => {
                    if awaiting_pong {
                        warn!(conn, timeout = ?keepalive, "No pong from client, closing connection");
                        observe!(broker, |m| m.stalled_connections.inc());
                        break;
                    }
                    if !send_within(&mut write, Message::Ping(Vec::new()), keepalive).await {
                        break;
                    }
                    awaiting_pong = true;
                }
            }
        }

        handler.close();

        // flush what was queued before the close marker, unless the peer
        // stopped reading
        let flush = async {
            while let Ok(Outbound::Frame(frame)) = outbound.try_recv() {
                let Some(message) = outgoing(&codec, &frame, target.compress, conn) else {
                    return;
                };
                if write.send(message).await.is_err() {
                    return;
                }
            }
            let _ = write.send(Message::Close(None)).await;
        };
        if timeout(keepalive, flush).await.is_err() {
            debug!(conn, "Gave up flushing to unresponsive client");
        }
        Ok(())
    }
}

/// Encode a queued frame the way this peer asked for it
fn outgoing(codec: &Codec, frame: &Bytes, compress: bool, conn: u64) -> Option<Message> {
    match codec.transcode(frame, compress) {
        Ok(frame) => Some(Message::Binary(frame.to_vec())),
        Err(e) => {
            error!(conn, error = %e, "Dropping connection after untranscodable frame");
            None
        }
    }
}

/// Send one message, giving up after `limit`
async fn send_within<S>(write: &mut S, message: Message, limit: Duration) -> bool
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    match timeout(limit, write.send(message)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            debug!(error = %e, "WebSocket write error");
            false
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BrokerConfig;
    use crate::room::Room;
    use tandem_core::{AwarenessEntry, AwarenessUpdate, Document, Update, UserPresence};
    use tandem_protocol::{Message as Frame, DEFAULT_MAX_FRAME_SIZE};
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn start_server() -> (Arc<RoomBroker>, SocketAddr) {
        start_server_with(BrokerConfig::default(), DEFAULT_KEEPALIVE_TIMEOUT).await
    }

    async fn start_server_with(config: BrokerConfig, keepalive: Duration) -> (Arc<RoomBroker>, SocketAddr) {
        let broker = Arc::new(RoomBroker::new(config));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = WebSocketServer::new(broker.clone(), addr).with_keepalive(keepalive);
        tokio::spawn(async move { server.serve(listener).await });
        (broker, addr)
    }

    async fn connect(addr: SocketAddr, path: &str) -> Client {
        let (client, _) = connect_async(format!("ws://{}{}", addr, path)).await.unwrap();
        client
    }

    /// Next binary message as sent, or `None` once the server closed the socket
    async fn next_binary(client: &mut Client) -> Option<Vec<u8>> {
        loop {
            let msg = timeout(Duration::from_secs(5), client.next())
                .await
                .expect("timed out waiting for frame");
            match msg {
                Some(Ok(Message::Binary(data))) => return Some(data),
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return None,
                Some(Ok(_)) => continue,
            }
        }
    }

    /// Next protocol frame, or `None` once the server closed the socket
    async fn next_frame(client: &mut Client) -> Option<Frame> {
        let data = next_binary(client).await?;
        Some(Codec::default().decode(&data).unwrap())
    }

    /// Server-side cleanup runs on the connection task
    async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..150 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        check()
    }

    /// Frames are applied on the server's connection task
    async fn wait_for_text(room: &Room, expected: &str) {
        wait_until(|| room.text() == expected).await;
        assert_eq!(room.text(), expected);
    }

    async fn send(client: &mut Client, frame: &Frame) {
        let bytes = Codec::default().encode(frame);
        client.send(Message::Binary(bytes.to_vec())).await.unwrap();
    }

    #[test]
    fn test_parse_target() {
        assert_eq!(
            parse_target("/r1?userId=u1").unwrap(),
            ConnectionTarget { room: "r1".into(), user_id: Some("u1".into()), compress: false }
        );
        assert_eq!(parse_target("/").unwrap().room, DEFAULT_ROOM);
        assert_eq!(parse_target("/my%20doc?userId=").unwrap(), ConnectionTarget {
            room: "my doc".into(),
            user_id: None,
            compress: false,
        });
        assert_eq!(parse_target("/team/notes").unwrap().room, "team/notes");
        assert!(matches!(parse_target("/bad%07"), Err(TransportError::InvalidRoomName(_))));
    }

    #[test]
    fn test_parse_target_compression() {
        assert!(parse_target("/r1?userId=u1&compress=lz4").unwrap().compress);
        assert!(!parse_target("/r1?compress=none").unwrap().compress);
        assert!(matches!(
            parse_target("/r1?compress=gzip"),
            Err(TransportError::InvalidTarget(_))
        ));
    }

    #[tokio::test]
    async fn test_two_clients_sync_over_websocket() {
        let (_broker, addr) = start_server().await;
        let mut alice = connect(addr, "/notes?userId=alice").await;
        assert!(matches!(next_frame(&mut alice).await, Some(Frame::SyncStep1(_))));
        let mut bob = connect(addr, "/notes?userId=bob").await;
        assert!(matches!(next_frame(&mut bob).await, Some(Frame::SyncStep1(_))));

        let mut doc_a = Document::new(1);
        let update = doc_a.apply_local_insert(0, "hello").unwrap();
        send(&mut alice, &Frame::Update(update.clone())).await;

        let mut doc_b = Document::new(2);
        match next_frame(&mut bob).await {
            Some(Frame::Update(received)) => {
                assert_eq!(received, update);
                doc_b.apply_remote_update(&received).unwrap();
            }
            other => panic!("unexpected {:?}", other),
        }

        let reply = doc_b.apply_local_insert(5, " world").unwrap();
        send(&mut bob, &Frame::Update(reply)).await;
        match next_frame(&mut alice).await {
            Some(Frame::Update(received)) => {
                doc_a.apply_remote_update(&received).unwrap();
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(doc_a.current_text(), "hello world");
        assert_eq!(doc_b.current_text(), doc_a.current_text());
    }

    #[tokio::test]
    async fn test_late_joiner_syncs_and_empty_room_is_released() {
        let (broker, addr) = start_server().await;
        let mut writer = connect(addr, "/draft?userId=w").await;
        next_frame(&mut writer).await;

        let mut doc = Document::new(3);
        let update = doc.apply_local_insert(0, "kept").unwrap();
        send(&mut writer, &Frame::SyncStep2(update)).await;
        wait_for_text(&broker.get("draft").unwrap(), "kept").await;

        let mut reader = connect(addr, "/draft?userId=r").await;
        next_frame(&mut reader).await;
        send(&mut reader, &Frame::SyncStep1(Document::new(4).state_vector())).await;
        let mut copy = Document::new(4);
        match next_frame(&mut reader).await {
            Some(Frame::SyncStep2(diff)) => {
                copy.apply_remote_update(&diff).unwrap();
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(copy.current_text(), "kept");

        send(&mut writer, &Frame::Close).await;
        send(&mut reader, &Frame::Close).await;
        assert!(next_frame(&mut writer).await.is_none());
        assert!(next_frame(&mut reader).await.is_none());

        assert!(wait_until(|| broker.get("draft").is_none()).await);
    }

    #[tokio::test]
    async fn test_reconnect_evicts_first_socket() {
        let (broker, addr) = start_server().await;
        let mut first = connect(addr, "/r1?userId=u1").await;
        next_frame(&mut first).await;
        let mut second = connect(addr, "/r1?userId=u1").await;
        next_frame(&mut second).await;

        assert!(next_frame(&mut first).await.is_none());
        let room = broker.get("r1").unwrap();
        assert_eq!(room.session_count(), 1);

        // the surviving connection still works
        let update: Update = Document::new(8).apply_local_insert(0, "ok").unwrap();
        send(&mut second, &Frame::Update(update)).await;
        wait_for_text(&room, "ok").await;
    }

    #[tokio::test]
    async fn test_malformed_frame_closes_only_sender() {
        let (broker, addr) = start_server().await;
        let mut good = connect(addr, "/r1?userId=good").await;
        next_frame(&mut good).await;
        let mut bad = connect(addr, "/r1?userId=bad").await;
        next_frame(&mut bad).await;

        bad.send(Message::Binary(vec![0, 42])).await.unwrap();
        assert!(next_frame(&mut bad).await.is_none());

        let update = Document::new(5).apply_local_insert(0, "still here").unwrap();
        send(&mut good, &Frame::Update(update)).await;
        let room = broker.get("r1").unwrap();
        wait_for_text(&room, "still here").await;
        assert_eq!(room.session_count(), 1);
    }

    #[tokio::test]
    async fn test_invalid_room_is_rejected_at_handshake() {
        let (broker, addr) = start_server().await;
        assert!(connect_async(format!("ws://{}/bad%07room", addr)).await.is_err());
        assert_eq!(broker.stats().rooms, 0);
    }

    #[tokio::test]
    async fn test_unanswered_pings_drop_client() {
        let (broker, addr) = start_server_with(BrokerConfig::default(), Duration::from_millis(150)).await;

        let mut awake = connect(addr, "/awake?userId=a").await;
        next_frame(&mut awake).await;
        // polling the stream answers pings
        let reader = tokio::spawn(async move { while let Some(Ok(_)) = awake.next().await {} });

        // joins, then never reads again, so pongs are never sent
        let mut idle = connect(addr, "/idle?userId=i").await;
        next_frame(&mut idle).await;
        assert!(broker.get("idle").is_some());

        assert!(wait_until(|| broker.get("idle").is_none()).await);
        assert_eq!(broker.get("awake").unwrap().session_count(), 1);
        reader.abort();
        drop(idle);
    }

    #[tokio::test]
    async fn test_oversized_message_closes_sender() {
        let config = BrokerConfig {
            codec: Codec::new(0, 256),
            ..BrokerConfig::default()
        };
        let (broker, addr) = start_server_with(config, DEFAULT_KEEPALIVE_TIMEOUT).await;
        let mut good = connect(addr, "/r1?userId=good").await;
        next_frame(&mut good).await;
        let mut big = connect(addr, "/r1?userId=big").await;
        next_frame(&mut big).await;

        big.send(Message::Binary(vec![0; 4096])).await.unwrap();
        assert!(next_frame(&mut big).await.is_none());

        let room = broker.get("r1").unwrap();
        assert!(wait_until(|| room.session_count() == 1).await);
        let update = Document::new(6).apply_local_insert(0, "small").unwrap();
        send(&mut good, &Frame::Update(update)).await;
        wait_for_text(&room, "small").await;
    }

    #[tokio::test]
    async fn test_dropped_socket_removes_presence_and_releases_room() {
        let (broker, addr) = start_server().await;
        let mut observer = connect(addr, "/r1?userId=observer").await;
        next_frame(&mut observer).await;
        let mut gone = connect(addr, "/r1?userId=gone").await;
        next_frame(&mut gone).await;

        let presence = AwarenessUpdate {
            entries: vec![AwarenessEntry {
                user_id: "gone".into(),
                clock: 1,
                state: Some(UserPresence::named("Gone")),
            }],
        };
        send(&mut gone, &Frame::Awareness(presence)).await;
        match next_frame(&mut observer).await {
            Some(Frame::Awareness(update)) => {
                assert_eq!(update.entries[0].user_id, "gone");
                assert!(update.entries[0].state.is_some());
            }
            other => panic!("unexpected {:?}", other),
        }

        // no close frame, the TCP stream just goes away
        drop(gone);
        match next_frame(&mut observer).await {
            Some(Frame::Awareness(update)) => {
                assert_eq!(update.entries.len(), 1);
                assert_eq!(update.entries[0].user_id, "gone");
                assert!(update.entries[0].state.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(broker.get("r1").unwrap().session_count(), 1);

        drop(observer);
        assert!(wait_until(|| broker.get("r1").is_none()).await);
        assert_eq!(broker.stats().rooms, 0);
    }

    #[tokio::test]
    async fn test_compression_only_for_clients_that_ask() {
        let config = BrokerConfig {
            codec: Codec::new(64, DEFAULT_MAX_FRAME_SIZE),
            ..BrokerConfig::default()
        };
        let (_broker, addr) = start_server_with(config, DEFAULT_KEEPALIVE_TIMEOUT).await;
        let mut plain = connect(addr, "/r1?userId=plain").await;
        next_frame(&mut plain).await;
        let mut packed = connect(addr, "/r1?userId=packed&compress=lz4").await;
        next_frame(&mut packed).await;

        let large = "abc".repeat(200);
        let codec = Codec::new(64, DEFAULT_MAX_FRAME_SIZE);

        // plain sender, compressing receiver
        let update = Document::new(1).apply_local_insert(0, &large).unwrap();
        send(&mut plain, &Frame::Update(update.clone())).await;
        let data = next_binary(&mut packed).await.unwrap();
        assert_eq!(data[0] & 0x01, 0x01);
        assert_eq!(codec.decode(&data).unwrap(), Frame::Update(update));

        // compressed sender, plain receiver
        let update = Document::new(2).apply_local_insert(0, &large).unwrap();
        let frame = codec.encode(&Frame::Update(update.clone()));
        assert_eq!(frame[0] & 0x01, 0x01);
        packed.send(Message::Binary(frame.to_vec())).await.unwrap();
        let data = next_binary(&mut plain).await.unwrap();
        assert_eq!(data[0], 0);
        assert_eq!(codec.decode(&data).unwrap(), Frame::Update(update));
    }
}
