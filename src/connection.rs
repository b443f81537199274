//! Per-socket protocol state machine.
//!
//! A [`Connection`] starts `Unestablished`. The first bytes decide the
//! protocol: an HTTP-shaped request goes through the WebSocket handshake,
//! anything else makes it a plain TCP connection and is delivered as-is.
//! Request heads and WebSocket frames are reassembled from as many reads as
//! they take. Application behaviour is injected through [`ConnectionHandler`].

use std::fmt;
use std::io::{self, Write};
use std::net::SocketAddr;

use bytes::{Buf, BytesMut};
use log::{debug, info, warn};

use crate::buffer::Buffer;
use crate::error::{FrameSignal, SendError};
use crate::net::framing;
use crate::net::handshake::{self, Detection, HandshakeDecision, HandshakeRequest};

/// Most unconsumed input a connection may hold: one maximal client frame.
pub const MAX_INBOUND_LEN: usize = framing::MAX_PAYLOAD_LEN + framing::MAX_HEADER_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Hands out process-unique, increasing connection ids.
#[derive(Debug, Default)]
pub struct IdAllocator {
    next: u64,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&mut self) -> ConnectionId {
        let id = ConnectionId(self.next);
        self.next += 1;
        id
    }
}

/// Protocol spoken on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionType {
    /// Plain byte stream, no framing.
    #[default]
    Tcp,
    /// RFC 6455 after a successful upgrade handshake.
    WebSocket,
    /// Reserved, never detected.
    As3Socket,
    /// Reserved, never detected.
    Comet,
    /// Reserved, never detected.
    Sgp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unestablished,
    Handshaking,
    Established,
    Closed,
}

/// Application hooks for one connection.
pub trait ConnectionHandler {
    /// Decides whether a WebSocket upgrade is accepted.
    fn on_proposed(
        &mut self,
        _session: &mut Session<'_>,
        _request: &HandshakeRequest,
    ) -> HandshakeDecision {
        HandshakeDecision::accept()
    }

    /// Called with every application payload, already unframed.
    fn on_recv(&mut self, session: &mut Session<'_>, data: Buffer);

    /// Called once when the connection reaches `Closed`.
    fn on_close(&mut self, _id: ConnectionId) {}
}

/// Creates one handler per accepted socket.
pub trait HandlerFactory {
    type Handler: ConnectionHandler;

    /// Admission check run before a socket is registered. Refused sockets
    /// are closed immediately.
    fn admit(&mut self, _peer: SocketAddr) -> bool {
        true
    }

    fn create(&mut self, id: ConnectionId, peer: SocketAddr) -> Self::Handler;
}

/// Messages a hook asked to fan out to every live connection.
#[derive(Debug, Default)]
pub struct Outbox {
    broadcasts: Vec<Buffer>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.broadcasts.is_empty()
    }

    pub fn take_broadcasts(&mut self) -> Vec<Buffer> {
        std::mem::take(&mut self.broadcasts)
    }
}

/// The socket side of a connection: everything except the handler.
struct Endpoint<S> {
    id: ConnectionId,
    kind: ConnectionType,
    state: ConnectionState,
    stream: S,
    outbound: BytesMut,
    /// Received bytes not yet consumed: a partial request head or frame.
    inbound: BytesMut,
    request: Option<HandshakeRequest>,
}

impl<S: Write> Endpoint<S> {
    fn send(&mut self, msg: &Buffer) -> Result<(), SendError> {
        if self.kind == ConnectionType::WebSocket {
            let frame = framing::encode_frame(msg)?;
            return self.send_raw(&frame);
        }
        self.send_raw(msg)
    }

    fn send_raw(&mut self, msg: &Buffer) -> Result<(), SendError> {
        if self.state == ConnectionState::Closed {
            return Err(SendError::Closed);
        }
        self.outbound.extend_from_slice(msg.as_slice());
        self.flush()
    }

    /// Writes as much pending output as the socket takes. The rest stays
    /// queued until the next writable event.
    fn flush(&mut self) -> Result<(), SendError> {
        while !self.outbound.is_empty() {
            match self.stream.write(&self.outbound) {
                Ok(0) => return Err(self.fail(io::ErrorKind::WriteZero.into())),
                Ok(n) => self.outbound.advance(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(self.fail(e)),
            }
        }
        Ok(())
    }

    fn fail(&mut self, e: io::Error) -> SendError {
        warn!("{}: Failed to send message: {}", self.id, e);
        self.shutdown();
        SendError::Io(e)
    }

    fn shutdown(&mut self) {
        if self.state != ConnectionState::Closed {
            info!("{}: Connection closed", self.id);
        }
        self.state = ConnectionState::Closed;
        self.outbound.clear();
        self.inbound.clear();
    }
}

trait Transmit {
    fn id(&self) -> ConnectionId;
    fn kind(&self) -> ConnectionType;
    fn request(&self) -> Option<&HandshakeRequest>;
    fn send(&mut self, msg: &Buffer) -> Result<(), SendError>;
    fn send_raw(&mut self, msg: &Buffer) -> Result<(), SendError>;
    fn close(&mut self);
}

impl<S: Write> Transmit for Endpoint<S> {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn kind(&self) -> ConnectionType {
        self.kind
    }

    fn request(&self) -> Option<&HandshakeRequest> {
        self.request.as_ref()
    }

    fn send(&mut self, msg: &Buffer) -> Result<(), SendError> {
        Endpoint::send(self, msg)
    }

    fn send_raw(&mut self, msg: &Buffer) -> Result<(), SendError> {
        Endpoint::send_raw(self, msg)
    }

    fn close(&mut self) {
        self.shutdown();
    }
}

/// What a hook can do with the connection it runs on.
pub struct Session<'a> {
    endpoint: &'a mut dyn Transmit,
    outbox: &'a mut Outbox,
}

impl Session<'_> {
    pub fn id(&self) -> ConnectionId {
        self.endpoint.id()
    }

    pub fn kind(&self) -> ConnectionType {
        self.endpoint.kind()
    }

    /// Request path of the upgrade handshake, once it has been accepted.
    pub fn path(&self) -> Option<&str> {
        self.endpoint.request().map(|r| r.path.as_str())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.endpoint.request().and_then(|r| r.header(name))
    }

    /// Sends `msg`, framed when the connection speaks WebSocket.
    pub fn send(&mut self, msg: &Buffer) -> Result<(), SendError> {
        self.endpoint.send(msg)
    }

    pub fn send_raw(&mut self, msg: &Buffer) -> Result<(), SendError> {
        self.endpoint.send_raw(msg)
    }

    /// Closes the connection without a WebSocket close frame.
    pub fn close(&mut self) {
        self.endpoint.close();
    }

    /// Queues `msg` for every live connection, this one included.
    pub fn broadcast(&mut self, msg: Buffer) {
        self.outbox.broadcasts.push(msg);
    }
}

pub struct Connection<S, H> {
    endpoint: Endpoint<S>,
    handler: H,
    close_notified: bool,
}

impl<S: Write, H: ConnectionHandler> Connection<S, H> {
    pub fn new(id: ConnectionId, stream: S, handler: H) -> Self {
        Self {
            endpoint: Endpoint {
                id,
                kind: ConnectionType::Tcp,
                state: ConnectionState::Unestablished,
                stream,
                outbound: BytesMut::new(),
                inbound: BytesMut::new(),
                request: None,
            },
            handler,
            close_notified: false,
        }
    }

    #[inline]
    pub fn id(&self) -> ConnectionId {
        self.endpoint.id
    }

    #[inline]
    pub fn kind(&self) -> ConnectionType {
        self.endpoint.kind
    }

    #[inline]
    pub fn state(&self) -> ConnectionState {
        self.endpoint.state
    }

    pub fn is_established(&self) -> bool {
        self.endpoint.state == ConnectionState::Established
    }

    pub fn is_closed(&self) -> bool {
        self.endpoint.state == ConnectionState::Closed
    }

    /// Accepted handshake request. Only set for WebSocket connections.
    pub fn request(&self) -> Option<&HandshakeRequest> {
        self.endpoint.request.as_ref()
    }

    /// True while output is queued behind a full socket.
    pub fn wants_write(&self) -> bool {
        !self.endpoint.outbound.is_empty()
    }

    /// Bytes held back waiting for the rest of a request head or frame.
    pub fn buffered(&self) -> usize {
        self.endpoint.inbound.len()
    }

    pub fn stream(&self) -> &S {
        &self.endpoint.stream
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.endpoint.stream
    }

    /// Handles bytes received before the protocol is known: detection and,
    /// for WebSocket, the whole upgrade handshake. A request head split
    /// across reads is held until its blank line arrives.
    pub fn on_first_recv(&mut self, data: Buffer, outbox: &mut Outbox) {
        if self.endpoint.state != ConnectionState::Unestablished {
            return self.on_raw_recv(data, outbox);
        }

        self.endpoint.inbound.extend_from_slice(data.as_slice());
        match handshake::detect(&self.endpoint.inbound) {
            Detection::Incomplete => {
                debug!("{}: Waiting for the rest of the request head", self.id());
            }
            Detection::Request { request, head_len } => {
                self.endpoint.inbound.advance(head_len);
                self.handshake(request, outbox);
                // Frames sent right behind the head
                self.deliver_frames(outbox);
            }
            Detection::Plain => {
                debug!("{}: Plain TCP connection", self.id());
                self.endpoint.kind = ConnectionType::Tcp;
                self.endpoint.state = ConnectionState::Established;
                let data = Buffer::from_raw(self.endpoint.inbound.split().freeze());
                self.deliver(data, outbox);
            }
        }
        self.notify_if_closed();
    }

    /// Unframes `data` according to the connection type and hands each
    /// payload to the handler. WebSocket input is decoded frame by frame;
    /// a trailing partial frame waits for the next read.
    pub fn on_raw_recv(&mut self, data: Buffer, outbox: &mut Outbox) {
        if self.endpoint.state != ConnectionState::Established {
            debug!("{}: Dropping payload in state {:?}", self.id(), self.state());
            return;
        }

        match self.endpoint.kind {
            ConnectionType::WebSocket => {
                self.endpoint.inbound.extend_from_slice(data.as_slice());
                self.deliver_frames(outbox);
            }
            _ => self.deliver(data, outbox),
        }
        self.notify_if_closed();
    }

    fn deliver_frames(&mut self, outbox: &mut Outbox) {
        while self.is_established() && self.endpoint.kind == ConnectionType::WebSocket {
            let Some((consumed, decoded)) = framing::decode_next(&self.endpoint.inbound) else {
                break;
            };
            self.endpoint.inbound.advance(consumed);

            match decoded {
                Ok(payload) => self.deliver(payload, outbox),
                Err(FrameSignal::Closing) => {
                    debug!("{}: Close frame received", self.id());
                    self.endpoint.shutdown();
                }
                Err(signal) => warn!("{}: Dropping frame: {}", self.id(), signal),
            }
        }
    }

    fn deliver(&mut self, payload: Buffer, outbox: &mut Outbox) {
        let mut session = Session {
            endpoint: &mut self.endpoint,
            outbox,
        };
        self.handler.on_recv(&mut session, payload);
    }

    pub fn send(&mut self, msg: &Buffer) -> Result<(), SendError> {
        let result = self.endpoint.send(msg);
        self.notify_if_closed();
        result
    }

    pub fn send_raw(&mut self, msg: &Buffer) -> Result<(), SendError> {
        let result = self.endpoint.send_raw(msg);
        self.notify_if_closed();
        result
    }

    /// Retries queued output after a writable event.
    pub fn flush(&mut self) -> Result<(), SendError> {
        let result = self.endpoint.flush();
        self.notify_if_closed();
        result
    }

    /// Moves to `Closed` immediately. Queued output is discarded.
    pub fn close(&mut self) {
        self.endpoint.shutdown();
        self.notify_if_closed();
    }

    fn handshake(&mut self, request: HandshakeRequest, outbox: &mut Outbox) {
        self.endpoint.state = ConnectionState::Handshaking;

        let decision = {
            let mut session = Session {
                endpoint: &mut self.endpoint,
                outbox,
            };
            self.handler.on_proposed(&mut session, &request)
        };
        if self.is_closed() {
            return;
        }

        match decision {
            HandshakeDecision::Accept { headers } => {
                let Some(response) = handshake::accept_response(&request, &headers) else {
                    warn!("{}: Handshake without Sec-WebSocket-Key", self.id());
                    return self.endpoint.shutdown();
                };
                let sent = match Buffer::from_text(&response) {
                    Ok(response) => self.endpoint.send_raw(&response).is_ok(),
                    Err(e) => {
                        warn!("{}: Bad handshake response: {}", self.id(), e);
                        false
                    }
                };

                if sent {
                    info!("{}: WebSocket established on {}", self.id(), request.path);
                    self.endpoint.kind = ConnectionType::WebSocket;
                    self.endpoint.state = ConnectionState::Established;
                    self.endpoint.request = Some(request);
                } else {
                    self.endpoint.shutdown();
                }
            }
            HandshakeDecision::Reject => {
                debug!("{}: Handshake rejected for {}", self.id(), request.path);
                let reject = Buffer::from_raw(handshake::reject_response().into_bytes());
                // Best effort: output the socket does not take now is dropped
                if self.endpoint.send_raw(&reject).is_ok() && !self.endpoint.outbound.is_empty() {
                    warn!(
                        "{}: Reject response cut short, {} bytes unsent",
                        self.id(),
                        self.endpoint.outbound.len()
                    );
                }
                self.endpoint.shutdown();
            }
        }
    }

    fn notify_if_closed(&mut self) {
        if self.is_closed() && !self.close_notified {
            self.close_notified = true;
            self.handler.on_close(self.endpoint.id);
        }
    }
}

impl<S, H> fmt::Debug for Connection<S, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.endpoint.id)
            .field("kind", &self.endpoint.kind)
            .field("state", &self.endpoint.state)
            .field("pending", &self.endpoint.outbound.len())
            .field("buffered", &self.endpoint.inbound.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    const UPGRADE: &str = "GET /chat HTTP/1.1\r\n\
        Host: localhost\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Sec-WebSocket-Version: 13\r\n\
        \r\n";

    #[derive(Default)]
    struct Log {
        received: Vec<Buffer>,
        closed: Vec<ConnectionId>,
    }

    struct Recorder {
        log: Rc<RefCell<Log>>,
        decision: HandshakeDecision,
        echo: bool,
    }

    impl ConnectionHandler for Recorder {
        fn on_proposed(
            &mut self,
            _session: &mut Session<'_>,
            _request: &HandshakeRequest,
        ) -> HandshakeDecision {
            self.decision.clone()
        }

        fn on_recv(&mut self, session: &mut Session<'_>, data: Buffer) {
            if self.echo {
                session.send(&data).unwrap();
            }
            self.log.borrow_mut().received.push(data);
        }

        fn on_close(&mut self, id: ConnectionId) {
            self.log.borrow_mut().closed.push(id);
        }
    }

    fn connection(decision: HandshakeDecision) -> (Connection<Vec<u8>, Recorder>, Rc<RefCell<Log>>) {
        let log = Rc::new(RefCell::new(Log::default()));
        let handler = Recorder {
            log: log.clone(),
            decision,
            echo: false,
        };
        (Connection::new(ConnectionId(7), Vec::new(), handler), log)
    }

    fn text(s: &str) -> Buffer {
        Buffer::from_text(s).unwrap()
    }

    fn masked(s: &str) -> Buffer {
        Buffer::from_raw(framing::encode_client_frame(s.as_bytes(), [9, 8, 7, 6]).unwrap())
    }

    fn upgraded() -> (Connection<Vec<u8>, Recorder>, Rc<RefCell<Log>>) {
        let (mut conn, log) = connection(HandshakeDecision::accept());
        conn.on_first_recv(text(UPGRADE), &mut Outbox::new());
        conn.stream_mut().clear();
        (conn, log)
    }

    #[test]
    fn ids_increase() {
        let mut ids = IdAllocator::new();
        assert_eq!(ids.allocate(), ConnectionId(0));
        assert_eq!(ids.allocate(), ConnectionId(1));
        assert_eq!(ids.allocate().to_string(), "conn-2");
    }

    #[test]
    fn non_request_first_payload_becomes_tcp_and_is_delivered() {
        let (mut conn, log) = connection(HandshakeDecision::accept());
        conn.on_first_recv(text("hello\r\n"), &mut Outbox::new());

        assert_eq!(conn.kind(), ConnectionType::Tcp);
        assert_eq!(conn.state(), ConnectionState::Established);
        assert_eq!(log.borrow().received, vec![text("hello\r\n")]);
        assert!(conn.stream().is_empty());
    }

    #[test]
    fn binary_first_payload_becomes_tcp() {
        let (mut conn, log) = connection(HandshakeDecision::accept());
        conn.on_first_recv(Buffer::from_raw(vec![0xde, 0xad, 0xbe, 0xef]), &mut Outbox::new());

        assert_eq!(conn.kind(), ConnectionType::Tcp);
        assert_eq!(log.borrow().received[0].as_slice(), &[0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn tcp_payloads_are_forwarded_verbatim() {
        let (mut conn, log) = connection(HandshakeDecision::accept());
        conn.on_first_recv(text("one"), &mut Outbox::new());
        conn.on_raw_recv(text("two"), &mut Outbox::new());
        assert_eq!(log.borrow().received, vec![text("one"), text("two")]);
    }

    #[test]
    fn upgrade_sends_101_and_establishes_websocket() {
        let (mut conn, log) = connection(HandshakeDecision::accept());
        conn.on_first_recv(text(UPGRADE), &mut Outbox::new());

        assert_eq!(conn.kind(), ConnectionType::WebSocket);
        assert_eq!(conn.state(), ConnectionState::Established);
        assert_eq!(conn.request().unwrap().path, "/chat");
        assert!(log.borrow().received.is_empty());

        let response = String::from_utf8(conn.stream().clone()).unwrap();
        assert!(response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(response.ends_with("\r\n\r\n"));
    }

    #[test]
    fn upgrade_without_key_closes() {
        let (mut conn, log) = connection(HandshakeDecision::accept());
        conn.on_first_recv(text("GET / HTTP/1.1\r\nUpgrade: websocket\r\n\r\n"), &mut Outbox::new());

        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(conn.stream().is_empty());
        assert_eq!(log.borrow().closed, vec![ConnectionId(7)]);
    }

    #[test]
    fn rejected_upgrade_sends_404_line_and_closes() {
        let (mut conn, log) = connection(HandshakeDecision::Reject);
        conn.on_first_recv(text(UPGRADE), &mut Outbox::new());

        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(conn.stream().as_slice(), b"HTTP/1.1 101 404 Not Found\r\n\r\n");
        assert_eq!(log.borrow().closed.len(), 1);
    }

    #[test]
    fn accept_with_custom_headers() {
        let decision = HandshakeDecision::Accept {
            headers: vec![("X-Room".to_string(), "lobby".to_string())],
        };
        let (mut conn, _log) = connection(decision);
        conn.on_first_recv(text(UPGRADE), &mut Outbox::new());

        let response = String::from_utf8(conn.stream().clone()).unwrap();
        assert!(response.contains("X-Room: lobby\r\n"));
    }

    #[test]
    fn websocket_frames_are_unmasked_before_delivery() {
        let (mut conn, log) = upgraded();
        conn.on_raw_recv(masked("hello world"), &mut Outbox::new());
        assert_eq!(log.borrow().received, vec![text("hello world")]);
    }

    #[test]
    fn close_frame_closes_once() {
        let (mut conn, log) = upgraded();
        conn.on_raw_recv(Buffer::from_raw(vec![0x88, 0x80, 1, 2, 3, 4]), &mut Outbox::new());

        assert_eq!(conn.state(), ConnectionState::Closed);
        // No close frame goes back to the peer
        assert!(conn.stream().is_empty());

        conn.on_raw_recv(masked("late"), &mut Outbox::new());
        conn.close();
        assert!(log.borrow().received.is_empty());
        assert_eq!(log.borrow().closed, vec![ConnectionId(7)]);
    }

    #[test]
    fn unsupported_frames_are_dropped_and_connection_stays_open() {
        let (mut conn, log) = upgraded();
        let unmasked = framing::encode_frame(&text("nope")).unwrap();
        conn.on_raw_recv(unmasked, &mut Outbox::new());
        conn.on_raw_recv(masked("\u{7f}ok"), &mut Outbox::new());

        assert_eq!(conn.state(), ConnectionState::Established);
        assert_eq!(log.borrow().received, vec![text("\u{7f}ok")]);
    }

    #[test]
    fn frame_split_across_reads_is_reassembled() {
        let (mut conn, log) = upgraded();
        let frame = masked("arrives in pieces");
        let (head, tail) = frame.as_slice().split_at(10);

        conn.on_raw_recv(Buffer::from_raw(head.to_vec()), &mut Outbox::new());
        assert!(log.borrow().received.is_empty());
        assert_eq!(conn.buffered(), 10);

        conn.on_raw_recv(Buffer::from_raw(tail.to_vec()), &mut Outbox::new());
        assert_eq!(log.borrow().received, vec![text("arrives in pieces")]);
        assert_eq!(conn.buffered(), 0);
    }

    #[test]
    fn every_frame_in_one_read_is_delivered() {
        let (mut conn, log) = upgraded();
        let mut raw = masked("first").as_slice().to_vec();
        raw.extend_from_slice(masked("second").as_slice());
        let third = masked("third");
        raw.extend_from_slice(&third.as_slice()[..3]);

        conn.on_raw_recv(Buffer::from_raw(raw), &mut Outbox::new());
        assert_eq!(log.borrow().received, vec![text("first"), text("second")]);
        assert_eq!(conn.buffered(), 3);

        conn.on_raw_recv(Buffer::from_raw(third.as_slice()[3..].to_vec()), &mut Outbox::new());
        assert_eq!(log.borrow().received.len(), 3);
    }

    #[test]
    fn frames_after_a_close_frame_are_ignored() {
        let (mut conn, log) = upgraded();
        let mut raw = vec![0x88, 0x80, 1, 2, 3, 4];
        raw.extend_from_slice(masked("too late").as_slice());
        conn.on_raw_recv(Buffer::from_raw(raw), &mut Outbox::new());

        assert!(conn.is_closed());
        assert!(log.borrow().received.is_empty());
        assert_eq!(log.borrow().closed.len(), 1);
    }

    #[test]
    fn request_head_split_across_reads_is_held() {
        let (mut conn, log) = connection(HandshakeDecision::accept());
        let (first, rest) = UPGRADE.split_at(40);

        conn.on_first_recv(text(first), &mut Outbox::new());
        assert_eq!(conn.state(), ConnectionState::Unestablished);
        assert!(conn.stream().is_empty());

        conn.on_first_recv(text(rest), &mut Outbox::new());
        assert_eq!(conn.kind(), ConnectionType::WebSocket);
        assert_eq!(conn.state(), ConnectionState::Established);
        assert!(log.borrow().received.is_empty());
    }

    #[test]
    fn frame_sent_behind_the_request_head_is_delivered() {
        let (mut conn, log) = connection(HandshakeDecision::accept());
        let mut raw = UPGRADE.as_bytes().to_vec();
        raw.extend_from_slice(masked("eager").as_slice());

        conn.on_first_recv(Buffer::from_raw(raw), &mut Outbox::new());
        assert_eq!(conn.kind(), ConnectionType::WebSocket);
        assert_eq!(log.borrow().received, vec![text("eager")]);
    }

    #[test]
    fn send_frames_for_websocket_only() {
        let (mut tcp, _) = connection(HandshakeDecision::accept());
        tcp.on_first_recv(text("x"), &mut Outbox::new());
        tcp.send(&text("hi")).unwrap();
        assert_eq!(tcp.stream().as_slice(), b"hi");

        let (mut ws, _) = upgraded();
        ws.send(&text("hi")).unwrap();
        assert_eq!(ws.stream().as_slice(), &[0x81, 0x02, b'h', b'i']);
        ws.send_raw(&text("raw")).unwrap();
        assert_eq!(&ws.stream()[4..], b"raw");
    }

    #[test]
    fn handler_replies_through_session() {
        let (mut conn, log) = upgraded();
        conn.handler.echo = true;
        conn.on_raw_recv(masked("ping"), &mut Outbox::new());
        assert_eq!(conn.stream().as_slice(), &[0x81, 0x04, b'p', b'i', b'n', b'g']);
        assert_eq!(log.borrow().received.len(), 1);
    }

    struct Broadcaster;

    impl ConnectionHandler for Broadcaster {
        fn on_recv(&mut self, session: &mut Session<'_>, data: Buffer) {
            assert_eq!(session.path(), Some("/chat"));
            assert_eq!(session.header("host"), Some(" localhost"));
            session.broadcast(data);
        }
    }

    #[test]
    fn broadcasts_are_queued_in_outbox() {
        let mut conn = Connection::new(ConnectionId(1), Vec::new(), Broadcaster);
        let mut outbox = Outbox::new();
        conn.on_first_recv(text(UPGRADE), &mut outbox);
        conn.on_raw_recv(masked("to all"), &mut outbox);
        assert_eq!(outbox.take_broadcasts(), vec![text("to all")]);
        assert!(outbox.is_empty());
    }

    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::ErrorKind::BrokenPipe.into())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn write_failure_closes_connection() {
        let log = Rc::new(RefCell::new(Log::default()));
        let handler = Recorder {
            log: log.clone(),
            decision: HandshakeDecision::accept(),
            echo: false,
        };
        let mut conn = Connection::new(ConnectionId(3), BrokenPipe, handler);
        assert!(matches!(conn.send(&text("x")), Err(SendError::Io(_))));
        assert!(conn.is_closed());
        assert!(matches!(conn.send(&text("x")), Err(SendError::Closed)));
        assert_eq!(log.borrow().closed, vec![ConnectionId(3)]);
    }

    /// Accepts `room` bytes, then reports a full socket.
    struct Throttled {
        written: Vec<u8>,
        room: usize,
    }

    impl Write for Throttled {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.room == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.room);
            self.room -= n;
            self.written.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn partial_writes_stay_queued_until_flush() {
        let stream = Throttled {
            written: Vec::new(),
            room: 3,
        };
        let mut conn = Connection::new(ConnectionId(4), stream, Broadcaster);
        conn.send_raw(&text("abcdef")).unwrap();
        assert!(conn.wants_write());
        assert_eq!(conn.stream().written, b"abc");

        conn.stream_mut().room = 10;
        conn.flush().unwrap();
        assert!(!conn.wants_write());
        assert_eq!(conn.stream().written, b"abcdef");
    }

    #[test]
    fn reject_on_a_full_socket_sends_what_fits_and_closes() {
        let stream = Throttled {
            written: Vec::new(),
            room: 5,
        };
        let log = Rc::new(RefCell::new(Log::default()));
        let handler = Recorder {
            log: log.clone(),
            decision: HandshakeDecision::Reject,
            echo: false,
        };
        let mut conn = Connection::new(ConnectionId(5), stream, handler);
        conn.on_first_recv(text(UPGRADE), &mut Outbox::new());

        assert!(conn.is_closed());
        assert!(!conn.wants_write());
        assert_eq!(conn.stream().written, b"HTTP/");
        assert_eq!(log.borrow().closed, vec![ConnectionId(5)]);
    }
}
