//! Single-threaded connection multiplexer on top of `mio`.
//!
//! One thread runs [`Reactor::run`] and services each readiness event to
//! completion before waiting again. Reads and writes use per-operation and
//! per-connection buffers; nothing is shared between connections. A peer
//! that sends more than one maximal frame in a single readiness event is
//! disconnected.

use std::collections::HashSet;
use std::io::{self, Read};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use log::{debug, error, info, warn};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};

use crate::buffer::Buffer;
use crate::config::ServerConfig;
use crate::connection::{
    Connection, ConnectionId, HandlerFactory, IdAllocator, Outbox, MAX_INBOUND_LEN,
};
use crate::error::{ReactorError, SetupError};
use crate::net::tcp_opt;
use crate::table::ConnectionTable;

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
const FIRST_CONNECTION: usize = 2;

/// Stops a running reactor from any thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) -> io::Result<()> {
        self.flag.store(true, Ordering::Release);
        self.waker.wake()
    }
}

pub struct Reactor<F: HandlerFactory> {
    poll: Poll,
    listener: TcpListener,
    table: ConnectionTable<TcpStream, F::Handler>,
    /// Connections currently registered for writable events.
    writers: HashSet<Token>,
    ids: IdAllocator,
    factory: F,
    config: ServerConfig,
    stop: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl<F: HandlerFactory> Reactor<F> {
    /// Opens the non-blocking listener and registers accept interest only,
    /// so the readiness wait blocks until there is work.
    pub fn bind(config: ServerConfig, factory: F) -> Result<Self, SetupError> {
        let poll = Poll::new().map_err(SetupError::Poll)?;

        let addr = config.bind_addr;
        let mut listener = tcp_opt::create_listener(addr, config.backlog)
            .map_err(|source| SetupError::Bind { addr, source })?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)
            .map_err(SetupError::Register)?;
        let waker = Waker::new(poll.registry(), WAKER).map_err(SetupError::Register)?;

        info!("Listening on {}", listener.local_addr().unwrap_or(addr));

        Ok(Self {
            poll,
            listener,
            table: ConnectionTable::new(),
            writers: HashSet::new(),
            ids: IdAllocator::new(),
            factory,
            config,
            stop: Arc::new(AtomicBool::new(false)),
            waker: Arc::new(waker),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flag: self.stop.clone(),
            waker: self.waker.clone(),
        }
    }

    pub fn connection_count(&self) -> usize {
        self.table.len()
    }

    /// Sends `msg` to every live connection. Returns the number of
    /// successful sends; failed connections are torn down.
    pub fn broadcast(&mut self, msg: &Buffer) -> usize {
        let delivered = self.table.broadcast(msg);
        self.maintain_all();
        delivered
    }

    /// Serves until shut down or until the event loop faults. Every
    /// connection is closed and the listener released before returning.
    pub fn run(&mut self) -> Result<(), ReactorError> {
        let mut events = Events::with_capacity(self.config.events_capacity);
        let result = self.serve(&mut events);
        if let Err(ref e) = result {
            error!("Server failure: {}", e);
        }
        self.teardown();
        result
    }

    fn serve(&mut self, events: &mut Events) -> Result<(), ReactorError> {
        debug!("Waiting for events");
        loop {
            if self.stop.load(Ordering::Acquire) {
                return Ok(());
            }

            if let Err(e) = self.poll.poll(events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(ReactorError::Poll(e));
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept()?,
                    WAKER => {}
                    token => self.connection_event(
                        token,
                        event.is_readable() || event.is_read_closed(),
                        event.is_writable(),
                    ),
                }
            }
        }
    }

    fn accept(&mut self) -> Result<(), ReactorError> {
        loop {
            let (mut stream, peer) = match self.listener.accept() {
                Ok(pair) => pair,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
                    ) =>
                {
                    continue
                }
                Err(e) => return Err(ReactorError::Accept(e)),
            };

            if !self.factory.admit(peer) {
                debug!("Connection from {} refused", peer);
                continue;
            }

            if let Err(e) = tcp_opt::apply_optimizations(&stream, self.config.nodelay) {
                warn!("Failed to tune socket from {}: {}", peer, e);
            }

            let id = self.ids.allocate();
            let token = token_for(id);
            if let Err(e) = self
                .poll
                .registry()
                .register(&mut stream, token, Interest::READABLE)
            {
                warn!("{}: Failed to register {}: {}", id, peer, e);
                continue;
            }

            let handler = self.factory.create(id, peer);
            self.table.insert(token, Connection::new(id, stream, handler));
            debug!("{}: Connection opened from {}", id, peer);
        }
    }

    fn connection_event(&mut self, token: Token, readable: bool, writable: bool) {
        let chunk = self.config.read_chunk;
        let Some(connection) = self.table.get_mut(token) else {
            warn!("Event for unknown connection {:?}", token);
            return;
        };

        if writable {
            // Failures close the connection; it is released below.
            let _ = connection.flush();
        }

        let mut outbox = Outbox::new();
        if readable && !connection.is_closed() {
            let limit = MAX_INBOUND_LEN.saturating_sub(connection.buffered());
            let (data, end) = drain(connection.id(), connection.stream_mut(), chunk, limit);
            if end == DrainEnd::OverLimit {
                warn!(
                    "{}: More than {} bytes of unconsumed input, closing",
                    connection.id(),
                    MAX_INBOUND_LEN
                );
                connection.close();
            } else {
                if !data.is_empty() {
                    let data = Buffer::from_raw(data.freeze());
                    if connection.is_established() {
                        connection.on_raw_recv(data, &mut outbox);
                    } else {
                        connection.on_first_recv(data, &mut outbox);
                    }
                }
                if end == DrainEnd::Eof {
                    connection.close();
                }
            }
        }

        let broadcasts = outbox.take_broadcasts();
        if broadcasts.is_empty() {
            self.maintain(token);
        } else {
            for msg in &broadcasts {
                self.table.broadcast(msg);
            }
            self.maintain_all();
        }
    }

    /// Releases `token` if its connection closed, otherwise syncs writable
    /// interest with whether output is queued.
    fn maintain(&mut self, token: Token) {
        let Some(connection) = self.table.get_mut(token) else {
            return;
        };
        if connection.is_closed() {
            return self.release(token);
        }

        let wants_write = connection.wants_write();
        if wants_write == self.writers.contains(&token) {
            return;
        }

        let interest = if wants_write {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        match self
            .poll
            .registry()
            .reregister(connection.stream_mut(), token, interest)
        {
            Ok(()) if wants_write => {
                self.writers.insert(token);
            }
            Ok(()) => {
                self.writers.remove(&token);
            }
            Err(e) => {
                warn!("{}: Failed to update interest: {}", connection.id(), e);
                connection.close();
                self.release(token);
            }
        }
    }

    fn maintain_all(&mut self) {
        for token in self.table.tokens() {
            self.maintain(token);
        }
    }

    /// Removes the connection and drops its socket.
    fn release(&mut self, token: Token) {
        self.writers.remove(&token);
        if let Some(mut connection) = self.table.remove(token) {
            let _ = self.poll.registry().deregister(connection.stream_mut());
            connection.close();
            debug!("{}: Released", connection.id());
        }
    }

    fn teardown(&mut self) {
        for token in self.table.tokens() {
            self.release(token);
        }
        let _ = self.poll.registry().deregister(&mut self.listener);
        info!("Server stopped");
    }
}

fn token_for(id: ConnectionId) -> Token {
    Token(FIRST_CONNECTION + id.0 as usize)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DrainEnd {
    WouldBlock,
    /// The peer closed or the read failed.
    Eof,
    /// More than `limit` bytes arrived before the socket would block.
    OverLimit,
}

/// Reads until the socket would block, the stream ends or more than `limit`
/// bytes have been collected.
fn drain<R: Read>(
    id: ConnectionId,
    stream: &mut R,
    chunk: usize,
    limit: usize,
) -> (BytesMut, DrainEnd) {
    let mut data = BytesMut::new();
    let mut scratch = vec![0u8; chunk];
    loop {
        match stream.read(&mut scratch) {
            Ok(0) => return (data, DrainEnd::Eof),
            Ok(n) => {
                data.extend_from_slice(&scratch[..n]);
                if data.len() > limit {
                    return (data, DrainEnd::OverLimit);
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                return (data, DrainEnd::WouldBlock)
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("{}: Read failed: {}", id, e);
                return (data, DrainEnd::Eof);
            }
        }
    }
}
