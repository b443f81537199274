use std::io;
use std::net::SocketAddr;

use mio::net::{TcpListener, TcpStream};
use socket2::{Domain, Protocol, Socket, Type};

/// Creates the non-blocking listening socket for the reactor.
///
/// # Options
/// * `SO_REUSEADDR`: restart without waiting out `TIME_WAIT` on the port.
/// * `Non-blocking`: required by the `mio` event loop.
pub fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(TcpListener::from_std(socket.into()))
}

/// Tunes a freshly accepted stream.
///
/// `TCP_NODELAY` disables Nagle so small frames leave immediately.
/// `mio` already hands out accepted sockets in non-blocking mode.
pub fn apply_optimizations(stream: &TcpStream, nodelay: bool) -> io::Result<()> {
    stream.set_nodelay(nodelay)
}
