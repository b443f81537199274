//! TCP/WebSocket connection multiplexer.
//!
//! A single-threaded `mio` reactor accepts sockets, detects per connection
//! whether the peer speaks raw TCP or WebSocket (RFC 6455), and frames
//! outbound payloads accordingly.

pub mod buffer;
pub mod config;
pub mod connection;
pub mod error;
pub mod net;
pub mod reactor;
pub mod table;
pub mod ticker;

pub use buffer::Buffer;
pub use config::ServerConfig;
pub use connection::{
    Connection, ConnectionHandler, ConnectionId, ConnectionState, ConnectionType, HandlerFactory,
    Session,
};
pub use error::{EncodingError, FrameSignal, ReactorError, SendError, SetupError};
pub use net::handshake::{HandshakeDecision, HandshakeRequest};
pub use reactor::{Reactor, ShutdownHandle};
pub use ticker::Ticker;
