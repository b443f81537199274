//! Live connections keyed by their poll token.

use std::collections::HashMap;
use std::io::Write;

use log::warn;
use mio::Token;

use crate::buffer::Buffer;
use crate::connection::{Connection, ConnectionHandler};

pub struct ConnectionTable<S, H> {
    connections: HashMap<Token, Connection<S, H>>,
}

impl<S: Write, H: ConnectionHandler> ConnectionTable<S, H> {
    pub fn new() -> Self {
        Self {
            connections: HashMap::new(),
        }
    }

    pub fn insert(&mut self, token: Token, connection: Connection<S, H>) {
        self.connections.insert(token, connection);
    }

    pub fn get_mut(&mut self, token: Token) -> Option<&mut Connection<S, H>> {
        self.connections.get_mut(&token)
    }

    pub fn remove(&mut self, token: Token) -> Option<Connection<S, H>> {
        self.connections.remove(&token)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn tokens(&self) -> Vec<Token> {
        self.connections.keys().copied().collect()
    }

    /// Sends `msg` to every connection, framed per connection type.
    ///
    /// A failed send is logged and does not stop delivery to the rest.
    /// Returns how many sends succeeded.
    pub fn broadcast(&mut self, msg: &Buffer) -> usize {
        let mut delivered = 0;
        for connection in self.connections.values_mut() {
            match connection.send(msg) {
                Ok(()) => delivered += 1,
                Err(e) => warn!("{}: Broadcast failed: {}", connection.id(), e),
            }
        }
        delivered
    }
}

impl<S: Write, H: ConnectionHandler> Default for ConnectionTable<S, H> {
    fn default() -> Self {
        Self::new()
    }
}
