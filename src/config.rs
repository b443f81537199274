//! Server configuration.
//!
//! Values come from the process environment. The binary calls
//! `dotenv::dotenv()` first so a local `.env` file can supply them.

use std::net::SocketAddr;
use std::str::FromStr;

use crate::error::ConfigError;

pub const DEFAULT_PORT: u16 = 10101;

/// Initial size of the per-read chunk, in bytes.
pub const DEFAULT_READ_CHUNK: usize = 1500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub read_chunk: usize,
    /// Capacity of the `mio::Events` batch per wait.
    pub events_capacity: usize,
    pub nodelay: bool,
    pub backlog: i32,
    /// Core to pin the reactor thread to, if any.
    pub pin_core: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            read_chunk: DEFAULT_READ_CHUNK,
            events_capacity: 128,
            nodelay: true,
            backlog: 1024,
            pin_core: None,
        }
    }
}

impl ServerConfig {
    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Builds a config from `lookup`, falling back to defaults for unset vars.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Ok(Self {
            bind_addr: parse_var(&lookup, "WSMUX_BIND")?.unwrap_or(defaults.bind_addr),
            read_chunk: positive(parse_var(&lookup, "WSMUX_READ_CHUNK")?, "WSMUX_READ_CHUNK")?
                .unwrap_or(defaults.read_chunk),
            events_capacity: positive(parse_var(&lookup, "WSMUX_EVENTS")?, "WSMUX_EVENTS")?
                .unwrap_or(defaults.events_capacity),
            nodelay: parse_var(&lookup, "WSMUX_NODELAY")?.unwrap_or(defaults.nodelay),
            backlog: parse_var(&lookup, "WSMUX_BACKLOG")?.unwrap_or(defaults.backlog),
            pin_core: parse_var(&lookup, "WSMUX_PIN_CORE")?,
        })
    }
}

fn parse_var<F, T>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value }),
    }
}

fn positive(value: Option<usize>, var: &'static str) -> Result<Option<usize>, ConfigError> {
    match value {
        Some(0) => Err(ConfigError::Invalid {
            var,
            value: "0".to_string(),
        }),
        other => Ok(other),
    }
}
