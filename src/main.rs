use std::net::SocketAddr;
use std::process;
use std::thread;

use log::{error, info, warn};

use wsmux::{
    Buffer, ConnectionHandler, ConnectionId, HandlerFactory, Reactor, ServerConfig, Session,
};

/// Relays every message to every connected client.
struct ChatHandler;

impl ConnectionHandler for ChatHandler {
    fn on_recv(&mut self, session: &mut Session<'_>, data: Buffer) {
        session.broadcast(data);
    }

    fn on_close(&mut self, id: ConnectionId) {
        info!("{}: Left the chat", id);
    }
}

struct ChatFactory;

impl HandlerFactory for ChatFactory {
    type Handler = ChatHandler;

    fn create(&mut self, id: ConnectionId, peer: SocketAddr) -> ChatHandler {
        info!("{}: Joined from {}", id, peer);
        ChatHandler
    }
}

fn main() {
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            process::exit(2);
        }
    };

    let pin_core = config.pin_core.and_then(|index| {
        let core = core_affinity::get_core_ids()?.into_iter().find(|c| c.id == index);
        if core.is_none() {
            warn!("Core {} not available, reactor thread stays unpinned", index);
        }
        core
    });

    let reactor_thread = thread::Builder::new()
        .name("wsmux-reactor".to_string())
        .spawn(move || {
            if let Some(core) = pin_core {
                if core_affinity::set_for_current(core) {
                    info!("Reactor pinned to core {:?}", core);
                }
            }

            let mut reactor = match Reactor::bind(config, ChatFactory) {
                Ok(reactor) => reactor,
                Err(e) => {
                    error!("There was an error while initialising: {}", e);
                    return false;
                }
            };
            reactor.run().is_ok()
        });

    let ok = match reactor_thread {
        Ok(handle) => handle.join().unwrap_or(false),
        Err(e) => {
            error!("Failed to start reactor thread: {}", e);
            false
        }
    };
    if !ok {
        process::exit(1);
    }
}
