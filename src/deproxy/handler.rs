use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use super::events::{Command, Event};
use crate::Result;

/// The protocol side of one connection. The reactor owns the socket and
/// calls into the handler; a handler never blocks.
///
/// An `Err` from `handle_event` is fatal for the whole manager.
pub trait Handler: Send {
    fn handle_event(&mut self, event: Event) -> Result<Vec<Command>>;

    /// Consulted before every write attempt. `false` holds output back.
    fn writable(&self, _now: Instant) -> bool {
        true
    }

    /// Bytes for the next `write()` call. The handler learns how many were
    /// taken from the following `Event::DataSent`.
    fn next_segment(&mut self, now: Instant) -> Option<Bytes>;

    /// Polled on every tick; `true` closes the connection.
    fn wants_close(&self) -> bool {
        false
    }
}

pub type SharedHandler = Arc<Mutex<dyn Handler>>;

/// An outbound connection to open.
pub struct Outbound {
    pub addr: SocketAddr,
    pub bind: Option<SocketAddr>,
    pub handler: SharedHandler,
}

/// Handler for an accepted connection and, for relays, the outbound
/// connection paired with it.
pub struct Accepted {
    pub handler: SharedHandler,
    pub companion: Option<Outbound>,
}

impl Accepted {
    pub fn new(handler: SharedHandler) -> Self {
        Self {
            handler,
            companion: None,
        }
    }
}

/// Listening side: builds a handler for each accepted connection.
pub trait Acceptor: Send + Sync {
    fn accept(&self, peer: SocketAddr) -> Result<Accepted>;
}
