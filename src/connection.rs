//! Per-connection bookkeeping shared by emulated clients, server
//! connections and relay legs.

use std::fmt;
use std::net::SocketAddr;
use std::time::SystemTime;
use uuid::Uuid;

/// `Connecting -> Connected -> Closing -> Closed`. A connection that was
/// never opened is `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Closing,
    #[default]
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct Connection {
    pub id: Uuid,
    pub state: ConnectionState,
    pub sockname: Option<SocketAddr>,
    pub peername: Option<SocketAddr>,
    pub timestamp_start: Option<SystemTime>,
    pub timestamp_end: Option<SystemTime>,
    pub error: Option<String>,
    /// Set once the connection reached `Connected` at least once.
    pub was_opened: bool,
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

impl Connection {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            state: ConnectionState::Closed,
            sockname: None,
            peername: None,
            timestamp_start: None,
            timestamp_end: None,
            error: None,
            was_opened: false,
        }
    }

    pub fn connecting(&mut self) {
        self.state = ConnectionState::Connecting;
        self.timestamp_start = Some(SystemTime::now());
        self.timestamp_end = None;
        self.error = None;
    }

    pub fn connected(&mut self, sockname: SocketAddr, peername: SocketAddr) {
        self.state = ConnectionState::Connected;
        self.sockname = Some(sockname);
        self.peername = Some(peername);
        self.was_opened = true;
        if self.timestamp_start.is_none() {
            self.timestamp_start = Some(SystemTime::now());
        }
    }

    /// Moves to `Closing` unless already closed.
    pub fn closing(&mut self) {
        if self.state != ConnectionState::Closed {
            self.state = ConnectionState::Closing;
        }
    }

    /// Idempotent: closing twice keeps the first end timestamp.
    pub fn closed(&mut self) {
        if self.state == ConnectionState::Closed && self.timestamp_end.is_some() {
            return;
        }
        self.state = ConnectionState::Closed;
        self.timestamp_end = Some(SystemTime::now());
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    pub fn is_connecting(&self) -> bool {
        self.state == ConnectionState::Connecting
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.sockname, self.peername) {
            (Some(local), Some(peer)) => write!(f, "{} -> {} ({})", local, peer, self.state),
            _ => write!(f, "{} ({})", self.id, self.state),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        let mut conn = Connection::new();
        assert!(conn.is_closed());
        assert!(!conn.was_opened);

        conn.connecting();
        assert!(conn.is_connecting());

        let local: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let peer: SocketAddr = "127.0.0.1:80".parse().unwrap();
        conn.connected(local, peer);
        assert!(conn.is_open());
        assert!(conn.was_opened);
        assert_eq!(conn.to_string(), "127.0.0.1:40000 -> 127.0.0.1:80 (connected)");

        conn.closing();
        assert_eq!(conn.state, ConnectionState::Closing);
        conn.closed();
        assert!(conn.is_closed());
    }

    #[test]
    fn test_double_close_is_harmless() {
        let mut conn = Connection::new();
        conn.connecting();
        conn.closed();
        let end = conn.timestamp_end;
        conn.closed();
        conn.closing();
        assert_eq!(conn.timestamp_end, end);
        assert!(conn.is_closed());
    }
}
