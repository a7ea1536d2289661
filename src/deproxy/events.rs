//! What the reactor tells a handler, and what a handler asks back.

use bytes::Bytes;
use std::io;
use std::net::SocketAddr;

#[derive(Debug)]
pub enum Event {
    /// The TCP connection is established (outbound) or accepted (inbound).
    Connected { local: SocketAddr, peer: SocketAddr },
    /// Bytes read by one `read()` call.
    DataReceived(Bytes),
    /// How many bytes of the last offered segment one `write()` call took.
    DataSent(usize),
    /// An outbound connect failed; `Closed` follows.
    ConnectFailed(io::ErrorKind),
    /// A read or write failed; `Closed` follows.
    IoError(io::ErrorKind),
    /// Delivered exactly once, as the last event of a connection.
    Closed,
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::Connected { .. } => "Connected",
            Event::DataReceived(_) => "DataReceived",
            Event::DataSent(_) => "DataSent",
            Event::ConnectFailed(_) => "ConnectFailed",
            Event::IoError(_) => "IoError",
            Event::Closed => "Closed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Close the connection now, without writing anything still pending.
    Close,
}
