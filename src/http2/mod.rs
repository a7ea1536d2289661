//! HTTP/2 framing and a client-side connection state machine.

pub mod connection;
pub mod frame;

pub use connection::{H2Connection, H2Event, Settings};
pub use frame::{Frame, FrameCodec, Priority, SettingCode};
