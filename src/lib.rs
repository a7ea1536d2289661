pub mod config;
pub mod connection;
pub mod deproxy;
pub mod error;
pub mod http2;
pub mod message;
pub mod stateful;
pub mod util;

pub use config::Config;
pub use deproxy::{DeproxyClient, DeproxyClientH2, DeproxyManager, DeproxyServer, StaticDeproxyServer};
pub use error::{Error, Result};
pub use message::{HttpMessage, Request, Response};
pub use stateful::{State, Stateful};
pub use util::{wait_until, WaitOutcome};
