//! Emulated clients and servers around a proxy under test.
//!
//! A [`DeproxyManager`] runs the reactor thread. Clients, servers and the
//! segmentation relay register connections with it through a
//! [`ManagerHandle`]; tests drive them from their own thread and observe
//! results with polling waits. The [`AutoParser`] shared by all of them
//! predicts what the proxy should forward and records deviations.

pub mod auto_parser;
pub mod client;
pub mod client_h2;
pub mod events;
pub mod handler;
pub mod manager;
pub mod selfproxy;
pub mod server;

pub use auto_parser::{AutoParser, ProxyCapabilities};
pub use client::{Client, DeproxyClient, ErrorCode, H1Input, Http1Session, Session};
pub use client_h2::{DeproxyClientH2, H2Input, Http2Session};
pub use events::{Command, Event};
pub use handler::{Accepted, Acceptor, Handler, Outbound, SharedHandler};
pub use manager::{DeproxyManager, ManagerHandle};
pub use selfproxy::{Chunking, SelfProxy, SelfProxyRegistry};
pub use server::{DeproxyServer, Reply, ResponseContent, ResponseHook, ServerOptions, StaticDeproxyServer};
