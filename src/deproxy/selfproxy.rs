//! Segmentation relay: a pass-through TCP proxy that re-cuts the client's
//! byte stream into small writes before it reaches the proxy under test.
//!
//! Every accepted connection gets a paired outbound connection to the
//! target. Bytes going to the target are written `segment_size` at a time
//! with `segment_gap` between writes; bytes coming back are passed on as
//! they arrive.

use bytes::{Bytes, BytesMut};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::events::{Command, Event};
use super::handler::{Accepted, Acceptor, Handler, Outbound};
use super::manager::ManagerHandle;
use crate::config::MAX_MESSAGE_SIZE;
use crate::stateful::{Lifecycle, State, Stateful};
use crate::util::lock;
use crate::Result;

/// How the target-bound direction is cut. A zero size writes whatever is
/// buffered, up to [`MAX_MESSAGE_SIZE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Chunking {
    pub segment_size: usize,
    pub segment_gap: Duration,
}

#[derive(Debug, Default)]
struct Pipe {
    to_target: BytesMut,
    to_client: BytesMut,
    client_closed: bool,
    target_closed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Client,
    Target,
}

struct RelayShared {
    chunking: Mutex<Chunking>,
    legs: AtomicUsize,
}

/// One half of a relayed connection.
struct RelayLeg {
    side: Side,
    pipe: Arc<Mutex<Pipe>>,
    shared: Arc<RelayShared>,
    connected: bool,
    last_segment: Option<Instant>,
}

impl RelayLeg {
    fn chunking(&self) -> Chunking {
        match self.side {
            Side::Target => *lock(&self.shared.chunking),
            Side::Client => Chunking::default(),
        }
    }

    fn outbox<'a>(&self, pipe: &'a mut Pipe) -> &'a mut BytesMut {
        match self.side {
            Side::Client => &mut pipe.to_client,
            Side::Target => &mut pipe.to_target,
        }
    }

    fn mark_closed(&self, pipe: &mut Pipe) {
        match self.side {
            Side::Client => pipe.client_closed = true,
            Side::Target => pipe.target_closed = true,
        }
    }
}

impl Handler for RelayLeg {
    fn handle_event(&mut self, event: Event) -> Result<Vec<Command>> {
        let mut pipe = lock(&self.pipe);
        match event {
            Event::Connected { local, peer } => {
                self.connected = true;
                self.shared.legs.fetch_add(1, Ordering::SeqCst);
                debug!(target: "deproxy::tcp", side = ?self.side, "relay leg {} -> {}", local, peer);
            }
            Event::DataReceived(data) => match self.side {
                Side::Client => pipe.to_target.extend_from_slice(&data),
                Side::Target => pipe.to_client.extend_from_slice(&data),
            },
            Event::DataSent(n) => {
                let outbox = self.outbox(&mut pipe);
                let _ = outbox.split_to(n.min(outbox.len()));
                self.last_segment = Some(Instant::now());
            }
            Event::ConnectFailed(kind) | Event::IoError(kind) => {
                debug!(target: "deproxy::tcp", side = ?self.side, "relay leg error {:?}", kind);
                self.mark_closed(&mut pipe);
            }
            Event::Closed => {
                if std::mem::take(&mut self.connected) {
                    self.shared.legs.fetch_sub(1, Ordering::SeqCst);
                }
                self.mark_closed(&mut pipe);
            }
        }
        Ok(Vec::new())
    }

    fn writable(&self, now: Instant) -> bool {
        let gap = self.chunking().segment_gap;
        match self.last_segment {
            Some(last) if !gap.is_zero() => now >= last + gap,
            _ => true,
        }
    }

    fn next_segment(&mut self, _now: Instant) -> Option<Bytes> {
        let size = match self.chunking().segment_size {
            0 => MAX_MESSAGE_SIZE,
            size => size,
        };
        let mut pipe = lock(&self.pipe);
        let outbox = self.outbox(&mut pipe);
        if outbox.is_empty() {
            return None;
        }
        Some(Bytes::copy_from_slice(&outbox[..size.min(outbox.len())]))
    }

    /// The peer leg is gone and everything it sent has been passed on.
    fn wants_close(&self) -> bool {
        let mut pipe = lock(&self.pipe);
        let peer_closed = match self.side {
            Side::Client => pipe.target_closed,
            Side::Target => pipe.client_closed,
        };
        peer_closed && self.outbox(&mut pipe).is_empty()
    }
}

struct RelayAcceptor {
    target: SocketAddr,
    shared: Arc<RelayShared>,
}

impl Acceptor for RelayAcceptor {
    fn accept(&self, peer: SocketAddr) -> Result<Accepted> {
        info!(target: "deproxy::tcp", "relay: {} -> {}", peer, self.target);
        let pipe = Arc::new(Mutex::new(Pipe::default()));
        let leg = |side| {
            Arc::new(Mutex::new(RelayLeg {
                side,
                pipe: pipe.clone(),
                shared: self.shared.clone(),
                connected: false,
                last_segment: None,
            }))
        };
        Ok(Accepted {
            handler: leg(Side::Client),
            companion: Some(Outbound {
                addr: self.target,
                bind: None,
                handler: leg(Side::Target),
            }),
        })
    }
}

/// A running segmentation relay in front of `target`.
pub struct SelfProxy {
    lifecycle: Lifecycle,
    manager: ManagerHandle,
    listen: SocketAddr,
    target: SocketAddr,
    local_addr: Option<SocketAddr>,
    shared: Arc<RelayShared>,
    listener: Option<CancellationToken>,
}

impl fmt::Debug for SelfProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelfProxy")
            .field("listen", &self.addr())
            .field("target", &self.target)
            .field("chunking", &self.chunking())
            .finish()
    }
}

impl SelfProxy {
    pub fn new(manager: &ManagerHandle, listen: SocketAddr, target: SocketAddr, chunking: Chunking) -> Self {
        Self {
            lifecycle: Lifecycle::new(),
            manager: manager.clone(),
            listen,
            target,
            local_addr: None,
            shared: Arc::new(RelayShared {
                chunking: Mutex::new(chunking),
                legs: AtomicUsize::new(0),
            }),
            listener: None,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.local_addr.unwrap_or(self.listen)
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }

    pub fn chunking(&self) -> Chunking {
        *lock(&self.shared.chunking)
    }

    /// Applies to every connection from the next write on.
    pub fn set_chunking(&self, chunking: Chunking) {
        *lock(&self.shared.chunking) = chunking;
    }
}

impl Stateful for SelfProxy {
    fn name(&self) -> String {
        format!("selfproxy {} -> {}", self.listen, self.target)
    }

    fn state(&self) -> State {
        if self.manager.has_failed() {
            State::Error
        } else {
            self.lifecycle.state()
        }
    }

    fn start(&mut self) -> Result<()> {
        let name = self.name();
        if !self.lifecycle.begin_start(&name) {
            return Ok(());
        }
        let acceptor = Arc::new(RelayAcceptor {
            target: self.target,
            shared: self.shared.clone(),
        });
        match self.manager.listen(self.listen, acceptor) {
            Ok((local, token)) => {
                self.local_addr = Some(local);
                self.listener = Some(token);
                self.lifecycle.set_state(State::Started);
                Ok(())
            }
            Err(e) => {
                self.lifecycle.append_exception(&name, &e);
                Err(e)
            }
        }
    }

    fn stop(&mut self) {
        let name = self.name();
        if !self.lifecycle.begin_stop(&name) {
            return;
        }
        if let Some(token) = self.listener.take() {
            token.cancel();
        }
        let deadline = Instant::now() + Duration::from_secs(1);
        while self.shared.legs.load(Ordering::SeqCst) > 0 && Instant::now() < deadline && !self.manager.has_failed() {
            std::thread::sleep(self.manager.poll_interval());
        }
        self.lifecycle.finish_stop(&name, Vec::new());
    }
}

impl Drop for SelfProxy {
    fn drop(&mut self) {
        if let Some(token) = self.listener.take() {
            token.cancel();
        }
    }
}

/// The one relay of a manager, shared by every client that asks for it.
///
/// Only the first requester's target and chunking take effect; later
/// requests just take another reference.
#[derive(Debug, Default)]
pub struct SelfProxyRegistry {
    proxy: Option<SelfProxy>,
    refs: usize,
}

impl SelfProxyRegistry {
    /// Takes a reference on the relay, starting it if needed, and returns
    /// the address clients should connect to.
    pub fn request(&mut self, manager: &ManagerHandle, target: SocketAddr, segment_size: usize, segment_gap: Duration) -> Result<SocketAddr> {
        if let Some(proxy) = &self.proxy {
            self.refs += 1;
            debug!(target: "deproxy::tcp", refs = self.refs, "selfproxy reused");
            return Ok(proxy.addr());
        }
        let ip = manager
            .config()
            .client
            .ip
            .parse::<IpAddr>()
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
        let chunking = Chunking {
            segment_size,
            segment_gap,
        };
        let mut proxy = SelfProxy::new(manager, SocketAddr::new(ip, 0), target, chunking);
        proxy.start()?;
        let addr = proxy.addr();
        self.proxy = Some(proxy);
        self.refs = 1;
        Ok(addr)
    }

    /// Drops a reference; the last one stops the relay.
    pub fn release(&mut self) {
        self.refs = self.refs.saturating_sub(1);
        if self.refs == 0 {
            if let Some(mut proxy) = self.proxy.take() {
                proxy.stop();
            }
        }
    }

    /// Retunes a running relay, e.g. between iterations of a test loop.
    pub fn update_chunking(&self, segment_size: usize, segment_gap: Duration) {
        if let Some(proxy) = &self.proxy {
            proxy.set_chunking(Chunking {
                segment_size,
                segment_gap,
            });
        }
    }

    pub fn refs(&self) -> usize {
        self.refs
    }

    pub fn addr(&self) -> Option<SocketAddr> {
        self.proxy.as_ref().map(SelfProxy::addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::deproxy::client::DeproxyClient;
    use crate::deproxy::manager::DeproxyManager;
    use crate::deproxy::server::DeproxyServer;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    fn manager() -> DeproxyManager {
        let mut config = Config::default();
        config.deproxy.auto_parser = false;
        let mut manager = DeproxyManager::new(config);
        manager.start().unwrap();
        manager
    }

    #[tokio::test]
    async fn test_relay_passes_bytes_both_ways() {
        let manager = manager();
        let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = origin.local_addr().unwrap();
        let mut proxy = SelfProxy::new(
            &manager.handle(),
            "127.0.0.1:0".parse().unwrap(),
            target,
            Chunking {
                segment_size: 2,
                segment_gap: Duration::from_millis(1),
            },
        );
        proxy.start().unwrap();

        let mut client = TcpStream::connect(proxy.addr()).await.unwrap();
        let (mut upstream, _) = origin.accept().await.unwrap();
        client.write_all(b"hello relay").await.unwrap();

        let mut received = Vec::new();
        let mut buf = [0u8; 64];
        while received.len() < 11 {
            let n = upstream.read(&mut buf).await.unwrap();
            assert!(n > 0 && n <= 11);
            received.extend_from_slice(&buf[..n]);
        }
        assert_eq!(&received[..], b"hello relay");

        upstream.write_all(b"back").await.unwrap();
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"back");

        // Closing the target side closes the client side.
        drop(upstream);
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
        proxy.stop();
    }

    #[tokio::test]
    async fn test_registry_is_ref_counted() {
        let manager = manager();
        let handle = manager.handle();
        let target = "127.0.0.1:9".parse().unwrap();
        let mut registry = SelfProxyRegistry::default();

        let first = registry.request(&handle, target, 1, Duration::ZERO).unwrap();
        let second = registry.request(&handle, target, 50, Duration::from_millis(5)).unwrap();
        assert_eq!(first, second);
        assert_eq!(registry.refs(), 2);

        registry.update_chunking(3, Duration::ZERO);
        registry.release();
        assert!(registry.addr().is_some());
        registry.release();
        assert!(registry.addr().is_none());
        registry.release();
        assert_eq!(registry.refs(), 0);
    }

    #[tokio::test]
    async fn test_client_through_relay() {
        let manager = manager();
        let mut server = DeproxyServer::with_response(
            &manager.handle(),
            "127.0.0.1:0".parse().unwrap(),
            "HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n",
        );
        server.start().unwrap();

        let mut client = DeproxyClient::new(&manager.handle(), server.addr());
        client.set_segmentation(3, Duration::ZERO);
        client.set_through_relay(true);
        client.start().unwrap();
        assert_eq!(lock(&manager.handle().relays()).refs(), 1);

        client
            .send_request("GET /relayed HTTP/1.1\r\nHost: x\r\n\r\n", Some(200), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(server.last_request().unwrap().uri, "/relayed");

        client.stop();
        assert_eq!(lock(&manager.handle().relays()).refs(), 0);
        assert!(manager.check_errors().is_ok());
    }
}
