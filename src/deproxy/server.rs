//! Emulated upstream origin.
//!
//! A [`DeproxyServer`] listens on one address, parses every request the
//! proxy forwards and answers with a canned response or whatever its
//! [`ResponseHook`] decides. Every accepted connection gets its own
//! [`ServerConnection`] handler driven by the reactor.

use bytes::{Buf, Bytes, BytesMut};
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::auto_parser::AutoParser;
use super::events::{Command, Event};
use super::handler::{Accepted, Acceptor, Handler};
use super::manager::ManagerHandle;
use crate::connection::Connection;
use crate::message::{HttpMessage, ParseOptions, Request, RequestDecoder, Response};
use crate::stateful::{Lifecycle, State, Stateful};
use crate::util::{lock, wait_until, WaitOutcome};
use crate::Result;

/// Upstream connections the proxy opens to one server by default.
pub const DEFAULT_CONNS_N: usize = 32;

/// A response in any of the forms tests author them in. Normalized to wire
/// bytes as soon as it reaches the server.
#[derive(Debug, Clone)]
pub enum ResponseContent {
    Text(String),
    Raw(Bytes),
    Message(Response),
}

impl ResponseContent {
    pub fn into_bytes(self) -> Bytes {
        match self {
            ResponseContent::Text(text) => Bytes::from(text),
            ResponseContent::Raw(raw) => raw,
            ResponseContent::Message(response) => response.to_bytes(),
        }
    }
}

impl From<&str> for ResponseContent {
    fn from(text: &str) -> Self {
        ResponseContent::Text(text.to_string())
    }
}

impl From<String> for ResponseContent {
    fn from(text: String) -> Self {
        ResponseContent::Text(text)
    }
}

impl From<&[u8]> for ResponseContent {
    fn from(raw: &[u8]) -> Self {
        ResponseContent::Raw(Bytes::copy_from_slice(raw))
    }
}

impl<const N: usize> From<&[u8; N]> for ResponseContent {
    fn from(raw: &[u8; N]) -> Self {
        ResponseContent::Raw(Bytes::copy_from_slice(raw))
    }
}

impl From<Vec<u8>> for ResponseContent {
    fn from(raw: Vec<u8>) -> Self {
        ResponseContent::Raw(Bytes::from(raw))
    }
}

impl From<Bytes> for ResponseContent {
    fn from(raw: Bytes) -> Self {
        ResponseContent::Raw(raw)
    }
}

impl From<Response> for ResponseContent {
    fn from(response: Response) -> Self {
        ResponseContent::Message(response)
    }
}

/// What the server does about one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reply {
    /// Bytes to send; `None` sends nothing.
    pub response: Option<Bytes>,
    /// Close the connection once everything queued so far is flushed.
    pub close: bool,
}

impl Reply {
    pub fn respond(response: impl Into<ResponseContent>) -> Self {
        Self {
            response: Some(response.into().into_bytes()),
            close: false,
        }
    }

    pub fn respond_and_close(response: impl Into<ResponseContent>) -> Self {
        Self {
            response: Some(response.into().into_bytes()),
            close: true,
        }
    }

    pub fn drop_connection() -> Self {
        Self {
            response: None,
            close: true,
        }
    }

    pub fn silence() -> Self {
        Self::default()
    }
}

/// Request-dependent server behavior. Runs on the reactor thread, so it must
/// return promptly.
pub trait ResponseHook: Send + Sync {
    fn receive_request(&self, request: &Request) -> Reply;
}

impl<F> ResponseHook for F
where
    F: Fn(&Request) -> Reply + Send + Sync,
{
    fn receive_request(&self, request: &Request) -> Reply {
        self(request)
    }
}

/// Knobs that change how the server answers. All of them may be changed
/// while the server runs.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Close a connection after this many responses.
    pub keep_alive: Option<usize>,
    /// Hold responses back until this many are ready, then flush them
    /// together. 0 and 1 disable batching.
    pub pipelined: usize,
    /// Once the server has seen this many requests, stop answering without
    /// closing connections.
    pub hang_on_req_num: Option<usize>,
    pub delay_before_sending_response: Duration,
    /// Close a connection as soon as any bytes arrive on it.
    pub drop_conn_when_receiving_data: bool,
    /// Bytes per write; 0 selects the configured default.
    pub segment_size: usize,
    /// Minimum spacing between writes.
    pub segment_gap: Duration,
    pub keep_original_data: bool,
    /// Connections the proxy is expected to open.
    pub conns_n: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            keep_alive: None,
            pipelined: 0,
            hang_on_req_num: None,
            delay_before_sending_response: Duration::ZERO,
            drop_conn_when_receiving_data: false,
            segment_size: 0,
            segment_gap: Duration::ZERO,
            keep_original_data: false,
            conns_n: DEFAULT_CONNS_N,
        }
    }
}

#[derive(Default)]
struct ServerState {
    response: Bytes,
    hook: Option<Arc<dyn ResponseHook>>,
    options: ServerOptions,
    requests: Vec<Request>,
    connections: usize,
    accepted: usize,
}

/// State shared between the server object and its connection handlers.
struct ServerShared {
    name: String,
    state: Mutex<ServerState>,
    auto_parser: Arc<Mutex<AutoParser>>,
    default_segment_size: usize,
}

impl ServerShared {
    /// Records `request` and decides the reply. `None` means the server is
    /// hanging.
    fn receive_request(&self, request: &Request) -> Option<Reply> {
        let (hook, canned) = {
            let mut state = lock(&self.state);
            state.requests.push(request.clone());
            if let Some(limit) = state.options.hang_on_req_num {
                if limit > 0 && state.requests.len() >= limit {
                    debug!(target: "deproxy::http", "{}: request #{} is left unanswered", self.name, state.requests.len());
                    return None;
                }
            }
            (state.hook.clone(), state.response.clone())
        };
        let reply = match hook {
            Some(hook) => hook.receive_request(request),
            None => Reply {
                response: Some(canned).filter(|r| !r.is_empty()),
                close: false,
            },
        };
        Some(reply)
    }

    fn options(&self) -> ServerOptions {
        lock(&self.state).options.clone()
    }
}


struct ServerAcceptor {
    shared: Arc<ServerShared>,
}

impl Acceptor for ServerAcceptor {
    fn accept(&self, peer: SocketAddr) -> Result<Accepted> {
        let options = {
            let mut state = lock(&self.shared.state);
            state.accepted += 1;
            state.options.clone()
        };
        debug!(target: "deproxy::tcp", "{}: new connection from {}", self.shared.name, peer);
        let handler = ServerConnection::new(self.shared.clone(), &options);
        Ok(Accepted::new(Arc::new(Mutex::new(handler))))
    }
}

/// One upstream connection as seen by the emulated origin.
pub struct ServerConnection {
    shared: Arc<ServerShared>,
    conn: Connection,
    decoder: RequestDecoder,
    inbound: BytesMut,
    outbound: BytesMut,
    batch: BytesMut,
    batched: usize,
    responses_done: usize,
    segment_size: usize,
    segment_gap: Duration,
    last_segment: Option<Instant>,
    send_not_before: Option<Instant>,
    close_after_flush: bool,
    counted: bool,
}

impl fmt::Debug for ServerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConnection")
            .field("conn", &self.conn.to_string())
            .field("responses_done", &self.responses_done)
            .field("pending", &self.outbound.len())
            .finish()
    }
}

impl ServerConnection {
    fn new(shared: Arc<ServerShared>, options: &ServerOptions) -> Self {
        let decoder = RequestDecoder::new(ParseOptions {
            body_parsing: true,
            keep_original_data: options.keep_original_data,
        });
        let mut conn = Self {
            shared,
            conn: Connection::new(),
            decoder,
            inbound: BytesMut::new(),
            outbound: BytesMut::new(),
            batch: BytesMut::new(),
            batched: 0,
            responses_done: 0,
            segment_size: 0,
            segment_gap: Duration::ZERO,
            last_segment: None,
            send_not_before: None,
            close_after_flush: false,
            counted: false,
        };
        conn.apply_pacing(options);
        conn
    }

    fn apply_pacing(&mut self, options: &ServerOptions) {
        self.segment_size = if options.segment_size > 0 {
            options.segment_size
        } else {
            self.shared.default_segment_size
        };
        self.segment_gap = options.segment_gap;
    }

    fn receive(&mut self, data: Bytes) -> Result<Vec<Command>> {
        let options = self.shared.options();
        if options.drop_conn_when_receiving_data {
            info!(target: "deproxy::tcp", "{}: dropping {} on incoming data", self.shared.name, self.conn);
            return Ok(vec![Command::Close]);
        }
        if self.close_after_flush {
            trace!(target: "deproxy::tcp", "{}: ignoring {} bytes on a closing connection", self.shared.name, data.len());
            return Ok(Vec::new());
        }
        self.apply_pacing(&options);
        self.inbound.extend_from_slice(&data);

        loop {
            let request = match self.decoder.decode(&mut self.inbound) {
                Ok(Some(request)) => request,
                Ok(None) => break,
                Err(e) => {
                    info!(
                        target: "deproxy::http",
                        "{}: can't parse message\n<<<<<\n{}>>>>>",
                        self.shared.name,
                        String::from_utf8_lossy(&self.inbound)
                    );
                    return Err(e);
                }
            };
            debug!(target: "deproxy::http", "{}: receive request {} {}", self.shared.name, request.method, request.uri);
            trace!(target: "deproxy::http", "{}", request);
            {
                let mut auto_parser = lock(&self.shared.auto_parser);
                if auto_parser.parsing() {
                    auto_parser.check_expected_request(&request);
                }
            }

            let Some(reply) = self.shared.receive_request(&request) else {
                continue;
            };
            if let Some(response) = reply.response {
                {
                    let mut auto_parser = lock(&self.shared.auto_parser);
                    if auto_parser.parsing() {
                        auto_parser.prepare_expected_response(&response);
                    }
                }
                self.queue(response, &options);
            }
            if reply.close {
                self.finish();
                break;
            }
        }
        Ok(Vec::new())
    }

    fn queue(&mut self, response: Bytes, options: &ServerOptions) {
        debug!(target: "deproxy::http", "{}: send response ({} bytes)", self.shared.name, response.len());
        self.responses_done += 1;
        if options.pipelined > 1 {
            self.batch.extend_from_slice(&response);
            self.batched += 1;
            if self.batched >= options.pipelined {
                self.flush_batch(options.delay_before_sending_response);
            }
        } else {
            self.push_out(&response, options.delay_before_sending_response);
        }
        if let Some(limit) = options.keep_alive {
            if limit > 0 && self.responses_done >= limit {
                debug!(target: "deproxy::tcp", "{}: keep-alive limit {} reached", self.shared.name, limit);
                self.finish();
            }
        }
    }

    fn flush_batch(&mut self, delay: Duration) {
        let batch = self.batch.split().freeze();
        self.batched = 0;
        self.push_out(&batch, delay);
    }

    fn push_out(&mut self, data: &[u8], delay: Duration) {
        if data.is_empty() {
            return;
        }
        if self.outbound.is_empty() && !delay.is_zero() {
            self.send_not_before = Some(Instant::now() + delay);
        }
        self.outbound.extend_from_slice(data);
    }

    /// Close once everything queued, including a partial batch, is out.
    fn finish(&mut self) {
        if self.batched > 0 {
            self.flush_batch(Duration::ZERO);
        }
        self.inbound.clear();
        self.close_after_flush = true;
    }
}

impl Handler for ServerConnection {
    fn handle_event(&mut self, event: Event) -> Result<Vec<Command>> {
        match event {
            Event::Connected { local, peer } => {
                self.conn.connected(local, peer);
                lock(&self.shared.state).connections += 1;
                self.counted = true;
            }
            Event::DataReceived(data) => return self.receive(data),
            Event::DataSent(n) => {
                self.outbound.advance(n);
                self.last_segment = Some(Instant::now());
                if self.outbound.is_empty() && self.close_after_flush {
                    return Ok(vec![Command::Close]);
                }
            }
            Event::ConnectFailed(kind) | Event::IoError(kind) => {
                self.conn.error = Some(format!("{:?}", kind));
            }
            Event::Closed => {
                if self.counted {
                    let mut state = lock(&self.shared.state);
                    state.connections = state.connections.saturating_sub(1);
                    self.counted = false;
                }
                self.conn.closed();
                debug!(target: "deproxy::tcp", "{}: connection closed", self.shared.name);
            }
        }
        Ok(Vec::new())
    }

    fn writable(&self, now: Instant) -> bool {
        if self.outbound.is_empty() {
            return false;
        }
        if self.send_not_before.map_or(false, |at| now < at) {
            return false;
        }
        match self.last_segment {
            Some(last) if !self.segment_gap.is_zero() => now >= last + self.segment_gap,
            _ => true,
        }
    }

    fn next_segment(&mut self, _now: Instant) -> Option<Bytes> {
        if self.outbound.is_empty() {
            return None;
        }
        let n = self.segment_size.max(1).min(self.outbound.len());
        Some(Bytes::copy_from_slice(&self.outbound[..n]))
    }

    fn wants_close(&self) -> bool {
        self.close_after_flush && self.outbound.is_empty()
    }
}

/// Emulated origin server.
pub struct DeproxyServer {
    lifecycle: Lifecycle,
    manager: ManagerHandle,
    addr: SocketAddr,
    local_addr: Option<SocketAddr>,
    shared: Arc<ServerShared>,
    listener: Option<CancellationToken>,
}

/// A server that always answers with its configured response.
pub type StaticDeproxyServer = DeproxyServer;

impl fmt::Debug for DeproxyServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeproxyServer")
            .field("addr", &self.addr)
            .field("state", &self.state())
            .field("connections", &self.connections())
            .finish()
    }
}

impl DeproxyServer {
    /// A server for `addr` that answers nothing until a response or hook is
    /// set. Port 0 picks a free port at start.
    pub fn new(manager: &ManagerHandle, addr: SocketAddr) -> Self {
        let config = manager.config();
        let default_segment_size = if config.deproxy.tcp_segmentation > 0 {
            config.deproxy.tcp_segmentation
        } else {
            config.deproxy.max_message_size
        };
        Self {
            lifecycle: Lifecycle::new(),
            manager: manager.clone(),
            addr,
            local_addr: None,
            shared: Arc::new(ServerShared {
                name: format!("deproxy server {}", addr),
                state: Mutex::new(ServerState::default()),
                auto_parser: manager.auto_parser(),
                default_segment_size,
            }),
            listener: None,
        }
    }

    pub fn with_response(manager: &ManagerHandle, addr: SocketAddr, response: impl Into<ResponseContent>) -> Self {
        let server = Self::new(manager, addr);
        server.set_response(response);
        server
    }

    /// The address the server is bound to once started, else the configured
    /// one.
    pub fn addr(&self) -> SocketAddr {
        self.local_addr.unwrap_or(self.addr)
    }

    pub fn set_response(&self, response: impl Into<ResponseContent>) {
        lock(&self.shared.state).response = response.into().into_bytes();
    }

    pub fn response(&self) -> Bytes {
        lock(&self.shared.state).response.clone()
    }

    /// Replaces the canned response with request-dependent behavior.
    pub fn set_hook(&self, hook: impl ResponseHook + 'static) {
        lock(&self.shared.state).hook = Some(Arc::new(hook));
    }

    pub fn clear_hook(&self) {
        lock(&self.shared.state).hook = None;
    }

    pub fn options(&self) -> ServerOptions {
        self.shared.options()
    }

    pub fn update_options(&self, update: impl FnOnce(&mut ServerOptions)) {
        update(&mut lock(&self.shared.state).options);
    }

    pub fn set_keep_alive(&self, keep_alive: Option<usize>) {
        self.update_options(|o| o.keep_alive = keep_alive);
    }

    pub fn set_pipelined(&self, pipelined: usize) {
        self.update_options(|o| o.pipelined = pipelined);
    }

    pub fn set_hang_on_req_num(&self, n: Option<usize>) {
        self.update_options(|o| o.hang_on_req_num = n);
    }

    pub fn set_delay_before_sending_response(&self, delay: Duration) {
        self.update_options(|o| o.delay_before_sending_response = delay);
    }

    pub fn set_drop_conn_when_receiving_data(&self, drop: bool) {
        self.update_options(|o| o.drop_conn_when_receiving_data = drop);
    }

    pub fn set_segmentation(&self, segment_size: usize, segment_gap: Duration) {
        self.update_options(|o| {
            o.segment_size = segment_size;
            o.segment_gap = segment_gap;
        });
    }

    pub fn set_conns_n(&self, conns_n: usize) {
        self.update_options(|o| o.conns_n = conns_n);
    }

    pub fn set_keep_original_data(&self, keep: bool) {
        self.update_options(|o| o.keep_original_data = keep);
    }

    pub fn requests(&self) -> Vec<Request> {
        lock(&self.shared.state).requests.clone()
    }

    pub fn last_request(&self) -> Option<Request> {
        lock(&self.shared.state).requests.last().cloned()
    }

    /// Currently open connections.
    pub fn connections(&self) -> usize {
        lock(&self.shared.state).connections
    }

    /// Connections accepted since the server was created.
    pub fn accepted(&self) -> usize {
        lock(&self.shared.state).accepted
    }

    fn not_running(&self) -> bool {
        self.state() != State::Started
    }

    /// Waits until the proxy holds `conns_n` connections. `false` on timeout
    /// or when the server is not running.
    pub async fn wait_for_connections(&self, timeout: Duration) -> bool {
        if self.not_running() {
            return false;
        }
        let conns_n = self.options().conns_n;
        wait_until(
            || self.connections() >= conns_n,
            timeout,
            self.manager.poll_interval(),
            || self.not_running(),
        )
        .await
        .is_satisfied()
    }

    pub async fn wait_for_requests(&self, n: usize, timeout: Duration) -> WaitOutcome {
        wait_until(
            || lock(&self.shared.state).requests.len() >= n,
            timeout,
            self.manager.poll_interval(),
            || self.not_running(),
        )
        .await
    }

    fn close_all(&mut self) -> Result<()> {
        if let Some(token) = self.listener.take() {
            token.cancel();
        }
        // Closed events arrive from the reactor thread.
        let deadline = Instant::now() + Duration::from_secs(1);
        while self.connections() > 0 && Instant::now() < deadline && !self.manager.has_failed() {
            std::thread::sleep(self.manager.poll_interval());
        }
        Ok(())
    }
}

impl Stateful for DeproxyServer {
    fn name(&self) -> String {
        self.shared.name.clone()
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
        lock(&self.shared.state).requests.clear();
        let acceptor = Arc::new(ServerAcceptor {
            shared: self.shared.clone(),
        });
        match self.manager.listen(self.addr, acceptor) {
            Ok((local, token)) => {
                info!(target: "deproxy::tcp", "{}: start on {}", name, local);
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
        info!(target: "deproxy::tcp", "{}: stop", name);
        let result = self.close_all();
        self.lifecycle.finish_stop(&name, vec![result]);
    }
}

impl Drop for DeproxyServer {
    fn drop(&mut self) {
        if let Some(token) = self.listener.take() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::deproxy::manager::DeproxyManager;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    const OK: &str = "HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";
    const GET: &[u8] = b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n";

    fn manager() -> DeproxyManager {
        let mut config = Config::default();
        config.deproxy.auto_parser = false;
        let mut manager = DeproxyManager::new(config);
        manager.start().unwrap();
        manager
    }

    fn started(manager: &DeproxyManager, response: &str) -> DeproxyServer {
        let mut server = DeproxyServer::with_response(&manager.handle(), "127.0.0.1:0".parse().unwrap(), response);
        server.start().unwrap();
        server
    }

    /// Reads until `expected` bytes arrived, EOF, or `timeout`.
    async fn read_some(stream: &mut TcpStream, expected: usize, timeout: Duration) -> (Vec<u8>, bool) {
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        let deadline = tokio::time::Instant::now() + timeout;
        while out.len() < expected {
            match tokio::time::timeout_at(deadline, stream.read(&mut buf)).await {
                Ok(Ok(0)) => return (out, true),
                Ok(Ok(n)) => out.extend_from_slice(&buf[..n]),
                Ok(Err(_)) => return (out, true),
                Err(_) => break,
            }
        }
        (out, false)
    }

    #[tokio::test]
    async fn test_static_response_and_request_tracking() {
        let manager = manager();
        let server = started(&manager, OK);
        let mut stream = TcpStream::connect(server.addr()).await.unwrap();
        stream.write_all(GET).await.unwrap();

        let (data, _) = read_some(&mut stream, OK.len(), Duration::from_secs(5)).await;
        assert_eq!(data, OK.as_bytes());
        assert!(server.wait_for_requests(1, Duration::from_secs(1)).await.is_satisfied());
        assert_eq!(server.last_request().unwrap().uri, "/");
        assert_eq!(server.connections(), 1);
    }

    #[tokio::test]
    async fn test_keep_alive_closes_connection() {
        let manager = manager();
        let server = started(&manager, OK);
        server.set_keep_alive(Some(1));
        let mut stream = TcpStream::connect(server.addr()).await.unwrap();
        stream.write_all(GET).await.unwrap();

        let (data, eof) = read_some(&mut stream, usize::MAX, Duration::from_secs(5)).await;
        assert_eq!(data, OK.as_bytes());
        assert!(eof);
    }

    #[tokio::test]
    async fn test_pipelined_responses_are_batched() {
        let manager = manager();
        let server = started(&manager, OK);
        server.set_pipelined(2);
        let mut stream = TcpStream::connect(server.addr()).await.unwrap();
        stream.write_all(GET).await.unwrap();

        let (data, _) = read_some(&mut stream, 1, Duration::from_millis(200)).await;
        assert!(data.is_empty());

        stream.write_all(GET).await.unwrap();
        let (data, _) = read_some(&mut stream, 2 * OK.len(), Duration::from_secs(5)).await;
        assert_eq!(data, [OK.as_bytes(), OK.as_bytes()].concat());
    }

    #[tokio::test]
    async fn test_hang_keeps_connection_open() {
        let manager = manager();
        let server = started(&manager, OK);
        server.set_hang_on_req_num(Some(2));
        let mut stream = TcpStream::connect(server.addr()).await.unwrap();
        stream.write_all(GET).await.unwrap();
        let (data, _) = read_some(&mut stream, OK.len(), Duration::from_secs(5)).await;
        assert_eq!(data.len(), OK.len());

        stream.write_all(GET).await.unwrap();
        let (data, eof) = read_some(&mut stream, 1, Duration::from_millis(300)).await;
        assert!(data.is_empty());
        assert!(!eof);
        assert_eq!(server.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_drop_connection_on_data() {
        let manager = manager();
        let server = started(&manager, OK);
        server.set_drop_conn_when_receiving_data(true);
        let mut stream = TcpStream::connect(server.addr()).await.unwrap();
        stream.write_all(GET).await.unwrap();

        let (data, eof) = read_some(&mut stream, usize::MAX, Duration::from_secs(5)).await;
        assert!(data.is_empty());
        assert!(eof);
        assert!(server.requests().is_empty());
    }

    #[tokio::test]
    async fn test_hook_decides_reply() {
        let manager = manager();
        let server = started(&manager, OK);
        server.set_hook(|request: &Request| {
            if request.uri == "/drop" {
                Reply::drop_connection()
            } else {
                Reply::respond(format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
                    request.uri.len(),
                    request.uri
                ))
            }
        });
        let mut stream = TcpStream::connect(server.addr()).await.unwrap();
        stream.write_all(b"GET /abc HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();
        let (data, _) = read_some(&mut stream, 42, Duration::from_secs(5)).await;
        assert!(data.ends_with(b"\r\n\r\n/abc"));

        stream.write_all(b"GET /drop HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();
        let (data, eof) = read_some(&mut stream, usize::MAX, Duration::from_secs(5)).await;
        assert!(data.is_empty());
        assert!(eof);
    }

    #[tokio::test]
    async fn test_segmented_response_arrives_whole() {
        let manager = manager();
        let server = started(&manager, OK);
        server.set_segmentation(1, Duration::from_millis(1));
        let mut stream = TcpStream::connect(server.addr()).await.unwrap();
        stream.write_all(GET).await.unwrap();
        let (data, _) = read_some(&mut stream, OK.len(), Duration::from_secs(5)).await;
        assert_eq!(data, OK.as_bytes());
    }

    #[tokio::test]
    async fn test_wait_for_connections() {
        let manager = manager();
        let server = started(&manager, OK);
        server.set_conns_n(2);
        assert!(!server.wait_for_connections(Duration::from_millis(50)).await);

        let _a = TcpStream::connect(server.addr()).await.unwrap();
        let _b = TcpStream::connect(server.addr()).await.unwrap();
        assert!(server.wait_for_connections(Duration::from_secs(5)).await);
        assert_eq!(server.accepted(), 2);
    }

    #[tokio::test]
    async fn test_stop_closes_connections() {
        let manager = manager();
        let mut server = started(&manager, OK);
        let mut stream = TcpStream::connect(server.addr()).await.unwrap();
        server.set_conns_n(1);
        assert!(server.wait_for_connections(Duration::from_secs(5)).await);

        server.stop();
        assert_eq!(server.state(), State::Stopped);
        let (_, eof) = read_some(&mut stream, usize::MAX, Duration::from_secs(5)).await;
        assert!(eof);
        assert!(!server.wait_for_connections(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_garbage_request_fails_manager() {
        let manager = manager();
        let server = started(&manager, OK);
        let mut stream = TcpStream::connect(server.addr()).await.unwrap();
        stream.write_all(b"NOT HTTP AT ALL\r\n\r\n").await.unwrap();
        let failed = wait_until(|| manager.state() == State::Error, Duration::from_secs(5), Duration::from_millis(1), || false).await;
        assert!(failed.is_satisfied());
        assert_eq!(server.state(), State::Error);
    }
}
