//! Emulated downstream clients.
//!
//! [`Client`] owns the lifecycle, the counters and the waits every client
//! shares; the protocol lives in a [`Session`], which is also the reactor
//! handler for the client's connection. [`DeproxyClient`] speaks HTTP/1.x,
//! [`DeproxyClientH2`](super::client_h2::DeproxyClientH2) speaks HTTP/2.

use bytes::{Bytes, BytesMut};
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::auto_parser::AutoParser;
use super::events::{Command, Event};
use super::handler::{Handler, Outbound, SharedHandler};
use super::manager::ManagerHandle;
use crate::connection::Connection;
use crate::message::{HttpMessage, ParseOptions, Request, RequestBuilder, Response, ResponseDecoder};
use crate::stateful::{Lifecycle, State, Stateful};
use crate::util::{lock, wait_until, WaitOutcome};
use crate::{Error, Result};

/// Why a connection or stream failed, as recorded by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Io(io::ErrorKind),
    H2(h2::Reason),
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::Io(kind) => write!(f, "{:?}", kind),
            ErrorCode::H2(reason) => write!(f, "{:?}", reason),
        }
    }
}

/// Connection, pacing and response bookkeeping shared by both protocols.
pub struct ClientBase {
    pub(crate) name: String,
    pub(crate) conn: Connection,
    pub(crate) auto_parser: Arc<Mutex<AutoParser>>,
    /// Requests the client must send.
    pub(crate) nrreq: usize,
    pub(crate) nrresp: usize,
    /// Requests that are expected to get a response.
    pub(crate) valid_req_num: usize,
    /// Index of the request buffer being sent.
    pub(crate) cur_req_num: usize,
    pub(crate) request_buffers: Vec<Bytes>,
    pub(crate) responses: Vec<Response>,
    pub(crate) methods: Vec<String>,
    pub(crate) error_codes: Vec<ErrorCode>,
    pub(crate) parsing: bool,
    pub(crate) x_forwarded_for: String,
    rps: u32,
    segment_size: usize,
    segment_gap: Duration,
    /// A relay does the segmentation for this connection.
    bypass_segmentation: bool,
    start_time: Option<Instant>,
    last_segment_time: Option<Instant>,
}

impl ClientBase {
    fn new(name: String, auto_parser: Arc<Mutex<AutoParser>>, x_forwarded_for: String) -> Self {
        Self {
            name,
            conn: Connection::new(),
            auto_parser,
            nrreq: 0,
            nrresp: 0,
            valid_req_num: 0,
            cur_req_num: 0,
            request_buffers: Vec::new(),
            responses: Vec::new(),
            methods: Vec::new(),
            error_codes: Vec::new(),
            parsing: true,
            x_forwarded_for,
            rps: 0,
            segment_size: 0,
            segment_gap: Duration::ZERO,
            bypass_segmentation: false,
            start_time: None,
            last_segment_time: None,
        }
    }

    pub(crate) fn clear_stats(&mut self) {
        self.nrreq = 0;
        self.nrresp = 0;
        self.valid_req_num = 0;
        self.cur_req_num = 0;
        self.request_buffers.clear();
        self.responses.clear();
        self.methods.clear();
        self.error_codes.clear();
        self.start_time = None;
        self.last_segment_time = None;
    }

    fn next_request_time(&self) -> Option<Instant> {
        let start = self.start_time?;
        if self.rps == 0 {
            return Some(start);
        }
        Some(start + Duration::from_secs_f64(self.cur_req_num as f64 / self.rps as f64))
    }

    /// A request is queued, its rps slot has come and the segment gap is
    /// over.
    pub(crate) fn has_pending_data(&self, now: Instant) -> bool {
        if self.cur_req_num >= self.request_buffers.len() {
            return false;
        }
        match self.next_request_time() {
            Some(at) if now >= at => {}
            _ => return false,
        }
        let gap = self.effective_gap();
        match self.last_segment_time {
            Some(last) if !gap.is_zero() => now >= last + gap,
            _ => true,
        }
    }

    fn effective_gap(&self) -> Duration {
        if self.bypass_segmentation {
            Duration::ZERO
        } else {
            self.segment_gap
        }
    }

    pub(crate) fn segment_size(&self) -> usize {
        self.segment_size
    }

    /// Bytes of the current request for one write.
    pub(crate) fn segment(&self) -> Option<Bytes> {
        let buffer = self.request_buffers.get(self.cur_req_num)?;
        if buffer.is_empty() {
            return None;
        }
        if self.segment_size > 0 && !self.bypass_segmentation {
            Some(buffer.slice(..self.segment_size.min(buffer.len())))
        } else {
            Some(buffer.clone())
        }
    }

    /// Drops `n` sent bytes from the current request. Returns true when
    /// the current buffer is now empty.
    pub(crate) fn consume(&mut self, n: usize) -> bool {
        self.last_segment_time = Some(Instant::now());
        let Some(buffer) = self.request_buffers.get_mut(self.cur_req_num) else {
            return false;
        };
        let n = n.min(buffer.len());
        let _ = buffer.split_to(n);
        if !buffer.is_empty() && self.segment_size == 0 {
            info!(target: "deproxy::tcp", "{}: {} bytes sent. {} bytes left.", self.name, n, buffer.len());
        }
        buffer.is_empty()
    }

    pub(crate) fn finish_current(&mut self) {
        self.cur_req_num += 1;
        info!(
            target: "deproxy::http",
            "{}: A request was send. The current number of a request - {}",
            self.name,
            self.cur_req_num
        );
    }

    pub(crate) fn receive_response(&mut self, response: Response, is_h2: bool) {
        self.nrresp += 1;
        info!(
            target: "deproxy::http",
            "{}: A response was receive. The response status={}. The current number of responses - {}.",
            self.name,
            response.status,
            self.nrresp
        );
        trace!(target: "deproxy::http", "{}", response);
        self.responses.push(response);
        let mut auto_parser = lock(&self.auto_parser);
        if auto_parser.parsing() {
            if let Some(last) = self.responses.last() {
                auto_parser.check_expected_response(last, is_h2);
            }
        }
    }

    /// Bookkeeping for events every protocol treats alike.
    pub(crate) fn handle_conn_event(&mut self, event: Event) {
        match event {
            Event::Connected { local, peer } => {
                info!(target: "deproxy::tcp", "{}: connected {} -> {}", self.name, local, peer);
                self.conn.connected(local, peer);
                self.start_time = Some(Instant::now());
            }
            Event::ConnectFailed(kind) | Event::IoError(kind) => {
                warn!(target: "deproxy::tcp", "{}: Receive error - {:?}", self.name, kind);
                self.error_codes.push(ErrorCode::Io(kind));
                self.conn.error = Some(format!("{:?}", kind));
            }
            Event::Closed => {
                debug!(target: "deproxy::tcp", "{}: connection closed", self.name);
                self.conn.closed();
            }
            Event::DataReceived(_) | Event::DataSent(_) => {}
        }
    }

    pub(crate) fn prepare_expected_request(&self, raw: &[u8]) {
        let mut auto_parser = lock(&self.auto_parser);
        if auto_parser.parsing() {
            auto_parser.prepare_expected_request(raw, &self.x_forwarded_for);
        }
    }
}

/// The protocol half of a client: a reactor handler that also owns the
/// client's counters.
pub trait Session: Handler + Sized + 'static {
    const HTTP2: bool;

    fn new(base: ClientBase) -> Self;

    fn base(&self) -> &ClientBase;

    fn base_mut(&mut self) -> &mut ClientBase;

    /// Forgets the previous run. Called on every start.
    fn clear_stats(&mut self);
}

/// An emulated client bound to one target address.
pub struct Client<S: Session> {
    lifecycle: Lifecycle,
    manager: ManagerHandle,
    addr: SocketAddr,
    bind_addr: Option<IpAddr>,
    through_relay: bool,
    relay_leased: bool,
    session: Arc<Mutex<S>>,
    token: Option<CancellationToken>,
}

impl<S: Session> fmt::Debug for Client<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("addr", &self.addr)
            .field("http2", &S::HTTP2)
            .field("state", &self.state())
            .finish()
    }
}

impl<S: Session> Client<S> {
    pub fn new(manager: &ManagerHandle, addr: SocketAddr) -> Self {
        let name = format!("deproxy client {}{}", if S::HTTP2 { "h2 " } else { "" }, addr);
        let base = ClientBase::new(name, manager.auto_parser(), manager.config().client.ip.clone());
        Self {
            lifecycle: Lifecycle::new(),
            manager: manager.clone(),
            addr,
            bind_addr: None,
            through_relay: false,
            relay_leased: false,
            session: Arc::new(Mutex::new(S::new(base))),
            token: None,
        }
    }

    pub(crate) fn session(&self) -> &Arc<Mutex<S>> {
        &self.session
    }

    pub(crate) fn manager(&self) -> &ManagerHandle {
        &self.manager
    }

    pub(super) fn with_base<T>(&self, f: impl FnOnce(&ClientBase) -> T) -> T {
        f(lock(&self.session).base())
    }

    pub(super) fn with_base_mut<T>(&self, f: impl FnOnce(&mut ClientBase) -> T) -> T {
        f(lock(&self.session).base_mut())
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Source address for the connection. It is also what the proxy puts
    /// into `X-Forwarded-For`.
    pub fn set_bind_addr(&mut self, ip: IpAddr) {
        self.bind_addr = Some(ip);
        self.with_base_mut(|b| b.x_forwarded_for = ip.to_string());
    }

    pub fn bind_addr(&self) -> Option<IpAddr> {
        self.bind_addr
    }

    /// The connection's local address once connected.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.with_base(|b| b.conn.sockname)
    }

    pub fn set_rps(&self, rps: u32) {
        self.with_base_mut(|b| b.rps = rps);
    }

    /// `segment_size` bytes per write (0 = whole requests), at least
    /// `segment_gap` apart.
    pub fn set_segmentation(&self, segment_size: usize, segment_gap: Duration) {
        self.with_base_mut(|b| {
            b.segment_size = segment_size;
            b.segment_gap = segment_gap;
        });
    }

    /// Route the connection through the segmentation relay, which then
    /// applies this client's segmentation instead of the client itself.
    pub fn set_through_relay(&mut self, through_relay: bool) {
        self.through_relay = through_relay;
    }

    pub fn parsing(&self) -> bool {
        self.with_base(|b| b.parsing)
    }

    /// Off for intentionally malformed traffic.
    pub fn set_parsing(&self, parsing: bool) {
        self.with_base_mut(|b| b.parsing = parsing);
    }

    pub fn nrreq(&self) -> usize {
        self.with_base(|b| b.nrreq)
    }

    pub fn nrresp(&self) -> usize {
        self.with_base(|b| b.nrresp)
    }

    pub fn valid_req_num(&self) -> usize {
        self.with_base(|b| b.valid_req_num)
    }

    pub fn cur_req_num(&self) -> usize {
        self.with_base(|b| b.cur_req_num)
    }

    pub fn responses(&self) -> Vec<Response> {
        self.with_base(|b| b.responses.clone())
    }

    pub fn last_response(&self) -> Option<Response> {
        self.with_base(|b| b.responses.last().cloned())
    }

    /// Response count per status code. HTTP responses need not match TCP
    /// exchanges one to one.
    pub fn statuses(&self) -> BTreeMap<u16, usize> {
        self.with_base(|b| {
            let mut statuses = BTreeMap::new();
            for response in &b.responses {
                *statuses.entry(response.status).or_insert(0) += 1;
            }
            statuses
        })
    }

    pub fn methods(&self) -> Vec<String> {
        self.with_base(|b| b.methods.clone())
    }

    pub fn error_codes(&self) -> Vec<ErrorCode> {
        self.with_base(|b| b.error_codes.clone())
    }

    /// Error codes are not checked for segmented connections: the order of
    /// a reset and the last bytes is not under the client's control there.
    pub fn assert_error_code(&self, expected: ErrorCode) -> Result<()> {
        self.with_base(|b| {
            if b.segment_size() > 0 || b.error_codes.contains(&expected) {
                Ok(())
            } else {
                Err(Error::assertion(format!("{} not found in {:?}", expected, b.error_codes)))
            }
        })
    }

    pub fn conn_is_closed(&self) -> bool {
        self.with_base(|b| b.conn.is_closed())
    }

    pub fn conn_is_active(&self) -> bool {
        self.with_base(|b| b.conn.is_open())
    }

    /// Queues raw bytes. `expect_response` counts them as a request that
    /// should be answered.
    pub fn send_bytes(&self, data: impl Into<Bytes>, expect_response: bool) {
        self.with_base_mut(|b| {
            b.request_buffers.push(data.into());
            b.nrreq += 1;
            if expect_response {
                b.valid_req_num += 1;
            }
        });
    }

    pub(super) fn poll(&self) -> Duration {
        self.manager.poll_interval()
    }

    pub(super) fn connection_lost(&self) -> bool {
        self.with_base(|b| b.conn.is_closed())
    }

    pub(crate) fn aborted(&self) -> bool {
        self.state() != State::Started || self.connection_lost()
    }

    pub async fn wait_for_connection_open(&self, timeout: Duration) -> WaitOutcome {
        wait_until(
            || self.conn_is_active(),
            timeout,
            self.poll(),
            || self.with_base(|b| !b.conn.is_connecting() && !b.conn.is_open()),
        )
        .await
    }

    pub async fn wait_for_connection_close(&self, timeout: Duration) -> WaitOutcome {
        wait_until(
            || self.conn_is_closed(),
            timeout,
            self.poll(),
            || self.state() == State::Error,
        )
        .await
    }

    /// Waits for `n` responses in total, by default one per valid request.
    pub async fn wait_for_response(&self, timeout: Duration, n: Option<usize>) -> WaitOutcome {
        wait_until(
            || self.with_base(|b| b.responses.len() >= n.unwrap_or(b.valid_req_num)),
            timeout,
            self.poll(),
            || self.aborted(),
        )
        .await
    }

    /// Shared tail of `send_request`: the response arrived and carries the
    /// expected status.
    pub(crate) async fn check_sent_request(&self, before: usize, expected_status: Option<u16>, timeout: Duration) -> Result<()> {
        let outcome = self.wait_for_response(timeout, None).await;
        let Some(expected) = expected_status else {
            return Ok(());
        };
        outcome.strict("response")?;
        self.with_base(|b| {
            if b.responses.len() != before + 1 {
                return Err(Error::assertion("Deproxy client has lost response."));
            }
            let received = b.responses.last().map(|r| r.status);
            if received != Some(expected) {
                return Err(Error::assertion(format!(
                    "HTTP response status codes mismatch. Expected - {}. Received - {:?}",
                    expected, received
                )));
            }
            Ok(())
        })
    }

    fn connect_target(&mut self) -> Result<SocketAddr> {
        let (segment_size, segment_gap) = self.with_base(|b| (b.segment_size, b.segment_gap));
        let use_relay = self.through_relay && (segment_size > 0 || !segment_gap.is_zero());
        self.with_base_mut(|b| b.bypass_segmentation = use_relay);
        if !use_relay {
            return Ok(self.addr);
        }
        let relays = self.manager.relays();
        let relay = lock(&relays).request(&self.manager, self.addr, segment_size, segment_gap)?;
        self.relay_leased = true;
        Ok(relay)
    }

    fn release_relay(&mut self) {
        if self.relay_leased {
            self.relay_leased = false;
            let relays = self.manager.relays();
            lock(&relays).release();
        }
    }

    fn open(&mut self) -> Result<()> {
        {
            let mut session = lock(&self.session);
            session.clear_stats();
            session.base_mut().conn.connecting();
        }
        let target = self.connect_target()?;
        let handler: SharedHandler = self.session.clone();
        let token = self.manager.connect(Outbound {
            addr: target,
            bind: self.bind_addr.map(|ip| SocketAddr::new(ip, 0)),
            handler,
        })?;
        self.token = Some(token);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(token) = self.token.take() {
            token.cancel();
        }
        // Closed arrives from the reactor thread.
        let deadline = Instant::now() + Duration::from_secs(1);
        while !self.conn_is_closed() && Instant::now() < deadline && !self.manager.has_failed() {
            std::thread::sleep(self.poll());
        }
        self.release_relay();
        Ok(())
    }
}

impl<S: Session> Stateful for Client<S> {
    fn name(&self) -> String {
        self.with_base(|b| b.name.clone())
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
        match self.open() {
            Ok(()) => {
                self.lifecycle.set_state(State::Started);
                Ok(())
            }
            Err(e) => {
                error!(target: "deproxy::tcp", "{}: start failed: {}", name, e);
                self.with_base_mut(|b| b.conn.closed());
                self.release_relay();
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
        let result = self.close();
        self.lifecycle.finish_stop(&name, vec![result]);
    }
}

impl<S: Session> Drop for Client<S> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            token.cancel();
        }
        self.release_relay();
    }
}

/// A request as handed to the HTTP/1 client: raw text, possibly
/// malformed on purpose, or a built [`Request`].
#[derive(Debug, Clone)]
pub enum H1Input {
    Raw(Bytes),
    Message(Request),
}

impl From<&str> for H1Input {
    fn from(text: &str) -> Self {
        H1Input::Raw(Bytes::copy_from_slice(text.as_bytes()))
    }
}

impl From<String> for H1Input {
    fn from(text: String) -> Self {
        H1Input::Raw(Bytes::from(text))
    }
}

impl From<&[u8]> for H1Input {
    fn from(raw: &[u8]) -> Self {
        H1Input::Raw(Bytes::copy_from_slice(raw))
    }
}

impl<const N: usize> From<&[u8; N]> for H1Input {
    fn from(raw: &[u8; N]) -> Self {
        H1Input::Raw(Bytes::copy_from_slice(raw))
    }
}

impl From<Bytes> for H1Input {
    fn from(raw: Bytes) -> Self {
        H1Input::Raw(raw)
    }
}

impl From<Request> for H1Input {
    fn from(request: Request) -> Self {
        H1Input::Message(request)
    }
}

impl From<&Request> for H1Input {
    fn from(request: &Request) -> Self {
        H1Input::Message(request.clone())
    }
}

/// Method recorded for raw requests that do not parse.
pub const INVALID_METHOD: &str = "INVALID";

/// HTTP/1.x protocol state of a [`DeproxyClient`].
pub struct Http1Session {
    base: ClientBase,
    decoder: ResponseDecoder,
    inbound: BytesMut,
}

impl Http1Session {
    /// Records the method(s) the responses will answer and returns the wire
    /// bytes.
    fn check_request(&mut self, input: H1Input) -> Result<Bytes> {
        let raw = match input {
            H1Input::Message(request) => {
                self.expect_method(&request.method);
                if request.headers.get("expect") == Some("100-continue") && request.body.is_empty() {
                    self.expect_method(&request.method);
                }
                request.to_bytes()
            }
            H1Input::Raw(raw) if self.base.parsing => {
                debug!(target: "deproxy::http", "{}: Request parsing is running.", self.base.name);
                match Request::parse(&raw) {
                    Ok(request) => {
                        if raw.len() > request.original_length {
                            return Err(Error::parse("Request has excess symbols."));
                        }
                        self.expect_method(&request.method);
                    }
                    Err(e) => {
                        info!(target: "deproxy::http", "{}: sending an INVALID request: {}", self.base.name, e);
                        self.expect_method(INVALID_METHOD);
                    }
                }
                raw
            }
            H1Input::Raw(raw) => {
                debug!(target: "deproxy::http", "{}: Request parsing has been disabled.", self.base.name);
                let method = raw.split(|b| *b == b' ').next().unwrap_or_default();
                self.expect_method(&String::from_utf8_lossy(method));
                raw
            }
        };
        self.base.prepare_expected_request(&raw);
        Ok(raw)
    }

    fn expect_method(&mut self, method: &str) {
        self.base.methods.push(method.to_string());
        self.decoder.expect_response_to(method);
    }

    fn receive(&mut self, data: Bytes) -> Result<()> {
        self.inbound.extend_from_slice(&data);
        loop {
            match self.decoder.decode(&mut self.inbound) {
                Ok(Some(response)) => self.base.receive_response(response, false),
                Ok(None) => return Ok(()),
                Err(e) => {
                    error!(
                        target: "deproxy::http",
                        "{}: Can't parse message\n<<<<\n{}\n>>>>",
                        self.base.name,
                        String::from_utf8_lossy(&self.inbound)
                    );
                    return Err(e);
                }
            }
        }
    }
}

impl Handler for Http1Session {
    fn handle_event(&mut self, event: Event) -> Result<Vec<Command>> {
        match event {
            Event::DataReceived(data) => self.receive(data)?,
            Event::DataSent(n) => {
                if self.base.consume(n) {
                    self.base.finish_current();
                }
            }
            other => self.base.handle_conn_event(other),
        }
        Ok(Vec::new())
    }

    fn writable(&self, now: Instant) -> bool {
        self.base.has_pending_data(now)
    }

    fn next_segment(&mut self, _now: Instant) -> Option<Bytes> {
        let segment = self.base.segment();
        if segment.is_none() && self.base.cur_req_num < self.base.request_buffers.len() {
            // Nothing to write for an empty buffer.
            self.base.finish_current();
        }
        segment
    }
}

impl Session for Http1Session {
    const HTTP2: bool = false;

    fn new(base: ClientBase) -> Self {
        Self {
            base,
            decoder: ResponseDecoder::new(ParseOptions::default()),
            inbound: BytesMut::new(),
        }
    }

    fn base(&self) -> &ClientBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ClientBase {
        &mut self.base
    }

    fn clear_stats(&mut self) {
        self.base.clear_stats();
        self.decoder = ResponseDecoder::new(ParseOptions::default());
        self.inbound.clear();
    }
}

/// HTTP/1.x emulated client.
pub type DeproxyClient = Client<Http1Session>;

impl Client<Http1Session> {
    /// A request builder with the configured client hostname as `Host`.
    pub fn create_request(&self, method: &str) -> RequestBuilder {
        Request::create(method).authority(Some(self.manager().config().client.hostname.as_str()))
    }

    /// Queues one request.
    pub fn make_request(&self, request: impl Into<H1Input>) -> Result<()> {
        let mut session = lock(self.session());
        let raw = session.check_request(request.into())?;
        let base = session.base_mut();
        base.valid_req_num += 1;
        base.request_buffers.push(raw);
        base.nrreq += 1;
        Ok(())
    }

    /// Queues several requests. Pipelined requests share one buffer and so
    /// leave in as few writes as possible.
    pub fn make_requests<I, R>(&self, requests: I, pipelined: bool) -> Result<()>
    where
        I: IntoIterator<Item = R>,
        R: Into<H1Input>,
    {
        if !pipelined {
            for request in requests {
                self.make_request(request)?;
            }
            return Ok(());
        }
        let mut session = lock(self.session());
        let mut joined = BytesMut::new();
        let mut count = 0;
        for request in requests {
            joined.extend_from_slice(&session.check_request(request.into())?);
            count += 1;
        }
        let base = session.base_mut();
        base.request_buffers.push(joined.freeze());
        base.valid_req_num += count;
        base.nrreq += 1;
        Ok(())
    }

    /// Sends one request and waits for its response. With an expected
    /// status, a missing response or another status is an error.
    pub async fn send_request(&self, request: impl Into<H1Input>, expected_status: Option<u16>, timeout: Duration) -> Result<()> {
        let before = self.with_base(|b| b.responses.len());
        self.make_request(request)?;
        self.check_sent_request(before, expected_status, timeout).await
    }
}
