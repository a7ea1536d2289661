//! HTTP/2 emulated client.
//!
//! Requests are queued as wire bytes like the HTTP/1 client does, except
//! bodies: DATA frames are cut lazily, one per write opportunity, so they
//! always fit the peer's frame size and the flow-control window of the
//! moment. A body that does not fit the window waits for WINDOW_UPDATE.

use bytes::{Bytes, BytesMut};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::auto_parser::AutoParser;
use super::client::{Client, ClientBase, ErrorCode, Session};
use super::events::{Command, Event};
use super::handler::Handler;
use crate::http2::{H2Connection, H2Event, Priority, SettingCode, Settings};
use crate::message::{Request, RequestBuilder, Response};
use crate::util::{lock, wait_until, WaitOutcome};
use crate::{Error, Result};

/// What `make_request` can send on an HTTP/2 connection.
#[derive(Debug, Clone)]
pub enum H2Input {
    /// One HEADERS frame.
    Headers(Vec<(String, String)>),
    /// HEADERS without END_STREAM, then the body as DATA.
    HeadersBody(Vec<(String, String)>, Bytes),
    /// DATA on the current stream.
    Body(Bytes),
    /// Bytes written as they are.
    Raw(Bytes),
}

fn owned_headers(headers: &[(&str, &str)]) -> Vec<(String, String)> {
    headers.iter().map(|(n, v)| (n.to_string(), v.to_string())).collect()
}

impl From<Vec<(String, String)>> for H2Input {
    fn from(headers: Vec<(String, String)>) -> Self {
        H2Input::Headers(headers)
    }
}

impl From<&[(&str, &str)]> for H2Input {
    fn from(headers: &[(&str, &str)]) -> Self {
        H2Input::Headers(owned_headers(headers))
    }
}

impl<const N: usize> From<[(&str, &str); N]> for H2Input {
    fn from(headers: [(&str, &str); N]) -> Self {
        H2Input::Headers(owned_headers(&headers))
    }
}

impl<const N: usize> From<([(&str, &str); N], &str)> for H2Input {
    fn from((headers, body): ([(&str, &str); N], &str)) -> Self {
        H2Input::HeadersBody(owned_headers(&headers), Bytes::copy_from_slice(body.as_bytes()))
    }
}

impl From<(Vec<(String, String)>, Bytes)> for H2Input {
    fn from((headers, body): (Vec<(String, String)>, Bytes)) -> Self {
        H2Input::HeadersBody(headers, body)
    }
}

impl From<&str> for H2Input {
    fn from(body: &str) -> Self {
        H2Input::Body(Bytes::copy_from_slice(body.as_bytes()))
    }
}

impl From<Bytes> for H2Input {
    fn from(raw: Bytes) -> Self {
        H2Input::Raw(raw)
    }
}

impl From<Request> for H2Input {
    fn from(request: Request) -> Self {
        let headers = request.h2_header_list();
        if request.body.is_empty() {
            H2Input::Headers(headers)
        } else {
            H2Input::HeadersBody(headers, request.body)
        }
    }
}

/// Body still to be framed for the request buffer at the same index.
#[derive(Debug)]
struct PendingBody {
    body: Bytes,
    stream_id: u32,
    end_stream: bool,
}

/// HTTP/2 protocol state of a [`DeproxyClientH2`].
pub struct Http2Session {
    base: ClientBase,
    h2: H2Connection,
    initial_settings: Settings,
    /// Stream of the next request.
    stream_id: u32,
    bodies: HashMap<usize, PendingBody>,
    active_responses: HashMap<u32, Response>,
    response_sequence: Vec<u32>,
    ended_streams: HashSet<u32>,
    reset_streams: HashSet<u32>,
    headers_received: HashSet<u32>,
    ack_settings: bool,
    ack_cnt: usize,
    ping_received: usize,
    last_stream_id: Option<u32>,
    auto_flow_control: bool,
    clear_last_response_buffer: bool,
    fatal: Option<Error>,
}

impl Http2Session {
    fn fresh_connection(settings: &Settings) -> H2Connection {
        let mut h2 = H2Connection::new();
        h2.initiate_connection(settings);
        h2
    }

    /// Appends whatever the connection queued as one unanswered buffer.
    fn flush_control(&mut self) {
        if self.h2.has_data_to_send() {
            let out = self.h2.data_to_send();
            self.base.request_buffers.push(out);
            self.base.nrreq += 1;
        }
    }

    fn add_request(&mut self, input: H2Input, end_stream: bool, priority: Option<Priority>) -> Result<()> {
        let index = self.base.request_buffers.len();
        let stream_id = self.stream_id;
        let mut expected: Option<(Vec<(String, String)>, Option<Bytes>)> = None;
        match input {
            H2Input::Raw(raw) => self.base.request_buffers.push(raw),
            H2Input::Body(body) => {
                self.base.request_buffers.push(Bytes::new());
                self.bodies.insert(
                    index,
                    PendingBody {
                        body,
                        stream_id,
                        end_stream,
                    },
                );
            }
            H2Input::Headers(headers) => {
                self.h2.send_headers(stream_id, &headers, end_stream, priority)?;
                self.base.request_buffers.push(self.h2.data_to_send());
                self.record_method(&headers);
                expected = Some((headers, None));
            }
            H2Input::HeadersBody(headers, body) => {
                self.h2.send_headers(stream_id, &headers, false, priority)?;
                self.base.request_buffers.push(self.h2.data_to_send());
                self.record_method(&headers);
                self.bodies.insert(
                    index,
                    PendingBody {
                        body: body.clone(),
                        stream_id,
                        end_stream,
                    },
                );
                expected = Some((headers, Some(body)));
            }
        }
        if end_stream {
            if let Some((headers, body)) = expected {
                let raw = AutoParser::create_request_from_headers(&headers, body.as_deref());
                self.base.prepare_expected_request(&raw);
            }
        }

        self.base.nrreq += 1;
        if end_stream {
            self.stream_id += 2;
            self.base.valid_req_num += 1;
        }
        Ok(())
    }

    fn record_method(&mut self, headers: &[(String, String)]) {
        if let Some((_, method)) = headers.iter().find(|(n, _)| n == ":method") {
            self.base.methods.push(method.clone());
        }
    }

    /// One DATA frame of the current request's body, or `None` while the
    /// flow-control window is closed.
    fn prepare_data_frame(&mut self, index: usize) -> Result<Option<Bytes>> {
        let Some(pending) = self.bodies.get_mut(&index) else {
            return Ok(None);
        };
        let window = self.h2.local_flow_control_window(pending.stream_id)?;
        let size = (self.h2.max_outbound_frame_size() as i64).min(window) as usize;
        if size == 0 && !pending.body.is_empty() {
            debug!(target: "deproxy::http", stream_id = pending.stream_id, "flow-control window is closed");
            return Ok(None);
        }
        let (chunk, end_stream) = if pending.body.len() > size {
            (pending.body.split_to(size), false)
        } else {
            (std::mem::take(&mut pending.body), pending.end_stream)
        };
        let stream_id = pending.stream_id;
        if end_stream || pending.body.is_empty() {
            self.bodies.remove(&index);
        }
        self.h2.send_data(stream_id, chunk, end_stream)?;
        Ok(Some(self.h2.data_to_send()))
    }

    fn on_data(&mut self, data: Bytes) -> Result<()> {
        if self.clear_last_response_buffer {
            self.clear_last_response_buffer = false;
            self.h2.clear_header_block_bytes();
        }
        let events = match self.h2.receive_data(&data) {
            Ok(events) => events,
            Err(e) => {
                error!(target: "deproxy::http", "{}: Can't parse frames: {}", self.base.name, e);
                return Err(e);
            }
        };
        info!(target: "deproxy::http", "{}: Receive {} h2 events", self.base.name, events.len());
        for event in &events {
            if let H2Event::StreamEnded { stream_id } = event {
                self.ended_streams.insert(*stream_id);
            }
        }
        for event in events {
            self.on_h2_event(event)?;
        }
        self.flush_control();
        Ok(())
    }

    fn on_h2_event(&mut self, event: H2Event) -> Result<()> {
        debug!(target: "deproxy::http", ?event, "h2 event");
        match event {
            H2Event::ResponseReceived { stream_id, headers } => {
                self.headers_received.insert(stream_id);
                let response = Response::from_h2_headers(headers)?;
                self.active_responses.insert(stream_id, response);
            }
            H2Event::InformationalResponseReceived { stream_id, .. } => {
                self.headers_received.insert(stream_id);
            }
            H2Event::DataReceived {
                stream_id,
                data,
                flow_controlled_length,
            } => {
                match self.active_responses.get_mut(&stream_id) {
                    Some(response) => {
                        let mut body = BytesMut::from(&response.body[..]);
                        body.extend_from_slice(&data);
                        response.body = body.freeze();
                    }
                    None => warn!(target: "deproxy::http", stream_id, "DATA without response headers"),
                }
                if self.auto_flow_control && flow_controlled_length > 0 {
                    self.return_window(stream_id, flow_controlled_length as u32)?;
                }
            }
            H2Event::TrailersReceived { stream_id, headers } => {
                self.headers_received.insert(stream_id);
                if let Some(response) = self.active_responses.get_mut(&stream_id) {
                    for (name, value) in headers.iter() {
                        response.trailer.add(name, value);
                    }
                }
            }
            H2Event::StreamEnded { stream_id } => {
                if let Some(response) = self.active_responses.remove(&stream_id) {
                    self.response_sequence.push(stream_id);
                    self.base.receive_response(response, true);
                    self.clear_last_response_buffer = true;
                }
            }
            H2Event::StreamReset { stream_id, error_code } => {
                info!(target: "deproxy::http", "{}: RST_STREAM on {} with {}", self.base.name, stream_id, error_code);
                self.reset_streams.insert(stream_id);
                self.base.error_codes.push(ErrorCode::H2(h2::Reason::from(error_code)));
            }
            H2Event::ConnectionTerminated {
                error_code,
                last_stream_id,
                ..
            } => {
                info!(target: "deproxy::http", "{}: GOAWAY with {}, last stream {}", self.base.name, error_code, last_stream_id);
                self.base.error_codes.push(ErrorCode::H2(h2::Reason::from(error_code)));
                self.last_stream_id = Some(last_stream_id);
            }
            H2Event::SettingsAcknowledged { .. } => {
                self.ack_settings = true;
                self.ack_cnt += 1;
            }
            H2Event::PingAckReceived { .. } => self.ping_received += 1,
            H2Event::RemoteSettingsChanged { .. }
            | H2Event::PingReceived { .. }
            | H2Event::WindowUpdated { .. }
            | H2Event::PushedStreamReceived { .. }
            | H2Event::PriorityUpdated { .. } => {}
        }
        Ok(())
    }

    /// WINDOW_UPDATE for the connection, and for the stream unless it is
    /// already finished.
    fn return_window(&mut self, stream_id: u32, increment: u32) -> Result<()> {
        self.h2.increment_flow_control_window(increment, None)?;
        if self.h2.is_stream_open(stream_id) && !self.ended_streams.contains(&stream_id) {
            self.h2.increment_flow_control_window(increment, Some(stream_id))?;
        }
        Ok(())
    }

    fn on_sent(&mut self, n: usize) {
        let index = self.base.cur_req_num;
        if self.base.consume(n) && !self.bodies.contains_key(&index) {
            self.base.finish_current();
        }
    }
}

impl Handler for Http2Session {
    fn handle_event(&mut self, event: Event) -> Result<Vec<Command>> {
        match event {
            Event::DataReceived(data) => self.on_data(data)?,
            Event::DataSent(n) => self.on_sent(n),
            Event::Closed => {
                self.base.handle_conn_event(Event::Closed);
                if let Some(e) = self.fatal.take() {
                    return Err(e);
                }
            }
            other => self.base.handle_conn_event(other),
        }
        Ok(Vec::new())
    }

    fn writable(&self, now: Instant) -> bool {
        self.fatal.is_none() && self.base.has_pending_data(now)
    }

    fn next_segment(&mut self, _now: Instant) -> Option<Bytes> {
        let index = self.base.cur_req_num;
        let current_empty = self.base.request_buffers.get(index).map_or(true, Bytes::is_empty);
        if current_empty {
            if !self.bodies.contains_key(&index) {
                // An empty raw buffer: nothing to write for it.
                if index < self.base.request_buffers.len() {
                    self.base.finish_current();
                }
                return None;
            }
            match self.prepare_data_frame(index) {
                Ok(Some(frame)) => self.base.request_buffers[index] = frame,
                Ok(None) => return None,
                Err(e) => {
                    error!(target: "deproxy::http", "{}: can't prepare DATA: {}", self.base.name, e);
                    self.fatal = Some(e);
                    return None;
                }
            }
        }
        self.base.segment()
    }

    fn wants_close(&self) -> bool {
        self.fatal.is_some()
    }
}

impl Session for Http2Session {
    const HTTP2: bool = true;

    fn new(base: ClientBase) -> Self {
        let initial_settings = Settings::client_defaults();
        Self {
            base,
            h2: Self::fresh_connection(&initial_settings),
            initial_settings,
            stream_id: 1,
            bodies: HashMap::new(),
            active_responses: HashMap::new(),
            response_sequence: Vec::new(),
            ended_streams: HashSet::new(),
            reset_streams: HashSet::new(),
            headers_received: HashSet::new(),
            ack_settings: false,
            ack_cnt: 0,
            ping_received: 0,
            last_stream_id: None,
            auto_flow_control: true,
            clear_last_response_buffer: false,
            fatal: None,
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
        self.h2 = Self::fresh_connection(&self.initial_settings);
        self.stream_id = 1;
        self.bodies.clear();
        self.active_responses.clear();
        self.response_sequence.clear();
        self.ended_streams.clear();
        self.reset_streams.clear();
        self.headers_received.clear();
        self.ack_settings = false;
        self.ack_cnt = 0;
        self.ping_received = 0;
        self.last_stream_id = None;
        self.auto_flow_control = true;
        self.clear_last_response_buffer = false;
        self.fatal = None;
    }
}

/// HTTP/2 emulated client.
pub type DeproxyClientH2 = Client<Http2Session>;

impl Client<Http2Session> {
    fn with_session<T>(&self, f: impl FnOnce(&mut Http2Session) -> T) -> T {
        f(&mut lock(self.session()))
    }

    /// An HTTP/2 request builder with the configured client hostname as
    /// `:authority`.
    pub fn create_request(&self, method: &str) -> RequestBuilder {
        Request::create_h2(method).authority(Some(self.manager().config().client.hostname.as_str()))
    }

    /// Queues a complete request on the next stream.
    pub fn make_request(&self, request: impl Into<H2Input>) -> Result<()> {
        self.make_request_with(request, true, None)
    }

    /// Queues a request. Without `end_stream` the stream stays open and
    /// further calls keep adding to it.
    pub fn make_request_with(&self, request: impl Into<H2Input>, end_stream: bool, priority: Option<Priority>) -> Result<()> {
        self.with_session(|s| s.add_request(request.into(), end_stream, priority))
    }

    /// Queues every request on its own stream.
    pub fn make_requests<I, R>(&self, requests: I) -> Result<()>
    where
        I: IntoIterator<Item = R>,
        R: Into<H2Input>,
    {
        for request in requests {
            self.make_request(request)?;
        }
        Ok(())
    }

    pub async fn send_request(&self, request: impl Into<H2Input>, expected_status: Option<u16>, timeout: Duration) -> Result<()> {
        let before = self.with_base(|b| b.responses.len());
        self.make_request(request)?;
        self.check_sent_request(before, expected_status, timeout).await
    }

    /// Replaces the connection with one announcing `settings`. Takes
    /// effect for the preface, so call it before the first request.
    pub fn update_initial_settings(&self, settings: Settings) {
        self.with_session(|s| {
            s.initial_settings = settings;
            s.h2 = Http2Session::fresh_connection(&settings);
        });
    }

    pub fn send_settings_frame(&self, changes: &[(SettingCode, u32)]) {
        self.with_session(|s| {
            s.ack_settings = false;
            s.h2.update_settings(changes);
            s.flush_control();
        });
    }

    pub fn send_ping(&self, payload: [u8; 8]) {
        self.with_session(|s| {
            s.h2.ping(payload);
            s.flush_control();
        });
    }

    pub fn send_rst_stream(&self, stream_id: u32, reason: h2::Reason) {
        self.with_session(|s| {
            s.h2.reset_stream(stream_id, reason.into());
            s.flush_control();
        });
    }

    pub fn send_goaway(&self, reason: h2::Reason) {
        self.with_session(|s| {
            s.h2.close_connection(reason.into());
            s.flush_control();
        });
    }

    /// Sends WINDOW_UPDATE for the connection (`None`) or a stream.
    pub fn increment_flow_control_window(&self, increment: u32, stream_id: Option<u32>) -> Result<()> {
        self.with_session(|s| {
            s.h2.increment_flow_control_window(increment, stream_id)?;
            s.flush_control();
            Ok(())
        })
    }

    pub fn auto_flow_control(&self) -> bool {
        self.with_session(|s| s.auto_flow_control)
    }

    /// Off: received DATA is never credited back, the peer stalls once the
    /// windows are spent.
    pub fn set_auto_flow_control(&self, auto_flow_control: bool) {
        self.with_session(|s| s.auto_flow_control = auto_flow_control);
    }

    /// Tracks `stream_id` as open so DATA can be framed for it without
    /// HEADERS, which then go out as raw bytes.
    pub fn init_stream_for_send(&self, stream_id: u32) {
        self.with_session(|s| s.h2.open_stream(stream_id));
    }

    /// Stream the next request will use.
    pub fn stream_id(&self) -> u32 {
        self.with_session(|s| s.stream_id)
    }

    pub fn set_stream_id(&self, stream_id: u32) {
        self.with_session(|s| s.stream_id = stream_id);
    }

    pub fn ack_settings(&self) -> bool {
        self.with_session(|s| s.ack_settings)
    }

    pub fn ack_cnt(&self) -> usize {
        self.with_session(|s| s.ack_cnt)
    }

    pub fn ping_received(&self) -> usize {
        self.with_session(|s| s.ping_received)
    }

    /// From the last GOAWAY.
    pub fn last_stream_id(&self) -> Option<u32> {
        self.with_session(|s| s.last_stream_id)
    }

    /// Stream ids in the order their responses completed.
    pub fn response_sequence(&self) -> Vec<u32> {
        self.with_session(|s| s.response_sequence.clone())
    }

    pub fn local_settings(&self) -> Settings {
        self.with_session(|s| *s.h2.local_settings())
    }

    pub fn remote_settings(&self) -> Settings {
        self.with_session(|s| *s.h2.remote_settings())
    }

    /// Whether `header` (an HPACK-encoded field) appears in the header
    /// blocks of the last response, across CONTINUATION boundaries.
    pub fn check_header_presence_in_last_response_buffer(&self, header: &[u8]) -> bool {
        if header.is_empty() {
            return true;
        }
        self.with_session(|s| s.h2.header_block_bytes().windows(header.len()).any(|w| w == header))
    }

    fn stream_wait_aborted(&self) -> bool {
        self.with_base(|b| b.conn.is_closed())
    }

    pub async fn wait_for_ack_settings(&self, timeout: Duration) -> WaitOutcome {
        wait_until(|| self.ack_settings(), timeout, self.poll(), || self.stream_wait_aborted()).await
    }

    pub async fn wait_for_reset_stream(&self, stream_id: u32, timeout: Duration) -> WaitOutcome {
        wait_until(
            || self.with_session(|s| s.reset_streams.contains(&stream_id)),
            timeout,
            self.poll(),
            || self.stream_wait_aborted(),
        )
        .await
    }

    pub async fn wait_for_headers_frame(&self, stream_id: u32, timeout: Duration) -> WaitOutcome {
        wait_until(
            || self.with_session(|s| s.headers_received.contains(&stream_id)),
            timeout,
            self.poll(),
            || self.stream_wait_aborted(),
        )
        .await
    }

    pub async fn wait_for_ping_frames(&self, count: usize, timeout: Duration) -> WaitOutcome {
        wait_until(|| self.ping_received() >= count, timeout, self.poll(), || self.stream_wait_aborted()).await
    }
}
