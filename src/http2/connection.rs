//! Client side of an HTTP/2 connection without I/O: frames go in through
//! [`H2Connection::receive_data`], bytes to write come out of
//! [`H2Connection::data_to_send`].

use bytes::{Bytes, BytesMut};
use fluke_hpack::encoder::encode_integer_into;
use fluke_hpack::{Decoder as HpackDecoder, Encoder as HpackEncoder};
use std::collections::{HashMap, VecDeque};
use tokio_util::codec::Decoder;
use tracing::{debug, trace};

use super::frame::{
    Frame, FrameCodec, Priority, SettingCode, DEFAULT_MAX_FRAME_SIZE, DEFAULT_WINDOW_SIZE, MAX_WINDOW_SIZE, PREFACE,
};
use crate::message::HeaderCollection;
use crate::{Error, Result};

/// Values of the six SETTINGS parameters on one side of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    pub header_table_size: u32,
    pub enable_push: u32,
    pub max_concurrent_streams: u32,
    pub initial_window_size: u32,
    pub max_frame_size: u32,
    pub max_header_list_size: u32,
}

impl Default for Settings {
    /// Protocol defaults, before any SETTINGS frame is exchanged.
    fn default() -> Self {
        Self {
            header_table_size: 4096,
            enable_push: 1,
            max_concurrent_streams: u32::MAX,
            initial_window_size: DEFAULT_WINDOW_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_header_list_size: u32::MAX,
        }
    }
}

impl Settings {
    /// Settings the test client announces when it opens a connection.
    pub fn client_defaults() -> Self {
        Self {
            max_concurrent_streams: 100,
            max_header_list_size: 65536,
            ..Self::default()
        }
    }

    pub fn get(&self, code: SettingCode) -> u32 {
        match code {
            SettingCode::HeaderTableSize => self.header_table_size,
            SettingCode::EnablePush => self.enable_push,
            SettingCode::MaxConcurrentStreams => self.max_concurrent_streams,
            SettingCode::InitialWindowSize => self.initial_window_size,
            SettingCode::MaxFrameSize => self.max_frame_size,
            SettingCode::MaxHeaderListSize => self.max_header_list_size,
        }
    }

    pub fn set(&mut self, code: SettingCode, value: u32) {
        match code {
            SettingCode::HeaderTableSize => self.header_table_size = value,
            SettingCode::EnablePush => self.enable_push = value,
            SettingCode::MaxConcurrentStreams => self.max_concurrent_streams = value,
            SettingCode::InitialWindowSize => self.initial_window_size = value,
            SettingCode::MaxFrameSize => self.max_frame_size = value,
            SettingCode::MaxHeaderListSize => self.max_header_list_size = value,
        }
    }

    pub fn as_pairs(&self) -> Vec<(u16, u32)> {
        [
            SettingCode::HeaderTableSize,
            SettingCode::EnablePush,
            SettingCode::MaxConcurrentStreams,
            SettingCode::InitialWindowSize,
            SettingCode::MaxFrameSize,
            SettingCode::MaxHeaderListSize,
        ]
        .into_iter()
        .map(|code| (code as u16, self.get(code)))
        .collect()
    }

    fn apply(&mut self, pairs: &[(u16, u32)]) {
        for (id, value) in pairs {
            if let Some(code) = SettingCode::from_u16(*id) {
                self.set(code, *value);
            }
        }
    }
}

/// Something the peer did, as seen after a call to `receive_data`.
#[derive(Debug, Clone, PartialEq)]
pub enum H2Event {
    ResponseReceived {
        stream_id: u32,
        headers: HeaderCollection,
    },
    InformationalResponseReceived {
        stream_id: u32,
        headers: HeaderCollection,
    },
    TrailersReceived {
        stream_id: u32,
        headers: HeaderCollection,
    },
    DataReceived {
        stream_id: u32,
        data: Bytes,
        flow_controlled_length: usize,
    },
    StreamEnded {
        stream_id: u32,
    },
    StreamReset {
        stream_id: u32,
        error_code: u32,
    },
    ConnectionTerminated {
        error_code: u32,
        last_stream_id: u32,
        additional_data: Bytes,
    },
    SettingsAcknowledged {
        changed: Vec<(u16, u32)>,
    },
    RemoteSettingsChanged {
        changed: Vec<(u16, u32)>,
    },
    PingReceived {
        data: [u8; 8],
    },
    PingAckReceived {
        data: [u8; 8],
    },
    WindowUpdated {
        stream_id: u32,
        delta: u32,
    },
    PushedStreamReceived {
        parent_stream_id: u32,
        pushed_stream_id: u32,
        headers: HeaderCollection,
    },
    PriorityUpdated {
        stream_id: u32,
        priority: Priority,
    },
}

#[derive(Debug)]
struct Stream {
    send_window: i64,
    recv_window: i64,
    response_started: bool,
}

#[derive(Debug)]
enum HeaderBlockKind {
    Headers { end_stream: bool },
    PushPromise { promised_stream_id: u32 },
}

#[derive(Debug)]
struct PendingHeaderBlock {
    stream_id: u32,
    kind: HeaderBlockKind,
    block: BytesMut,
}

pub struct H2Connection {
    encoder: HpackEncoder<'static>,
    decoder: HpackDecoder<'static>,
    codec: FrameCodec,
    inbound: BytesMut,
    outbound: BytesMut,
    local_settings: Settings,
    remote_settings: Settings,
    unacked_settings: VecDeque<Vec<(u16, u32)>>,
    send_window: i64,
    recv_window: i64,
    streams: HashMap<u32, Stream>,
    pending_block: Option<PendingHeaderBlock>,
    header_block_bytes: BytesMut,
    highest_stream_id: u32,
    /// Dynamic table size to announce at the start of the next header block.
    table_size_update: Option<u32>,
}

impl std::fmt::Debug for H2Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("H2Connection")
            .field("local_settings", &self.local_settings)
            .field("remote_settings", &self.remote_settings)
            .field("send_window", &self.send_window)
            .field("recv_window", &self.recv_window)
            .field("streams", &self.streams.len())
            .finish()
    }
}

impl Default for H2Connection {
    fn default() -> Self {
        Self::new()
    }
}

impl H2Connection {
    pub fn new() -> Self {
        Self {
            encoder: HpackEncoder::new(),
            decoder: HpackDecoder::new(),
            codec: FrameCodec::default(),
            inbound: BytesMut::new(),
            outbound: BytesMut::new(),
            local_settings: Settings::default(),
            remote_settings: Settings::default(),
            unacked_settings: VecDeque::new(),
            send_window: DEFAULT_WINDOW_SIZE as i64,
            recv_window: DEFAULT_WINDOW_SIZE as i64,
            streams: HashMap::new(),
            pending_block: None,
            header_block_bytes: BytesMut::new(),
            highest_stream_id: 0,
            table_size_update: None,
        }
    }

    /// Queues the connection preface followed by a SETTINGS frame carrying
    /// `settings`.
    pub fn initiate_connection(&mut self, settings: &Settings) {
        self.outbound.extend_from_slice(PREFACE);
        self.queue_settings(settings.as_pairs());
    }

    /// Queues a SETTINGS frame. Values take effect locally once the peer
    /// acknowledges them.
    pub fn update_settings(&mut self, changes: &[(SettingCode, u32)]) {
        self.queue_settings(changes.iter().map(|(code, value)| (*code as u16, *value)).collect());
    }

    fn queue_settings(&mut self, pairs: Vec<(u16, u32)>) {
        Frame::Settings {
            ack: false,
            settings: pairs.clone(),
        }
        .encode(&mut self.outbound);
        self.unacked_settings.push_back(pairs);
    }

    pub fn local_settings(&self) -> &Settings {
        &self.local_settings
    }

    pub fn remote_settings(&self) -> &Settings {
        &self.remote_settings
    }

    /// Largest stream id this side has opened.
    pub fn highest_stream_id(&self) -> u32 {
        self.highest_stream_id
    }

    /// HPACK-encodes `headers` into a HEADERS frame, split across
    /// CONTINUATION frames when the block exceeds the peer's frame size.
    pub fn send_headers(
        &mut self,
        stream_id: u32,
        headers: &[(String, String)],
        end_stream: bool,
        priority: Option<Priority>,
    ) -> Result<()> {
        if stream_id == 0 || stream_id % 2 == 0 {
            return Err(Error::h2(format!("stream {} cannot be opened by a client", stream_id)));
        }
        let mut block = Vec::new();
        if let Some(size) = self.table_size_update.take() {
            // Dynamic Table Size Update, RFC 7541 6.3.
            encode_integer_into(size as usize, 5, 0x20, &mut block)?;
        }
        self.encoder
            .encode_into(headers.iter().map(|(n, v)| (n.as_bytes(), v.as_bytes())), &mut block)?;
        let block = Bytes::from(block);
        let max = self.remote_settings.max_frame_size as usize;

        let first_len = block.len().min(max);
        Frame::Headers {
            stream_id,
            block: block.slice(..first_len),
            end_stream,
            end_headers: first_len == block.len(),
            priority,
        }
        .encode(&mut self.outbound);
        let mut offset = first_len;
        while offset < block.len() {
            let end = (offset + max).min(block.len());
            Frame::Continuation {
                stream_id,
                block: block.slice(offset..end),
                end_headers: end == block.len(),
            }
            .encode(&mut self.outbound);
            offset = end;
        }

        self.open_stream(stream_id);
        trace!(target: "deproxy::http", stream_id, block_len = block.len(), "queued HEADERS");
        Ok(())
    }

    /// Starts tracking `stream_id` as open without sending HEADERS, for
    /// streams whose frames are written as raw bytes.
    pub fn open_stream(&mut self, stream_id: u32) {
        let initial_send = self.remote_settings.initial_window_size as i64;
        let initial_recv = self.local_settings.initial_window_size as i64;
        self.streams.entry(stream_id).or_insert(Stream {
            send_window: initial_send,
            recv_window: initial_recv,
            response_started: false,
        });
        self.highest_stream_id = self.highest_stream_id.max(stream_id);
    }

    pub fn is_stream_open(&self, stream_id: u32) -> bool {
        self.streams.contains_key(&stream_id)
    }

    /// Raw HPACK blocks of every HEADERS, CONTINUATION and PUSH_PROMISE
    /// frame received since the last [`H2Connection::clear_header_block_bytes`].
    pub fn header_block_bytes(&self) -> &[u8] {
        &self.header_block_bytes
    }

    pub fn clear_header_block_bytes(&mut self) {
        self.header_block_bytes.clear();
    }

    /// Queues one DATA frame. The payload must fit the peer's frame size and
    /// both flow-control windows.
    pub fn send_data(&mut self, stream_id: u32, data: Bytes, end_stream: bool) -> Result<()> {
        let len = data.len();
        if len > self.max_outbound_frame_size() as usize {
            return Err(Error::h2(format!(
                "DATA of {} bytes exceeds the peer's frame size {}",
                len,
                self.max_outbound_frame_size()
            )));
        }
        let window = self.local_flow_control_window(stream_id)?;
        if len as i64 > window {
            return Err(Error::h2(format!(
                "DATA of {} bytes exceeds the flow-control window {} of stream {}",
                len, window, stream_id
            )));
        }
        self.send_window -= len as i64;
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            stream.send_window -= len as i64;
        }
        Frame::Data {
            stream_id,
            data,
            end_stream,
            flow_controlled_length: len,
        }
        .encode(&mut self.outbound);
        Ok(())
    }

    /// How many DATA bytes may be sent on `stream_id` right now.
    pub fn local_flow_control_window(&self, stream_id: u32) -> Result<i64> {
        let stream = self
            .streams
            .get(&stream_id)
            .ok_or_else(|| Error::h2(format!("unknown stream {}", stream_id)))?;
        Ok(self.send_window.min(stream.send_window).max(0))
    }

    pub fn max_outbound_frame_size(&self) -> u32 {
        self.remote_settings.max_frame_size
    }

    /// Queues a WINDOW_UPDATE for the connection (`None`) or one stream and
    /// widens the matching receive window.
    pub fn increment_flow_control_window(&mut self, increment: u32, stream_id: Option<u32>) -> Result<()> {
        if increment == 0 || increment as i64 > MAX_WINDOW_SIZE {
            return Err(Error::h2(format!("invalid window increment {}", increment)));
        }
        match stream_id {
            None | Some(0) => self.recv_window += increment as i64,
            Some(id) => {
                if let Some(stream) = self.streams.get_mut(&id) {
                    stream.recv_window += increment as i64;
                }
            }
        }
        Frame::WindowUpdate {
            stream_id: stream_id.unwrap_or(0),
            increment,
        }
        .encode(&mut self.outbound);
        Ok(())
    }

    pub fn ping(&mut self, payload: [u8; 8]) {
        Frame::Ping { ack: false, payload }.encode(&mut self.outbound);
    }

    pub fn reset_stream(&mut self, stream_id: u32, error_code: u32) {
        Frame::RstStream { stream_id, error_code }.encode(&mut self.outbound);
        self.streams.remove(&stream_id);
    }

    pub fn close_connection(&mut self, error_code: u32) {
        Frame::GoAway {
            last_stream_id: 0,
            error_code,
            debug_data: Bytes::new(),
        }
        .encode(&mut self.outbound);
    }

    /// Appends an arbitrary frame to the outbound bytes.
    pub fn send_frame(&mut self, frame: &Frame) {
        frame.encode(&mut self.outbound);
    }

    /// Takes everything queued for the wire so far.
    pub fn data_to_send(&mut self) -> Bytes {
        self.outbound.split().freeze()
    }

    pub fn has_data_to_send(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Feeds received bytes and returns the events of every complete frame.
    /// SETTINGS and PING are acknowledged automatically.
    pub fn receive_data(&mut self, data: &[u8]) -> Result<Vec<H2Event>> {
        self.inbound.extend_from_slice(data);
        let mut events = Vec::new();
        while let Some(frame) = self.codec.decode(&mut self.inbound)? {
            trace!(target: "deproxy::http", kind = frame.kind(), stream_id = frame.stream_id(), "frame received");
            self.handle_frame(frame, &mut events)?;
        }
        Ok(events)
    }

    fn handle_frame(&mut self, frame: Frame, events: &mut Vec<H2Event>) -> Result<()> {
        if let Some(pending) = &self.pending_block {
            let continues = matches!(&frame, Frame::Continuation { stream_id, .. } if *stream_id == pending.stream_id);
            if !continues {
                return Err(Error::h2("expected CONTINUATION frame"));
            }
        }
        match frame {
            Frame::Data {
                stream_id,
                data,
                end_stream,
                flow_controlled_length,
            } => {
                self.recv_window -= flow_controlled_length as i64;
                if let Some(stream) = self.streams.get_mut(&stream_id) {
                    stream.recv_window -= flow_controlled_length as i64;
                }
                events.push(H2Event::DataReceived {
                    stream_id,
                    data,
                    flow_controlled_length,
                });
                if end_stream {
                    events.push(H2Event::StreamEnded { stream_id });
                }
            }
            Frame::Headers {
                stream_id,
                block,
                end_stream,
                end_headers,
                ..
            } => {
                self.header_block_bytes.extend_from_slice(&block);
                let pending = PendingHeaderBlock {
                    stream_id,
                    kind: HeaderBlockKind::Headers { end_stream },
                    block: BytesMut::from(&block[..]),
                };
                self.continue_block(pending, end_headers, events)?;
            }
            Frame::Continuation {
                block, end_headers, ..
            } => {
                let Some(mut pending) = self.pending_block.take() else {
                    return Err(Error::h2("CONTINUATION without a header block"));
                };
                self.header_block_bytes.extend_from_slice(&block);
                pending.block.extend_from_slice(&block);
                self.continue_block(pending, end_headers, events)?;
            }
            Frame::PushPromise {
                stream_id,
                promised_stream_id,
                block,
                end_headers,
            } => {
                self.header_block_bytes.extend_from_slice(&block);
                let pending = PendingHeaderBlock {
                    stream_id,
                    kind: HeaderBlockKind::PushPromise { promised_stream_id },
                    block: BytesMut::from(&block[..]),
                };
                self.continue_block(pending, end_headers, events)?;
            }
            Frame::Priority { stream_id, priority } => {
                events.push(H2Event::PriorityUpdated { stream_id, priority });
            }
            Frame::RstStream { stream_id, error_code } => {
                self.streams.remove(&stream_id);
                events.push(H2Event::StreamReset { stream_id, error_code });
            }
            Frame::Settings { ack: true, .. } => {
                let changed = self.unacked_settings.pop_front().unwrap_or_default();
                self.local_settings.apply(&changed);
                self.codec.set_max_frame_size(self.local_settings.max_frame_size);
                self.decoder
                    .set_max_allowed_table_size(self.local_settings.header_table_size as usize);
                debug!(target: "deproxy::http", ?changed, "SETTINGS acknowledged");
                events.push(H2Event::SettingsAcknowledged { changed });
            }
            Frame::Settings { ack: false, settings } => {
                let old_window = self.remote_settings.initial_window_size as i64;
                let old_table_size = self.remote_settings.header_table_size;
                self.remote_settings.apply(&settings);
                let table_size = self.remote_settings.header_table_size;
                if table_size != old_table_size {
                    self.encoder.set_max_table_size(table_size as usize);
                    self.table_size_update = Some(table_size);
                }
                let delta = self.remote_settings.initial_window_size as i64 - old_window;
                if delta != 0 {
                    for stream in self.streams.values_mut() {
                        stream.send_window += delta;
                    }
                }
                Frame::Settings {
                    ack: true,
                    settings: Vec::new(),
                }
                .encode(&mut self.outbound);
                events.push(H2Event::RemoteSettingsChanged { changed: settings });
            }
            Frame::Ping { ack: false, payload } => {
                Frame::Ping { ack: true, payload }.encode(&mut self.outbound);
                events.push(H2Event::PingReceived { data: payload });
            }
            Frame::Ping { ack: true, payload } => {
                events.push(H2Event::PingAckReceived { data: payload });
            }
            Frame::GoAway {
                last_stream_id,
                error_code,
                debug_data,
            } => {
                events.push(H2Event::ConnectionTerminated {
                    error_code,
                    last_stream_id,
                    additional_data: debug_data,
                });
            }
            Frame::WindowUpdate { stream_id, increment } => {
                if stream_id == 0 {
                    self.send_window += increment as i64;
                } else if let Some(stream) = self.streams.get_mut(&stream_id) {
                    stream.send_window += increment as i64;
                }
                events.push(H2Event::WindowUpdated {
                    stream_id,
                    delta: increment,
                });
            }
            Frame::Unknown { kind, .. } => {
                debug!(target: "deproxy::http", kind, "ignoring frame of unknown type");
            }
        }
        Ok(())
    }

    fn continue_block(&mut self, pending: PendingHeaderBlock, end_headers: bool, events: &mut Vec<H2Event>) -> Result<()> {
        if !end_headers {
            self.pending_block = Some(pending);
            return Ok(());
        }
        let decoded = self
            .decoder
            .decode(&pending.block)
            .map_err(|e| Error::h2(format!("HPACK decoding failed: {:?}", e)))?;
        let headers = HeaderCollection::from_pairs(
            decoded
                .into_iter()
                .map(|(n, v)| (String::from_utf8_lossy(&n).into_owned(), String::from_utf8_lossy(&v).into_owned())),
        );
        let stream_id = pending.stream_id;
        match pending.kind {
            HeaderBlockKind::PushPromise { promised_stream_id } => {
                events.push(H2Event::PushedStreamReceived {
                    parent_stream_id: stream_id,
                    pushed_stream_id: promised_stream_id,
                    headers,
                });
            }
            HeaderBlockKind::Headers { end_stream } => {
                let started = self.streams.get(&stream_id).map(|s| s.response_started).unwrap_or(false);
                let informational = headers
                    .get(":status")
                    .and_then(|s| s.parse::<u16>().ok())
                    .map(|s| (100..200).contains(&s))
                    .unwrap_or(false);
                if started {
                    events.push(H2Event::TrailersReceived { stream_id, headers });
                } else if informational {
                    events.push(H2Event::InformationalResponseReceived { stream_id, headers });
                } else {
                    if let Some(stream) = self.streams.get_mut(&stream_id) {
                        stream.response_started = true;
                    }
                    events.push(H2Event::ResponseReceived { stream_id, headers });
                }
                if end_stream {
                    events.push(H2Event::StreamEnded { stream_id });
                }
            }
        }
        Ok(())
    }
}
