//! HTTP/2 frame layout (RFC 9113 section 4 and 6).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{Error, Result};

pub const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";
pub const FRAME_HEADER_LEN: usize = 9;
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16384;
pub const MAX_FRAME_SIZE_LIMIT: u32 = (1 << 24) - 1;
pub const DEFAULT_WINDOW_SIZE: u32 = 65535;
pub const MAX_WINDOW_SIZE: i64 = (1 << 31) - 1;

pub const FRAME_DATA: u8 = 0x0;
pub const FRAME_HEADERS: u8 = 0x1;
pub const FRAME_PRIORITY: u8 = 0x2;
pub const FRAME_RST_STREAM: u8 = 0x3;
pub const FRAME_SETTINGS: u8 = 0x4;
pub const FRAME_PUSH_PROMISE: u8 = 0x5;
pub const FRAME_PING: u8 = 0x6;
pub const FRAME_GOAWAY: u8 = 0x7;
pub const FRAME_WINDOW_UPDATE: u8 = 0x8;
pub const FRAME_CONTINUATION: u8 = 0x9;

pub const FLAG_END_STREAM: u8 = 0x1;
pub const FLAG_ACK: u8 = 0x1;
pub const FLAG_END_HEADERS: u8 = 0x4;
pub const FLAG_PADDED: u8 = 0x8;
pub const FLAG_PRIORITY: u8 = 0x20;

/// SETTINGS parameter identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum SettingCode {
    HeaderTableSize = 0x1,
    EnablePush = 0x2,
    MaxConcurrentStreams = 0x3,
    InitialWindowSize = 0x4,
    MaxFrameSize = 0x5,
    MaxHeaderListSize = 0x6,
}

impl SettingCode {
    pub fn from_u16(id: u16) -> Option<Self> {
        match id {
            0x1 => Some(SettingCode::HeaderTableSize),
            0x2 => Some(SettingCode::EnablePush),
            0x3 => Some(SettingCode::MaxConcurrentStreams),
            0x4 => Some(SettingCode::InitialWindowSize),
            0x5 => Some(SettingCode::MaxFrameSize),
            0x6 => Some(SettingCode::MaxHeaderListSize),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Priority {
    pub depends_on: u32,
    pub weight: u8,
    pub exclusive: bool,
}

impl Priority {
    fn encode(&self, dst: &mut BytesMut) {
        let dep = if self.exclusive {
            self.depends_on | 0x8000_0000
        } else {
            self.depends_on & 0x7FFF_FFFF
        };
        dst.put_u32(dep);
        dst.put_u8(self.weight);
    }

    fn decode(src: &mut Bytes) -> Result<Self> {
        if src.len() < 5 {
            return Err(Error::h2("priority block too short"));
        }
        let dep = src.get_u32();
        Ok(Self {
            depends_on: dep & 0x7FFF_FFFF,
            exclusive: dep & 0x8000_0000 != 0,
            weight: src.get_u8(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data {
        stream_id: u32,
        data: Bytes,
        end_stream: bool,
        /// Payload length including padding, as charged to flow control.
        flow_controlled_length: usize,
    },
    Headers {
        stream_id: u32,
        block: Bytes,
        end_stream: bool,
        end_headers: bool,
        priority: Option<Priority>,
    },
    Priority {
        stream_id: u32,
        priority: Priority,
    },
    RstStream {
        stream_id: u32,
        error_code: u32,
    },
    Settings {
        ack: bool,
        settings: Vec<(u16, u32)>,
    },
    PushPromise {
        stream_id: u32,
        promised_stream_id: u32,
        block: Bytes,
        end_headers: bool,
    },
    Ping {
        ack: bool,
        payload: [u8; 8],
    },
    GoAway {
        last_stream_id: u32,
        error_code: u32,
        debug_data: Bytes,
    },
    WindowUpdate {
        stream_id: u32,
        increment: u32,
    },
    Continuation {
        stream_id: u32,
        block: Bytes,
        end_headers: bool,
    },
    Unknown {
        kind: u8,
        flags: u8,
        stream_id: u32,
        payload: Bytes,
    },
}

impl Frame {
    pub fn kind(&self) -> u8 {
        match self {
            Frame::Data { .. } => FRAME_DATA,
            Frame::Headers { .. } => FRAME_HEADERS,
            Frame::Priority { .. } => FRAME_PRIORITY,
            Frame::RstStream { .. } => FRAME_RST_STREAM,
            Frame::Settings { .. } => FRAME_SETTINGS,
            Frame::PushPromise { .. } => FRAME_PUSH_PROMISE,
            Frame::Ping { .. } => FRAME_PING,
            Frame::GoAway { .. } => FRAME_GOAWAY,
            Frame::WindowUpdate { .. } => FRAME_WINDOW_UPDATE,
            Frame::Continuation { .. } => FRAME_CONTINUATION,
            Frame::Unknown { kind, .. } => *kind,
        }
    }

    pub fn stream_id(&self) -> u32 {
        match self {
            Frame::Data { stream_id, .. }
            | Frame::Headers { stream_id, .. }
            | Frame::Priority { stream_id, .. }
            | Frame::RstStream { stream_id, .. }
            | Frame::PushPromise { stream_id, .. }
            | Frame::WindowUpdate { stream_id, .. }
            | Frame::Continuation { stream_id, .. }
            | Frame::Unknown { stream_id, .. } => *stream_id,
            Frame::Settings { .. } | Frame::Ping { .. } | Frame::GoAway { .. } => 0,
        }
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        let mut payload = BytesMut::new();
        let mut flags = 0u8;
        match self {
            Frame::Data { data, end_stream, .. } => {
                if *end_stream {
                    flags |= FLAG_END_STREAM;
                }
                payload.extend_from_slice(data);
            }
            Frame::Headers {
                block,
                end_stream,
                end_headers,
                priority,
                ..
            } => {
                if *end_stream {
                    flags |= FLAG_END_STREAM;
                }
                if *end_headers {
                    flags |= FLAG_END_HEADERS;
                }
                if let Some(priority) = priority {
                    flags |= FLAG_PRIORITY;
                    priority.encode(&mut payload);
                }
                payload.extend_from_slice(block);
            }
            Frame::Priority { priority, .. } => priority.encode(&mut payload),
            Frame::RstStream { error_code, .. } => payload.put_u32(*error_code),
            Frame::Settings { ack, settings } => {
                if *ack {
                    flags |= FLAG_ACK;
                }
                for (id, value) in settings {
                    payload.put_u16(*id);
                    payload.put_u32(*value);
                }
            }
            Frame::PushPromise {
                promised_stream_id,
                block,
                end_headers,
                ..
            } => {
                if *end_headers {
                    flags |= FLAG_END_HEADERS;
                }
                payload.put_u32(*promised_stream_id & 0x7FFF_FFFF);
                payload.extend_from_slice(block);
            }
            Frame::Ping { ack, payload: data } => {
                if *ack {
                    flags |= FLAG_ACK;
                }
                payload.extend_from_slice(data);
            }
            Frame::GoAway {
                last_stream_id,
                error_code,
                debug_data,
            } => {
                payload.put_u32(*last_stream_id & 0x7FFF_FFFF);
                payload.put_u32(*error_code);
                payload.extend_from_slice(debug_data);
            }
            Frame::WindowUpdate { increment, .. } => payload.put_u32(*increment & 0x7FFF_FFFF),
            Frame::Continuation { block, end_headers, .. } => {
                if *end_headers {
                    flags |= FLAG_END_HEADERS;
                }
                payload.extend_from_slice(block);
            }
            Frame::Unknown {
                flags: raw_flags,
                payload: raw,
                ..
            } => {
                flags = *raw_flags;
                payload.extend_from_slice(raw);
            }
        }
        encode_raw(dst, self.kind(), flags, self.stream_id(), &payload);
    }

    /// Parses one frame from a header and its complete payload.
    fn decode(kind: u8, flags: u8, stream_id: u32, mut payload: Bytes) -> Result<Self> {
        let flow_controlled_length = payload.len();
        if matches!(kind, FRAME_DATA | FRAME_HEADERS | FRAME_PUSH_PROMISE) && flags & FLAG_PADDED != 0 {
            payload = strip_padding(payload)?;
        }
        let frame = match kind {
            FRAME_DATA => Frame::Data {
                stream_id,
                data: payload,
                end_stream: flags & FLAG_END_STREAM != 0,
                flow_controlled_length,
            },
            FRAME_HEADERS => {
                let priority = if flags & FLAG_PRIORITY != 0 {
                    Some(Priority::decode(&mut payload)?)
                } else {
                    None
                };
                Frame::Headers {
                    stream_id,
                    block: payload,
                    end_stream: flags & FLAG_END_STREAM != 0,
                    end_headers: flags & FLAG_END_HEADERS != 0,
                    priority,
                }
            }
            FRAME_PRIORITY => Frame::Priority {
                stream_id,
                priority: Priority::decode(&mut payload)?,
            },
            FRAME_RST_STREAM => Frame::RstStream {
                stream_id,
                error_code: read_u32(&mut payload, "RST_STREAM")?,
            },
            FRAME_SETTINGS => {
                if payload.len() % 6 != 0 {
                    return Err(Error::h2(format!("SETTINGS payload of {} bytes", payload.len())));
                }
                let mut settings = Vec::with_capacity(payload.len() / 6);
                while payload.has_remaining() {
                    settings.push((payload.get_u16(), payload.get_u32()));
                }
                Frame::Settings {
                    ack: flags & FLAG_ACK != 0,
                    settings,
                }
            }
            FRAME_PUSH_PROMISE => Frame::PushPromise {
                stream_id,
                promised_stream_id: read_u32(&mut payload, "PUSH_PROMISE")? & 0x7FFF_FFFF,
                block: payload,
                end_headers: flags & FLAG_END_HEADERS != 0,
            },
            FRAME_PING => {
                if payload.len() != 8 {
                    return Err(Error::h2(format!("PING payload of {} bytes", payload.len())));
                }
                let mut data = [0u8; 8];
                payload.copy_to_slice(&mut data);
                Frame::Ping {
                    ack: flags & FLAG_ACK != 0,
                    payload: data,
                }
            }
            FRAME_GOAWAY => Frame::GoAway {
                last_stream_id: read_u32(&mut payload, "GOAWAY")? & 0x7FFF_FFFF,
                error_code: read_u32(&mut payload, "GOAWAY")?,
                debug_data: payload,
            },
            FRAME_WINDOW_UPDATE => Frame::WindowUpdate {
                stream_id,
                increment: read_u32(&mut payload, "WINDOW_UPDATE")? & 0x7FFF_FFFF,
            },
            FRAME_CONTINUATION => Frame::Continuation {
                stream_id,
                block: payload,
                end_headers: flags & FLAG_END_HEADERS != 0,
            },
            _ => Frame::Unknown {
                kind,
                flags,
                stream_id,
                payload,
            },
        };
        Ok(frame)
    }
}

/// Writes a frame header and payload as given, valid or not.
pub fn encode_raw(dst: &mut BytesMut, kind: u8, flags: u8, stream_id: u32, payload: &[u8]) {
    let len = payload.len() as u32;
    dst.reserve(FRAME_HEADER_LEN + payload.len());
    dst.put_u8((len >> 16) as u8);
    dst.put_u8((len >> 8) as u8);
    dst.put_u8(len as u8);
    dst.put_u8(kind);
    dst.put_u8(flags);
    dst.put_u32(stream_id & 0x7FFF_FFFF);
    dst.extend_from_slice(payload);
}

fn strip_padding(mut payload: Bytes) -> Result<Bytes> {
    if payload.is_empty() {
        return Err(Error::h2("padded frame without pad length"));
    }
    let pad = payload.get_u8() as usize;
    if pad > payload.len() {
        return Err(Error::h2("padding exceeds frame payload"));
    }
    payload.truncate(payload.len() - pad);
    Ok(payload)
}

fn read_u32(payload: &mut Bytes, frame: &str) -> Result<u32> {
    if payload.len() < 4 {
        return Err(Error::h2(format!("{} frame too short", frame)));
    }
    Ok(payload.get_u32())
}

/// Frames to and from a byte stream. Frames longer than `max_frame_size`
/// are rejected.
#[derive(Debug)]
pub struct FrameCodec {
    max_frame_size: u32,
}

impl FrameCodec {
    pub fn new(max_frame_size: u32) -> Self {
        Self { max_frame_size }
    }

    pub fn set_max_frame_size(&mut self, size: u32) {
        self.max_frame_size = size;
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let len = ((src[0] as usize) << 16) | ((src[1] as usize) << 8) | src[2] as usize;
        if len > self.max_frame_size as usize {
            return Err(Error::h2(format!(
                "frame of {} bytes exceeds SETTINGS_MAX_FRAME_SIZE {}",
                len, self.max_frame_size
            )));
        }
        if src.len() < FRAME_HEADER_LEN + len {
            src.reserve(FRAME_HEADER_LEN + len - src.len());
            return Ok(None);
        }
        let kind = src[3];
        let flags = src[4];
        let stream_id = u32::from_be_bytes([src[5], src[6], src[7], src[8]]) & 0x7FFF_FFFF;
        src.advance(FRAME_HEADER_LEN);
        let payload = src.split_to(len).freeze();
        Frame::decode(kind, flags, stream_id, payload).map(Some)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        frame.encode(dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(frame: Frame) -> Frame {
        let mut buf = BytesMut::new();
        frame.encode(&mut buf);
        FrameCodec::default().decode(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn test_settings_frame_layout() {
        let mut buf = BytesMut::new();
        Frame::Settings {
            ack: false,
            settings: vec![(SettingCode::InitialWindowSize as u16, 1000)],
        }
        .encode(&mut buf);
        assert_eq!(&buf[..], &[0, 0, 6, 4, 0, 0, 0, 0, 0, 0, 4, 0, 0, 3, 232]);
    }

    #[test]
    fn test_headers_with_priority() {
        let frame = Frame::Headers {
            stream_id: 3,
            block: Bytes::from_static(b"\x82"),
            end_stream: true,
            end_headers: true,
            priority: Some(Priority {
                depends_on: 1,
                weight: 200,
                exclusive: true,
            }),
        };
        assert_eq!(round_trip(frame.clone()), frame);
    }

    #[test]
    fn test_padded_data_charges_padding() {
        let mut buf = BytesMut::new();
        encode_raw(&mut buf, FRAME_DATA, FLAG_PADDED | FLAG_END_STREAM, 1, b"\x02abc\x00\x00");
        let frame = FrameCodec::default().decode(&mut buf).unwrap().unwrap();
        match frame {
            Frame::Data {
                data,
                end_stream,
                flow_controlled_length,
                ..
            } => {
                assert_eq!(&data[..], b"abc");
                assert!(end_stream);
                assert_eq!(flow_controlled_length, 6);
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_partial_frame_waits() {
        let mut full = BytesMut::new();
        Frame::Ping {
            ack: false,
            payload: *b"12345678",
        }
        .encode(&mut full);
        let mut codec = FrameCodec::default();
        let mut partial = BytesMut::from(&full[..10]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.extend_from_slice(&full[10..]);
        assert!(matches!(codec.decode(&mut partial).unwrap(), Some(Frame::Ping { ack: false, .. })));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut buf = BytesMut::new();
        encode_raw(&mut buf, FRAME_DATA, 0, 1, &vec![0u8; 20000]);
        assert!(FrameCodec::default().decode(&mut buf).is_err());
    }

    #[test]
    fn test_goaway_fields() {
        let frame = round_trip(Frame::GoAway {
            last_stream_id: 7,
            error_code: 1,
            debug_data: Bytes::from_static(b"bye"),
        });
        assert_eq!(
            frame,
            Frame::GoAway {
                last_stream_id: 7,
                error_code: 1,
                debug_data: Bytes::from_static(b"bye"),
            }
        );
    }
}
