//! Framing of pipelined HTTP/1 messages out of a receive buffer.

use bytes::{Buf, BytesMut};
use std::collections::VecDeque;
use tokio_util::codec::Decoder;

use super::{ParseOptions, Request, Response};
use crate::{Error, Result};

/// Splits requests off the front of a server-side receive buffer.
#[derive(Debug, Default)]
pub struct RequestDecoder {
    opts: ParseOptions,
}

impl RequestDecoder {
    pub fn new(opts: ParseOptions) -> Self {
        Self { opts }
    }
}

impl Decoder for RequestDecoder {
    type Item = Request;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Request>> {
        if src.is_empty() {
            return Ok(None);
        }
        match Request::parse_with(src, self.opts) {
            Ok(request) => {
                src.advance(request.original_length);
                Ok(Some(request))
            }
            Err(e) if e.is_incomplete() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Splits responses off the front of a client-side receive buffer. Each
/// response consumes the method of the request it answers.
#[derive(Debug, Default)]
pub struct ResponseDecoder {
    opts: ParseOptions,
    methods: VecDeque<String>,
}

impl ResponseDecoder {
    pub fn new(opts: ParseOptions) -> Self {
        Self {
            opts,
            methods: VecDeque::new(),
        }
    }

    /// Records the method of a request whose response is still due.
    pub fn expect_response_to(&mut self, method: &str) {
        self.methods.push_back(method.to_string());
    }

    pub fn pending(&self) -> usize {
        self.methods.len()
    }
}

impl Decoder for ResponseDecoder {
    type Item = Response;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Response>> {
        if src.is_empty() {
            return Ok(None);
        }
        let method = self.methods.front().map(String::as_str).unwrap_or("GET");
        match Response::parse_with(src, method, self.opts) {
            Ok(response) => {
                src.advance(response.original_length);
                self.methods.pop_front();
                Ok(Some(response))
            }
            Err(e) if e.is_incomplete() => Ok(None),
            Err(e) => Err(e),
        }
    }
}
