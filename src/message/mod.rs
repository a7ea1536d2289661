//! HTTP/1.x and HTTP/2 message model.
//!
//! Messages are parsed from the front of a byte buffer and keep enough of
//! the wire form (raw chunked body, header order and case, trailer) to be
//! rebuilt byte for byte. The auto-parser mutates parsed messages in place to
//! turn what one side sent into what the other side should receive.

pub mod chunked;
pub mod codec;
pub mod date;
pub mod headers;
pub mod request;
pub mod response;

use bytes::{Bytes, BytesMut};
use sha2::{Digest, Sha256};
use std::fmt;

pub use codec::{RequestDecoder, ResponseDecoder};
pub use headers::HeaderCollection;
pub use request::{Request, RequestBuilder, METHODS};
pub use response::{Response, ResponseBuilder};

use crate::{Error, Result};

/// Bodies longer than this are summarized by their digest in mismatch
/// reports.
const MAX_DUMPED_BODY: usize = 1024;

/// Parsing switches shared by requests and responses.
#[derive(Debug, Clone, Copy)]
pub struct ParseOptions {
    /// When false the body is whatever follows the header block.
    pub body_parsing: bool,
    /// Keep a copy of the consumed bytes in `original_data`.
    pub keep_original_data: bool,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            body_parsing: true,
            keep_original_data: false,
        }
    }
}

/// Observed and computed messages differ.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{reason}\n--- expected ---\n{expected}\n--- received ---\n{received}")]
pub struct Mismatch {
    pub reason: String,
    pub expected: String,
    pub received: String,
}

impl Mismatch {
    pub fn new<M: HttpMessage>(reason: String, expected: &M, received: &M) -> Self {
        Self {
            reason,
            expected: expected.dump(),
            received: received.dump(),
        }
    }
}

/// Behavior shared by every HTTP message flavor.
pub trait HttpMessage {
    fn headers(&self) -> &HeaderCollection;
    fn headers_mut(&mut self) -> &mut HeaderCollection;
    fn trailer(&self) -> &HeaderCollection;
    fn trailer_mut(&mut self) -> &mut HeaderCollection;
    fn body(&self) -> &Bytes;
    fn set_body(&mut self, body: Bytes);

    /// Start line without CRLF, `None` for HTTP/2 messages.
    fn first_line(&self) -> Option<String>;

    /// Wire form: start line, header block, body, trailer.
    fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::new();
        if let Some(line) = self.first_line() {
            out.extend_from_slice(line.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(self.headers().to_string().as_bytes());
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(self.body());
        if !self.trailer().is_empty() {
            out.extend_from_slice(self.trailer().to_string().as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.freeze()
    }

    /// Serializes the message, first replacing `Content-Length` with the
    /// current body length when asked to.
    fn build_message(&mut self, update_content_length: bool) -> Bytes {
        if update_content_length && !self.is_chunked() {
            let len = self.body().len();
            self.headers_mut().delete_all("content-length");
            self.headers_mut().add("Content-Length", len.to_string());
        }
        self.to_bytes()
    }

    /// The last transfer coding is `chunked`.
    fn is_chunked(&self) -> bool {
        self.headers()
            .get("transfer-encoding")
            .and_then(|te| te.split(',').last())
            .map_or(false, |last| last.trim().eq_ignore_ascii_case("chunked"))
    }

    /// Payload with the chunked framing removed.
    fn decoded_body(&self) -> Result<Bytes> {
        if self.is_chunked() {
            chunked::decode_chunked(self.body()).map(|(data, _)| data)
        } else {
            Ok(self.body().clone())
        }
    }

    /// Replaces a raw chunked body with its payload.
    fn convert_chunked_body(&mut self) -> Result<()> {
        let (data, _) = chunked::decode_chunked(self.body())?;
        self.set_body(data);
        Ok(())
    }

    fn content_hash(&self) -> String {
        let digest = Sha256::digest(self.body());
        digest.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Human readable dump; long bodies are replaced by length and digest.
    fn dump(&self) -> String {
        let body = self.body();
        let mut out = String::new();
        if let Some(line) = self.first_line() {
            out.push_str(&line);
            out.push('\n');
        }
        for (name, value) in self.headers().iter() {
            out.push_str(&format!("{}: {}\n", name, value));
        }
        out.push('\n');
        if body.len() > MAX_DUMPED_BODY {
            out.push_str(&format!("<{} bytes, sha256 {}>\n", body.len(), self.content_hash()));
        } else {
            out.push_str(&String::from_utf8_lossy(body));
        }
        out.push_str(&self.trailer().to_string());
        out
    }
}

/// Forward-only cursor over a receive buffer.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Next line including its `\n`, or the rest of the buffer if no line
    /// end is present.
    pub(crate) fn read_line(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos..];
        let len = rest.iter().position(|&b| b == b'\n').map_or(rest.len(), |i| i + 1);
        self.pos += len;
        &rest[..len]
    }

    pub(crate) fn read(&mut self, n: usize) -> &'a [u8] {
        let rest = &self.buf[self.pos..];
        let len = n.min(rest.len());
        self.pos += len;
        &rest[..len]
    }

    pub(crate) fn read_rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos..];
        self.pos = self.buf.len();
        rest
    }

    pub(crate) fn peek(&self, n: usize) -> &'a [u8] {
        let rest = &self.buf[self.pos..];
        &rest[..n.min(rest.len())]
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn consumed(&self) -> &'a [u8] {
        &self.buf[..self.pos]
    }
}

/// Body framed by `Transfer-Encoding` (RFC 7230 3.3.3 #3).
pub(crate) fn read_encoded_body(
    reader: &mut Reader<'_>,
    headers: &HeaderCollection,
    is_request: bool,
    body: &mut BytesMut,
    trailer: &mut HeaderCollection,
) -> Result<()> {
    let te = headers.get("transfer-encoding").unwrap_or_default();
    let last = te.split(',').last().unwrap_or_default().trim();
    if last.eq_ignore_ascii_case("chunked") {
        return read_chunked_body(reader, body, trailer);
    }
    if is_request {
        return Err(Error::parse("Unlimited body not allowed for requests"));
    }
    body.extend_from_slice(reader.read_rest());
    Ok(())
}

/// Copies a chunked body verbatim into `body` and the trailer, if any, into
/// `trailer`.
pub(crate) fn read_chunked_body(
    reader: &mut Reader<'_>,
    body: &mut BytesMut,
    trailer: &mut HeaderCollection,
) -> Result<()> {
    loop {
        let line = reader.read_line();
        if line.is_empty() {
            return Err(Error::incomplete("Empty chunk in chunked body."));
        }
        if line.last() != Some(&b'\n') {
            return Err(Error::incomplete("Incomplete chunk size line."));
        }
        body.extend_from_slice(line);
        let size = chunked::parse_chunk_size(line)?;
        if size == 0 {
            break;
        }
        let data = reader.read(size);
        if data.len() < size {
            return Err(Error::incomplete("Incomplete chunk in chunked body"));
        }
        body.extend_from_slice(data);
        let eol = chunked::read_eol(reader)?;
        body.extend_from_slice(eol);
    }

    // The final CRLF either follows the last chunk directly or ends the
    // trailer block.
    match reader.peek(2) {
        b"" => Err(Error::incomplete("Incomplete last CRLF in chunked body.")),
        b"\r" => Err(Error::incomplete("Incomplete chunked body.")),
        b"\r\n" => {
            body.extend_from_slice(reader.read(2));
            Ok(())
        }
        [b'\n', ..] => {
            body.extend_from_slice(reader.read(1));
            Ok(())
        }
        _ => {
            *trailer = HeaderCollection::parse(reader, false)?;
            Ok(())
        }
    }
}

/// Body framed by `Content-Length` (RFC 7230 3.3.3 #5).
pub(crate) fn read_sized_body(reader: &mut Reader<'_>, headers: &HeaderCollection, body: &mut BytesMut) -> Result<()> {
    let raw = headers.get("content-length").unwrap_or_default();
    let size: usize = raw
        .trim()
        .parse()
        .map_err(|_| Error::parse(format!("Invalid Content-Length: {:?}", raw)))?;

    let data = reader.read(size);
    body.extend_from_slice(data);
    if data.len() < size {
        if headers.get("expect") == Some("100-continue") {
            return Ok(());
        }
        return Err(Error::incomplete(format!(
            "Body is {} of {} bytes",
            data.len(),
            size
        )));
    }
    Ok(())
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.to_bytes()))
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.to_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_lines() {
        let mut reader = Reader::new(b"a\r\nb\nrest");
        assert_eq!(reader.read_line(), b"a\r\n");
        assert_eq!(reader.read_line(), b"b\n");
        assert_eq!(reader.read_line(), b"rest");
        assert_eq!(reader.read_line(), b"");
        assert_eq!(reader.position(), 9);
    }

    #[test]
    fn test_chunked_body_with_trailer() {
        let data = b"4\r\nWiki\r\n5;ext=1\r\npedia\r\n0\r\nX-Checksum: abc\r\n\r\nNEXT";
        let mut reader = Reader::new(data);
        let mut body = BytesMut::new();
        let mut trailer = HeaderCollection::new();
        read_chunked_body(&mut reader, &mut body, &mut trailer).unwrap();

        assert_eq!(&body[..], b"4\r\nWiki\r\n5;ext=1\r\npedia\r\n0\r\n");
        assert_eq!(trailer.get("x-checksum"), Some("abc"));
        assert_eq!(reader.read_rest(), b"NEXT");
    }

    #[test]
    fn test_chunked_body_incomplete() {
        for data in [
            &b"4\r\nWi"[..],
            b"4\r\nWiki\r\n",
            b"4\r\nWiki\r\n0\r\n",
            b"0\r\n\r",
            b"0\r\nX-T: 1\r\n",
            b"0\r\nX-T: 1\r\n\r",
            b"0\r\nX-T",
        ] {
            let mut reader = Reader::new(data);
            let err = read_chunked_body(&mut reader, &mut BytesMut::new(), &mut HeaderCollection::new()).unwrap_err();
            assert!(err.is_incomplete(), "{:?}", data);
        }
    }

    #[test]
    fn test_chunked_body_bad_size() {
        let mut reader = Reader::new(b"zz\r\n");
        let err = read_chunked_body(&mut reader, &mut BytesMut::new(), &mut HeaderCollection::new()).unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }

    #[test]
    fn test_sized_body_expect_continue() {
        let headers = HeaderCollection::from_pairs([("Content-Length", "10"), ("Expect", "100-continue")]);
        let mut body = BytesMut::new();
        read_sized_body(&mut Reader::new(b"abc"), &headers, &mut body).unwrap();
        assert_eq!(&body[..], b"abc");

        let headers = HeaderCollection::from_pairs([("Content-Length", "10")]);
        let err = read_sized_body(&mut Reader::new(b"abc"), &headers, &mut BytesMut::new()).unwrap_err();
        assert!(err.is_incomplete());

        let headers = HeaderCollection::from_pairs([("Content-Length", "ten")]);
        let err = read_sized_body(&mut Reader::new(b"abc"), &headers, &mut BytesMut::new()).unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }
}
