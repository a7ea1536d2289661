use bytes::{Bytes, BytesMut};

use super::request::compare_common;
use super::{
    date, read_encoded_body, read_sized_body, HeaderCollection, HttpMessage, Mismatch, ParseOptions, Reader,
};
use crate::{Error, Result};

/// An HTTP/1.x response, or an HTTP/2 response carrying `:status`.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub reason: Option<String>,
    pub version: String,
    /// Method of the request this answers; decides whether a body follows.
    pub method: String,
    pub headers: HeaderCollection,
    pub trailer: HeaderCollection,
    pub body: Bytes,
    pub original_length: usize,
    pub original_data: Option<Bytes>,
    pub expected_time_delta: Option<u64>,
    h2: bool,
}

impl Default for Response {
    fn default() -> Self {
        Self {
            status: 0,
            reason: None,
            version: "HTTP/0.9".to_string(),
            method: "GET".to_string(),
            headers: HeaderCollection::new(),
            trailer: HeaderCollection::new(),
            body: Bytes::new(),
            original_length: 0,
            original_data: None,
            expected_time_delta: None,
            h2: false,
        }
    }
}

impl Response {
    pub fn parse(data: &[u8], method: &str) -> Result<Self> {
        Self::parse_with(data, method, ParseOptions::default())
    }

    pub fn parse_with(data: &[u8], method: &str, opts: ParseOptions) -> Result<Self> {
        let mut reader = Reader::new(data);
        let mut response = Response {
            method: method.to_string(),
            ..Default::default()
        };
        response.parse_status_line(&mut reader)?;
        response.headers = HeaderCollection::parse(&mut reader, false)?;

        let mut body = BytesMut::new();
        if opts.body_parsing {
            response.parse_body(&mut reader, &mut body)?;
        } else {
            body.extend_from_slice(reader.read_rest());
        }
        response.body = body.freeze();
        response.original_length = reader.position();
        if opts.keep_original_data {
            response.original_data = Some(Bytes::copy_from_slice(reader.consumed()));
        }
        Ok(response)
    }

    /// An HTTP/2 response from its decoded header list.
    pub fn from_h2_headers(headers: HeaderCollection) -> Result<Self> {
        let status = headers
            .get(":status")
            .ok_or_else(|| Error::parse("HTTP/2 response without :status"))?;
        let status = parse_status(status)?;
        Ok(Self {
            status,
            version: "HTTP/2".to_string(),
            method: String::new(),
            headers,
            h2: true,
            ..Default::default()
        })
    }

    fn parse_status_line(&mut self, reader: &mut Reader<'_>) -> Result<()> {
        let line = reader.read_line();
        if line.last() != Some(&b'\n') {
            return Err(Error::incomplete("Incomplete Status line!"));
        }
        let text = String::from_utf8_lossy(line);
        let words: Vec<&str> = text.split_whitespace().collect();
        let status = match words.as_slice() {
            [version, status, reason @ ..] if !reason.is_empty() => {
                self.reason = Some(reason.join(" "));
                self.version = version.to_string();
                status
            }
            [version, status] => {
                self.version = version.to_string();
                status
            }
            _ => return Err(Error::parse("Invalid Status line!")),
        };
        self.status = parse_status(status)?;
        Ok(())
    }

    /// RFC 7230 3.3.3.
    fn parse_body(&mut self, reader: &mut Reader<'_>, body: &mut BytesMut) -> Result<()> {
        if self.method == "HEAD" {
            return Ok(());
        }
        if (100..200).contains(&self.status) || self.status == 204 || self.status == 304 {
            return Ok(());
        }
        if self.method == "CONNECT" && (200..300).contains(&self.status) {
            return Ok(());
        }
        if self.headers.contains("transfer-encoding") {
            return read_encoded_body(reader, &self.headers, false, body, &mut self.trailer);
        }
        if self.headers.contains("content-length") {
            return read_sized_body(reader, &self.headers, body);
        }
        body.extend_from_slice(reader.read_rest());
        Ok(())
    }

    pub fn create(status: u16) -> ResponseBuilder {
        ResponseBuilder::new(status)
    }

    pub fn is_h2(&self) -> bool {
        self.h2
    }

    pub fn set_expected(&mut self, time_delta: u64) {
        self.expected_time_delta = Some(time_delta);
    }

    /// Reason phrase used when serializing: the parsed one, else the
    /// standard phrase for the status.
    pub fn reason_phrase(&self) -> String {
        self.reason.clone().unwrap_or_else(|| canonical_reason(self.status).to_string())
    }

    /// Headers the proxy under test adds to every response it forwards.
    pub fn add_tempesta_headers(&mut self, proxy_version: &str) {
        let via = if self.h2 { "2.0" } else { "1.1" };
        self.headers.delete_all("via");
        self.headers.add("via", format!("{} tempesta_fw (Tempesta FW {})", via, proxy_version));
        self.headers.delete_all("server");
        self.headers.add("server", format!("Tempesta FW/{}", proxy_version));
        self.trailer.delete_all("server");
        self.trailer.delete_all("via");
        if !self.headers.contains("date") {
            self.headers.add("date", date::date_time_string());
        }
    }

    /// The same response as an HTTP/2 proxy would emit it: `:status` added,
    /// proxy headers refreshed for HTTP/2.
    pub fn convert_http1_to_http2(&self, proxy_version: &str) -> Response {
        let mut converted = Response {
            status: self.status,
            reason: None,
            version: "HTTP/2".to_string(),
            method: self.method.clone(),
            headers: self.headers.clone(),
            trailer: self.trailer.clone(),
            body: self.body.clone(),
            expected_time_delta: self.expected_time_delta,
            h2: true,
            ..Default::default()
        };
        converted.headers.add(":status", self.status.to_string());
        converted.add_tempesta_headers(proxy_version);
        converted
    }

    /// Checks `received` against this computed response.
    pub fn compare(&self, received: &Response) -> std::result::Result<(), Mismatch> {
        let field = |what: &str, r: &dyn std::fmt::Debug, e: &dyn std::fmt::Debug| {
            Mismatch::new(
                format!("Invalid response {}.\nReceived: {:?}.\nExpected: {:?}.", what, r, e),
                self,
                received,
            )
        };
        if received.status != self.status {
            return Err(field("status", &received.status, &self.status));
        }
        if received.version != self.version {
            return Err(field("version", &received.version, &self.version));
        }
        if received.reason_phrase() != self.reason_phrase() {
            return Err(field("reason", &received.reason, &self.reason));
        }
        compare_common(self, received, self.expected_time_delta.unwrap_or_default())
    }
}

fn parse_status(status: &str) -> Result<u16> {
    status
        .parse::<u16>()
        .ok()
        .filter(|code| (100..600).contains(code))
        .ok_or_else(|| Error::parse("Invalid Status code!"))
}

fn canonical_reason(status: u16) -> &'static str {
    http::StatusCode::from_u16(status)
        .ok()
        .and_then(|code| code.canonical_reason())
        .unwrap_or("Unknown")
}

impl HttpMessage for Response {
    fn headers(&self) -> &HeaderCollection {
        &self.headers
    }

    fn headers_mut(&mut self) -> &mut HeaderCollection {
        &mut self.headers
    }

    fn trailer(&self) -> &HeaderCollection {
        &self.trailer
    }

    fn trailer_mut(&mut self) -> &mut HeaderCollection {
        &mut self.trailer
    }

    fn body(&self) -> &Bytes {
        &self.body
    }

    fn set_body(&mut self, body: Bytes) {
        self.body = body;
    }

    fn first_line(&self) -> Option<String> {
        if self.h2 {
            return None;
        }
        Some(format!("{} {} {}", self.version, self.status, self.reason_phrase()))
    }
}

/// Builds a response the way a test authors one: status, headers, optional
/// `Date`/`Server`, body.
#[derive(Debug, Clone)]
pub struct ResponseBuilder {
    status: u16,
    version: String,
    headers: Vec<(String, String)>,
    date: Option<String>,
    server: Option<String>,
    body: Bytes,
    method: String,
    proxy_version: Option<String>,
    expected: Option<u64>,
    h2: bool,
}

impl ResponseBuilder {
    fn new(status: u16) -> Self {
        Self {
            status,
            version: "HTTP/1.1".to_string(),
            headers: Vec::new(),
            date: None,
            server: None,
            body: Bytes::new(),
            method: "GET".to_string(),
            proxy_version: None,
            expected: None,
            h2: false,
        }
    }

    pub fn version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn headers<N: Into<String>, V: Into<String>>(mut self, headers: impl IntoIterator<Item = (N, V)>) -> Self {
        self.headers.extend(headers.into_iter().map(|(n, v)| (n.into(), v.into())));
        self
    }

    /// Adds a `date` header for `timestamp`.
    pub fn date(mut self, timestamp: i64) -> Self {
        self.date = Some(date::http_date(timestamp));
        self
    }

    /// Adds a `date` header for the current time.
    pub fn date_now(mut self) -> Self {
        self.date = Some(date::date_time_string());
        self
    }

    pub fn server(mut self, server: &str) -> Self {
        self.server = Some(server.to_string());
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn method(mut self, method: &str) -> Self {
        self.method = method.to_string();
        self
    }

    /// Adds the headers the proxy under test would add.
    pub fn tempesta_headers(mut self, proxy_version: &str) -> Self {
        self.proxy_version = Some(proxy_version.to_string());
        self
    }

    pub fn expected(mut self, time_delta: u64) -> Self {
        self.expected = Some(time_delta);
        self
    }

    pub fn h2(mut self) -> Self {
        self.h2 = true;
        self
    }

    /// Wire bytes of the HTTP/1 response, without reparsing.
    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::new();
        out.extend_from_slice(
            format!("{} {} {}\r\n", self.version, self.status, canonical_reason(self.status)).as_bytes(),
        );
        for (name, value) in &self.headers {
            out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
        }
        if let Some(date) = &self.date {
            out.extend_from_slice(format!("date: {}\r\n", date).as_bytes());
        }
        if let Some(server) = &self.server {
            out.extend_from_slice(format!("Server: {}\r\n", server).as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out.freeze()
    }

    pub fn build(self) -> Result<Response> {
        let mut response = if self.h2 {
            let mut headers = HeaderCollection::new();
            headers.add(":status", self.status.to_string());
            for (name, value) in &self.headers {
                headers.add(name.as_str(), value.as_str());
            }
            if let Some(date) = &self.date {
                headers.add("date", date.as_str());
            }
            let mut response = Response::from_h2_headers(headers)?;
            response.body = self.body.clone();
            response.method = self.method.clone();
            response
        } else {
            Response::parse(&self.to_bytes(), &self.method)?
        };
        if let Some(delta) = self.expected {
            response.set_expected(delta);
        }
        if let Some(version) = &self.proxy_version {
            response.add_tempesta_headers(version);
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sized_response() {
        let data = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
        let response = Response::parse(data, "GET").unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.reason.as_deref(), Some("OK"));
        assert_eq!(&response.body[..], b"hello");
        assert_eq!(&response.to_bytes()[..], &data[..]);
    }

    #[test]
    fn test_multiword_reason_round_trip() {
        let data = b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n";
        let response = Response::parse(data, "GET").unwrap();
        assert_eq!(response.reason.as_deref(), Some("Not Found"));
        assert_eq!(&response.to_bytes()[..], &data[..]);
    }

    #[test]
    fn test_head_and_bodiless_statuses() {
        let data = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\n";
        let response = Response::parse(data, "HEAD").unwrap();
        assert!(response.body.is_empty());
        assert_eq!(response.original_length, data.len());

        for status in ["100 Continue", "204 No Content", "304 Not Modified"] {
            let data = format!("HTTP/1.1 {}\r\nContent-Length: 5\r\n\r\nhello", status);
            let response = Response::parse(data.as_bytes(), "GET").unwrap();
            assert!(response.body.is_empty(), "{}", status);
        }
    }

    #[test]
    fn test_read_until_end_without_framing() {
        let response = Response::parse(b"HTTP/1.0 200 OK\r\n\r\nall of it", "GET").unwrap();
        assert_eq!(&response.body[..], b"all of it");
    }

    #[test]
    fn test_non_chunked_transfer_coding_reads_rest() {
        let response = Response::parse(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: gzip\r\n\r\nzz", "GET").unwrap();
        assert_eq!(&response.body[..], b"zz");
    }

    #[test]
    fn test_build_message_keeps_chunked_trailer() {
        let data = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\nX-T: 1\r\n\r\n";
        let mut response = Response::parse(data, "GET").unwrap();
        assert_eq!(response.trailer.get("x-t"), Some("1"));
        let built = response.build_message(true);
        assert_eq!(&built[..], &data[..]);
        assert_eq!(&response.decoded_body().unwrap()[..], b"abc");

        let split = data.len() - 2;
        assert!(Response::parse(&data[..split], "GET").unwrap_err().is_incomplete());
    }

    #[test]
    fn test_invalid_status() {
        assert!(matches!(Response::parse(b"HTTP/1.1 99 Low\r\n\r\n", "GET"), Err(Error::Parse(_))));
        assert!(matches!(Response::parse(b"HTTP/1.1 abc\r\n\r\n", "GET"), Err(Error::Parse(_))));
        assert!(matches!(Response::parse(b"garbage\r\n\r\n", "GET"), Err(Error::Parse(_))));
        assert!(Response::parse(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhel", "GET")
            .unwrap_err()
            .is_incomplete());
    }

    #[test]
    fn test_create_with_date_and_server() {
        let response = Response::create(200)
            .header("Content-Length", "2")
            .date(784111777)
            .server("deproxy")
            .body("ok")
            .build()
            .unwrap();
        assert_eq!(response.headers.get("date"), Some("Sun, 06 Nov 1994 08:49:37 GMT"));
        assert_eq!(response.headers.get("server"), Some("deproxy"));
        assert_eq!(&response.body[..], b"ok");
    }

    #[test]
    fn test_tempesta_headers() {
        let mut response = Response::parse(
            b"HTTP/1.1 200 OK\r\nServer: nginx\r\nVia: 1.0 other\r\nContent-Length: 0\r\n\r\n",
            "GET",
        )
        .unwrap();
        response.add_tempesta_headers("0.8");
        assert_eq!(response.headers.get("via"), Some("1.1 tempesta_fw (Tempesta FW 0.8)"));
        assert_eq!(response.headers.get("server"), Some("Tempesta FW/0.8"));
        assert!(response.headers.contains("date"));
        assert_eq!(response.headers.find_all("via").count(), 1);
    }

    #[test]
    fn test_convert_http1_to_http2() {
        let response = Response::parse(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok", "GET").unwrap();
        let h2 = response.convert_http1_to_http2("0.8");
        assert!(h2.is_h2());
        assert_eq!(h2.headers.get(":status"), Some("200"));
        assert_eq!(h2.headers.get("via"), Some("2.0 tempesta_fw (Tempesta FW 0.8)"));
        assert_eq!(h2.first_line(), None);
        assert_eq!(h2.version, "HTTP/2");
    }

    #[test]
    fn test_compare_status_mismatch() {
        let mut expected = Response::create(200).header("Content-Length", "0").build().unwrap();
        expected.set_expected(20);
        let received = Response::create(502).header("Content-Length", "0").build().unwrap();
        let mismatch = expected.compare(&received).unwrap_err();
        assert!(mismatch.reason.contains("status"));
    }

    #[test]
    fn test_from_h2_headers_requires_status() {
        assert!(Response::from_h2_headers(HeaderCollection::new()).is_err());
        let response = Response::from_h2_headers(HeaderCollection::from_pairs([(":status", "204")])).unwrap();
        assert_eq!(response.status, 204);
    }
}
