use bytes::{Bytes, BytesMut};

use super::{
    date, read_encoded_body, read_sized_body, HeaderCollection, HttpMessage, Mismatch, ParseOptions, Reader,
};
use crate::{Error, Result};

/// Methods registered with IANA plus the non-standard ones proxies are
/// tested with.
pub const METHODS: &[&str] = &[
    "ACL",
    "BASELINE-CONTROL",
    "BIND",
    "CHECKIN",
    "CHECKOUT",
    "CONNECT",
    "COPY",
    "DELETE",
    "GET",
    "HEAD",
    "LABEL",
    "LINK",
    "LOCK",
    "MERGE",
    "MKACTIVITY",
    "MKCALENDAR",
    "MKCOL",
    "MKREDIRECTREF",
    "MKWORKSPACE",
    "MOVE",
    "OPTIONS",
    "ORDERPATCH",
    "PATCH",
    "POST",
    "PRI",
    "PROPFIND",
    "PROPPATCH",
    "PUT",
    "REBIND",
    "REPORT",
    "SEARCH",
    "TRACE",
    "UNBIND",
    "UNCHECKOUT",
    "UNLINK",
    "UNLOCK",
    "UPDATE",
    "UPDATEREDIRECTREF",
    "POT",
    "GFT",
    "PUTA",
    "GETA",
    "OPTIONA",
    "VERSION-CONTROL",
    "PURGE",
    "UNKNOWN",
];

/// An HTTP/1.x request, or an HTTP/2 request whose start line lives in
/// pseudo-headers.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub method: String,
    pub uri: String,
    pub version: String,
    pub headers: HeaderCollection,
    pub trailer: HeaderCollection,
    /// Raw body; chunked framing is kept.
    pub body: Bytes,
    /// Bytes consumed from the input to parse this message.
    pub original_length: usize,
    pub original_data: Option<Bytes>,
    /// Set on computed messages: tolerance for `Date` comparison in seconds.
    pub expected_time_delta: Option<u64>,
    h2: bool,
}

impl Default for Request {
    fn default() -> Self {
        Self {
            method: String::new(),
            uri: String::new(),
            version: "HTTP/0.9".to_string(),
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

impl Request {
    pub fn parse(data: &[u8]) -> Result<Self> {
        Self::parse_with(data, ParseOptions::default())
    }

    pub fn parse_with(data: &[u8], opts: ParseOptions) -> Result<Self> {
        let mut reader = Reader::new(data);
        let mut request = Request::default();
        request.parse_first_line(&mut reader)?;
        request.headers = HeaderCollection::parse(&mut reader, false)?;

        let mut body = BytesMut::new();
        if opts.body_parsing {
            request.parse_body(&mut reader, &mut body)?;
        } else {
            body.extend_from_slice(reader.read_rest());
        }
        request.body = body.freeze();
        request.original_length = reader.position();
        if opts.keep_original_data {
            request.original_data = Some(Bytes::copy_from_slice(reader.consumed()));
        }
        Ok(request)
    }

    /// Parses the textual form of an HTTP/2 request: pseudo-headers and
    /// headers, an empty line, then the body.
    pub fn parse_h2(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        let headers = HeaderCollection::parse(&mut reader, true)?;
        let mut request = Request::from_h2_headers(headers);
        request.body = Bytes::copy_from_slice(reader.read_rest());
        request.original_length = reader.position();
        Ok(request)
    }

    pub fn from_h2_headers(headers: HeaderCollection) -> Self {
        Self {
            method: headers.get(":method").unwrap_or_default().to_string(),
            uri: headers.get(":path").unwrap_or_default().to_string(),
            version: "HTTP/2".to_string(),
            headers,
            h2: true,
            ..Default::default()
        }
    }

    fn parse_first_line(&mut self, reader: &mut Reader<'_>) -> Result<()> {
        let mut line = reader.read_line();
        if line.last() != Some(&b'\n') {
            return Err(Error::incomplete(format!(
                "Incomplete request line!. First line - '{}'.",
                String::from_utf8_lossy(line)
            )));
        }
        // Optional empty lines before the request line.
        while line == b"\r\n" || line == b"\n" {
            line = reader.read_line();
        }
        if line.last() != Some(&b'\n') {
            return Err(Error::incomplete("Incomplete request line!"));
        }

        let text = String::from_utf8_lossy(line);
        let words: Vec<&str> = text.split_whitespace().collect();
        match words.as_slice() {
            [method, uri, version] => {
                self.method = method.to_string();
                self.uri = uri.to_string();
                self.version = version.to_string();
            }
            [method, uri] => {
                self.method = method.to_string();
                self.uri = uri.to_string();
            }
            _ => return Err(Error::parse("Invalid request line!")),
        }
        if !METHODS.contains(&self.method.as_str()) {
            return Err(Error::parse("Invalid request method!"));
        }
        Ok(())
    }

    /// RFC 7230 3.3.3: no `Transfer-Encoding` or `Content-Length` means no
    /// body.
    fn parse_body(&mut self, reader: &mut Reader<'_>, body: &mut BytesMut) -> Result<()> {
        if self.headers.contains("transfer-encoding") {
            return read_encoded_body(reader, &self.headers, true, body, &mut self.trailer);
        }
        if self.headers.contains("content-length") {
            return read_sized_body(reader, &self.headers, body);
        }
        Ok(())
    }

    pub fn create(method: &str) -> RequestBuilder {
        RequestBuilder::new(method, false)
    }

    /// HTTP/2 request: `:method`, `:path`, `:scheme`, `:authority` followed
    /// by the regular headers.
    pub fn create_h2(method: &str) -> RequestBuilder {
        RequestBuilder::new(method, true)
    }

    pub fn is_h2(&self) -> bool {
        self.h2
    }

    /// Headers as sent in an HTTP/2 HEADERS frame.
    pub fn h2_header_list(&self) -> Vec<(String, String)> {
        self.headers.items().to_vec()
    }

    pub fn set_expected(&mut self, time_delta: u64) {
        self.expected_time_delta = Some(time_delta);
    }

    /// Headers the proxy under test adds when forwarding a request.
    pub fn add_tempesta_headers(&mut self, proxy_version: &str, x_forwarded_for: &str) {
        self.headers.add("Via", format!("1.1 tempesta_fw (Tempesta FW {})", proxy_version));
        self.headers.delete_all("X-Forwarded-For");
        self.headers.add("X-Forwarded-For", x_forwarded_for);
    }

    /// Checks `received` against this computed request.
    pub fn compare(&self, received: &Request) -> std::result::Result<(), Mismatch> {
        let field = |what: &str, r: &str, e: &str| {
            Mismatch::new(
                format!("Invalid request {}.\nReceived: {}.\nExpected: {}.", what, r, e),
                self,
                received,
            )
        };
        if received.method != self.method {
            return Err(field("method", &received.method, &self.method));
        }
        if received.version != self.version {
            return Err(field("version", &received.version, &self.version));
        }
        if received.uri != self.uri {
            return Err(field("uri", &received.uri, &self.uri));
        }
        compare_common(self, received, self.expected_time_delta.unwrap_or_default())
    }
}

/// Body, headers and trailer comparison shared by requests and responses.
pub(crate) fn compare_common<M: HttpMessage>(expected: &M, received: &M, time_delta: u64) -> std::result::Result<(), Mismatch> {
    if received.body() != expected.body() {
        return Err(Mismatch::new("Invalid http body.".to_string(), expected, received));
    }
    HeaderCollection::compare(expected.headers(), received.headers(), time_delta)
        .and_then(|_| HeaderCollection::compare(expected.trailer(), received.trailer(), time_delta))
        .map_err(|reason| Mismatch::new(reason, expected, received))
}

impl HttpMessage for Request {
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
        Some(format!("{} {} {}", self.method, self.uri, self.version))
    }
}

/// Builds a request from convenient parts. HTTP/1 requests are serialized
/// and reparsed so the result is exactly what a peer would see.
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    method: String,
    uri: String,
    version: Option<String>,
    authority: Option<String>,
    headers: Vec<(String, String)>,
    date: Option<String>,
    body: Bytes,
    h2: bool,
}

impl RequestBuilder {
    fn new(method: &str, h2: bool) -> Self {
        Self {
            method: method.to_string(),
            uri: "/".to_string(),
            version: None,
            authority: Some("localhost".to_string()),
            headers: Vec::new(),
            date: None,
            body: Bytes::new(),
            h2,
        }
    }

    pub fn uri(mut self, uri: &str) -> Self {
        self.uri = uri.to_string();
        self
    }

    pub fn version(mut self, version: &str) -> Self {
        self.version = Some(version.to_string());
        self
    }

    /// `Host` (HTTP/1) or `:authority` (HTTP/2); `None` omits it.
    pub fn authority(mut self, authority: Option<&str>) -> Self {
        self.authority = authority.map(str::to_string);
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

    pub fn date(mut self, timestamp: i64) -> Self {
        self.date = Some(date::http_date(timestamp));
        self
    }

    /// Adds `Content-Length` when neither it nor `Transfer-Encoding` is
    /// given.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn build(self) -> Result<Request> {
        if self.h2 {
            return Ok(self.build_h2());
        }
        let version = self.version.as_deref().unwrap_or("HTTP/1.1");
        let mut headers = HeaderCollection::new();
        if let Some(authority) = &self.authority {
            headers.add("Host", authority.as_str());
        }
        for (name, value) in &self.headers {
            headers.add(name.as_str(), value.as_str());
        }
        if let Some(date) = &self.date {
            headers.add("date", date.as_str());
        }
        if !self.body.is_empty() && !headers.contains("content-length") && !headers.contains("transfer-encoding") {
            headers.add("Content-Length", self.body.len().to_string());
        }

        let mut text = BytesMut::new();
        text.extend_from_slice(format!("{} {} {}\r\n", self.method, self.uri, version).as_bytes());
        text.extend_from_slice(headers.to_string().as_bytes());
        text.extend_from_slice(b"\r\n");
        text.extend_from_slice(&self.body);
        Request::parse(&text)
    }

    fn build_h2(self) -> Request {
        let mut headers = HeaderCollection::new();
        headers.add(":method", self.method.as_str());
        headers.add(":path", self.uri.as_str());
        headers.add(":scheme", "https");
        if let Some(authority) = &self.authority {
            headers.add(":authority", authority.as_str());
        }
        for (name, value) in self.headers {
            headers.add(name, value);
        }
        if let Some(date) = self.date {
            headers.add("date", date);
        }
        Request {
            method: self.method,
            uri: self.uri,
            version: self.version.unwrap_or_else(|| "HTTP/2".to_string()),
            headers,
            body: self.body,
            h2: true,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_get() {
        let data = b"GET /index.html HTTP/1.1\r\nHost: example.com\r\nAccept: */*\r\n\r\n";
        let request = Request::parse(data).unwrap();
        assert_eq!(request.method, "GET");
        assert_eq!(request.uri, "/index.html");
        assert_eq!(request.version, "HTTP/1.1");
        assert_eq!(request.headers.get("host"), Some("example.com"));
        assert_eq!(request.original_length, data.len());
        assert_eq!(&request.to_bytes()[..], &data[..]);
    }

    #[test]
    fn test_round_trip_preserves_duplicates_and_case() {
        let data = b"POST /form HTTP/1.1\r\nHost: x\r\nX-Dup: 1\r\nx-dup: 2\r\nContent-Length: 3\r\n\r\nabc";
        let request = Request::parse(data).unwrap();
        assert_eq!(request.headers.find_all("X-DUP").collect::<Vec<_>>(), vec!["1", "2"]);
        assert_eq!(&request.to_bytes()[..], &data[..]);
    }

    #[test]
    fn test_pipelined_original_length() {
        let first = "GET /0 HTTP/1.1\r\nHost: x\r\n\r\n";
        let data = format!("{}GET /1 HTTP/1.1\r\nHost: x\r\n\r\n", first);
        let request = Request::parse(data.as_bytes()).unwrap();
        assert_eq!(request.uri, "/0");
        assert_eq!(request.original_length, first.len());
        let next = Request::parse(&data.as_bytes()[request.original_length..]).unwrap();
        assert_eq!(next.uri, "/1");
    }

    #[test]
    fn test_leading_empty_lines_skipped() {
        let request = Request::parse(b"\r\n\r\nGET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        assert_eq!(request.method, "GET");
    }

    #[test]
    fn test_two_word_request_line() {
        let request = Request::parse(b"GET /\r\n\r\n").unwrap();
        assert_eq!(request.version, "HTTP/0.9");
    }

    #[test]
    fn test_invalid_request_line_and_method() {
        assert!(matches!(Request::parse(b"GET\r\n\r\n"), Err(Error::Parse(_))));
        assert!(matches!(Request::parse(b"FETCH / HTTP/1.1\r\n\r\n"), Err(Error::Parse(_))));
        assert!(Request::parse(b"GET / HTTP/1.1").unwrap_err().is_incomplete());
    }

    #[test]
    fn test_chunked_request_body_and_trailer() {
        let data = b"POST / HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\nX-Trailer: t\r\n\r\n";
        let request = Request::parse(data).unwrap();
        assert_eq!(&request.body[..], b"3\r\nabc\r\n0\r\n");
        assert_eq!(request.trailer.get("x-trailer"), Some("t"));
        assert_eq!(&request.decoded_body().unwrap()[..], b"abc");
        assert_eq!(&request.to_bytes()[..], &data[..]);
    }

    #[test]
    fn test_build_message_keeps_chunked_trailer() {
        let data = b"POST /t HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\nX-Sum: 1\r\nX-Sum: 2\r\n\r\n";
        let mut request = Request::parse(data).unwrap();
        assert_eq!(request.trailer.find_all("x-sum").collect::<Vec<_>>(), vec!["1", "2"]);
        let built = request.build_message(true);
        assert_eq!(&built[..], &data[..]);
        assert!(!request.headers.contains("content-length"));
        assert_eq!(Request::parse(&built).unwrap(), request);
    }

    #[test]
    fn test_non_chunked_request_coding_rejected() {
        let data = b"POST / HTTP/1.1\r\nTransfer-Encoding: gzip\r\n\r\nabc";
        assert!(matches!(Request::parse(data), Err(Error::Parse(_))));
    }

    #[test]
    fn test_body_parsing_disabled_keeps_rest() {
        let data = b"POST / HTTP/1.1\r\nContent-Length: bad\r\n\r\nabc";
        assert!(Request::parse(data).is_err());
        let opts = ParseOptions {
            body_parsing: false,
            ..Default::default()
        };
        let request = Request::parse_with(data, opts).unwrap();
        assert_eq!(&request.body[..], b"abc");
    }

    #[test]
    fn test_keep_original_data() {
        let data = b"GET / HTTP/1.1\r\nHost: x\r\n\r\nGET /next";
        let opts = ParseOptions {
            keep_original_data: true,
            ..Default::default()
        };
        let request = Request::parse_with(data, opts).unwrap();
        assert_eq!(request.original_data.as_deref(), Some(&b"GET / HTTP/1.1\r\nHost: x\r\n\r\n"[..]));
    }

    #[test]
    fn test_create_puts_host_first() {
        let request = Request::create("POST")
            .uri("/upload")
            .header("Content-Type", "text/plain")
            .body("hello")
            .build()
            .unwrap();
        assert_eq!(request.headers.items()[0], ("Host".to_string(), "localhost".to_string()));
        assert_eq!(request.headers.get("content-length"), Some("5"));
        assert_eq!(&request.body[..], b"hello");
    }

    #[test]
    fn test_create_h2_pseudo_headers() {
        let request = Request::create_h2("GET").uri("/a").header("x-my", "1").build().unwrap();
        let names: Vec<String> = request.headers.keys();
        assert_eq!(names, vec![":method", ":path", ":scheme", ":authority", "x-my"]);
        assert!(request.is_h2());
        assert_eq!(request.first_line(), None);
    }

    #[test]
    fn test_parse_h2_text() {
        let request = Request::parse_h2(b":method: POST\r\n:path: /p\r\nx: y\r\n\r\nbody").unwrap();
        assert_eq!(request.method, "POST");
        assert_eq!(request.uri, "/p");
        assert_eq!(&request.body[..], b"body");
    }

    #[test]
    fn test_tempesta_headers_and_compare() {
        let received = Request::parse(b"GET / HTTP/1.1\r\nHost: x\r\nVia: 1.1 tempesta_fw (Tempesta FW 0.8)\r\nX-Forwarded-For: 10.0.0.1\r\n\r\n").unwrap();
        let mut expected = Request::parse(b"GET / HTTP/1.1\r\nHost: x\r\nX-Forwarded-For: 1.1.1.1\r\n\r\n").unwrap();
        expected.set_expected(0);
        expected.add_tempesta_headers("0.8", "10.0.0.1");
        assert!(expected.compare(&received).is_ok());

        expected.uri = "/other".to_string();
        let mismatch = expected.compare(&received).unwrap_err();
        assert!(mismatch.reason.contains("uri"));
    }
}
