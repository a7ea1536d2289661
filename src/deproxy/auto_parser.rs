//! Expectation engine: computes what a compliant proxy should forward and
//! checks what the emulated peers actually observe.
//!
//! The client side prepares an expected request from every request it
//! sends; the server side checks each request it receives against it. The
//! server prepares an expected response from every response it sends; the
//! client checks each response it receives. Mismatches are collected and
//! reported by [`AutoParser::check_exceptions`].

use bytes::Bytes;
use regex::Regex;
use tracing::{debug, info};
use url::Host;

use crate::config::Config;
use crate::message::{HeaderCollection, HttpMessage, Mismatch, ParseOptions, Request, Response};
use crate::{Error, Result};

const HOP_BY_HOP: &[&str] = &["connection", "keep-alive", "proxy-connection", "upgrade"];

/// What the expectation engine needs to know about the proxy under test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyCapabilities {
    pub cache_enabled: bool,
    /// Embedded in `Via` and `Server`.
    pub version: String,
}

impl Default for ProxyCapabilities {
    fn default() -> Self {
        Self {
            cache_enabled: false,
            version: "0.8".to_string(),
        }
    }
}

impl ProxyCapabilities {
    /// From the `proxy` config section. Raw proxy configuration text, when
    /// present, overrides `cache_enabled`.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut caps = Self {
            cache_enabled: config.proxy.cache_enabled,
            version: config.proxy.version.clone(),
        };
        if let Some(text) = &config.proxy.config_text {
            caps.cache_enabled = Self::cache_enabled_in(text)?;
        }
        Ok(caps)
    }

    /// Scans proxy configuration text for a `cache 1` or `cache 2`
    /// directive.
    pub fn from_config_text(text: &str, version: &str) -> Result<Self> {
        Ok(Self {
            cache_enabled: Self::cache_enabled_in(text)?,
            version: version.to_string(),
        })
    }

    fn cache_enabled_in(text: &str) -> Result<bool> {
        let re = Regex::new(r"(?m)^\s*cache\s+[12]\s*;")?;
        Ok(re.is_match(text))
    }
}

pub struct AutoParser {
    enabled_by_default: bool,
    parsing: bool,
    capabilities: ProxyCapabilities,
    expected_time_delta: u64,
    expected_request: Option<Request>,
    expected_response: Option<Response>,
    client_request: Option<Request>,
    mismatches: Vec<Mismatch>,
}

impl std::fmt::Debug for AutoParser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoParser")
            .field("parsing", &self.parsing)
            .field("capabilities", &self.capabilities)
            .field("mismatches", &self.mismatches.len())
            .finish()
    }
}

impl AutoParser {
    pub fn new(config: &Config) -> Self {
        let capabilities = ProxyCapabilities::from_config(config).unwrap_or_else(|e| {
            info!(target: "deproxy::http", "Ignoring proxy config text: {}", e);
            ProxyCapabilities {
                cache_enabled: config.proxy.cache_enabled,
                version: config.proxy.version.clone(),
            }
        });
        Self {
            enabled_by_default: config.deproxy.auto_parser,
            parsing: config.deproxy.auto_parser,
            capabilities,
            expected_time_delta: config.deproxy.expected_time_delta,
            expected_request: None,
            expected_response: None,
            client_request: None,
            mismatches: Vec::new(),
        }
    }

    pub fn parsing(&self) -> bool {
        self.parsing
    }

    pub fn set_parsing(&mut self, parsing: bool) {
        self.parsing = parsing;
    }

    pub fn capabilities(&self) -> &ProxyCapabilities {
        &self.capabilities
    }

    pub fn set_capabilities(&mut self, capabilities: ProxyCapabilities) {
        self.capabilities = capabilities;
    }

    pub fn expected_request(&self) -> Option<&Request> {
        self.expected_request.as_ref()
    }

    pub fn expected_response(&self) -> Option<&Response> {
        self.expected_response.as_ref()
    }

    pub fn mismatches(&self) -> &[Mismatch] {
        &self.mismatches
    }

    /// Forgets every expectation and mismatch and restores the configured
    /// `parsing` flag.
    pub fn cleanup(&mut self) {
        self.parsing = self.enabled_by_default;
        self.expected_request = None;
        self.expected_response = None;
        self.client_request = None;
        self.mismatches.clear();
    }

    /// Fails with every mismatch collected so far.
    pub fn check_exceptions(&self) -> Result<()> {
        match self.mismatches.as_slice() {
            [] => Ok(()),
            [only] => Err(Error::Mismatch(only.clone())),
            all => {
                let reasons: Vec<String> = all.iter().map(|m| m.to_string()).collect();
                Err(Error::assertion(format!(
                    "{} auto-parser mismatches:\n{}",
                    all.len(),
                    reasons.join("\n")
                )))
            }
        }
    }

    fn record(&mut self, mismatch: Mismatch) {
        info!(target: "deproxy::http", "AutoParser: {}", mismatch.reason);
        debug!(target: "deproxy::http", "AutoParser: Expected:\n{}", mismatch.expected);
        debug!(target: "deproxy::http", "AutoParser: Received:\n{}", mismatch.received);
        self.mismatches.push(mismatch);
    }

    /// Turns a request a client is about to send into the request the
    /// origin should receive.
    pub fn prepare_expected_request(&mut self, raw: &[u8], x_forwarded_for: &str) {
        debug!(target: "deproxy::http", "AutoParser: Prepare expected request");
        let parsed = Request::parse(raw).or_else(|_| {
            debug!(target: "deproxy::http", "AutoParser: Request: invalid Content-Length header. Body parsing is disabled");
            Request::parse_with(
                raw,
                ParseOptions {
                    body_parsing: false,
                    ..Default::default()
                },
            )
        });
        let mut request = match parsed {
            Ok(request) => request,
            Err(e) => {
                info!(target: "deproxy::http", "AutoParser: request is not checked: {}", e);
                self.expected_request = None;
                self.client_request = None;
                return;
            }
        };

        self.client_request = Some(request.clone());
        request.set_expected(self.expected_time_delta);
        rewrite_absolute_uri(&mut request);
        request.add_tempesta_headers(&self.capabilities.version, x_forwarded_for);
        strip_hop_by_hop(&mut request);
        self.translate_method(&mut request);
        self.expected_request = Some(request);
    }

    fn translate_method(&self, request: &mut Request) {
        if request.method == "PURGE" {
            debug!(target: "deproxy::http", "AutoParser: Client request method is 'PURGE'. Expected request method is changed to 'GET'.");
            request.method = "GET".to_string();
        } else if request.method == "HEAD" && self.capabilities.cache_enabled {
            debug!(target: "deproxy::http", "AutoParser: Client request method is 'HEAD' and cache is on. Expected request method is changed to 'GET'.");
            request.method = "GET".to_string();
        }
    }

    pub fn check_expected_request(&mut self, received: &Request) {
        let Some(expected) = &self.expected_request else {
            debug!(target: "deproxy::http", "AutoParser: Request is not checked.");
            return;
        };
        debug!(target: "deproxy::http", "AutoParser: Check expected request.");
        if let Err(mismatch) = expected.compare(received) {
            self.record(mismatch);
        }
    }

    /// Turns a response the server is about to send into the response the
    /// proxy should forward, before any client-specific adjustment.
    pub fn prepare_expected_response(&mut self, raw: &[u8]) {
        debug!(target: "deproxy::http", "AutoParser: Prepare expected response");
        let parsed = Response::parse(raw, "GET").or_else(|_| {
            debug!(target: "deproxy::http", "AutoParser: Response: invalid Content-Length header. Body parsing is disabled");
            Response::parse_with(
                raw,
                "GET",
                ParseOptions {
                    body_parsing: false,
                    ..Default::default()
                },
            )
        });
        match parsed {
            Ok(mut response) => {
                response.set_expected(self.expected_time_delta);
                response.add_tempesta_headers(&self.capabilities.version);
                strip_hop_by_hop(&mut response);
                self.expected_response = Some(response);
            }
            Err(e) => {
                info!(target: "deproxy::http", "AutoParser: response is not checked: {}", e);
                self.expected_response = None;
            }
        }
    }

    /// Skipped for non-2xx statuses, `PURGE` requests and when no client
    /// request is known.
    pub fn check_expected_response(&mut self, received: &Response, is_h2: bool) {
        let checkable = (200..300).contains(&received.status)
            && self.expected_response.is_some()
            && self.client_request.as_ref().map_or(false, |r| r.method != "PURGE");
        if !checkable {
            debug!(target: "deproxy::http", "AutoParser: Response is not checked.");
            return;
        }
        let Some(expected) = self.expected_for(received, is_h2) else {
            return;
        };
        debug!(target: "deproxy::http", "AutoParser: Check expected response");
        if let Err(mismatch) = expected.compare(received) {
            self.record(mismatch);
        }
    }

    /// The stored expectation adjusted to the client's protocol and to
    /// whether the response came from the cache.
    fn expected_for(&self, received: &Response, is_h2: bool) -> Option<Response> {
        let stored = self.expected_response.as_ref()?;
        let mut expected = if is_h2 {
            stored.convert_http1_to_http2(&self.capabilities.version)
        } else {
            stored.clone()
        };

        if self.client_request.as_ref().map_or(false, |r| r.method == "HEAD") {
            debug!(target: "deproxy::http", "AutoParser: Request method is 'HEAD'. Remove body from expected response");
            expected.body = Bytes::new();
            expected.trailer.clear();
        }
        strip_hop_by_hop(&mut expected);

        let from_cache = received.headers.contains("age");
        if from_cache {
            expected.headers.delete_all("set-cookie");
        }
        if is_h2 || from_cache {
            dechunk_expected(&mut expected);
        }
        if !is_h2 || from_cache {
            add_content_length(&mut expected);
        }
        Some(expected)
    }

    /// HTTP/1 request equivalent to an HTTP/2 header list and body.
    pub fn create_request_from_headers(headers: &[(String, String)], body: Option<&[u8]>) -> Bytes {
        let mut method = String::new();
        let mut uri = String::new();
        let mut collected = HeaderCollection::new();
        let mut cookies = Vec::new();
        for (name, value) in headers {
            match name.as_str() {
                ":authority" => collected.add("host", value.as_str()),
                ":path" => uri = value.clone(),
                ":method" => method = value.clone(),
                ":scheme" => {}
                "cookie" => cookies.push(value.clone()),
                _ => collected.add(name.as_str(), value.as_str()),
            }
        }

        let hosts: Vec<String> = collected.find_all("host").map(str::to_string).collect();
        if hosts.len() > 1 {
            debug!(target: "deproxy::http", "AutoParser: H2Request: :authority and host headers are present.");
            collected.delete_all("host");
            collected.add("host", hosts[0].as_str());
        }
        if !cookies.is_empty() {
            collected.add("cookie", cookies.join("; "));
        }
        let body = body.unwrap_or_default();
        if !body.is_empty() {
            collected.delete_all("content-length");
            collected.add("content-length", body.len().to_string());
        }

        let mut out = format!("{} {} HTTP/1.1\r\n{}\r\n", method, uri, collected).into_bytes();
        out.extend_from_slice(body);
        Bytes::from(out)
    }
}

/// A compliant HTTP/1.1 proxy moves the authority of an absolute URI into
/// `Host` and forwards the origin form. The path is kept byte for byte.
fn rewrite_absolute_uri(request: &mut Request) {
    if request.version != "HTTP/1.1" {
        return;
    }
    let Some((authority, origin_form)) = split_absolute_uri(&request.uri) else {
        return;
    };
    request.uri = origin_form;
    request.headers.set("host", authority);
}

/// `http://user@host:port/path?q` -> (`host:port`, `/path?q`).
fn split_absolute_uri(uri: &str) -> Option<(String, String)> {
    let (scheme, rest) = uri.split_once("://")?;
    if !(scheme.eq_ignore_ascii_case("http") || scheme.eq_ignore_ascii_case("https")) {
        return None;
    }
    let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let (authority, tail) = rest.split_at(end);
    let authority = authority.rsplit_once('@').map_or(authority, |(_, host)| host);
    if !valid_authority(authority) {
        return None;
    }
    let origin_form = if tail.starts_with('/') {
        tail.to_string()
    } else {
        format!("/{}", tail)
    };
    Some((authority.to_string(), origin_form))
}

fn valid_authority(authority: &str) -> bool {
    let (host, port) = match authority.rfind(':') {
        Some(i) if !authority[i..].contains(']') => (&authority[..i], Some(&authority[i + 1..])),
        _ => (authority, None),
    };
    let port_ok = port.map_or(true, |p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()));
    port_ok && !host.is_empty() && Host::parse(host).is_ok()
}

/// Removes the hop-by-hop headers and every header a `Connection` value
/// names, from headers and trailer.
fn strip_hop_by_hop<M: HttpMessage>(message: &mut M) {
    let listed: Vec<String> = message
        .headers()
        .find_all("connection")
        .chain(message.trailer().find_all("connection"))
        .flat_map(|value| value.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty() && name != "close" && name != "keep-alive")
        .collect();
    for name in HOP_BY_HOP.iter().copied().chain(listed.iter().map(String::as_str)) {
        message.headers_mut().delete_all(name);
        message.trailer_mut().delete_all(name);
    }
}

/// The proxy re-frames chunked bodies for HTTP/2 and for cached entries:
/// codings other than `chunked` become `Content-Encoding`, the payload gets
/// a `Content-Length` and trailers join the headers.
fn dechunk_expected(expected: &mut Response) {
    let Some(te) = expected.headers.get("transfer-encoding").map(str::to_string) else {
        return;
    };
    let codings: Vec<&str> = te.split(',').map(str::trim).collect();
    let content_encoding = codings[..codings.len().saturating_sub(1)].join(",");
    expected.headers.delete_all("transfer-encoding");
    if !content_encoding.is_empty() {
        expected.headers.add("content-encoding", content_encoding);
    }
    if let Ok((payload, _)) = crate::message::chunked::decode_chunked(&expected.body) {
        expected.body = payload;
    }
    expected.headers.add("content-length", expected.body.len().to_string());
    let trailer = std::mem::take(&mut expected.trailer);
    for (name, value) in trailer.iter() {
        expected.headers.add(name, value);
    }
}

fn add_content_length(expected: &mut Response) {
    if !expected.headers.contains("content-length")
        && !expected.headers.contains("transfer-encoding")
        && expected.status != 204
    {
        expected.headers.add("content-length", expected.body.len().to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser(cache: bool) -> AutoParser {
        let mut config = Config::default();
        config.proxy.cache_enabled = cache;
        AutoParser::new(&config)
    }

    fn forwarded(raw: &[u8]) -> Request {
        Request::parse(raw).unwrap()
    }

    #[test]
    fn test_config_text_detects_cache() {
        let caps = ProxyCapabilities::from_config_text("listen 80;\ncache 2;\n", "0.8").unwrap();
        assert!(caps.cache_enabled);
        let caps = ProxyCapabilities::from_config_text("listen 80;\ncache 0;\n", "0.8").unwrap();
        assert!(!caps.cache_enabled);
    }

    #[test]
    fn test_expected_request_gets_proxy_headers() {
        let mut ap = parser(false);
        ap.prepare_expected_request(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: keep-alive\r\n\r\n", "127.0.0.1");
        let expected = ap.expected_request().unwrap();
        assert_eq!(expected.headers.get("x-forwarded-for"), Some("127.0.0.1"));
        assert_eq!(expected.headers.get("via"), Some("1.1 tempesta_fw (Tempesta FW 0.8)"));
        assert!(!expected.headers.contains("connection"));

        let received = forwarded(
            b"GET / HTTP/1.1\r\nHost: localhost\r\nvia: 1.1 tempesta_fw (Tempesta FW 0.8)\r\nX-Forwarded-For: 127.0.0.1\r\n\r\n",
        );
        ap.check_expected_request(&received);
        assert!(ap.check_exceptions().is_ok());
    }

    #[test]
    fn test_connection_listed_headers_stripped() {
        let mut ap = parser(false);
        ap.prepare_expected_request(
            b"GET / HTTP/1.1\r\nHost: x\r\nConnection: X-Private, Upgrade\r\nX-Private: 1\r\nUpgrade: h2c\r\nProxy-Connection: a\r\n\r\n",
            "10.0.0.1",
        );
        let expected = ap.expected_request().unwrap();
        for name in ["connection", "x-private", "upgrade", "proxy-connection"] {
            assert!(!expected.headers.contains(name), "{}", name);
        }
    }

    #[test]
    fn test_absolute_uri_moves_to_host() {
        let mut ap = parser(false);
        ap.prepare_expected_request(b"GET http://user@example.com:8080/a?b=1 HTTP/1.1\r\nHost: other\r\n\r\n", "127.0.0.1");
        let expected = ap.expected_request().unwrap();
        assert_eq!(expected.uri, "/a?b=1");
        assert_eq!(expected.headers.get("host"), Some("example.com:8080"));
    }

    #[test]
    fn test_absolute_uri_path_kept_verbatim() {
        let mut ap = parser(false);
        ap.prepare_expected_request(b"GET HTTP://example.com:80/a/../b/%7e?x=<y> HTTP/1.1\r\nHost: o\r\n\r\n", "127.0.0.1");
        let expected = ap.expected_request().unwrap();
        assert_eq!(expected.uri, "/a/../b/%7e?x=<y>");
        assert_eq!(expected.headers.get("host"), Some("example.com:80"));

        ap.prepare_expected_request(b"GET http://[::1]:8080?q HTTP/1.1\r\nHost: o\r\n\r\n", "127.0.0.1");
        let expected = ap.expected_request().unwrap();
        assert_eq!(expected.uri, "/?q");
        assert_eq!(expected.headers.get("host"), Some("[::1]:8080"));

        ap.prepare_expected_request(b"GET http://example.com:x/p HTTP/1.1\r\nHost: o\r\n\r\n", "127.0.0.1");
        let expected = ap.expected_request().unwrap();
        assert_eq!(expected.uri, "http://example.com:x/p");
        assert_eq!(expected.headers.get("host"), Some("o"));
    }

    #[test]
    fn test_method_translation() {
        let mut ap = parser(false);
        ap.prepare_expected_request(b"PURGE / HTTP/1.1\r\nHost: x\r\n\r\n", "127.0.0.1");
        assert_eq!(ap.expected_request().unwrap().method, "GET");
        ap.prepare_expected_request(b"HEAD / HTTP/1.1\r\nHost: x\r\n\r\n", "127.0.0.1");
        assert_eq!(ap.expected_request().unwrap().method, "HEAD");

        let mut ap = parser(true);
        ap.prepare_expected_request(b"HEAD / HTTP/1.1\r\nHost: x\r\n\r\n", "127.0.0.1");
        assert_eq!(ap.expected_request().unwrap().method, "GET");
    }

    #[test]
    fn test_bad_content_length_falls_back() {
        let mut ap = parser(false);
        ap.prepare_expected_request(b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: abc\r\n\r\n", "127.0.0.1");
        assert!(ap.expected_request().is_some());

        ap.prepare_expected_request(b"NOT A REQUEST\r\n\r\n", "127.0.0.1");
        assert!(ap.expected_request().is_none());
    }

    #[test]
    fn test_request_mismatch_is_deferred() {
        let mut ap = parser(false);
        ap.prepare_expected_request(b"GET /a HTTP/1.1\r\nHost: x\r\n\r\n", "127.0.0.1");
        ap.check_expected_request(&forwarded(b"GET /b HTTP/1.1\r\nHost: x\r\n\r\n"));
        ap.check_expected_request(&forwarded(b"GET /c HTTP/1.1\r\nHost: x\r\n\r\n"));
        assert_eq!(ap.mismatches().len(), 2);
        assert!(matches!(ap.check_exceptions(), Err(Error::Assertion(_))));

        ap.cleanup();
        assert!(ap.check_exceptions().is_ok());
        assert!(ap.expected_request().is_none());
    }

    fn expected_for(ap: &mut AutoParser, client: &[u8], origin: &[u8], received: &Response, h2: bool) -> Response {
        ap.prepare_expected_request(client, "127.0.0.1");
        ap.prepare_expected_response(origin);
        ap.expected_for(received, h2).unwrap()
    }

    #[test]
    fn test_cached_response_loses_set_cookie() {
        let mut ap = parser(true);
        let origin = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nSet-Cookie: a=b\r\n\r\nok";
        let cached = Response::parse(b"HTTP/1.1 200 OK\r\nAge: 3\r\nContent-Length: 2\r\n\r\nok", "GET").unwrap();
        let fresh = Response::parse(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok", "GET").unwrap();

        let expected = expected_for(&mut ap, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n", origin, &cached, false);
        assert!(!expected.headers.contains("set-cookie"));
        let expected = expected_for(&mut ap, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n", origin, &fresh, false);
        assert_eq!(expected.headers.get("set-cookie"), Some("a=b"));
    }

    #[test]
    fn test_head_response_has_no_body() {
        let mut ap = parser(false);
        let origin = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\nX-T: 1\r\n\r\n";
        let received = Response::parse(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n", "HEAD").unwrap();
        let expected = expected_for(&mut ap, b"HEAD / HTTP/1.1\r\nHost: x\r\n\r\n", origin, &received, false);
        assert!(expected.body.is_empty());
        assert!(expected.trailer.is_empty());
    }

    #[test]
    fn test_h2_expectation_is_dechunked() {
        let mut ap = parser(false);
        let origin = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: gzip, chunked\r\n\r\n3\r\nabc\r\n0\r\nX-T: 1\r\n\r\n";
        let received = Response::from_h2_headers(HeaderCollection::from_pairs([(":status", "200")])).unwrap();
        let expected = expected_for(&mut ap, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n", origin, &received, true);
        assert_eq!(expected.headers.get(":status"), Some("200"));
        assert_eq!(expected.headers.get("content-encoding"), Some("gzip"));
        assert_eq!(expected.headers.get("content-length"), Some("3"));
        assert_eq!(expected.headers.get("x-t"), Some("1"));
        assert!(!expected.headers.contains("transfer-encoding"));
        assert_eq!(&expected.body[..], b"abc");
        assert!(expected.headers.get("via").unwrap().starts_with("2.0"));
    }

    #[test]
    fn test_h1_expectation_gets_content_length() {
        let mut ap = parser(false);
        let origin = b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\nbody";
        let received = Response::parse(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nbody", "GET").unwrap();
        let expected = expected_for(&mut ap, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n", origin, &received, false);
        assert_eq!(expected.headers.get("content-length"), Some("4"));
        assert!(!expected.headers.contains("connection"));
    }

    #[test]
    fn test_non_2xx_and_purge_are_not_checked() {
        let mut ap = parser(false);
        ap.prepare_expected_request(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n", "127.0.0.1");
        ap.prepare_expected_response(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok");
        let not_found = Response::parse(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n", "GET").unwrap();
        ap.check_expected_response(&not_found, false);

        ap.prepare_expected_request(b"PURGE / HTTP/1.1\r\nHost: x\r\n\r\n", "127.0.0.1");
        let other = Response::parse(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n", "GET").unwrap();
        ap.check_expected_response(&other, false);
        assert!(ap.mismatches().is_empty());
    }

    #[test]
    fn test_request_from_h2_headers() {
        let headers: Vec<(String, String)> = [
            (":method", "POST"),
            (":path", "/upload"),
            (":scheme", "https"),
            (":authority", "example.com"),
            ("host", "ignored.com"),
            ("cookie", "a=1"),
            ("cookie", "b=2"),
        ]
        .iter()
        .map(|(n, v)| (n.to_string(), v.to_string()))
        .collect();
        let raw = AutoParser::create_request_from_headers(&headers, Some(b"data"));
        let request = Request::parse(&raw).unwrap();
        assert_eq!(request.method, "POST");
        assert_eq!(request.uri, "/upload");
        assert_eq!(request.version, "HTTP/1.1");
        assert_eq!(request.headers.find_all("host").collect::<Vec<_>>(), vec!["example.com"]);
        assert_eq!(request.headers.get("cookie"), Some("a=1; b=2"));
        assert_eq!(request.headers.get("content-length"), Some("4"));
        assert_eq!(&request.body[..], b"data");
    }
}
