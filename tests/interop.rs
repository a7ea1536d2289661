//! The emulated client against independent HTTP implementations.

use bytes::Bytes;
use deproxy_rs::{Config, DeproxyClient, DeproxyManager, HttpMessage, Request, Stateful};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TIMEOUT: Duration = Duration::from_secs(5);

fn manager() -> DeproxyManager {
    let mut config = Config::default();
    config.deproxy.auto_parser = false;
    let mut manager = DeproxyManager::new(config);
    manager.start().unwrap();
    manager
}

/// HTTP/1.1 server answering with the request path.
async fn hyper_path_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::spawn(async move {
                let service = service_fn(|request: hyper::Request<Incoming>| async move {
                    let body = Bytes::from(request.uri().path().to_string());
                    Ok::<_, Infallible>(hyper::Response::new(Full::new(body)))
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    addr
}

#[tokio::test]
async fn test_hyper_answers_pipelined_requests() {
    let manager = manager();
    let addr = hyper_path_echo().await;
    let mut client = DeproxyClient::new(&manager.handle(), addr);
    client.start().unwrap();

    let requests: Vec<Request> = (0..3)
        .map(|i| client.create_request("GET").uri(&format!("/p{}", i)).build().unwrap())
        .collect();
    client.make_requests(requests, true).unwrap();

    assert!(client.wait_for_response(TIMEOUT, None).await.is_satisfied());
    let bodies: Vec<Bytes> = client.responses().into_iter().map(|r| r.body).collect();
    assert_eq!(bodies, vec![Bytes::from("/p0"), Bytes::from("/p1"), Bytes::from("/p2")]);
    assert!(client.responses().iter().all(|r| r.headers.contains("date")));
}

#[tokio::test]
async fn test_wiremock_origin() {
    let origin = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/submit"))
        .and(header("x-test", "1"))
        .respond_with(ResponseTemplate::new(201).set_body_string("created"))
        .expect(1)
        .mount(&origin)
        .await;

    let manager = manager();
    let mut client = DeproxyClient::new(&manager.handle(), *origin.address());
    client.start().unwrap();
    let request = client
        .create_request("POST")
        .uri("/submit")
        .header("X-Test", "1")
        .body("payload")
        .build()
        .unwrap();
    client.send_request(request, Some(201), TIMEOUT).await.unwrap();

    let response = client.last_response().unwrap();
    assert_eq!(&response.body[..], b"created");
    assert_eq!(client.methods(), vec!["POST".to_string()]);
}

#[test]
fn test_built_request_is_valid_http() {
    let request = Request::create("PUT")
        .uri("/upload?x=1")
        .header("Content-Type", "text/plain")
        .body("0123456789")
        .build()
        .unwrap();
    let wire = request.to_bytes();

    let mut headers = [httparse::EMPTY_HEADER; 8];
    let mut parsed = httparse::Request::new(&mut headers);
    let status = parsed.parse(&wire).unwrap();
    let head_len = match status {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => panic!("partial request"),
    };
    assert_eq!(parsed.method, Some("PUT"));
    assert_eq!(parsed.path, Some("/upload?x=1"));
    let content_length = parsed
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case("content-length"))
        .map(|h| std::str::from_utf8(h.value).unwrap().to_string());
    assert_eq!(content_length.as_deref(), Some("10"));
    assert_eq!(&wire[head_len..], b"0123456789");
}
