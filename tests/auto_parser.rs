//! Expectation checks with a pass-through relay standing in for the proxy
//! under test. A relay adds none of the headers a proxy adds, so every
//! exchange must produce mismatches.

use deproxy_rs::deproxy::selfproxy::{Chunking, SelfProxy};
use deproxy_rs::deproxy::AutoParser;
use deproxy_rs::{Config, DeproxyClient, DeproxyManager, DeproxyServer, Error, Stateful};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(5);
const OK: &str = "HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";

fn mismatches(auto_parser: &Arc<Mutex<AutoParser>>) -> usize {
    auto_parser.lock().unwrap().mismatches().len()
}

#[tokio::test]
async fn test_transparent_relay_is_reported() {
    let mut manager = DeproxyManager::new(Config::default());
    manager.start().unwrap();
    let handle = manager.handle();
    let auto_parser = manager.auto_parser();

    let mut server = DeproxyServer::with_response(&handle, "127.0.0.1:0".parse().unwrap(), OK);
    server.start().unwrap();
    let mut relay = SelfProxy::new(&handle, "127.0.0.1:0".parse().unwrap(), server.addr(), Chunking::default());
    relay.start().unwrap();

    let mut client = DeproxyClient::new(&handle, relay.addr());
    client.start().unwrap();
    client
        .send_request("GET / HTTP/1.1\r\nHost: localhost\r\n\r\n", Some(200), TIMEOUT)
        .await
        .unwrap();

    // Missing Via / X-Forwarded-For on the request, Via / Server on the
    // response.
    assert!(mismatches(&auto_parser) >= 2);
    let err = auto_parser.lock().unwrap().check_exceptions().unwrap_err();
    assert!(matches!(err, Error::Assertion(_)));

    auto_parser.lock().unwrap().cleanup();
    assert!(auto_parser.lock().unwrap().check_exceptions().is_ok());
    assert!(manager.check_errors().is_ok());

    client.stop();
    relay.stop();
    server.stop();
    manager.stop();
}

#[tokio::test]
async fn test_disabled_parsing_records_nothing() {
    let mut manager = DeproxyManager::new(Config::default());
    manager.start().unwrap();
    let handle = manager.handle();
    let auto_parser = manager.auto_parser();
    auto_parser.lock().unwrap().set_parsing(false);

    let mut server = DeproxyServer::with_response(&handle, "127.0.0.1:0".parse().unwrap(), OK);
    server.start().unwrap();
    let mut client = DeproxyClient::new(&handle, server.addr());
    client.start().unwrap();
    client
        .send_request("GET / HTTP/1.1\r\nHost: localhost\r\n\r\n", Some(200), TIMEOUT)
        .await
        .unwrap();

    assert_eq!(mismatches(&auto_parser), 0);
    assert!(auto_parser.lock().unwrap().expected_request().is_none());
}
