//! The reactor: one OS thread running a current-thread tokio runtime that
//! drives every emulated connection.

use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::auto_parser::AutoParser;
use super::events::{Command, Event};
use super::handler::{Acceptor, Outbound, SharedHandler};
use super::selfproxy::SelfProxyRegistry;
use crate::config::Config;
use crate::stateful::{Lifecycle, State, Stateful};
use crate::util::lock;
use crate::{Error, Result};

const STALL_THRESHOLD: Duration = Duration::from_secs(1);

enum Registration {
    Listen {
        listener: std::net::TcpListener,
        acceptor: Arc<dyn Acceptor>,
        token: CancellationToken,
    },
    Connect {
        outbound: Outbound,
        token: CancellationToken,
    },
}

struct Running {
    tx: mpsc::UnboundedSender<Registration>,
    token: CancellationToken,
}

#[derive(Default)]
struct ReactorShared {
    running: Mutex<Option<Running>>,
    errors: Mutex<Vec<String>>,
    failed: AtomicBool,
    live: AtomicUsize,
}

impl ReactorShared {
    /// A handler failed: remember why and tear everything down.
    fn record_fatal(&self, err: &Error) {
        error!(target: "deproxy::tcp", "Error while polling: {}", err);
        lock(&self.errors).push(err.to_string());
        self.failed.store(true, Ordering::SeqCst);
        if let Some(running) = lock(&self.running).as_ref() {
            running.token.cancel();
        }
    }
}

/// Cheap clonable access to a running manager, held by clients, servers
/// and relays.
#[derive(Clone)]
pub struct ManagerHandle {
    shared: Arc<ReactorShared>,
    config: Arc<Config>,
    auto_parser: Arc<Mutex<AutoParser>>,
    relays: Arc<Mutex<SelfProxyRegistry>>,
}

impl std::fmt::Debug for ManagerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagerHandle")
            .field("failed", &self.has_failed())
            .field("live", &self.live_connections())
            .finish()
    }
}

impl ManagerHandle {
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn auto_parser(&self) -> Arc<Mutex<AutoParser>> {
        self.auto_parser.clone()
    }

    pub fn relays(&self) -> Arc<Mutex<SelfProxyRegistry>> {
        self.relays.clone()
    }

    pub fn poll_interval(&self) -> Duration {
        self.config.poll_interval()
    }

    pub fn has_failed(&self) -> bool {
        self.shared.failed.load(Ordering::SeqCst)
    }

    pub fn live_connections(&self) -> usize {
        self.shared.live.load(Ordering::SeqCst)
    }

    fn submit(&self, make: impl FnOnce(CancellationToken) -> Registration) -> Result<CancellationToken> {
        let running = lock(&self.shared.running);
        let running = running
            .as_ref()
            .ok_or_else(|| Error::framework("deproxy manager is not running"))?;
        let token = running.token.child_token();
        running
            .tx
            .send(make(token.clone()))
            .map_err(|_| Error::framework("deproxy reactor has exited"))?;
        Ok(token)
    }

    /// Binds `addr` right away, so address errors reach the caller, and
    /// hands the listener to the reactor. Cancel the returned token to stop
    /// listening and close every accepted connection.
    pub fn listen(&self, addr: SocketAddr, acceptor: Arc<dyn Acceptor>) -> Result<(SocketAddr, CancellationToken)> {
        let listener = std::net::TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local = listener.local_addr()?;
        let token = self.submit(move |token| Registration::Listen {
            listener,
            acceptor,
            token,
        })?;
        info!(target: "deproxy::tcp", "Listening on {}", local);
        Ok((local, token))
    }

    /// Opens an outbound connection. Cancel the returned token to close it.
    pub fn connect(&self, outbound: Outbound) -> Result<CancellationToken> {
        info!(target: "deproxy::tcp", "Trying to connect to {}", outbound.addr);
        self.submit(move |token| Registration::Connect { outbound, token })
    }
}

pub struct DeproxyManager {
    lifecycle: Lifecycle,
    handle: ManagerHandle,
    thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for DeproxyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeproxyManager")
            .field("state", &self.state())
            .field("handle", &self.handle)
            .finish()
    }
}

impl DeproxyManager {
    pub fn new(config: Config) -> Self {
        let auto_parser = AutoParser::new(&config);
        Self {
            lifecycle: Lifecycle::new(),
            handle: ManagerHandle {
                shared: Arc::new(ReactorShared::default()),
                config: Arc::new(config),
                auto_parser: Arc::new(Mutex::new(auto_parser)),
                relays: Arc::new(Mutex::new(SelfProxyRegistry::default())),
            },
            thread: None,
        }
    }

    pub fn handle(&self) -> ManagerHandle {
        self.handle.clone()
    }

    pub fn config(&self) -> &Config {
        &self.handle.config
    }

    pub fn auto_parser(&self) -> Arc<Mutex<AutoParser>> {
        self.handle.auto_parser()
    }

    pub fn live_connections(&self) -> usize {
        self.handle.live_connections()
    }

    /// First fatal handler error, if any.
    pub fn check_errors(&self) -> Result<()> {
        match lock(&self.handle.shared.errors).first() {
            Some(err) => Err(Error::framework(err)),
            None => Ok(()),
        }
    }

    pub fn errors(&self) -> Vec<String> {
        lock(&self.handle.shared.errors).clone()
    }

    fn spawn_reactor(&mut self) -> Result<()> {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let shared = self.handle.shared.clone();
        shared.failed.store(false, Ordering::SeqCst);
        lock(&shared.errors).clear();
        *lock(&shared.running) = Some(Running {
            tx,
            token: token.clone(),
        });

        let poll = self.handle.poll_interval();
        let thread = std::thread::Builder::new()
            .name("deproxy-reactor".to_string())
            .spawn(move || runtime.block_on(run_reactor(rx, token, shared, poll)))?;
        self.thread = Some(thread);
        Ok(())
    }

    fn stop_reactor(&mut self) -> Result<()> {
        if let Some(running) = lock(&self.handle.shared.running).take() {
            running.token.cancel();
        }
        if let Some(thread) = self.thread.take() {
            thread
                .join()
                .map_err(|_| Error::framework("deproxy reactor thread panicked"))?;
        }
        Ok(())
    }
}

impl Stateful for DeproxyManager {
    fn name(&self) -> String {
        "deproxy manager".to_string()
    }

    fn state(&self) -> State {
        if self.handle.has_failed() {
            State::Error
        } else {
            self.lifecycle.state()
        }
    }

    fn start(&mut self) -> Result<()> {
        let name = self.name();
        if !self.lifecycle.begin_start(&name) {
            return Ok(());
        }
        match self.spawn_reactor() {
            Ok(()) => {
                self.lifecycle.set_state(State::Started);
                Ok(())
            }
            Err(e) => {
                self.lifecycle.append_exception(&name, &e);
                Err(e)
            }
        }
    }

    fn stop(&mut self) {
        let name = self.name();
        if !self.lifecycle.begin_stop(&name) {
            return;
        }
        let result = self.stop_reactor();
        self.lifecycle.finish_stop(&name, vec![result]);
    }
}

impl Drop for DeproxyManager {
    fn drop(&mut self) {
        let _ = self.stop_reactor();
    }
}

async fn run_reactor(
    mut rx: mpsc::UnboundedReceiver<Registration>,
    token: CancellationToken,
    shared: Arc<ReactorShared>,
    poll: Duration,
) {
    debug!(target: "deproxy::tcp", "reactor started");
    tokio::spawn(watch_stalls(token.clone(), poll));
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            registration = rx.recv() => match registration {
                Some(Registration::Listen { listener, acceptor, token }) => {
                    match TcpListener::from_std(listener) {
                        Ok(listener) => {
                            tokio::spawn(serve(listener, acceptor, token, shared.clone(), poll));
                        }
                        Err(e) => shared.record_fatal(&Error::from(e)),
                    }
                }
                Some(Registration::Connect { outbound, token }) => {
                    spawn_tracked(&shared, connect(outbound, token, shared.clone(), poll));
                }
                None => break,
            },
        }
    }

    // Give every connection the chance to deliver `Closed`.
    let deadline = Instant::now() + Duration::from_secs(1);
    while shared.live.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
        tokio::time::sleep(poll).await;
    }
    debug!(target: "deproxy::tcp", "reactor stopped");
}

/// A tick that arrives much later than scheduled means a handler hogged
/// the reactor thread.
async fn watch_stalls(token: CancellationToken, poll: Duration) {
    loop {
        let before = Instant::now();
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(poll) => {}
        }
        let elapsed = before.elapsed();
        if elapsed > STALL_THRESHOLD {
            warn!(target: "deproxy::tcp", "freeze while polling - {:?}", elapsed);
        }
    }
}

struct LiveGuard(Arc<ReactorShared>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.live.fetch_sub(1, Ordering::SeqCst);
    }
}

fn spawn_tracked<F>(shared: &Arc<ReactorShared>, task: F)
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    shared.live.fetch_add(1, Ordering::SeqCst);
    let guard = LiveGuard(shared.clone());
    tokio::spawn(async move {
        task.await;
        drop(guard);
    });
}

/// Delivers `event`; `false` means the connection must close.
fn dispatch(handler: &SharedHandler, shared: &ReactorShared, event: Event) -> bool {
    trace!(target: "deproxy::tcp", event = event.name(), "dispatch");
    let result = lock(handler).handle_event(event);
    match result {
        Ok(commands) => !commands.contains(&Command::Close),
        Err(e) => {
            shared.record_fatal(&e);
            false
        }
    }
}

async fn serve(
    listener: TcpListener,
    acceptor: Arc<dyn Acceptor>,
    token: CancellationToken,
    shared: Arc<ReactorShared>,
    poll: Duration,
) {
    loop {
        let accepted = tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!(target: "deproxy::tcp", "accept failed: {}", e);
                continue;
            }
        };
        debug!(target: "deproxy::tcp", "Accepted connection from {}", peer);
        let accepted = match acceptor.accept(peer) {
            Ok(accepted) => accepted,
            Err(e) => {
                shared.record_fatal(&e);
                break;
            }
        };
        let conn_token = token.child_token();
        let handler = accepted.handler;
        let task_shared = shared.clone();
        let task_token = conn_token.clone();
        spawn_tracked(&shared, async move {
            let local = match stream.local_addr() {
                Ok(local) => local,
                Err(e) => {
                    dispatch(&handler, &task_shared, Event::IoError(e.kind()));
                    dispatch(&handler, &task_shared, Event::Closed);
                    return;
                }
            };
            if dispatch(&handler, &task_shared, Event::Connected { local, peer }) {
                drive(stream, &handler, &task_token, &task_shared, poll).await;
            }
            dispatch(&handler, &task_shared, Event::Closed);
        });
        if let Some(companion) = accepted.companion {
            spawn_tracked(&shared, connect(companion, conn_token, shared.clone(), poll));
        }
    }
    debug!(target: "deproxy::tcp", "listener closed");
}

async fn connect(outbound: Outbound, token: CancellationToken, shared: Arc<ReactorShared>, poll: Duration) {
    let Outbound { addr, bind, handler } = outbound;
    let connecting = async {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        if let Some(bind) = bind {
            socket.bind(bind)?;
        }
        socket.connect(addr).await
    };
    let stream = tokio::select! {
        _ = token.cancelled() => {
            dispatch(&handler, &shared, Event::Closed);
            return;
        }
        stream = connecting => stream,
    };
    let stream = match stream {
        Ok(stream) => stream,
        Err(e) => {
            warn!(target: "deproxy::tcp", "connect to {} failed: {}", addr, e);
            dispatch(&handler, &shared, Event::ConnectFailed(e.kind()));
            dispatch(&handler, &shared, Event::Closed);
            return;
        }
    };
    let addrs = stream.local_addr().and_then(|local| Ok((local, stream.peer_addr()?)));
    match addrs {
        Ok((local, peer)) => {
            info!(target: "deproxy::tcp", "Connected {} -> {}", local, peer);
            if dispatch(&handler, &shared, Event::Connected { local, peer }) {
                drive(stream, &handler, &token, &shared, poll).await;
            }
        }
        Err(e) => {
            dispatch(&handler, &shared, Event::IoError(e.kind()));
        }
    }
    dispatch(&handler, &shared, Event::Closed);
}

/// Moves bytes between the socket and the handler until either side closes.
async fn drive(
    mut stream: TcpStream,
    handler: &SharedHandler,
    token: &CancellationToken,
    shared: &ReactorShared,
    poll: Duration,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(target: "deproxy::tcp", "TCP_NODELAY: {}", e);
    }
    let mut buf = BytesMut::with_capacity(crate::config::MAX_MESSAGE_SIZE);
    let (mut reader, mut writer) = stream.split();
    loop {
        let segment = {
            let mut h = lock(handler);
            if h.wants_close() {
                break;
            }
            let now = Instant::now();
            if h.writable(now) {
                h.next_segment(now)
            } else {
                None
            }
        }
        .unwrap_or_default();
        buf.reserve(crate::config::MAX_MESSAGE_SIZE);

        tokio::select! {
            _ = token.cancelled() => break,
            read = reader.read_buf(&mut buf) => match read {
                Ok(0) => {
                    debug!(target: "deproxy::tcp", "peer closed the connection");
                    break;
                }
                Ok(n) => {
                    trace!(target: "deproxy::tcp", "Receive {} bytes", n);
                    if !dispatch(handler, shared, Event::DataReceived(buf.split().freeze())) {
                        break;
                    }
                }
                Err(e) => {
                    warn!(target: "deproxy::tcp", "Receive error - {}", e);
                    dispatch(handler, shared, Event::IoError(e.kind()));
                    break;
                }
            },
            written = writer.write(&segment), if !segment.is_empty() => match written {
                Ok(n) => {
                    trace!(target: "deproxy::tcp", "Send {} of {} bytes", n, segment.len());
                    if !dispatch(handler, shared, Event::DataSent(n)) {
                        break;
                    }
                }
                Err(e) => {
                    warn!(target: "deproxy::tcp", "Send error - {}", e);
                    dispatch(handler, shared, Event::IoError(e.kind()));
                    break;
                }
            },
            _ = tokio::time::sleep(poll) => {}
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deproxy::handler::{Accepted, Handler};
    use bytes::Bytes;
    use std::collections::VecDeque;

    /// Writes `outbox` and records everything it sees.
    #[derive(Default)]
    struct Recorder {
        outbox: VecDeque<Bytes>,
        received: BytesMut,
        events: Vec<&'static str>,
        fail_on_data: bool,
    }

    impl Handler for Recorder {
        fn handle_event(&mut self, event: Event) -> Result<Vec<Command>> {
            self.events.push(event.name());
            match event {
                Event::DataReceived(data) => {
                    if self.fail_on_data {
                        return Err(Error::parse("garbage"));
                    }
                    self.received.extend_from_slice(&data);
                }
                Event::DataSent(n) => {
                    if let Some(front) = self.outbox.front_mut() {
                        let _ = front.split_to(n);
                        if front.is_empty() {
                            self.outbox.pop_front();
                        }
                    }
                }
                _ => {}
            }
            Ok(Vec::new())
        }

        fn next_segment(&mut self, _now: Instant) -> Option<Bytes> {
            self.outbox.front().cloned()
        }
    }

    struct EchoAcceptor {
        handlers: Mutex<Vec<Arc<Mutex<Recorder>>>>,
        fail_on_data: bool,
    }

    impl Acceptor for EchoAcceptor {
        fn accept(&self, _peer: SocketAddr) -> Result<Accepted> {
            let handler = Arc::new(Mutex::new(Recorder {
                fail_on_data: self.fail_on_data,
                ..Default::default()
            }));
            self.handlers.lock().unwrap().push(handler.clone());
            Ok(Accepted::new(handler))
        }
    }

    fn started_manager() -> DeproxyManager {
        let mut manager = DeproxyManager::new(Config::default());
        manager.start().unwrap();
        manager
    }

    async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
        crate::util::wait_until(&mut cond, Duration::from_secs(5), Duration::from_millis(1), || false)
            .await
            .is_satisfied()
    }

    #[tokio::test]
    async fn test_connect_send_and_close() {
        let mut manager = started_manager();
        let handle = manager.handle();
        let acceptor = Arc::new(EchoAcceptor {
            handlers: Mutex::new(Vec::new()),
            fail_on_data: false,
        });
        let (addr, _listener) = handle.listen("127.0.0.1:0".parse().unwrap(), acceptor.clone()).unwrap();

        let client = Arc::new(Mutex::new(Recorder::default()));
        client.lock().unwrap().outbox.push_back(Bytes::from_static(b"hello"));
        let token = handle
            .connect(Outbound {
                addr,
                bind: None,
                handler: client.clone(),
            })
            .unwrap();

        assert!(
            eventually(|| {
                let handlers = acceptor.handlers.lock().unwrap();
                handlers.first().map_or(false, |h| &h.lock().unwrap().received[..] == b"hello")
            })
            .await
        );
        assert_eq!(client.lock().unwrap().events[0], "Connected");

        token.cancel();
        assert!(eventually(|| client.lock().unwrap().events.last() == Some(&"Closed")).await);
        manager.stop();
        assert_eq!(manager.state(), State::Stopped);
        assert!(manager.check_errors().is_ok());
    }

    #[tokio::test]
    async fn test_connect_refused_is_not_fatal() {
        let mut manager = started_manager();
        let handle = manager.handle();
        // Grab a free port and release it so nothing listens there.
        let addr = std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
        let client = Arc::new(Mutex::new(Recorder::default()));
        handle
            .connect(Outbound {
                addr,
                bind: None,
                handler: client.clone(),
            })
            .unwrap();

        assert!(eventually(|| client.lock().unwrap().events == vec!["ConnectFailed", "Closed"]).await);
        assert!(manager.check_errors().is_ok());
        manager.stop();
    }

    #[tokio::test]
    async fn test_handler_error_fails_manager() {
        let mut manager = started_manager();
        let handle = manager.handle();
        let acceptor = Arc::new(EchoAcceptor {
            handlers: Mutex::new(Vec::new()),
            fail_on_data: true,
        });
        let (addr, _listener) = handle.listen("127.0.0.1:0".parse().unwrap(), acceptor).unwrap();
        let client = Arc::new(Mutex::new(Recorder::default()));
        client.lock().unwrap().outbox.push_back(Bytes::from_static(b"junk"));
        handle
            .connect(Outbound {
                addr,
                bind: None,
                handler: client,
            })
            .unwrap();

        assert!(eventually(|| manager.state() == State::Error).await);
        assert!(matches!(manager.check_errors(), Err(Error::Framework(_))));
        manager.stop();
    }

    #[tokio::test]
    async fn test_registration_requires_running_manager() {
        let manager = DeproxyManager::new(Config::default());
        let acceptor = Arc::new(EchoAcceptor {
            handlers: Mutex::new(Vec::new()),
            fail_on_data: false,
        });
        let err = manager
            .handle()
            .listen("127.0.0.1:0".parse().unwrap(), acceptor)
            .unwrap_err();
        assert!(matches!(err, Error::Framework(_)));
    }

    #[tokio::test]
    async fn test_double_start_and_stop() {
        let mut manager = started_manager();
        manager.start().unwrap();
        assert!(manager.is_running());
        manager.stop();
        manager.stop();
        assert_eq!(manager.state(), State::Stopped);
        manager.start().unwrap();
        assert!(manager.is_running());
        manager.stop();
    }
}
