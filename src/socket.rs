//! Unix datagram IPC between job-hosting processes and their clients.
//!
//! # Framing
//!
//! Every payload is sent as `<decimal-length><payload>` with no delimiter.
//! Frames larger than [`MAX_DATAGRAM`] are split across several datagrams
//! and reassembled per sender:
//!
//! - a datagram from a sender with no pending payload must start with a
//!   length prefix, otherwise it is logged and dropped;
//! - while a payload is pending, every datagram from the same sender is a
//!   continuation, whatever bytes it starts with;
//! - a payload growing past its declared length is dropped;
//! - senders without an address cannot be told apart, so their payloads
//!   must fit in one datagram; partial ones are dropped.
//!
//! Payloads whose first byte is an ASCII digit cannot be framed
//! unambiguously and are rejected by [`encode`].

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::Shutdown;
use std::os::unix::net::{SocketAddr, UnixDatagram};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::error::{Result, TaroError};
use crate::paths;

/// Largest datagram sent or received.
pub const MAX_DATAGRAM: usize = 16 * 1024;

/// Declared payload lengths above this are protocol violations.
pub const MAX_PAYLOAD: usize = 16 * 1024 * 1024;

pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);

const POLL_INTERVAL: Duration = Duration::from_millis(200);
const PENDING_TTL: Duration = Duration::from_secs(10);

/// Frames a payload with its decimal length prefix.
pub fn encode(payload: &[u8]) -> Result<Vec<u8>> {
    if payload.first().is_some_and(u8::is_ascii_digit) {
        return Err(TaroError::Protocol(
            "payload must not start with a digit".into(),
        ));
    }
    let prefix = payload.len().to_string();
    let mut frame = Vec::with_capacity(prefix.len() + payload.len());
    frame.extend_from_slice(prefix.as_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

fn split_prefix(datagram: &[u8]) -> Option<(usize, &[u8])> {
    let digits = datagram.iter().take_while(|b| b.is_ascii_digit()).count();
    if digits == 0 {
        return None;
    }
    let len = std::str::from_utf8(&datagram[..digits]).ok()?.parse().ok()?;
    Some((len, &datagram[digits..]))
}

/// Identity of a datagram sender, used to key partial payloads.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PeerKey {
    Path(PathBuf),
    Abstract(Vec<u8>),
    Unnamed,
}

impl PeerKey {
    pub fn of(addr: &SocketAddr) -> Self {
        if let Some(path) = addr.as_pathname() {
            return PeerKey::Path(path.to_path_buf());
        }
        #[cfg(target_os = "linux")]
        {
            use std::os::linux::net::SocketAddrExt;
            if let Some(name) = addr.as_abstract_name() {
                return PeerKey::Abstract(name.to_vec());
            }
        }
        PeerKey::Unnamed
    }
}

struct Pending {
    expected: usize,
    buf: Vec<u8>,
    started: Instant,
}

/// Reassembles framed payloads from datagrams.
#[derive(Default)]
pub struct Reassembler {
    pending: HashMap<PeerKey, Pending>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one datagram; returns a payload once it is complete.
    pub fn push(&mut self, peer: PeerKey, datagram: &[u8]) -> Option<Vec<u8>> {
        self.expire();

        if let Some(pending) = self.pending.get_mut(&peer) {
            pending.buf.extend_from_slice(datagram);
            let (received, expected) = (pending.buf.len(), pending.expected);
            if received < expected {
                tracing::debug!(?peer, received, expected, "incomplete_payload");
                return None;
            }
            let pending = self.pending.remove(&peer)?;
            if received > expected {
                tracing::warn!(?peer, received, expected, "oversized_payload");
                return None;
            }
            return Some(pending.buf);
        }

        let Some((expected, body)) = split_prefix(datagram) else {
            tracing::warn!(?peer, len = datagram.len(), "unprefixed_datagram");
            return None;
        };
        if expected > MAX_PAYLOAD {
            tracing::warn!(?peer, expected, "payload_too_large");
            return None;
        }
        match body.len() {
            n if n == expected => Some(body.to_vec()),
            n if n > expected => {
                tracing::warn!(?peer, received = n, expected, "oversized_payload");
                None
            }
            n if peer == PeerKey::Unnamed => {
                tracing::warn!(received = n, expected, "unnamed_partial_payload");
                None
            }
            n => {
                tracing::debug!(?peer, received = n, expected, "incomplete_payload");
                let mut buf = Vec::with_capacity(expected);
                buf.extend_from_slice(body);
                self.pending.insert(
                    peer,
                    Pending {
                        expected,
                        buf,
                        started: Instant::now(),
                    },
                );
                None
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    fn expire(&mut self) {
        self.pending.retain(|peer, p| {
            let alive = p.started.elapsed() < PENDING_TTL;
            if !alive {
                tracing::warn!(?peer, received = p.buf.len(), expected = p.expected, "payload_expired");
            }
            alive
        });
    }
}

fn send_frame(frame: &[u8], send: impl Fn(&[u8]) -> io::Result<usize>) -> io::Result<()> {
    for chunk in frame.chunks(MAX_DATAGRAM) {
        send(chunk)?;
    }
    Ok(())
}

/// Server-side hook invoked with every reassembled request.
pub trait RequestHandler: Send + Sync + 'static {
    /// Returns the response to send back, or `None` to stay silent.
    fn handle(&self, request: Value) -> Option<Value>;

    /// Called for payloads that are not valid JSON.
    fn handle_invalid(&self, error: &serde_json::Error) -> Option<Value> {
        let _ = error;
        None
    }
}

impl<F> RequestHandler for F
where
    F: Fn(Value) -> Option<Value> + Send + Sync + 'static,
{
    fn handle(&self, request: Value) -> Option<Value> {
        self(request)
    }
}

/// Datagram server serving one socket file on a dedicated thread.
///
/// The loop ends when [`close`](SocketServer::close) is called or when an
/// empty datagram is received. Dropping the server closes it.
pub struct SocketServer {
    path: PathBuf,
    socket: Arc<UnixDatagram>,
    stopped: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl SocketServer {
    pub fn start(path: impl Into<PathBuf>, handler: Arc<dyn RequestHandler>) -> Result<Self> {
        let path = path.into();
        let socket = UnixDatagram::bind(&path)?;
        socket.set_read_timeout(Some(POLL_INTERVAL))?;
        socket.set_write_timeout(Some(DEFAULT_RESPONSE_TIMEOUT))?;
        let socket = Arc::new(socket);
        let stopped = Arc::new(AtomicBool::new(false));

        let thread = {
            let socket = Arc::clone(&socket);
            let stopped = Arc::clone(&stopped);
            let path = path.clone();
            thread::Builder::new()
                .name("taro-socket-server".into())
                .spawn(move || serve(&path, &socket, &stopped, handler.as_ref()))
        };
        let thread = match thread {
            Ok(thread) => thread,
            Err(e) => {
                let _ = std::fs::remove_file(&path);
                return Err(e.into());
            }
        };
        tracing::debug!(socket = %path.display(), "socket_server_started");

        Ok(Self {
            path,
            socket,
            stopped,
            thread: Some(thread),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Signals the serving loop to end without waiting for it.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    /// Stops serving, shuts the socket down and removes the socket file.
    pub fn close(&mut self) {
        self.stop();
        let _ = self.socket.shutdown(Shutdown::Read);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!(socket = %self.path.display(), "socket_server_panicked");
            }
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!(socket = %self.path.display(), "socket_removed"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(socket = %self.path.display(), error = %e, "socket_remove_failed"),
        }
    }
}

impl Drop for SocketServer {
    fn drop(&mut self) {
        self.close();
    }
}

fn serve(path: &Path, socket: &UnixDatagram, stopped: &AtomicBool, handler: &dyn RequestHandler) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut reassembler = Reassembler::new();

    while !stopped.load(Ordering::SeqCst) {
        let (len, addr) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(e) if is_timeout(&e) || e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                if !stopped.load(Ordering::SeqCst) {
                    tracing::error!(socket = %path.display(), error = %e, "socket_receive_failed");
                }
                break;
            }
        };
        if len == 0 {
            tracing::debug!(socket = %path.display(), "empty_datagram_shutdown");
            break;
        }
        let Some(payload) = reassembler.push(PeerKey::of(&addr), &buf[..len]) else {
            continue;
        };

        let response = match serde_json::from_slice::<Value>(&payload) {
            Ok(request) => handler.handle(request),
            Err(e) => {
                tracing::warn!(socket = %path.display(), error = %e, "invalid_request");
                handler.handle_invalid(&e)
            }
        };
        if let Some(response) = response {
            if let Err(e) = respond(socket, &addr, &response) {
                tracing::warn!(socket = %path.display(), error = %e, "response_failed");
            }
        }
    }
    tracing::debug!(socket = %path.display(), "socket_server_stopped");
}

fn respond(socket: &UnixDatagram, addr: &SocketAddr, response: &Value) -> Result<()> {
    if PeerKey::of(addr) == PeerKey::Unnamed {
        tracing::debug!("no_return_address");
        return Ok(());
    }
    let frame = encode(&serde_json::to_vec(response)?)?;
    send_frame(&frame, |chunk| socket.send_to_addr(chunk, addr))?;
    Ok(())
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

/// Response of one server in a scatter-gather exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceResponse {
    pub instance_id: String,
    pub response: Value,
}

/// Sends requests to every server socket of one kind in a directory.
///
/// Every client sends from its own address. A bidirectional client waits
/// for one response per server; a unidirectional one only sends. Servers
/// refusing the connection are remembered as dead and skipped from then on.
pub struct SocketClient {
    dir: PathBuf,
    extension: String,
    socket: UnixDatagram,
    bidirectional: bool,
    timeout: Duration,
    dead: HashSet<PathBuf>,
    bound_path: Option<PathBuf>,
}

impl SocketClient {
    pub fn new(dir: impl Into<PathBuf>, extension: impl Into<String>, bidirectional: bool) -> Result<Self> {
        // Unidirectional clients bind too: servers key reassembly by sender.
        let (socket, bound_path) = bind_client_socket()?;
        socket.set_write_timeout(Some(DEFAULT_RESPONSE_TIMEOUT))?;
        Ok(Self {
            dir: dir.into(),
            extension: extension.into(),
            socket,
            bidirectional,
            timeout: DEFAULT_RESPONSE_TIMEOUT,
            dead: HashSet::new(),
            bound_path,
        })
    }

    /// How long to wait for each server's response.
    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self> {
        self.socket.set_write_timeout(Some(timeout))?;
        self.timeout = timeout;
        Ok(self)
    }

    pub fn dead_sockets(&self) -> impl Iterator<Item = &Path> {
        self.dead.iter().map(PathBuf::as_path)
    }

    /// Sends `request` to every server, or only to the instances listed in
    /// `include` when it is not empty, and collects the responses.
    pub fn communicate(&mut self, request: &Value, include: &[String]) -> Result<Vec<InstanceResponse>> {
        let frame = encode(&serde_json::to_vec(request)?)?;
        let mut responses = Vec::new();

        for path in paths::socket_files(&self.dir, &self.extension)? {
            let Some(instance_id) = paths::socket_name(&path).map(str::to_string) else {
                continue;
            };
            if !include.is_empty() && !include.contains(&instance_id) {
                continue;
            }
            if self.dead.contains(&path) {
                continue;
            }

            if let Err(e) = send_frame(&frame, |chunk| self.socket.send_to(chunk, &path)) {
                match e.kind() {
                    io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound => {
                        tracing::warn!(socket = %path.display(), "dead_socket");
                        self.dead.insert(path);
                    }
                    _ => tracing::warn!(socket = %path.display(), error = %e, "send_failed"),
                }
                continue;
            }
            if !self.bidirectional {
                continue;
            }

            match self.receive_from(&path) {
                Ok(Some(response)) => responses.push(InstanceResponse { instance_id, response }),
                Ok(None) => tracing::debug!(socket = %path.display(), "no_response"),
                Err(e) => tracing::warn!(socket = %path.display(), error = %e, "receive_failed"),
            }
        }
        Ok(responses)
    }

    /// Waits for one complete response from the server at `path`. Datagrams
    /// from other sources are late answers to earlier requests and ignored.
    fn receive_from(&self, path: &Path) -> Result<Option<Value>> {
        let deadline = Instant::now() + self.timeout;
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut reassembler = Reassembler::new();
        let expected = PeerKey::Path(path.to_path_buf());

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            self.socket.set_read_timeout(Some(remaining))?;
            let (len, addr) = match self.socket.recv_from(&mut buf) {
                Ok(received) => received,
                Err(e) if is_timeout(&e) => return Ok(None),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            let peer = PeerKey::of(&addr);
            if peer != expected {
                tracing::debug!(?peer, "stale_response");
                continue;
            }
            if let Some(payload) = reassembler.push(peer, &buf[..len]) {
                return Ok(Some(serde_json::from_slice(&payload)?));
            }
        }
    }
}

impl Drop for SocketClient {
    fn drop(&mut self) {
        if let Some(path) = self.bound_path.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[cfg(target_os = "linux")]
fn bind_client_socket() -> io::Result<(UnixDatagram, Option<PathBuf>)> {
    use std::os::linux::net::SocketAddrExt;
    let name = format!("taro-client-{}", uuid::Uuid::new_v4().simple());
    let addr = SocketAddr::from_abstract_name(name.as_bytes())?;
    Ok((UnixDatagram::bind_addr(&addr)?, None))
}

#[cfg(not(target_os = "linux"))]
fn bind_client_socket() -> io::Result<(UnixDatagram, Option<PathBuf>)> {
    let path = std::env::temp_dir().join(format!("taro-client-{}", uuid::Uuid::new_v4().simple()));
    Ok((UnixDatagram::bind(&path)?, Some(path)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo(request: Value) -> Option<Value> {
        Some(json!({ "echo": request }))
    }

    fn silent(_: Value) -> Option<Value> {
        None
    }

    fn start(dir: &Path, name: &str, handler: Arc<dyn RequestHandler>) -> SocketServer {
        SocketServer::start(paths::socket_path(dir, name, "api"), handler).unwrap()
    }

    fn dead_socket(dir: &Path, name: &str) -> PathBuf {
        let path = paths::socket_path(dir, name, "api");
        drop(UnixDatagram::bind(&path).unwrap());
        path
    }

    #[test]
    fn encode_prefixes_length() {
        assert_eq!(encode(b"{\"a\":1}").unwrap(), b"7{\"a\":1}".to_vec());
        assert!(matches!(encode(b"42"), Err(TaroError::Protocol(_))));
    }

    #[test]
    fn reassembles_split_payload_per_peer() {
        let mut r = Reassembler::new();
        let a = PeerKey::Path("/a".into());
        let b = PeerKey::Path("/b".into());

        assert_eq!(r.push(a.clone(), b"8{\"k\":"), None);
        assert_eq!(r.push(b.clone(), b"2{}"), Some(b"{}".to_vec()));
        // Continuations are appended even when they start with digits.
        assert_eq!(r.push(a.clone(), b"12}"), Some(b"{\"k\":12}".to_vec()));
        assert_eq!(r.pending(), 0);
    }

    #[test]
    fn unprefixed_datagram_is_dropped() {
        let mut r = Reassembler::new();
        let peer = PeerKey::Path("/a".into());
        assert_eq!(r.push(peer.clone(), b"{}"), None);
        assert_eq!(r.pending(), 0);
        assert_eq!(r.push(peer, b"2{}"), Some(b"{}".to_vec()));
    }

    #[test]
    fn unnamed_peers_never_accumulate() {
        let mut r = Reassembler::new();
        assert_eq!(r.push(PeerKey::Unnamed, b"8{\"k\":"), None);
        assert_eq!(r.pending(), 0);
        assert_eq!(r.push(PeerKey::Unnamed, b"2{}"), Some(b"{}".to_vec()));
    }

    fn recording_server(dir: &Path) -> (SocketServer, std::sync::mpsc::Receiver<Value>) {
        let (tx, rx) = std::sync::mpsc::channel();
        let tx = std::sync::Mutex::new(tx);
        let record = move |request: Value| {
            let _ = tx.lock().unwrap().send(request);
            None
        };
        let server = SocketServer::start(paths::socket_path(dir, "srv", "listener"), Arc::new(record)).unwrap();
        (server, rx)
    }

    fn split_frame(payload: &[u8]) -> (Vec<u8>, Vec<u8>) {
        let mut frame = encode(payload).unwrap();
        let rest = frame.split_off(20);
        assert!(!rest[0].is_ascii_digit());
        (frame, rest)
    }

    #[test]
    fn interleaved_senders_are_reassembled_separately() {
        let dir = tempfile::tempdir().unwrap();
        let (server, rx) = recording_server(dir.path());
        let a = UnixDatagram::bind(dir.path().join("a.sock")).unwrap();
        let b = UnixDatagram::bind(dir.path().join("b.sock")).unwrap();

        let (head, tail) = split_frame(br#"{"from":"a","pad":"xxxxxxxxxxxxxxxx"}"#);
        a.send_to(&head, server.path()).unwrap();
        b.send_to(&encode(br#"{"from":"b"}"#).unwrap(), server.path()).unwrap();
        a.send_to(&tail, server.path()).unwrap();

        let mut seen: Vec<String> = (0..2)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap()["from"].as_str().unwrap().to_string())
            .collect();
        seen.sort();
        assert_eq!(seen, vec!["a", "b"]);
    }

    #[test]
    fn unbound_sender_partial_does_not_swallow_others() {
        let dir = tempfile::tempdir().unwrap();
        let (server, rx) = recording_server(dir.path());
        let a = UnixDatagram::unbound().unwrap();
        let b = UnixDatagram::unbound().unwrap();

        let (head, tail) = split_frame(br#"{"from":"a","pad":"xxxxxxxxxxxxxxxx"}"#);
        a.send_to(&head, server.path()).unwrap();
        b.send_to(&encode(br#"{"from":"b"}"#).unwrap(), server.path()).unwrap();
        a.send_to(&tail, server.path()).unwrap();

        let received = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(received["from"], "b");
        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
    }

    #[test]
    fn unidirectional_clients_send_from_distinct_addresses() {
        let dir = tempfile::tempdir().unwrap();
        let (_server, rx) = recording_server(dir.path());
        let data = "y".repeat(MAX_DATAGRAM + 100);

        let mut one = SocketClient::new(dir.path(), "listener", false).unwrap();
        let mut two = SocketClient::new(dir.path(), "listener", false).unwrap();
        one.communicate(&json!({ "from": "one", "data": data }), &[]).unwrap();
        two.communicate(&json!({ "from": "two" }), &[]).unwrap();

        let mut seen: Vec<String> = (0..2)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap()["from"].as_str().unwrap().to_string())
            .collect();
        seen.sort();
        assert_eq!(seen, vec!["one", "two"]);
    }

    #[test]
    fn oversized_payload_is_dropped() {
        let mut r = Reassembler::new();
        let peer = PeerKey::Path("/a".into());
        assert_eq!(r.push(peer.clone(), b"3{}"), None);
        assert_eq!(r.push(peer.clone(), b"}}"), None);
        assert_eq!(r.pending(), 0);
        assert_eq!(r.push(peer, b"1{}"), None);
    }

    #[test]
    fn scatter_gather_skips_dead_server() {
        let dir = tempfile::tempdir().unwrap();
        let _one = start(dir.path(), "one", Arc::new(echo));
        let dead = dead_socket(dir.path(), "two");
        let _three = start(dir.path(), "three", Arc::new(echo));

        let mut client = SocketClient::new(dir.path(), "api", true).unwrap();
        let responses = client.communicate(&json!({"api": "/jobs"}), &[]).unwrap();

        let ids: Vec<_> = responses.iter().map(|r| r.instance_id.as_str()).collect();
        assert_eq!(ids, vec!["one", "three"]);
        assert_eq!(responses[0].response["echo"]["api"], "/jobs");
        assert_eq!(client.dead_sockets().collect::<Vec<_>>(), vec![dead.as_path()]);

        // A server appearing at the dead path is never contacted by this client.
        std::fs::remove_file(&dead).unwrap();
        let _revived = start(dir.path(), "two", Arc::new(echo));
        let responses = client.communicate(&json!({"api": "/jobs"}), &[]).unwrap();
        assert_eq!(responses.len(), 2);

        let mut fresh = SocketClient::new(dir.path(), "api", true).unwrap();
        assert_eq!(fresh.communicate(&json!({}), &[]).unwrap().len(), 3);
    }

    #[test]
    fn include_filters_instances() {
        let dir = tempfile::tempdir().unwrap();
        let _one = start(dir.path(), "one", Arc::new(echo));
        let _two = start(dir.path(), "two", Arc::new(echo));

        let mut client = SocketClient::new(dir.path(), "api", true).unwrap();
        let responses = client
            .communicate(&json!({}), &["two".to_string()])
            .unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].instance_id, "two");
    }

    #[test]
    fn large_request_arrives_in_one_piece() {
        let dir = tempfile::tempdir().unwrap();
        let size = |request: Value| Some(json!({ "len": request["data"].as_str().map(str::len) }));
        let _server = start(dir.path(), "big", Arc::new(size));

        let data = "x".repeat(MAX_DATAGRAM + 4000);
        let mut client = SocketClient::new(dir.path(), "api", true).unwrap();
        let responses = client.communicate(&json!({ "data": data }), &[]).unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].response["len"], MAX_DATAGRAM + 4000);
    }

    #[test]
    fn silent_server_yields_no_response() {
        let dir = tempfile::tempdir().unwrap();
        let _server = start(dir.path(), "quiet", Arc::new(silent));
        let mut client = SocketClient::new(dir.path(), "api", true)
            .unwrap()
            .with_timeout(Duration::from_millis(100))
            .unwrap();
        assert!(client.communicate(&json!({}), &[]).unwrap().is_empty());
        assert_eq!(client.dead_sockets().count(), 0);
    }

    #[test]
    fn unidirectional_client_only_sends() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = std::sync::mpsc::channel();
        let tx = std::sync::Mutex::new(tx);
        let record = move |request: Value| {
            let _ = tx.lock().unwrap().send(request);
            None
        };
        let _server = start(dir.path(), "sink", Arc::new(record));

        let mut client = SocketClient::new(dir.path(), "api", false).unwrap();
        assert!(client.communicate(&json!({"n": 1}), &[]).unwrap().is_empty());
        let received = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(received["n"], 1);
    }

    #[test]
    fn close_removes_socket_file_and_empty_datagram_stops_loop() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = start(dir.path(), "s", Arc::new(echo));
        let path = server.path().to_path_buf();

        UnixDatagram::unbound().unwrap().send_to(b"", &path).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while server.is_running() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(!server.is_running());

        server.close();
        assert!(!path.exists());
        server.close();
    }
}
