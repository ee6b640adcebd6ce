//! # Local Proxies and the Stream Gateway
//!
//! The bridge between ordinary TCP clients and destination streams:
//!
//! - [`StreamGateway`]: demultiplexes one destination's frame queue into
//!   per-stream byte channels, hands out [`Stream`] handles, and queues
//!   inbound opens for [`StreamGateway::accept`]
//! - [`HttpProxy`]: HTTP proxy speaking CONNECT and absolute-form requests
//! - [`SocksProxy`]: SOCKS5, no authentication, CONNECT only
//!
//! Both proxies resolve hostnames of the form `<64 hex chars>` (optionally
//! suffixed `.allium`) to destination ids. Clearnet hosts are refused; this
//! router carries overlay traffic only.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, trace, warn};

use crate::crypto::{sign_with_domain, STREAM_SIGNATURE_DOMAIN};
use crate::identity::{DestinationId, DestinationKeys};
use crate::messages::StreamFrame;
use crate::tunnel::{stream_open_payload, DestinationHandle, StreamSendError, TunnelEngine};

/// Application bytes per stream frame. Well under the frame bound so the
/// garlic box, bundled leases, and the per-hop layers still fit one wire
/// message.
pub const STREAM_CHUNK: usize = 8 * 1024;

/// Per-stream inbound byte queue, in frames.
const STREAM_QUEUE: usize = 64;

/// Inbound streams waiting in the accept queue.
const ACCEPT_BACKLOG: usize = 32;

// ============================================================================
// Stream Gateway
// ============================================================================

/// Demultiplexer over one destination: owns the frame queue and fans frames
/// out to per-stream channels. Cheap to clone.
#[derive(Clone)]
pub struct StreamGateway {
    inner: Arc<GatewayInner>,
}

struct GatewayInner {
    keys: DestinationKeys,
    engine: TunnelEngine,
    streams: Mutex<HashMap<u64, mpsc::Sender<Vec<u8>>>>,
    accept_rx: AsyncMutex<mpsc::Receiver<Stream>>,
}

impl StreamGateway {
    /// Take over a destination's frame queue and start demultiplexing.
    pub fn new(handle: DestinationHandle) -> Self {
        let (keys, mut inbound, engine) = handle.split();
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_BACKLOG);
        let inner = Arc::new(GatewayInner {
            keys,
            engine,
            streams: Mutex::new(HashMap::new()),
            accept_rx: AsyncMutex::new(accept_rx),
        });

        let reader = inner.clone();
        tokio::spawn(async move {
            while let Some(frame) = inbound.recv().await {
                reader.dispatch(frame, &accept_tx);
            }
            trace!(dest = %reader.keys.id().short(), "stream gateway reader stopped");
        });

        Self { inner }
    }

    #[inline]
    pub fn local_id(&self) -> DestinationId {
        self.inner.keys.id()
    }

    /// Open a stream toward a remote destination. Resolves its lease set
    /// first, so the error distinguishes "unknown destination" from a
    /// tunnel problem.
    pub async fn open_stream(&self, to: DestinationId) -> Result<Stream, StreamSendError> {
        if self.inner.engine.resolve_lease_set(to).await.is_none() {
            return Err(StreamSendError::NoLeaseSet);
        }

        let (stream_id, rx) = self.inner.register_fresh_stream();
        let from = self.inner.keys.destination();
        let payload = stream_open_payload(stream_id, &from, &to);
        let signature =
            sign_with_domain(self.inner.keys.signing_key(), STREAM_SIGNATURE_DOMAIN, &payload);
        let open = StreamFrame::Open {
            stream_id,
            from,
            signature,
        };

        if let Err(err) = self
            .inner
            .engine
            .send_frame(self.local_id(), to, open)
            .await
        {
            self.inner.deregister(stream_id);
            return Err(err);
        }

        debug!(
            stream_id,
            to = %to.short(),
            "stream opened"
        );
        Ok(self.inner.make_stream_with_rx(stream_id, to, rx))
    }

    /// Next inbound stream. `None` once the destination is closed.
    pub async fn accept(&self) -> Option<Stream> {
        self.inner.accept_rx.lock().await.recv().await
    }

    /// Close the underlying destination; tears its tunnels down and ends the
    /// reader task.
    pub async fn close(&self) {
        self.inner.engine.close_destination(self.local_id()).await;
    }
}

impl GatewayInner {
    /// Route one inbound frame to its stream, or surface a new one.
    fn dispatch(self: &Arc<Self>, frame: StreamFrame, accept_tx: &mpsc::Sender<Stream>) {
        match frame {
            StreamFrame::Open {
                stream_id, from, ..
            } => {
                // Signature already checked at garlic delivery
                {
                    let streams = self.streams.lock().expect("stream map lock");
                    if streams.contains_key(&stream_id) {
                        trace!(stream_id, "duplicate stream open ignored");
                        return;
                    }
                }
                let stream = {
                    let (tx, rx) = mpsc::channel(STREAM_QUEUE);
                    self.streams
                        .lock()
                        .expect("stream map lock")
                        .insert(stream_id, tx);
                    self.make_stream_with_rx(stream_id, from.id(), rx)
                };
                if accept_tx.try_send(stream).is_err() {
                    warn!(stream_id, "accept queue full, inbound stream dropped");
                    self.deregister(stream_id);
                }
            }
            StreamFrame::Data {
                stream_id, payload, ..
            } => {
                let tx = {
                    let streams = self.streams.lock().expect("stream map lock");
                    streams.get(&stream_id).cloned()
                };
                match tx {
                    Some(tx) => {
                        if tx.try_send(payload).is_err() {
                            warn!(stream_id, "stream queue full, data dropped");
                        }
                    }
                    None => trace!(stream_id, "data for unknown stream dropped"),
                }
            }
            StreamFrame::Close { stream_id } => {
                // Dropping the sender ends the receiver with None
                self.deregister(stream_id);
                trace!(stream_id, "stream closed by peer");
            }
        }
    }

    /// Allocate an id no live stream uses and register its channel.
    fn register_fresh_stream(self: &Arc<Self>) -> (u64, mpsc::Receiver<Vec<u8>>) {
        let mut streams = self.streams.lock().expect("stream map lock");
        loop {
            let id = rand::random::<u64>();
            if id == 0 || streams.contains_key(&id) {
                continue;
            }
            let (tx, rx) = mpsc::channel(STREAM_QUEUE);
            streams.insert(id, tx);
            return (id, rx);
        }
    }

    fn make_stream_with_rx(
        self: &Arc<Self>,
        stream_id: u64,
        peer: DestinationId,
        rx: mpsc::Receiver<Vec<u8>>,
    ) -> Stream {
        Stream {
            sender: StreamSender {
                id: stream_id,
                local: self.keys.id(),
                peer,
                engine: self.engine.clone(),
                gateway: Arc::downgrade(self),
                seq: 0,
                closed: false,
            },
            receiver: StreamReceiver { rx },
        }
    }

    fn deregister(&self, stream_id: u64) {
        self.streams
            .lock()
            .expect("stream map lock")
            .remove(&stream_id);
    }
}

// ============================================================================
// Streams
// ============================================================================

/// One bidirectional byte stream between two destinations.
pub struct Stream {
    sender: StreamSender,
    receiver: StreamReceiver,
}

impl Stream {
    #[inline]
    pub fn id(&self) -> u64 {
        self.sender.id
    }

    #[inline]
    pub fn peer(&self) -> DestinationId {
        self.sender.peer
    }

    pub async fn send(&mut self, data: &[u8]) -> Result<(), StreamSendError> {
        self.sender.send(data).await
    }

    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.receiver.recv().await
    }

    pub async fn close(mut self) {
        self.sender.close().await;
    }

    /// Split for concurrent pumping in both directions.
    pub fn into_split(self) -> (StreamSender, StreamReceiver) {
        (self.sender, self.receiver)
    }
}

/// Write half of a stream. Chunks data into frames and numbers them.
pub struct StreamSender {
    id: u64,
    local: DestinationId,
    peer: DestinationId,
    engine: TunnelEngine,
    gateway: std::sync::Weak<GatewayInner>,
    seq: u64,
    closed: bool,
}

impl StreamSender {
    pub async fn send(&mut self, data: &[u8]) -> Result<(), StreamSendError> {
        for chunk in data.chunks(STREAM_CHUNK) {
            let frame = StreamFrame::Data {
                stream_id: self.id,
                seq: self.seq,
                payload: chunk.to_vec(),
            };
            self.engine.send_frame(self.local, self.peer, frame).await?;
            self.seq += 1;
        }
        Ok(())
    }

    /// Send a close frame and drop the local bookkeeping. Errors on the
    /// close frame are ignored; the peer's state times out with its tunnels.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self
            .engine
            .send_frame(
                self.local,
                self.peer,
                StreamFrame::Close { stream_id: self.id },
            )
            .await;
        if let Some(gateway) = self.gateway.upgrade() {
            gateway.deregister(self.id);
        }
    }
}

/// Read half of a stream. Yields payloads in inbound-tunnel delivery order;
/// `None` after the peer closed.
pub struct StreamReceiver {
    rx: mpsc::Receiver<Vec<u8>>,
}

impl StreamReceiver {
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }
}

// ============================================================================
// Host Parsing
// ============================================================================

/// Parse a proxy hostname into a destination id.
///
/// Accepts the 64-hex-digit destination id, optionally suffixed `.allium`.
/// Everything else (clearnet names, IPs) yields `None` and is refused.
pub fn parse_destination_host(host: &str) -> Option<DestinationId> {
    let host = host.trim().trim_end_matches('.').to_ascii_lowercase();
    let name = host.strip_suffix(".allium").unwrap_or(&host);
    if name.len() != 64 || !name.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let mut bytes = [0u8; 32];
    hex::decode_to_slice(name, &mut bytes).ok()?;
    Some(DestinationId::from_bytes(bytes))
}

/// Split `host:port` into its parts; the port defaults when absent.
fn split_host_port(target: &str, default_port: u16) -> (String, u16) {
    match target.rsplit_once(':') {
        Some((host, port)) => match port.parse() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (target.to_string(), default_port),
        },
        None => (target.to_string(), default_port),
    }
}

// ============================================================================
// HTTP Proxy
// ============================================================================

/// HTTP proxy: CONNECT for arbitrary byte streams, absolute-form requests
/// rewritten to origin form and forwarded over a stream.
pub struct HttpProxy {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

impl HttpProxy {
    pub async fn bind(addr: SocketAddr, gateway: StreamGateway) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("http proxy could not bind {}", addr))?;
        let addr = listener.local_addr()?;
        info!(%addr, "http proxy listening");
        let task = tokio::spawn(accept_loop(listener, gateway, serve_http_client));
        Ok(Self { addr, task })
    }

    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting and abort in-flight client connections. Tunnels are
    /// untouched; they expire with their pool.
    pub async fn stop(self) {
        self.task.abort();
        let _ = self.task.await;
    }
}

/// SOCKS5 proxy, CONNECT only, no authentication.
pub struct SocksProxy {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

impl SocksProxy {
    pub async fn bind(addr: SocketAddr, gateway: StreamGateway) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("socks proxy could not bind {}", addr))?;
        let addr = listener.local_addr()?;
        info!(%addr, "socks proxy listening");
        let task = tokio::spawn(accept_loop(listener, gateway, serve_socks_client));
        Ok(Self { addr, task })
    }

    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn stop(self) {
        self.task.abort();
        let _ = self.task.await;
    }
}

/// Shared accept loop. Client tasks live in a JoinSet, so aborting the loop
/// aborts every client with it.
async fn accept_loop<F, Fut>(listener: TcpListener, gateway: StreamGateway, serve: F)
where
    F: Fn(TcpStream, StreamGateway) -> Fut + Copy + Send + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    let mut clients: JoinSet<()> = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    let gateway = gateway.clone();
                    clients.spawn(async move {
                        if let Err(err) = serve(socket, gateway).await {
                            debug!(%peer, error = %err, "proxy client ended with error");
                        }
                    });
                }
                Err(err) => {
                    warn!(error = %err, "proxy accept failed");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            },
            Some(_) = clients.join_next(), if !clients.is_empty() => {}
        }
    }
}

/// Read an HTTP request head, bounded. Returns (head, leftover body bytes).
async fn read_request_head(socket: &mut TcpStream) -> Result<(Vec<u8>, Vec<u8>)> {
    const MAX_HEAD: usize = 16 * 1024;
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        if let Some(end) = find_head_end(&buf) {
            let leftover = buf.split_off(end);
            return Ok((buf, leftover));
        }
        if buf.len() > MAX_HEAD {
            bail!("request head too large");
        }
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            bail!("connection closed before request head");
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

async fn refuse_http(socket: &mut TcpStream, status: &str, reason: &str) -> Result<()> {
    let body = format!("{}\n", reason);
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );
    socket.write_all(response.as_bytes()).await?;
    Ok(())
}

async fn serve_http_client(mut socket: TcpStream, gateway: StreamGateway) -> Result<()> {
    let (head, leftover) = read_request_head(&mut socket).await?;
    let head_text = String::from_utf8_lossy(&head).into_owned();
    let Some((method, target)) = parse_request_line(&head_text) else {
        refuse_http(&mut socket, "400 Bad Request", "malformed request line").await?;
        return Ok(());
    };

    if method.eq_ignore_ascii_case("CONNECT") {
        let (host, _port) = split_host_port(&target, 443);
        let Some(dest) = parse_destination_host(&host) else {
            refuse_http(
                &mut socket,
                "403 Forbidden",
                "only overlay destinations are reachable through this proxy",
            )
            .await?;
            return Ok(());
        };
        let stream = match gateway.open_stream(dest).await {
            Ok(stream) => stream,
            Err(err) => {
                debug!(host, error = %err, "connect failed");
                refuse_http(&mut socket, "502 Bad Gateway", "destination unreachable").await?;
                return Ok(());
            }
        };
        socket
            .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .await?;
        pump(socket, stream, leftover).await;
        return Ok(());
    }

    // Absolute-form request: rewrite to origin form and forward
    let Some((host, rewritten)) = rewrite_absolute_request(&head_text) else {
        refuse_http(
            &mut socket,
            "400 Bad Request",
            "expected an absolute-form request or CONNECT",
        )
        .await?;
        return Ok(());
    };
    let Some(dest) = parse_destination_host(&host) else {
        refuse_http(
            &mut socket,
            "403 Forbidden",
            "only overlay destinations are reachable through this proxy",
        )
        .await?;
        return Ok(());
    };
    let stream = match gateway.open_stream(dest).await {
        Ok(stream) => stream,
        Err(err) => {
            debug!(host, error = %err, "request forward failed");
            refuse_http(&mut socket, "502 Bad Gateway", "destination unreachable").await?;
            return Ok(());
        }
    };

    let mut initial = rewritten.into_bytes();
    initial.extend_from_slice(&leftover);
    pump(socket, stream, initial).await;
    Ok(())
}

/// Method and target of the request line.
fn parse_request_line(head: &str) -> Option<(String, String)> {
    let line = head.lines().next()?;
    let mut parts = line.split_whitespace();
    let method = parts.next()?.to_string();
    let target = parts.next()?.to_string();
    parts.next()?; // version must be present
    Some((method, target))
}

/// Rewrite an absolute-form request head to origin form.
///
/// Returns the target host and the rewritten head. Hop-by-hop proxy headers
/// are dropped, the Host header is forced to the target.
fn rewrite_absolute_request(head: &str) -> Option<(String, String)> {
    let mut lines = head.split("\r\n");
    let request_line = lines.next()?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?;
    let target = parts.next()?;
    let version = parts.next()?;

    let rest = target.strip_prefix("http://")?;
    let (authority, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    };
    let (host, _port) = split_host_port(authority, 80);

    let mut out = format!("{} {} {}\r\n", method, path, version);
    out.push_str(&format!("Host: {}\r\n", authority));
    for line in lines {
        if line.is_empty() {
            break;
        }
        let lower = line.to_ascii_lowercase();
        if lower.starts_with("host:")
            || lower.starts_with("proxy-connection:")
            || lower.starts_with("proxy-authorization:")
        {
            continue;
        }
        out.push_str(line);
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    Some((host, out))
}

// ============================================================================
// SOCKS5
// ============================================================================

const SOCKS_VERSION: u8 = 5;
const SOCKS_NO_AUTH: u8 = 0;
const SOCKS_NO_ACCEPTABLE: u8 = 0xFF;
const SOCKS_CMD_CONNECT: u8 = 1;

const SOCKS_REPLY_OK: u8 = 0;
const SOCKS_REPLY_NOT_ALLOWED: u8 = 2;
const SOCKS_REPLY_HOST_UNREACHABLE: u8 = 4;
const SOCKS_REPLY_REFUSED: u8 = 5;
const SOCKS_REPLY_CMD_UNSUPPORTED: u8 = 7;

async fn socks_reply(socket: &mut TcpStream, code: u8) -> Result<()> {
    // Bound address is irrelevant for an overlay connect; zeros are fine
    let reply = [SOCKS_VERSION, code, 0, 1, 0, 0, 0, 0, 0, 0];
    socket.write_all(&reply).await?;
    Ok(())
}

async fn serve_socks_client(mut socket: TcpStream, gateway: StreamGateway) -> Result<()> {
    // Greeting
    let mut header = [0u8; 2];
    socket.read_exact(&mut header).await?;
    if header[0] != SOCKS_VERSION {
        bail!("unsupported socks version {}", header[0]);
    }
    let mut methods = vec![0u8; header[1] as usize];
    socket.read_exact(&mut methods).await?;
    if !methods.contains(&SOCKS_NO_AUTH) {
        socket.write_all(&[SOCKS_VERSION, SOCKS_NO_ACCEPTABLE]).await?;
        return Ok(());
    }
    socket.write_all(&[SOCKS_VERSION, SOCKS_NO_AUTH]).await?;

    // Request
    let mut request = [0u8; 4];
    socket.read_exact(&mut request).await?;
    if request[1] != SOCKS_CMD_CONNECT {
        socks_reply(&mut socket, SOCKS_REPLY_CMD_UNSUPPORTED).await?;
        return Ok(());
    }

    let host = match request[3] {
        3 => {
            let mut len = [0u8; 1];
            socket.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            socket.read_exact(&mut name).await?;
            let mut port = [0u8; 2];
            socket.read_exact(&mut port).await?;
            String::from_utf8_lossy(&name).into_owned()
        }
        1 => {
            // Literal IPv4 can never be an overlay destination
            let mut rest = [0u8; 6];
            socket.read_exact(&mut rest).await?;
            socks_reply(&mut socket, SOCKS_REPLY_NOT_ALLOWED).await?;
            return Ok(());
        }
        4 => {
            let mut rest = [0u8; 18];
            socket.read_exact(&mut rest).await?;
            socks_reply(&mut socket, SOCKS_REPLY_NOT_ALLOWED).await?;
            return Ok(());
        }
        other => bail!("unknown socks address type {}", other),
    };

    let Some(dest) = parse_destination_host(&host) else {
        socks_reply(&mut socket, SOCKS_REPLY_NOT_ALLOWED).await?;
        return Ok(());
    };

    let stream = match gateway.open_stream(dest).await {
        Ok(stream) => stream,
        Err(StreamSendError::NoLeaseSet) => {
            socks_reply(&mut socket, SOCKS_REPLY_HOST_UNREACHABLE).await?;
            return Ok(());
        }
        Err(err) => {
            debug!(host, error = %err, "socks connect failed");
            socks_reply(&mut socket, SOCKS_REPLY_REFUSED).await?;
            return Ok(());
        }
    };

    socks_reply(&mut socket, SOCKS_REPLY_OK).await?;
    pump(socket, stream, Vec::new()).await;
    Ok(())
}

// ============================================================================
// Pump
// ============================================================================

/// Copy bytes both ways until either side closes.
async fn pump(socket: TcpStream, stream: Stream, initial: Vec<u8>) {
    let (mut sender, mut receiver) = stream.into_split();
    if !initial.is_empty() {
        if sender.send(&initial).await.is_err() {
            return;
        }
    }

    let (mut rd, mut wr) = socket.into_split();
    let mut buf = vec![0u8; STREAM_CHUNK];
    loop {
        tokio::select! {
            read = rd.read(&mut buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if sender.send(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            },
            data = receiver.recv() => match data {
                Some(bytes) => {
                    if wr.write_all(&bytes).await.is_err() {
                        break;
                    }
                }
                None => {
                    let _ = wr.shutdown().await;
                    break;
                }
            }
        }
    }
    sender.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destination_hosts_parse_with_and_without_suffix() {
        let id = DestinationKeys::generate().id();
        let hex = id.to_hex();

        assert_eq!(parse_destination_host(&hex), Some(id));
        assert_eq!(parse_destination_host(&format!("{}.allium", hex)), Some(id));
        assert_eq!(
            parse_destination_host(&format!("{}.ALLIUM", hex.to_uppercase())),
            Some(id)
        );
    }

    #[test]
    fn clearnet_hosts_are_refused() {
        assert_eq!(parse_destination_host("example.com"), None);
        assert_eq!(parse_destination_host("192.0.2.1"), None);
        assert_eq!(parse_destination_host(""), None);
        // Right length, wrong alphabet
        assert_eq!(parse_destination_host(&"g".repeat(64)), None);
        // Wrong length
        assert_eq!(parse_destination_host(&"a".repeat(63)), None);
    }

    #[test]
    fn host_port_splitting() {
        assert_eq!(split_host_port("host:8080", 80), ("host".to_string(), 8080));
        assert_eq!(split_host_port("host", 80), ("host".to_string(), 80));
        assert_eq!(
            split_host_port("host:notaport", 80),
            ("host:notaport".to_string(), 80)
        );
    }

    #[test]
    fn request_line_parsing() {
        assert_eq!(
            parse_request_line("CONNECT abc:443 HTTP/1.1\r\n\r\n"),
            Some(("CONNECT".to_string(), "abc:443".to_string()))
        );
        assert_eq!(parse_request_line("GARBAGE\r\n"), None);
    }

    #[test]
    fn absolute_form_is_rewritten_to_origin_form() {
        let hex = "a".repeat(64);
        let head = format!(
            "GET http://{}.allium/index.html HTTP/1.1\r\nHost: ignored\r\nProxy-Connection: keep-alive\r\nAccept: */*\r\n\r\n",
            hex
        );
        let (host, rewritten) = rewrite_absolute_request(&head).expect("rewrites");

        assert_eq!(host, format!("{}.allium", hex));
        assert!(rewritten.starts_with("GET /index.html HTTP/1.1\r\n"));
        assert!(rewritten.contains(&format!("Host: {}.allium\r\n", hex)));
        assert!(!rewritten.to_ascii_lowercase().contains("proxy-connection"));
        assert!(rewritten.contains("Accept: */*\r\n"));
        assert!(rewritten.ends_with("\r\n\r\n"));
    }

    #[test]
    fn absolute_form_without_path_gets_root() {
        let hex = "b".repeat(64);
        let head = format!("GET http://{} HTTP/1.1\r\n\r\n", hex);
        let (host, rewritten) = rewrite_absolute_request(&head).expect("rewrites");
        assert_eq!(host, hex);
        assert!(rewritten.starts_with("GET / HTTP/1.1\r\n"));
    }

    #[test]
    fn non_absolute_target_is_rejected() {
        assert!(rewrite_absolute_request("GET /local HTTP/1.1\r\n\r\n").is_none());
        assert!(rewrite_absolute_request("GET https://x/ HTTP/1.1\r\n\r\n").is_none());
    }

    #[test]
    fn head_end_detection() {
        assert_eq!(find_head_end(b"GET / HTTP/1.1\r\n\r\nbody"), Some(18));
        assert_eq!(find_head_end(b"partial\r\n"), None);
    }
}
