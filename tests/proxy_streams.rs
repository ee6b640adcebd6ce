//! Integration tests for the stream gateway and the local proxies: streams
//! over real tunnels, SOCKS5 and HTTP CONNECT end to end, and clearnet
//! refusal.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use allium::garlic::MessageSwitch;
use allium::identity::{RouterKeys, CAP_REACHABLE, CAP_TRANSIT};
use allium::netdb::{AnyPeer, NetDb};
use allium::proxy::{HttpProxy, SocksProxy, StreamGateway};
use allium::transport::Transport;
use allium::tunnel::{TunnelConfig, TunnelEngine};

const READY_TIMEOUT: Duration = Duration::from_secs(60);
const IO_TIMEOUT: Duration = Duration::from_secs(20);

struct TestNode {
    keys: Arc<RouterKeys>,
    netdb: NetDb,
    transport: Transport,
    engine: TunnelEngine,
}

impl TestNode {
    fn id(&self) -> allium::RouterId {
        self.keys.id()
    }
}

fn fast_config() -> TunnelConfig {
    TunnelConfig {
        hop_count: 1,
        lifetime: Duration::from_secs(600),
        replacement_margin: Duration::from_secs(120),
        build_timeout: Duration::from_secs(5),
        build_retries: 2,
        pool_size: 1,
        max_transit: 64,
    }
}

async fn spawn_node() -> TestNode {
    let keys = Arc::new(RouterKeys::generate());
    let netdb = NetDb::new(keys.id(), 3600, Arc::new(AnyPeer));
    let transport = Transport::bind(
        "127.0.0.1:0".parse().unwrap(),
        &keys,
        Vec::new(),
        CAP_TRANSIT | CAP_REACHABLE,
        netdb.clone(),
        Duration::from_secs(60),
    )
    .await
    .expect("transport bind");
    let engine = TunnelEngine::new(keys.clone(), fast_config(), netdb.clone(), transport.clone());
    MessageSwitch::spawn(transport.clone(), netdb.clone(), engine.clone())
        .await
        .expect("switch claims the inbound queue");
    TestNode {
        keys,
        netdb,
        transport,
        engine,
    }
}

async fn introduce(nodes: &[&TestNode]) {
    for a in nodes {
        for b in nodes {
            if a.id() != b.id() {
                a.netdb
                    .store_router_info(b.transport.local_info().clone())
                    .await
                    .expect("descriptor accepted");
            }
        }
    }
}

/// Client-side and server-side gateways on two nodes, pools ready, plus a
/// third node so the mesh has a dedicated hop.
async fn gateway_pair() -> (TestNode, TestNode, TestNode, StreamGateway, StreamGateway) {
    let a = spawn_node().await;
    let b = spawn_node().await;
    let s = spawn_node().await;
    introduce(&[&a, &b, &s]).await;
    a.transport.connect(s.id()).await.expect("dial server");

    let client_dest = a.engine.create_destination().await.expect("client dest");
    let server_dest = s.engine.create_destination().await.expect("server dest");

    timeout(READY_TIMEOUT, client_dest.ready())
        .await
        .expect("client pool in time")
        .expect("client pool ready");
    timeout(READY_TIMEOUT, server_dest.ready())
        .await
        .expect("server pool in time")
        .expect("server pool ready");

    (
        a,
        b,
        s,
        StreamGateway::new(client_dest),
        StreamGateway::new(server_dest),
    )
}

/// Accept streams forever and echo every payload back.
fn spawn_echo(gateway: StreamGateway) {
    tokio::spawn(async move {
        while let Some(stream) = gateway.accept().await {
            tokio::spawn(async move {
                let (mut tx, mut rx) = stream.into_split();
                while let Some(bytes) = rx.recv().await {
                    if tx.send(&bytes).await.is_err() {
                        break;
                    }
                }
                tx.close().await;
            });
        }
    });
}

async fn read_exact_timeout(socket: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    timeout(IO_TIMEOUT, socket.read_exact(&mut buf))
        .await
        .expect("read in time")
        .expect("read succeeds");
    buf
}

#[tokio::test]
async fn gateway_streams_roundtrip_and_close() {
    let (_a, _b, _s, client_gw, server_gw) = gateway_pair().await;
    let server_id = server_gw.local_id();

    let mut stream = timeout(IO_TIMEOUT, client_gw.open_stream(server_id))
        .await
        .expect("open in time")
        .expect("stream opens");

    let mut accepted = timeout(IO_TIMEOUT, server_gw.accept())
        .await
        .expect("accept in time")
        .expect("inbound stream");
    assert_eq!(accepted.peer(), client_gw.local_id());
    assert_eq!(accepted.id(), stream.id());

    stream.send(b"hello").await.expect("client sends");
    let got = timeout(IO_TIMEOUT, accepted.recv())
        .await
        .expect("server recv in time")
        .expect("server receives");
    assert_eq!(got, b"hello");

    accepted.send(b"world").await.expect("server replies");
    let reply = timeout(IO_TIMEOUT, stream.recv())
        .await
        .expect("client recv in time")
        .expect("client receives");
    assert_eq!(reply, b"world");

    // Close travels as a frame and ends the remote read side
    stream.close().await;
    let end = timeout(IO_TIMEOUT, accepted.recv())
        .await
        .expect("close in time");
    assert!(end.is_none(), "peer close ends the stream");
}

#[tokio::test]
async fn socks5_connect_echoes_end_to_end() {
    let (_a, _b, _s, client_gw, server_gw) = gateway_pair().await;
    let server_hex = server_gw.local_id().to_hex();
    spawn_echo(server_gw);

    let proxy = SocksProxy::bind("127.0.0.1:0".parse().unwrap(), client_gw)
        .await
        .expect("socks bind");
    let mut socket = TcpStream::connect(proxy.local_addr()).await.expect("tcp");

    // Greeting: version 5, one method, no-auth
    socket.write_all(&[5, 1, 0]).await.unwrap();
    assert_eq!(read_exact_timeout(&mut socket, 2).await, vec![5, 0]);

    // CONNECT to the destination by hostname
    let host = format!("{}.allium", server_hex);
    let mut request = vec![5, 1, 0, 3, host.len() as u8];
    request.extend_from_slice(host.as_bytes());
    request.extend_from_slice(&80u16.to_be_bytes());
    socket.write_all(&request).await.unwrap();

    let reply = read_exact_timeout(&mut socket, 10).await;
    assert_eq!(reply[0], 5);
    assert_eq!(reply[1], 0, "connect must succeed");

    socket.write_all(b"echo me").await.unwrap();
    assert_eq!(read_exact_timeout(&mut socket, 7).await, b"echo me");

    proxy.stop().await;
}

#[tokio::test]
async fn http_connect_echoes_end_to_end() {
    let (_a, _b, _s, client_gw, server_gw) = gateway_pair().await;
    let server_hex = server_gw.local_id().to_hex();
    spawn_echo(server_gw);

    let proxy = HttpProxy::bind("127.0.0.1:0".parse().unwrap(), client_gw)
        .await
        .expect("http bind");
    let mut socket = TcpStream::connect(proxy.local_addr()).await.expect("tcp");

    let connect = format!("CONNECT {}.allium:443 HTTP/1.1\r\nHost: x\r\n\r\n", server_hex);
    socket.write_all(connect.as_bytes()).await.unwrap();

    // Read the response head
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        timeout(IO_TIMEOUT, socket.read_exact(&mut byte))
            .await
            .expect("head in time")
            .expect("head read");
        head.push(byte[0]);
        assert!(head.len() < 4096, "response head too large");
    }
    let head = String::from_utf8_lossy(&head);
    assert!(head.starts_with("HTTP/1.1 200"), "got: {}", head);

    socket.write_all(b"tunnel bytes").await.unwrap();
    assert_eq!(read_exact_timeout(&mut socket, 12).await, b"tunnel bytes");

    proxy.stop().await;
}

#[tokio::test]
async fn http_proxy_refuses_clearnet() {
    // Refusal happens before any tunnel work, so an isolated node suffices
    let lonely = spawn_node().await;
    let dest = lonely.engine.create_destination().await.expect("dest");
    let gateway = StreamGateway::new(dest);

    let proxy = HttpProxy::bind("127.0.0.1:0".parse().unwrap(), gateway)
        .await
        .expect("http bind");
    let mut socket = TcpStream::connect(proxy.local_addr()).await.expect("tcp");

    socket
        .write_all(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n")
        .await
        .unwrap();
    let mut response = Vec::new();
    timeout(IO_TIMEOUT, socket.read_to_end(&mut response))
        .await
        .expect("response in time")
        .expect("response read");
    let response = String::from_utf8_lossy(&response);
    assert!(response.starts_with("HTTP/1.1 403"), "got: {}", response);

    proxy.stop().await;
}

#[tokio::test]
async fn socks_proxy_refuses_clearnet_and_ip_literals() {
    let lonely = spawn_node().await;
    let dest = lonely.engine.create_destination().await.expect("dest");
    let gateway = StreamGateway::new(dest);

    let proxy = SocksProxy::bind("127.0.0.1:0".parse().unwrap(), gateway)
        .await
        .expect("socks bind");

    // Clearnet hostname
    let mut socket = TcpStream::connect(proxy.local_addr()).await.expect("tcp");
    socket.write_all(&[5, 1, 0]).await.unwrap();
    assert_eq!(read_exact_timeout(&mut socket, 2).await, vec![5, 0]);
    let host = b"example.com";
    let mut request = vec![5, 1, 0, 3, host.len() as u8];
    request.extend_from_slice(host);
    request.extend_from_slice(&443u16.to_be_bytes());
    socket.write_all(&request).await.unwrap();
    let reply = read_exact_timeout(&mut socket, 10).await;
    assert_eq!(reply[1], 2, "clearnet hostname must be refused");

    // IPv4 literal
    let mut socket = TcpStream::connect(proxy.local_addr()).await.expect("tcp");
    socket.write_all(&[5, 1, 0]).await.unwrap();
    assert_eq!(read_exact_timeout(&mut socket, 2).await, vec![5, 0]);
    socket
        .write_all(&[5, 1, 0, 1, 192, 0, 2, 1, 1, 187])
        .await
        .unwrap();
    let reply = read_exact_timeout(&mut socket, 10).await;
    assert_eq!(reply[1], 2, "ip literals must be refused");

    proxy.stop().await;
}
