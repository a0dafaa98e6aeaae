//! End-to-end flows: client orchestrator against the server-side acceptors,
//! including a two-hop chain on a single connection.

#![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use gangway_handshake::{HandshakeConfig, HandshakeStream, ProxyStep, chain};
use gangway_http::HttpConnectAcceptor;
use gangway_socks::{Socks4Acceptor, Socks5Acceptor, Socks5AcceptorConfig};
use gangway_types::{UserId, UserPass};
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _, ReadBuf, duplex};

/// Serves bytes an acceptor had already buffered before handing back the
/// stream, then reads from the stream itself.
struct Rewound<S> {
    leftover: Bytes,
    inner: S,
}

impl<S> Rewound<S> {
    fn new(leftover: Bytes, inner: S) -> Self {
        Self { leftover, inner }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Rewound<S> {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        if !self.leftover.is_empty() {
            let n = core::cmp::min(buf.remaining(), self.leftover.len());
            let chunk = self.leftover.split_to(n);
            buf.put_slice(&chunk);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Rewound<S> {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<Result<usize, io::Error>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

fn no_timeout() -> HandshakeConfig {
    HandshakeConfig { connect_timeout: None }
}

#[tokio::test]
async fn socks5_client_against_acceptor() {
    let (client_io, server_io) = duplex(4096);

    let server = tokio::spawn(async move {
        let acceptor = Socks5Acceptor::accept(server_io).await.unwrap();
        assert!(acceptor.is_connect_command());
        assert_eq!(acceptor.dest_addr().to_string(), "example.com:443");

        let (stream, leftover) = acceptor.granted("0.0.0.0:0".parse().unwrap()).await.unwrap();
        let mut stream = Rewound::new(leftover, stream);

        let mut payload = [0u8; 5];
        stream.read_exact(&mut payload).await.unwrap();
        assert_eq!(&payload, b"hello");
        stream.write_all(b"world").await.unwrap();
    });

    let mut client = HandshakeStream::socks5(client_io, "10.0.0.1:1080", "example.com:443", None, no_timeout()).unwrap();

    client.write_all(b"hello").await.unwrap();
    client.flush().await.unwrap();

    let mut reply = [0u8; 5];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"world");

    server.await.unwrap();
}

#[tokio::test]
async fn socks5_password_client_against_acceptor() {
    let (client_io, server_io) = duplex(4096);

    let server = tokio::spawn(async move {
        let conf = Socks5AcceptorConfig {
            no_auth_required: false,
            users: Some(vec![UserPass::new("alice", "hunter2").unwrap()]),
        };
        let acceptor = Socks5Acceptor::accept_with_config(server_io, &conf).await.unwrap();
        acceptor.granted("0.0.0.0:0".parse().unwrap()).await.unwrap();
    });

    let creds = UserPass::new("alice", "hunter2").unwrap();
    let mut client =
        HandshakeStream::socks5(client_io, "10.0.0.1:1080", "example.com:443", Some(creds), no_timeout()).unwrap();
    client.ready().await.unwrap();
    assert!(client.is_established());

    server.await.unwrap();
}

#[tokio::test]
async fn socks4a_request_decoded_across_dribbled_writes() {
    let (mut client_io, server_io) = duplex(4096);

    let server = tokio::spawn(async move {
        let acceptor = Socks4Acceptor::accept(server_io).await.unwrap();
        assert_eq!(acceptor.user_id(), "alice");
        assert_eq!(acceptor.dest_addr().to_string(), "example.com:1080");
        acceptor
            .granted("0.0.0.0:0".parse().unwrap())
            .await
            .unwrap();
    });

    // Fixed header and part of the user-id, then the rest of the user-id,
    // then the 4a domain: the decoder suspends and resumes per field.
    let request: &[u8] = &[
        4, 1, 0x04, 0x38, 0, 0, 0, 7, b'a', b'l', b'i', b'c', b'e', 0, b'e', b'x', b'a', b'm', b'p', b'l', b'e', b'.',
        b'c', b'o', b'm', 0,
    ];
    for part in [&request[..10], &request[10..16], &request[16..]] {
        client_io.write_all(part).await.unwrap();
        client_io.flush().await.unwrap();
        tokio::task::yield_now().await;
    }

    let mut reply = [0u8; 8];
    client_io.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply[..2], &[0, 90]);

    server.await.unwrap();
}

#[tokio::test]
async fn two_hop_chain_over_one_connection() {
    let (client_io, server_io) = duplex(4096);

    // The "network": hop 1 is a SOCKS5 proxy, and whatever it tunnels to is
    // hop 2, an HTTP CONNECT proxy, both speaking over the same duplex pipe.
    let server = tokio::spawn(async move {
        let socks = Socks5Acceptor::accept(server_io).await.unwrap();
        // Hop 1 is asked to reach hop 2's proxy address.
        assert_eq!(socks.dest_addr().to_string(), "10.0.0.2:8080");
        let (stream, leftover) = socks.granted("0.0.0.0:0".parse().unwrap()).await.unwrap();

        let http = HttpConnectAcceptor::accept(Rewound::new(leftover, stream)).await.unwrap();
        assert_eq!(http.dest_addr().to_string(), "example.com:443");
        let (stream, leftover) = http.granted().await.unwrap();
        let mut stream = Rewound::new(leftover, stream);

        let mut payload = [0u8; 4];
        stream.read_exact(&mut payload).await.unwrap();
        assert_eq!(&payload, b"ping");
        stream.write_all(b"pong").await.unwrap();
    });

    let steps = vec![
        ProxyStep::socks5("10.0.0.1:1080", None).unwrap(),
        ProxyStep::http("10.0.0.2:8080", None).unwrap(),
    ];
    let mut client = chain(client_io, steps, "example.com:443", no_timeout()).unwrap();

    // Issued before any handshake completed; released through both queues.
    client.write_all(b"ping").await.unwrap();
    client.flush().await.unwrap();

    let mut reply = [0u8; 4];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"pong");

    server.await.unwrap();
}

#[tokio::test]
async fn http_connect_over_loopback_tcp() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let proxy_addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let acceptor = HttpConnectAcceptor::accept(socket).await.unwrap();
        assert_eq!(acceptor.dest_addr().to_string(), "example.com:80");
        let (stream, leftover) = acceptor.granted().await.unwrap();
        let mut stream = Rewound::new(leftover, stream);

        let mut payload = [0u8; 3];
        stream.read_exact(&mut payload).await.unwrap();
        assert_eq!(&payload, b"GET");
    });

    let socket = tokio::net::TcpStream::connect(proxy_addr).await.unwrap();
    let mut client =
        HandshakeStream::http_connect(socket, proxy_addr, "example.com:80", None, HandshakeConfig::default()).unwrap();
    client.ready().await.unwrap();
    client.write_all(b"GET").await.unwrap();
    client.flush().await.unwrap();

    server.await.unwrap();
}

#[tokio::test]
async fn socks4_rejection_surfaces_user_id_context() {
    let (client_io, server_io) = duplex(4096);

    let server = tokio::spawn(async move {
        let acceptor = Socks4Acceptor::accept(server_io).await.unwrap();
        acceptor.rejected(gangway_socks::socks4::Socks4Status::Rejected).await.unwrap();
    });

    let mut client = HandshakeStream::socks4(
        client_io,
        "10.0.0.1:1080",
        "192.168.0.1:80",
        UserId::new("bob").unwrap(),
        no_timeout(),
    )
    .unwrap();

    let err = client.ready().await.unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    let message = err.to_string();
    assert!(message.starts_with("socks4, none, 10.0.0.1:1080 => 192.168.0.1:80"), "{message}");

    server.await.unwrap();
}
