use std::collections::VecDeque;
use std::future::{Future as _, poll_fn};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Buf as _, Bytes, BytesMut};
use futures_core::ready;
use gangway_http::BasicAuth;
use gangway_types::{TargetAddr, ToTargetAddr, UserId, UserPass};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Sleep;
use tokio_util::io::poll_read_buf;

use crate::error::{FailureKind, HandshakeFailure, replay};
use crate::handshaker::{Handshaker, HttpConnectHandshaker, Progress, Socks4Handshaker, Socks5Handshaker};

/// The default connect timeout: 10 seconds.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy)]
pub struct HandshakeConfig {
    /// Fail the attempt if the tunnel is not up within this window.
    /// `None` disables the timer.
    pub connect_timeout: Option<Duration>,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Some(DEFAULT_CONNECT_TIMEOUT),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    NotStarted,
    AwaitingResponse,
    Succeeded,
    Failed,
}

/// A stream that performs a proxy handshake before passing bytes through.
///
/// The handshake is driven lazily by `poll_read` / `poll_write` /
/// `poll_flush` (or all at once by [`ready`](Self::ready)). Until it
/// completes, application writes are queued and application reads are
/// suppressed; afterwards queued writes are released in submission order and
/// the stream is a transparent tunnel. A failed handshake is terminal: every
/// subsequent operation returns the same cause and the connection should be
/// dropped.
///
/// Several of these can be stacked on one connection to cross multiple
/// proxies: an outer layer's first frames simply sit in the inner layer's
/// pending-write queue until the inner tunnel is up, so ordering alone
/// sequences the handshakes.
#[derive(Debug)]
pub struct HandshakeStream<S> {
    stream: S,
    handshaker: Box<dyn Handshaker>,
    config: HandshakeConfig,
    phase: Phase,
    read_buf: BytesMut,
    write_buf: BytesMut,
    leftover: BytesMut,
    pending_writes: VecDeque<Bytes>,
    flush_requested: bool,
    timeout: Option<Pin<Box<Sleep>>>,
    failure: Option<Arc<HandshakeFailure>>,
}

impl<S> HandshakeStream<S> {
    pub fn new(stream: S, handshaker: Box<dyn Handshaker>, config: HandshakeConfig) -> Self {
        Self {
            stream,
            handshaker,
            config,
            phase: Phase::NotStarted,
            read_buf: BytesMut::new(),
            write_buf: BytesMut::new(),
            leftover: BytesMut::new(),
            pending_writes: VecDeque::new(),
            flush_requested: false,
            timeout: None,
            failure: None,
        }
    }

    /// SOCKS4/4a CONNECT through `proxy`.
    pub fn socks4(
        stream: S,
        proxy: impl ToTargetAddr,
        dest: impl ToTargetAddr,
        user_id: UserId,
        config: HandshakeConfig,
    ) -> io::Result<Self> {
        Ok(Self::new(stream, Box::new(Socks4Handshaker::new(proxy, dest, user_id)?), config))
    }

    /// SOCKS5 CONNECT through `proxy`, with password auth when `auth` is set.
    pub fn socks5(
        stream: S,
        proxy: impl ToTargetAddr,
        dest: impl ToTargetAddr,
        auth: Option<UserPass>,
        config: HandshakeConfig,
    ) -> io::Result<Self> {
        Ok(Self::new(stream, Box::new(Socks5Handshaker::new(proxy, dest, auth)?), config))
    }

    /// HTTP CONNECT through `proxy`, with Basic authorization when `auth` is
    /// set.
    pub fn http_connect(
        stream: S,
        proxy: impl ToTargetAddr,
        dest: impl ToTargetAddr,
        auth: Option<BasicAuth>,
        config: HandshakeConfig,
    ) -> io::Result<Self> {
        Ok(Self::new(stream, Box::new(HttpConnectHandshaker::new(proxy, dest, auth)?), config))
    }

    pub fn protocol(&self) -> &'static str {
        self.handshaker.protocol()
    }

    pub fn proxy_addr(&self) -> &TargetAddr {
        self.handshaker.proxy_addr()
    }

    pub fn dest_addr(&self) -> &TargetAddr {
        self.handshaker.dest_addr()
    }

    /// Address the proxy bound for this tunnel, when reported.
    pub fn bound_addr(&self) -> Option<TargetAddr> {
        self.handshaker.bound_addr()
    }

    pub fn is_established(&self) -> bool {
        self.phase == Phase::Succeeded
    }

    /// Hands back the inner stream and any tunneled bytes that arrived
    /// right behind the handshake frames. Only meaningful after success.
    pub fn into_parts(self) -> (S, Bytes) {
        (self.stream, self.leftover.freeze())
    }
}

impl<S> HandshakeStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Drives the handshake to completion.
    pub async fn ready(&mut self) -> io::Result<()> {
        poll_fn(|cx| self.poll_handshake(cx)).await
    }

    /// Terminal failure transition. A no-op if an outcome was already
    /// reached: whichever terminal transition happens first wins.
    fn fail(&mut self, kind: FailureKind) -> io::Error {
        if let Some(failure) = &self.failure {
            return replay(failure);
        }

        let failure = Arc::new(HandshakeFailure::new(
            self.handshaker.protocol(),
            self.handshaker.auth_scheme(),
            self.handshaker.proxy_addr().clone(),
            self.handshaker.dest_addr().clone(),
            kind,
        ));

        tracing::warn!(%failure, "proxy handshake failed");

        self.phase = Phase::Failed;
        self.timeout = None;
        // Queued writes fail with the same cause; their payload is dropped.
        self.pending_writes.clear();
        self.write_buf.clear();
        self.failure = Some(Arc::clone(&failure));

        replay(&failure)
    }

    fn succeed(&mut self) {
        self.phase = Phase::Succeeded;
        self.timeout = None;

        // Bytes past the final handshake frame are tunneled payload.
        self.leftover = core::mem::take(&mut self.read_buf);

        // Queued application writes now go onto the bare stream, in
        // submission order, ahead of anything written later.
        while let Some(chunk) = self.pending_writes.pop_front() {
            self.write_buf.extend_from_slice(&chunk);
        }

        tracing::debug!(
            protocol = self.handshaker.protocol(),
            proxy = %self.handshaker.proxy_addr(),
            dest = %self.handshaker.dest_addr(),
            "tunnel established"
        );
    }

    /// Polls the connect timer; `Pending` if it has not fired (or is not
    /// armed).
    fn poll_check_timeout(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if let Some(timeout) = &mut self.timeout {
            if timeout.as_mut().poll(cx).is_ready() {
                return Poll::Ready(Err(self.fail(FailureKind::Timeout)));
            }
        }
        Poll::Pending
    }

    fn poll_write_out(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.write_buf.is_empty() {
            let n = ready!(Pin::new(&mut self.stream).poll_write(cx, &self.write_buf))?;
            if n == 0 {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "write zero byte into stream",
                )));
            }
            self.write_buf.advance(n);
        }
        Poll::Ready(Ok(()))
    }

    fn poll_handshake(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        loop {
            match self.phase {
                Phase::Succeeded => return Poll::Ready(Ok(())),
                Phase::Failed => {
                    let failure = self.failure.as_ref().expect("failed phase always carries its failure");
                    return Poll::Ready(Err(replay(failure)));
                }
                Phase::NotStarted => {
                    if let Some(delay) = self.config.connect_timeout {
                        self.timeout = Some(Box::pin(tokio::time::sleep(delay)));
                    }

                    let Self {
                        handshaker, write_buf, ..
                    } = self;
                    if let Err(kind) = handshaker.start(write_buf) {
                        return Poll::Ready(Err(self.fail(kind)));
                    }

                    tracing::trace!(protocol = self.handshaker.protocol(), "handshake started");
                    self.phase = Phase::AwaitingResponse;
                }
                Phase::AwaitingResponse => {
                    // Ship outbound protocol frames before interpreting input.
                    match self.poll_write_out(cx) {
                        Poll::Ready(Ok(())) => {}
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(self.fail(FailureKind::Io(e)))),
                        Poll::Pending => return self.poll_check_timeout(cx),
                    }
                    match Pin::new(&mut self.stream).poll_flush(cx) {
                        Poll::Ready(Ok(())) => {}
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(self.fail(FailureKind::Io(e)))),
                        Poll::Pending => return self.poll_check_timeout(cx),
                    }

                    let Self {
                        handshaker,
                        read_buf,
                        write_buf,
                        ..
                    } = self;
                    match handshaker.advance(read_buf, write_buf) {
                        Err(kind) => return Poll::Ready(Err(self.fail(kind))),
                        Ok(Progress::Established) => {
                            self.succeed();
                        }
                        Ok(Progress::Pending) => {
                            if !self.write_buf.is_empty() {
                                // Next stage message to send.
                                continue;
                            }

                            match poll_read_buf(Pin::new(&mut self.stream), cx, &mut self.read_buf) {
                                Poll::Ready(Ok(0)) => {
                                    return Poll::Ready(Err(self.fail(FailureKind::Disconnected)));
                                }
                                Poll::Ready(Ok(_)) => {}
                                Poll::Ready(Err(e)) => return Poll::Ready(Err(self.fail(FailureKind::Io(e)))),
                                Poll::Pending => return self.poll_check_timeout(cx),
                            }
                        }
                    }
                }
            }
        }
    }
}

impl<S> AsyncRead for HandshakeStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        // Reads are suppressed until the tunnel is up; afterwards the sticky
        // failure (if any) is replayed.
        ready!(this.poll_handshake(cx))?;

        // Push queued writes and a deferred flush along, without blocking
        // the read path on them.
        if !this.write_buf.is_empty() || this.flush_requested {
            match this.poll_write_out(cx) {
                Poll::Ready(Ok(())) => {
                    if this.flush_requested && Pin::new(&mut this.stream).poll_flush(cx)?.is_ready() {
                        this.flush_requested = false;
                    }
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => {}
            }
        }

        // Hand out remaining leftover first, if any.
        if !this.leftover.is_empty() {
            let n = core::cmp::min(buf.remaining(), this.leftover.len());
            buf.put_slice(&this.leftover.split_to(n));
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut this.stream).poll_read(cx, buf)
    }
}

impl<S> AsyncWrite for HandshakeStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<Result<usize, io::Error>> {
        let this = self.get_mut();

        match this.poll_handshake(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => {
                // Accepted into the pending queue; released once the tunnel
                // is up, or failed with the handshake.
                this.pending_writes.push_back(Bytes::copy_from_slice(buf));
                return Poll::Ready(Ok(buf.len()));
            }
        }

        // Earlier queued bytes keep their place in line.
        ready!(this.poll_write_out(cx))?;
        Pin::new(&mut this.stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        let this = self.get_mut();

        match this.poll_handshake(cx) {
            Poll::Ready(Ok(())) => {
                ready!(this.poll_write_out(cx))?;
                this.flush_requested = false;
                Pin::new(&mut this.stream).poll_flush(cx)
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => {
                // Remembered and performed right after the tunnel is up.
                this.flush_requested = true;
                Poll::Pending
            }
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        let this = self.get_mut();

        if this.phase == Phase::Succeeded {
            ready!(this.poll_write_out(cx))?;
        }

        // Shutting down mid-handshake abandons the attempt.
        Pin::new(&mut this.stream).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

    use super::*;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _, DuplexStream, duplex};

    fn no_timeout() -> HandshakeConfig {
        HandshakeConfig { connect_timeout: None }
    }

    async fn serve_socks5_no_auth(mut server: DuplexStream, reply: &[u8]) -> DuplexStream {
        let mut greeting = [0u8; 3];
        server.read_exact(&mut greeting).await.unwrap();
        assert_eq!(greeting, [5, 1, 0]);
        server.write_all(&[5, 0]).await.unwrap();

        let mut command = [0u8; 10];
        server.read_exact(&mut command).await.unwrap();
        assert_eq!(command, [5, 1, 0, 1, 127, 0, 0, 1, 0, 80]);
        server.write_all(reply).await.unwrap();

        server
    }

    #[tokio::test]
    async fn socks5_no_auth_end_to_end() {
        let (client_io, server_io) = duplex(1024);

        let server = tokio::spawn(async move {
            serve_socks5_no_auth(server_io, &[5, 0, 0, 1, 0, 0, 0, 0, 0, 0]).await;
        });

        let mut client =
            HandshakeStream::socks5(client_io, "10.0.0.1:1080", "127.0.0.1:80", None, no_timeout()).unwrap();
        client.ready().await.unwrap();

        assert!(client.is_established());
        assert_eq!(client.dest_addr().to_string(), "127.0.0.1:80");
        assert_eq!(client.bound_addr().unwrap().to_string(), "0.0.0.0:0");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn socks4a_end_to_end() {
        let (client_io, mut server_io) = duplex(1024);

        let server = tokio::spawn(async move {
            let mut request = [0u8; 26];
            server_io.read_exact(&mut request).await.unwrap();
            // 4a marker followed by user-id and domain.
            assert_eq!(&request[..8], &[4, 1, 0x04, 0x38, 0, 0, 0, 1]);
            assert_eq!(&request[8..], b"alice\0example.com\0");
            server_io.write_all(&[0, 90, 0, 80, 10, 0, 0, 1]).await.unwrap();
        });

        let mut client = HandshakeStream::socks4(
            client_io,
            "10.0.0.1:1080",
            "example.com:1080",
            UserId::new("alice").unwrap(),
            no_timeout(),
        )
        .unwrap();
        client.ready().await.unwrap();

        assert_eq!(client.bound_addr().unwrap().to_string(), "10.0.0.1:80");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn http_connect_end_to_end() {
        let (client_io, mut server_io) = duplex(1024);

        let server = tokio::spawn(async move {
            let mut head = Vec::new();
            let mut byte = [0u8; 1];
            while !head.ends_with(b"\r\n\r\n") {
                server_io.read_exact(&mut byte).await.unwrap();
                head.push(byte[0]);
            }
            assert!(head.starts_with(b"CONNECT example.com:443 HTTP/1.1\r\n"));
            server_io.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.unwrap();
        });

        let mut client =
            HandshakeStream::http_connect(client_io, "10.0.0.1:8080", "example.com:443", None, no_timeout()).unwrap();
        client.ready().await.unwrap();

        assert!(client.is_established());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn writes_queued_before_success_are_flushed_fifo() {
        let (client_io, server_io) = duplex(1024);

        let server = tokio::spawn(async move {
            let mut server = serve_socks5_no_auth(server_io, &[5, 0, 0, 1, 0, 0, 0, 0, 0, 0]).await;

            // The queued writes arrive strictly after the handshake frames,
            // in submission order.
            let mut payload = [0u8; 11];
            server.read_exact(&mut payload).await.unwrap();
            assert_eq!(&payload, b"firstsecond");
        });

        let mut client =
            HandshakeStream::socks5(client_io, "10.0.0.1:1080", "127.0.0.1:80", None, no_timeout()).unwrap();

        // Issued while the handshake is still pending: queued, not sent.
        client.write_all(b"first").await.unwrap();
        client.write_all(b"second").await.unwrap();
        assert!(!client.is_established());

        client.ready().await.unwrap();
        client.flush().await.unwrap();

        server.await.unwrap();
    }

    #[tokio::test]
    async fn auth_failure_fails_queued_writes_with_same_cause() {
        let (client_io, mut server_io) = duplex(1024);

        let server = tokio::spawn(async move {
            let mut greeting = [0u8; 4];
            server_io.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [5, 2, 0, 2]);
            server_io.write_all(&[5, 2]).await.unwrap();

            let mut auth = [0u8; 15];
            server_io.read_exact(&mut auth).await.unwrap();
            server_io.write_all(&[1, 1]).await.unwrap();

            server_io
        });

        let creds = UserPass::new("alice", "hunter2").unwrap();
        let mut client =
            HandshakeStream::socks5(client_io, "10.0.0.1:1080", "127.0.0.1:80", Some(creds), no_timeout()).unwrap();

        client.write_all(b"queued").await.unwrap();

        let err = client.ready().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
        assert!(err.to_string().contains("authStatus: FAILURE"), "{err}");

        // The queued write fails with the very same cause, as does anything
        // attempted afterwards.
        let flush_err = client.flush().await.unwrap_err();
        assert!(flush_err.to_string().contains("authStatus: FAILURE"), "{flush_err}");

        let mut buf = [0u8; 1];
        let read_err = client.read_exact(&mut buf).await.unwrap_err();
        assert!(read_err.to_string().contains("authStatus: FAILURE"), "{read_err}");

        drop(server);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fails_the_attempt() {
        let (client_io, _server_io) = duplex(1024);

        let mut client = HandshakeStream::socks5(
            client_io,
            "10.0.0.1:1080",
            "127.0.0.1:80",
            None,
            HandshakeConfig {
                connect_timeout: Some(Duration::from_secs(5)),
            },
        )
        .unwrap();

        let err = client.ready().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(err.to_string().ends_with("timeout"), "{err}");
    }

    #[tokio::test]
    async fn completion_beats_an_already_expired_timer() {
        let (client_io, mut server_io) = duplex(1024);

        // Both replies are buffered before the client ever polls, and the
        // timer is already expired on the first poll: completion is checked
        // first, so exactly one outcome is produced, and it is success.
        server_io.write_all(&[5, 0]).await.unwrap();
        server_io.write_all(&[5, 0, 0, 1, 0, 0, 0, 0, 0, 0]).await.unwrap();

        let mut client = HandshakeStream::socks5(
            client_io,
            "10.0.0.1:1080",
            "127.0.0.1:80",
            None,
            HandshakeConfig {
                connect_timeout: Some(Duration::ZERO),
            },
        )
        .unwrap();

        client.ready().await.unwrap();
        assert!(client.is_established());
    }

    #[tokio::test]
    async fn disconnect_before_completion_is_a_failure() {
        let (client_io, server_io) = duplex(1024);
        drop(server_io);

        let mut client =
            HandshakeStream::socks5(client_io, "10.0.0.1:1080", "127.0.0.1:80", None, no_timeout()).unwrap();

        let err = client.ready().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        assert!(err.to_string().ends_with("disconnected"), "{err}");
    }

    #[tokio::test]
    async fn bytes_behind_the_handshake_pass_through() {
        let (client_io, server_io) = duplex(1024);

        let server = tokio::spawn(async move {
            // Success reply and early tunneled bytes in one burst.
            let mut server = serve_socks5_no_auth(server_io, &[5, 0, 0, 1, 0, 0, 0, 0, 0, 0]).await;
            server.write_all(b"early").await.unwrap();
            server
        });

        let mut client =
            HandshakeStream::socks5(client_io, "10.0.0.1:1080", "127.0.0.1:80", None, no_timeout()).unwrap();
        client.ready().await.unwrap();

        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"early");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn deferred_flush_is_performed_after_success() {
        let (client_io, server_io) = duplex(1024);

        let server = tokio::spawn(async move {
            let mut server = serve_socks5_no_auth(server_io, &[5, 0, 0, 1, 0, 0, 0, 0, 0, 0]).await;
            let mut payload = [0u8; 6];
            server.read_exact(&mut payload).await.unwrap();
            assert_eq!(&payload, b"queued");
        });

        let mut client =
            HandshakeStream::socks5(client_io, "10.0.0.1:1080", "127.0.0.1:80", None, no_timeout()).unwrap();

        client.write_all(b"queued").await.unwrap();
        // The flush blocks until the handshake completes, then the queued
        // write is on the wire.
        client.flush().await.unwrap();
        assert!(client.is_established());

        server.await.unwrap();
    }
}
