//! Stacking handshakes to traverse several proxies on one connection.
//!
//! Hop N's first frames are queued by hop N-1's pending-write queue and
//! released exactly when hop N-1's tunnel comes up, so the handshakes
//! sequence themselves through ordering alone; there is no explicit
//! handoff between layers.

use std::io;

use gangway_http::BasicAuth;
use gangway_types::{TargetAddr, ToTargetAddr, UserId, UserPass};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::handshaker::{Handshaker, HttpConnectHandshaker, Socks4Handshaker, Socks5Handshaker};
use crate::stream::{HandshakeConfig, HandshakeStream};

pub trait AsyncReadWrite: AsyncRead + AsyncWrite {}

impl<T> AsyncReadWrite for T where T: AsyncRead + AsyncWrite {}

/// Type-erased stream, so a chain of arbitrary length has one type.
pub type BoxedStream = Box<dyn AsyncReadWrite + Unpin + Send>;

#[derive(Debug, Clone)]
pub enum ProxyProtocol {
    Socks4 { user_id: UserId },
    Socks5 { auth: Option<UserPass> },
    Http { auth: Option<BasicAuth> },
}

/// One hop of a proxy chain.
#[derive(Debug, Clone)]
pub struct ProxyStep {
    pub protocol: ProxyProtocol,
    pub proxy: TargetAddr,
}

impl ProxyStep {
    pub fn socks4(proxy: impl ToTargetAddr, user_id: UserId) -> io::Result<Self> {
        Ok(Self {
            protocol: ProxyProtocol::Socks4 { user_id },
            proxy: proxy.to_target_addr()?,
        })
    }

    pub fn socks5(proxy: impl ToTargetAddr, auth: Option<UserPass>) -> io::Result<Self> {
        Ok(Self {
            protocol: ProxyProtocol::Socks5 { auth },
            proxy: proxy.to_target_addr()?,
        })
    }

    pub fn http(proxy: impl ToTargetAddr, auth: Option<BasicAuth>) -> io::Result<Self> {
        Ok(Self {
            protocol: ProxyProtocol::Http { auth },
            proxy: proxy.to_target_addr()?,
        })
    }

    fn into_handshaker(self, target: TargetAddr) -> io::Result<Box<dyn Handshaker>> {
        let Self { protocol, proxy } = self;
        Ok(match protocol {
            ProxyProtocol::Socks4 { user_id } => Box::new(Socks4Handshaker::new(proxy, target, user_id)?),
            ProxyProtocol::Socks5 { auth } => Box::new(Socks5Handshaker::new(proxy, target, auth)?),
            ProxyProtocol::Http { auth } => Box::new(HttpConnectHandshaker::new(proxy, target, auth)?),
        })
    }
}

/// Stacks one [`HandshakeStream`] per hop over `stream`, which must already
/// be connected to the first hop's proxy.
///
/// Each hop tunnels to the next hop's proxy address; the last hop tunnels
/// to `dest`. Nothing is sent until the returned stream is polled (or
/// [`ready`](HandshakeStream::ready) is awaited), and every hop runs its
/// own connect timeout from that first poll.
pub fn chain<S>(
    stream: S,
    steps: Vec<ProxyStep>,
    dest: impl ToTargetAddr,
    config: HandshakeConfig,
) -> io::Result<HandshakeStream<BoxedStream>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let dest = dest.to_target_addr()?;

    if steps.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty proxy chain"));
    }

    // Hop i tunnels to hop i+1's proxy; the last hop to the destination.
    let mut targets: Vec<TargetAddr> = steps.iter().skip(1).map(|step| step.proxy.clone()).collect();
    targets.push(dest);

    let mut hops = steps.into_iter().zip(targets);
    let (last_step, last_target) = hops.next_back().expect("chain length checked above");

    let mut current: BoxedStream = Box::new(stream);
    for (step, target) in hops {
        let handshaker = step.into_handshaker(target)?;
        current = Box::new(HandshakeStream::new(current, handshaker, config));
    }

    Ok(HandshakeStream::new(current, last_step.into_handshaker(last_target)?, config))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

    use super::*;

    #[test]
    fn empty_chain_is_rejected() {
        let (client_io, _server_io) = tokio::io::duplex(64);
        let err = chain(client_io, Vec::new(), "example.com:443", HandshakeConfig::default()).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn steps_target_the_next_hop() {
        let (client_io, _server_io) = tokio::io::duplex(64);

        let steps = vec![
            ProxyStep::socks5("10.0.0.1:1080", None).unwrap(),
            ProxyStep::http("10.0.0.2:8080", None).unwrap(),
        ];

        let outer = chain(client_io, steps, "example.com:443", HandshakeConfig::default()).unwrap();

        // The outermost layer is the last hop, tunneling to the final
        // destination through everything beneath it.
        assert_eq!(outer.protocol(), "http");
        assert_eq!(outer.proxy_addr().to_string(), "10.0.0.2:8080");
        assert_eq!(outer.dest_addr().to_string(), "example.com:443");
    }
}
