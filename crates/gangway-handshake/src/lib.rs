//! Client-side proxy handshake orchestration.
//!
//! The protocol codecs live in `gangway-socks` and `gangway-http`; this
//! crate sequences them over a byte stream: send the initial message,
//! interpret responses, queue application writes until the tunnel is up,
//! enforce the connect timeout, then get out of the way.

mod chain;
mod error;
mod handshaker;
mod stream;

pub use chain::{AsyncReadWrite, BoxedStream, ProxyProtocol, ProxyStep, chain};
pub use error::{FailureKind, HandshakeFailure};
pub use handshaker::{AUTH_NONE, Handshaker, HttpConnectHandshaker, Progress, Socks4Handshaker, Socks5Handshaker};
pub use stream::{DEFAULT_CONNECT_TIMEOUT, HandshakeConfig, HandshakeStream};
