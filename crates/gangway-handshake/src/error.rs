use core::fmt;
use std::io;
use std::sync::Arc;

use gangway_types::{DecodeError, TargetAddr};

/// What went wrong during a handshake attempt.
#[derive(Debug)]
#[non_exhaustive]
pub enum FailureKind {
    /// The peer sent a frame that could not be decoded.
    Decode(DecodeError),
    /// The proxy refused the tunnel; `detail` carries the peer-supplied
    /// context (status code, auth status), `headers` any response headers.
    Rejected {
        detail: String,
        headers: Vec<(String, String)>,
    },
    /// No completion within the configured window.
    Timeout,
    /// The peer closed the connection before the handshake completed.
    Disconnected,
    /// Underlying transport failure.
    Io(io::Error),
}

impl FailureKind {
    pub fn rejected(detail: impl Into<String>) -> Self {
        FailureKind::Rejected {
            detail: detail.into(),
            headers: Vec::new(),
        }
    }

    fn io_error_kind(&self) -> io::ErrorKind {
        match self {
            FailureKind::Decode(_) => io::ErrorKind::InvalidData,
            FailureKind::Rejected { .. } => io::ErrorKind::ConnectionRefused,
            FailureKind::Timeout => io::ErrorKind::TimedOut,
            FailureKind::Disconnected => io::ErrorKind::UnexpectedEof,
            FailureKind::Io(cause) => cause.kind(),
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Decode(cause) => cause.fmt(f),
            FailureKind::Rejected { detail, .. } => detail.fmt(f),
            FailureKind::Timeout => write!(f, "timeout"),
            FailureKind::Disconnected => write!(f, "disconnected"),
            FailureKind::Io(cause) => cause.fmt(f),
        }
    }
}

/// Terminal failure of one handshake attempt.
///
/// The message always names the protocol, the authentication scheme, the
/// proxy and the destination, so a failure deep inside a chain can be
/// attributed to its hop.
#[derive(Debug)]
pub struct HandshakeFailure {
    protocol: &'static str,
    auth_scheme: &'static str,
    proxy: TargetAddr,
    dest: TargetAddr,
    kind: FailureKind,
}

impl HandshakeFailure {
    pub(crate) fn new(
        protocol: &'static str,
        auth_scheme: &'static str,
        proxy: TargetAddr,
        dest: TargetAddr,
        kind: FailureKind,
    ) -> Self {
        Self {
            protocol,
            auth_scheme,
            proxy,
            dest,
            kind,
        }
    }

    pub fn protocol(&self) -> &'static str {
        self.protocol
    }

    pub fn auth_scheme(&self) -> &'static str {
        self.auth_scheme
    }

    pub fn proxy_addr(&self) -> &TargetAddr {
        &self.proxy
    }

    pub fn dest_addr(&self) -> &TargetAddr {
        &self.dest
    }

    pub fn kind(&self) -> &FailureKind {
        &self.kind
    }

    /// Response headers attached to a rejection, if any.
    pub fn headers(&self) -> &[(String, String)] {
        match &self.kind {
            FailureKind::Rejected { headers, .. } => headers,
            _ => &[],
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.kind, FailureKind::Timeout)
    }
}

impl fmt::Display for HandshakeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}, {}, {} => {}, {}",
            self.protocol, self.auth_scheme, self.proxy, self.dest, self.kind
        )
    }
}

impl std::error::Error for HandshakeFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            FailureKind::Decode(cause) => Some(cause),
            FailureKind::Io(cause) => Some(cause),
            _ => None,
        }
    }
}

impl From<HandshakeFailure> for io::Error {
    fn from(failure: HandshakeFailure) -> Self {
        io::Error::new(failure.kind.io_error_kind(), failure)
    }
}

/// Converts a shared failure into a fresh `io::Error` carrying it.
///
/// Used to replay the same terminal failure from every operation on a
/// failed stream.
pub(crate) fn replay(failure: &Arc<HandshakeFailure>) -> io::Error {
    io::Error::new(failure.kind.io_error_kind(), Arc::clone(failure))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "test code can panic on errors")]

    use super::*;
    use gangway_types::ToTargetAddr as _;

    #[test]
    fn message_carries_full_context() {
        let failure = HandshakeFailure::new(
            "socks5",
            "password",
            "10.0.0.1:1080".to_target_addr().unwrap(),
            "example.com:443".to_target_addr().unwrap(),
            FailureKind::rejected("authStatus: FAILURE"),
        );

        assert_eq!(
            failure.to_string(),
            "socks5, password, 10.0.0.1:1080 => example.com:443, authStatus: FAILURE"
        );
    }
}
