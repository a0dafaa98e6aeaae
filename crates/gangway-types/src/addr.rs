use core::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

/// Longest domain name representable on the wire (one-byte length prefix).
pub(crate) const DOMAIN_MAX_LEN: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum AddrError {
    EmptyDomain,
    DomainTooLong { len: usize },
    NotAscii,
    ZeroPort,
    BadFormat { reason: &'static str },
}

impl std::error::Error for AddrError {}

impl fmt::Display for AddrError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddrError::EmptyDomain => write!(f, "domain name is empty"),
            AddrError::DomainTooLong { len } => {
                write!(f, "domain name too long: {len} bytes, max is {DOMAIN_MAX_LEN}")
            }
            AddrError::NotAscii => write!(
                f,
                "domain name contains non-ASCII characters (IDNA-encode it beforehand)"
            ),
            AddrError::ZeroPort => write!(f, "port must be non-zero"),
            AddrError::BadFormat { reason } => write!(f, "bad address format: {reason}"),
        }
    }
}

impl From<AddrError> for io::Error {
    fn from(e: AddrError) -> Self {
        io::Error::new(io::ErrorKind::InvalidInput, e)
    }
}

/// A validated domain name: ASCII-only and at most 255 bytes, so it always
/// fits behind a one-byte length prefix on the wire.
///
/// Internationalized names must be IDNA-encoded (punycode) by the caller
/// before construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DomainName(String);

impl DomainName {
    pub fn new(name: impl Into<String>) -> Result<Self, AddrError> {
        let name = name.into();

        if name.is_empty() {
            return Err(AddrError::EmptyDomain);
        }

        if !name.is_ascii() {
            return Err(AddrError::NotAscii);
        }

        if name.len() > DOMAIN_MAX_LEN {
            return Err(AddrError::DomainTooLong { len: name.len() });
        }

        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for DomainName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for DomainName {
    type Err = AddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// A host address as it appears in proxy protocol frames.
///
/// `Unknown` carries no text: it encodes as a zero-length payload and never
/// decodes successfully from the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostAddr {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Domain(DomainName),
    Unknown,
}

impl fmt::Display for HostAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostAddr::Ipv4(ip) => ip.fmt(f),
            HostAddr::Ipv6(ip) => ip.fmt(f),
            HostAddr::Domain(domain) => domain.fmt(f),
            HostAddr::Unknown => write!(f, "<unknown>"),
        }
    }
}

/// A destination (or bound) endpoint: a resolved socket address or a domain
/// name with a port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ip(SocketAddr),
    Domain(DomainName, u16),
}

impl TargetAddr {
    pub fn as_ip(&self) -> Option<SocketAddr> {
        match self {
            TargetAddr::Ip(ip) => Some(*ip),
            _ => None,
        }
    }

    pub fn as_domain(&self) -> Option<(&str, u16)> {
        match self {
            TargetAddr::Domain(domain, port) => Some((domain.as_str(), *port)),
            _ => None,
        }
    }

    pub fn host(&self) -> HostAddr {
        match self {
            TargetAddr::Ip(SocketAddr::V4(addr)) => HostAddr::Ipv4(*addr.ip()),
            TargetAddr::Ip(SocketAddr::V6(addr)) => HostAddr::Ipv6(*addr.ip()),
            TargetAddr::Domain(domain, _) => HostAddr::Domain(domain.clone()),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::Ip(addr) => addr.port(),
            TargetAddr::Domain(_, port) => *port,
        }
    }

    /// Rebuilds an endpoint from its wire-level parts.
    ///
    /// Returns `None` for `HostAddr::Unknown`, which has no endpoint form.
    pub fn from_host(host: HostAddr, port: u16) -> Option<Self> {
        match host {
            HostAddr::Ipv4(ip) => Some(TargetAddr::Ip(SocketAddr::V4(SocketAddrV4::new(ip, port)))),
            HostAddr::Ipv6(ip) => Some(TargetAddr::Ip(SocketAddr::V6(SocketAddrV6::new(ip, port, 0, 0)))),
            HostAddr::Domain(domain) => Some(TargetAddr::Domain(domain, port)),
            HostAddr::Unknown => None,
        }
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ip(addr) => addr.fmt(f),
            TargetAddr::Domain(domain, port) => write!(f, "{domain}:{port}"),
        }
    }
}

/// A trait to convert to `TargetAddr` (destination) similar to `std::net::ToSocketAddrs`.
///
/// All implementations reject port 0: a tunnel destination always names a
/// concrete port.
pub trait ToTargetAddr {
    fn to_target_addr(&self) -> io::Result<TargetAddr>;
}

fn nonzero_port(port: u16) -> io::Result<u16> {
    if port == 0 {
        return Err(AddrError::ZeroPort.into());
    }
    Ok(port)
}

impl ToTargetAddr for TargetAddr {
    fn to_target_addr(&self) -> io::Result<TargetAddr> {
        nonzero_port(self.port())?;
        Ok(self.clone())
    }
}

impl ToTargetAddr for SocketAddr {
    fn to_target_addr(&self) -> io::Result<TargetAddr> {
        nonzero_port(self.port())?;
        Ok(TargetAddr::Ip(*self))
    }
}

impl ToTargetAddr for SocketAddrV4 {
    fn to_target_addr(&self) -> io::Result<TargetAddr> {
        SocketAddr::V4(*self).to_target_addr()
    }
}

impl ToTargetAddr for SocketAddrV6 {
    fn to_target_addr(&self) -> io::Result<TargetAddr> {
        SocketAddr::V6(*self).to_target_addr()
    }
}

impl ToTargetAddr for (Ipv4Addr, u16) {
    fn to_target_addr(&self) -> io::Result<TargetAddr> {
        SocketAddrV4::new(self.0, self.1).to_target_addr()
    }
}

impl ToTargetAddr for (Ipv6Addr, u16) {
    fn to_target_addr(&self) -> io::Result<TargetAddr> {
        SocketAddrV6::new(self.0, self.1, 0, 0).to_target_addr()
    }
}

impl ToTargetAddr for (&str, u16) {
    fn to_target_addr(&self) -> io::Result<TargetAddr> {
        if let Ok(addr) = self.0.parse::<Ipv4Addr>() {
            return (addr, self.1).to_target_addr();
        }

        if let Ok(addr) = self.0.parse::<Ipv6Addr>() {
            return (addr, self.1).to_target_addr();
        }

        let domain = DomainName::new(self.0)?;
        Ok(TargetAddr::Domain(domain, nonzero_port(self.1)?))
    }
}

impl ToTargetAddr for &str {
    fn to_target_addr(&self) -> io::Result<TargetAddr> {
        if let Ok(addr) = self.parse::<SocketAddrV4>() {
            return addr.to_target_addr();
        }

        if let Ok(addr) = self.parse::<SocketAddrV6>() {
            return addr.to_target_addr();
        }

        let (host, port) = self
            .rsplit_once(':')
            .ok_or(AddrError::BadFormat { reason: "missing port" })?;

        let port = port.parse().map_err(|_| AddrError::BadFormat { reason: "bad port" })?;

        (host, port).to_target_addr()
    }
}

impl ToTargetAddr for String {
    fn to_target_addr(&self) -> io::Result<TargetAddr> {
        self.as_str().to_target_addr()
    }
}

impl<T: ToTargetAddr + ?Sized> ToTargetAddr for &T {
    fn to_target_addr(&self) -> io::Result<TargetAddr> {
        (**self).to_target_addr()
    }
}
