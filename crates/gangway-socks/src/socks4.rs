//! SOCKS4 and SOCKS4a framing.
//!
//! <https://www.openssh.com/txt/socks4.protocol>
//!
//! ```text
//!             +----+----+----+----+----+----+----+----+----+----+....+----+
//!             | VN | CD | DSTPORT |      DSTIP        | USERID       |NULL|
//!             +----+----+----+----+----+----+----+----+----+----+....+----+
//! # of bytes:   1    1      2              4           variable       1
//! ```
//!
//! Under the 4a convention a destination IP in `0.0.0.1`–`0.0.0.255` means
//! the real destination is a domain name appended after the user-id field,
//! also NUL-terminated.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use bytes::{Buf as _, BufMut as _, Bytes, BytesMut};
use futures_util::{SinkExt as _, StreamExt as _};
use gangway_types::{DecodeError, DecodeResult, DomainName, TargetAddr, ToTargetAddr, UserId};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, Encoder, Framed};

const VERSION: u8 = 0x04;
const REPLY_VERSION: u8 = 0x00;
const MAX_FIELD_LEN: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Socks4Command {
    Connect,
    Bind,
    Other(u8),
}

impl Socks4Command {
    fn from_u8(value: u8) -> Self {
        match value {
            0x01 => Socks4Command::Connect,
            0x02 => Socks4Command::Bind,
            other => Socks4Command::Other(other),
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            Socks4Command::Connect => 0x01,
            Socks4Command::Bind => 0x02,
            Socks4Command::Other(other) => other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Socks4Status {
    Granted,
    Rejected,
    IdentdUnreachable,
    IdentdMismatch,
    Other(u8),
}

impl Socks4Status {
    fn from_u8(value: u8) -> Self {
        match value {
            90 => Socks4Status::Granted,
            91 => Socks4Status::Rejected,
            92 => Socks4Status::IdentdUnreachable,
            93 => Socks4Status::IdentdMismatch,
            other => Socks4Status::Other(other),
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            Socks4Status::Granted => 90,
            Socks4Status::Rejected => 91,
            Socks4Status::IdentdUnreachable => 92,
            Socks4Status::IdentdMismatch => 93,
            Socks4Status::Other(other) => other,
        }
    }
}

impl core::fmt::Display for Socks4Status {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Socks4Status::Granted => write!(f, "request granted"),
            Socks4Status::Rejected => write!(f, "request rejected or failed"),
            Socks4Status::IdentdUnreachable => write!(f, "identd not reachable"),
            Socks4Status::IdentdMismatch => write!(f, "identd reported a different user-id"),
            Socks4Status::Other(code) => write!(f, "unknown status {code}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socks4CommandRequest {
    pub command: Socks4Command,
    pub dst: TargetAddr,
    pub user_id: String,
    pub decode_result: DecodeResult,
}

impl Socks4CommandRequest {
    /// Builds a CONNECT request.
    ///
    /// The destination may be an IPv4 literal or a domain name (sent with
    /// the 4a convention); IPv6 is not representable in SOCKS4.
    pub fn connect(dst: impl ToTargetAddr, user_id: UserId) -> io::Result<Self> {
        let dst = dst.to_target_addr()?;

        if matches!(dst, TargetAddr::Ip(SocketAddr::V6(_))) {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "SOCKS4 does not support IPv6"));
        }

        Ok(Self {
            command: Socks4Command::Connect,
            dst,
            user_id: user_id.as_str().to_owned(),
            decode_result: DecodeResult::Success,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socks4CommandResponse {
    pub status: Socks4Status,
    pub bound: SocketAddrV4,
    pub decode_result: DecodeResult,
}

impl Socks4CommandResponse {
    pub fn new(status: Socks4Status, bound: SocketAddrV4) -> Self {
        Self {
            status,
            bound,
            decode_result: DecodeResult::Success,
        }
    }
}

pub fn encode_request(request: &Socks4CommandRequest, dst: &mut BytesMut) -> io::Result<()> {
    dst.put_u8(VERSION);
    dst.put_u8(request.command.to_u8());
    dst.put_u16(request.dst.port());

    match &request.dst {
        TargetAddr::Ip(SocketAddr::V4(addr)) => {
            dst.put_slice(&addr.ip().octets());
            dst.put_slice(request.user_id.as_bytes());
            dst.put_u8(0);
        }
        TargetAddr::Ip(SocketAddr::V6(_)) => {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "SOCKS4 does not support IPv6"));
        }
        TargetAddr::Domain(domain, _) => {
            // 4a marker: the domain follows the user-id, never before.
            dst.put_slice(&[0, 0, 0, 1]);
            dst.put_slice(request.user_id.as_bytes());
            dst.put_u8(0);
            dst.put_slice(domain.as_bytes());
            dst.put_u8(0);
        }
    }

    Ok(())
}

pub fn encode_response(response: &Socks4CommandResponse, dst: &mut BytesMut) {
    dst.put_u8(REPLY_VERSION);
    dst.put_u8(response.status.to_u8());
    dst.put_u16(response.bound.port());
    dst.put_slice(&response.bound.ip().octets());
}

/// Searches the front of `buf` for a NUL-terminated field.
///
/// `Ok(None)` while the terminator has not arrived; scanning past 255 bytes
/// without finding one is a hard failure.
fn read_nul_terminated(field: &'static str, src: &mut BytesMut) -> Result<Option<String>, DecodeError> {
    match src.iter().position(|&b| b == 0) {
        Some(pos) if pos < MAX_FIELD_LEN => {
            let bytes = src.split_to(pos);
            src.advance(1); // the NUL itself
            Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
        }
        Some(_) => Err(DecodeError::FieldTooLong {
            field,
            max: MAX_FIELD_LEN,
        }),
        None if src.len() > MAX_FIELD_LEN + 1 => Err(DecodeError::FieldTooLong {
            field,
            max: MAX_FIELD_LEN,
        }),
        None => Ok(None),
    }
}

fn is_socks4a_marker(ip: Ipv4Addr) -> bool {
    let octets = ip.octets();
    octets[..3] == [0, 0, 0] && octets[3] != 0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestStage {
    Start,
    ReadUserId,
    ReadDomain,
    Success,
    Failure,
}

/// Server-side SOCKS4 codec: decodes one command request, encodes the reply.
///
/// After a successful decode any further buffered bytes are left untouched:
/// they are the start of the tunneled payload and belong to the caller. On a
/// failed decode a single best-effort request carrying the failure is
/// produced, then everything that follows on the connection is discarded.
#[derive(Debug)]
pub struct Socks4ServerCodec {
    stage: RequestStage,
    command: Option<Socks4Command>,
    port: u16,
    ip: Option<Ipv4Addr>,
    user_id: Option<String>,
}

impl Default for Socks4ServerCodec {
    fn default() -> Self {
        Self {
            stage: RequestStage::Start,
            command: None,
            port: 0,
            ip: None,
            user_id: None,
        }
    }
}

impl Socks4ServerCodec {
    fn fail(&mut self, src: &mut BytesMut, cause: DecodeError) -> Socks4CommandRequest {
        self.stage = RequestStage::Failure;
        src.clear();

        let dst = match self.ip {
            Some(ip) => TargetAddr::Ip(SocketAddr::V4(SocketAddrV4::new(ip, self.port))),
            None => TargetAddr::Ip(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 65535))),
        };

        Socks4CommandRequest {
            command: self.command.unwrap_or(Socks4Command::Connect),
            dst,
            user_id: self.user_id.clone().unwrap_or_default(),
            decode_result: DecodeResult::Failure(cause),
        }
    }
}

impl Decoder for Socks4ServerCodec {
    type Item = Socks4CommandRequest;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.stage == RequestStage::Start {
            if src.len() < 8 {
                return Ok(None);
            }

            let version = src.get_u8();
            if version != VERSION {
                return Ok(Some(self.fail(
                    src,
                    DecodeError::UnsupportedVersion {
                        actual: version,
                        expected: VERSION,
                    },
                )));
            }

            self.command = Some(Socks4Command::from_u8(src.get_u8()));
            self.port = src.get_u16();
            self.ip = Some(Ipv4Addr::from(src.get_u32()));
            self.stage = RequestStage::ReadUserId;
        }

        if self.stage == RequestStage::ReadUserId {
            match read_nul_terminated("userid", src) {
                Ok(Some(user_id)) => {
                    self.user_id = Some(user_id);
                    self.stage = RequestStage::ReadDomain;
                }
                Ok(None) => return Ok(None),
                Err(cause) => return Ok(Some(self.fail(src, cause))),
            }
        }

        if self.stage == RequestStage::ReadDomain {
            let ip = self.ip.expect("fixed header was decoded in the Start stage");

            let dst = if is_socks4a_marker(ip) {
                match read_nul_terminated("dstAddr", src) {
                    Ok(Some(name)) => match DomainName::new(name) {
                        Ok(domain) => TargetAddr::Domain(domain, self.port),
                        Err(_) => {
                            let cause = DecodeError::Malformed {
                                field: "dstAddr",
                                reason: "not a valid domain name",
                            };
                            return Ok(Some(self.fail(src, cause)));
                        }
                    },
                    Ok(None) => return Ok(None),
                    Err(cause) => return Ok(Some(self.fail(src, cause))),
                }
            } else {
                TargetAddr::Ip(SocketAddr::V4(SocketAddrV4::new(ip, self.port)))
            };

            self.stage = RequestStage::Success;

            return Ok(Some(Socks4CommandRequest {
                command: self.command.expect("fixed header was decoded in the Start stage"),
                dst,
                user_id: self.user_id.take().unwrap_or_default(),
                decode_result: DecodeResult::Success,
            }));
        }

        if self.stage == RequestStage::Failure {
            // Terminal message already produced; swallow whatever else arrives.
            src.clear();
        }

        // Success: leftover bytes are tunneled payload, not ours to consume.
        Ok(None)
    }
}

impl Encoder<Socks4CommandResponse> for Socks4ServerCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Socks4CommandResponse, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_response(&item, dst);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseStage {
    Init,
    Success,
    Failure,
}

/// Client-side SOCKS4 codec: encodes the command request, decodes the reply.
///
/// Replies have no variable-length fields and decode in one shot once all
/// 8 bytes are buffered.
#[derive(Debug)]
pub struct Socks4ClientCodec {
    stage: ResponseStage,
}

impl Default for Socks4ClientCodec {
    fn default() -> Self {
        Self {
            stage: ResponseStage::Init,
        }
    }
}

impl Socks4ClientCodec {
    fn fail(&mut self, src: &mut BytesMut, cause: DecodeError) -> Socks4CommandResponse {
        self.stage = ResponseStage::Failure;
        src.clear();

        Socks4CommandResponse {
            status: Socks4Status::Rejected,
            bound: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
            decode_result: DecodeResult::Failure(cause),
        }
    }
}

impl Decoder for Socks4ClientCodec {
    type Item = Socks4CommandResponse;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.stage {
            ResponseStage::Init => {
                if src.len() < 8 {
                    return Ok(None);
                }

                let version = src.get_u8();
                if version != REPLY_VERSION {
                    return Ok(Some(self.fail(
                        src,
                        DecodeError::UnsupportedVersion {
                            actual: version,
                            expected: REPLY_VERSION,
                        },
                    )));
                }

                let status = Socks4Status::from_u8(src.get_u8());
                let port = src.get_u16();
                let ip = Ipv4Addr::from(src.get_u32());

                self.stage = ResponseStage::Success;

                Ok(Some(Socks4CommandResponse::new(status, SocketAddrV4::new(ip, port))))
            }
            ResponseStage::Success => Ok(None),
            ResponseStage::Failure => {
                src.clear();
                Ok(None)
            }
        }
    }
}

impl Encoder<Socks4CommandRequest> for Socks4ClientCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Socks4CommandRequest, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_request(&item, dst)
    }
}

/// SOCKS4 request acceptor for usage in proxy servers.
#[derive(Debug)]
pub struct Socks4Acceptor<S> {
    framed: Framed<S, Socks4ServerCodec>,
    request: Socks4CommandRequest,
}

impl<S> Socks4Acceptor<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Reads one SOCKS4/4a command request from the stream.
    pub async fn accept(stream: S) -> io::Result<Self> {
        let mut framed = Framed::new(stream, Socks4ServerCodec::default());

        let request = framed
            .next()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "stream eofed"))??;

        if let Some(cause) = request.decode_result.failure() {
            let reply = Socks4CommandResponse::new(
                Socks4Status::Rejected,
                SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
            );
            framed.send(reply).await?;
            return Err(cause.clone().into());
        }

        Ok(Self { framed, request })
    }

    pub fn dest_addr(&self) -> &TargetAddr {
        &self.request.dst
    }

    pub fn user_id(&self) -> &str {
        &self.request.user_id
    }

    pub fn is_connect_command(&self) -> bool {
        matches!(self.request.command, Socks4Command::Connect)
    }

    /// Sends the granted reply and hands back the stream along with any
    /// bytes the client already pipelined after its request.
    pub async fn granted(mut self, bound: SocketAddrV4) -> io::Result<(S, Bytes)> {
        self.framed
            .send(Socks4CommandResponse::new(Socks4Status::Granted, bound))
            .await?;

        let parts = self.framed.into_parts();
        Ok((parts.io, parts.read_buf.freeze()))
    }

    /// Sends a failure reply and consumes the stream.
    pub async fn rejected(mut self, status: Socks4Status) -> io::Result<()> {
        self.framed
            .send(Socks4CommandResponse::new(
                status,
                SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
            ))
            .await?;
        Ok(())
    }
}
