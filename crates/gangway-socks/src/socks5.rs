//! SOCKS5 framing as defined in [RFC 1928] and [RFC 1929].
//!
//! The protocol is a sequence of stages (greeting, optional password
//! sub-negotiation, command), each with its own request/response pair. One
//! decoder exists per stage and direction; a connection replaces the active
//! decoder as it moves from stage to stage.
//!
//! [RFC 1928]: https://www.ietf.org/rfc/rfc1928.txt
//! [RFC 1929]: https://datatracker.ietf.org/doc/html/rfc1929

use std::io;
use std::net::{Ipv4Addr, SocketAddr};

use bytes::{Buf as _, BufMut as _, Bytes, BytesMut};
use futures_util::{SinkExt as _, StreamExt as _};
use gangway_types::{DecodeError, DecodeResult, HostAddr, TargetAddr, ToTargetAddr, UserPass};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, Encoder, Framed};

use crate::addr::{host_atyp, read_host, write_host};

const VERSION: u8 = 0x05;
const PASSWORD_VERSION: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    NoAuth,
    Gssapi,
    Password,
    Unaccepted,
    Other(u8),
}

impl AuthMethod {
    fn from_u8(value: u8) -> Self {
        match value {
            0x00 => AuthMethod::NoAuth,
            0x01 => AuthMethod::Gssapi,
            0x02 => AuthMethod::Password,
            0xFF => AuthMethod::Unaccepted,
            other => AuthMethod::Other(other),
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            AuthMethod::NoAuth => 0x00,
            AuthMethod::Gssapi => 0x01,
            AuthMethod::Password => 0x02,
            AuthMethod::Unaccepted => 0xFF,
            AuthMethod::Other(other) => other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Socks5Command {
    Connect,
    Bind,
    UdpAssociate,
    Other(u8),
}

impl Socks5Command {
    fn from_u8(value: u8) -> Self {
        match value {
            0x01 => Socks5Command::Connect,
            0x02 => Socks5Command::Bind,
            0x03 => Socks5Command::UdpAssociate,
            other => Socks5Command::Other(other),
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            Socks5Command::Connect => 0x01,
            Socks5Command::Bind => 0x02,
            Socks5Command::UdpAssociate => 0x03,
            Socks5Command::Other(other) => other,
        }
    }
}

/// SOCKS5 reply codes defined in RFC 1928.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Socks5CommandStatus {
    Succeeded,
    GeneralFailure,
    NotAllowedByRuleset,
    NetworkUnreachable,
    HostUnreachable,
    ConnectionRefused,
    TtlExpired,
    CommandNotSupported,
    AddressTypeNotSupported,
    Other(u8),
}

impl Socks5CommandStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0x00 => Socks5CommandStatus::Succeeded,
            0x01 => Socks5CommandStatus::GeneralFailure,
            0x02 => Socks5CommandStatus::NotAllowedByRuleset,
            0x03 => Socks5CommandStatus::NetworkUnreachable,
            0x04 => Socks5CommandStatus::HostUnreachable,
            0x05 => Socks5CommandStatus::ConnectionRefused,
            0x06 => Socks5CommandStatus::TtlExpired,
            0x07 => Socks5CommandStatus::CommandNotSupported,
            0x08 => Socks5CommandStatus::AddressTypeNotSupported,
            other => Socks5CommandStatus::Other(other),
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            Socks5CommandStatus::Succeeded => 0x00,
            Socks5CommandStatus::GeneralFailure => 0x01,
            Socks5CommandStatus::NotAllowedByRuleset => 0x02,
            Socks5CommandStatus::NetworkUnreachable => 0x03,
            Socks5CommandStatus::HostUnreachable => 0x04,
            Socks5CommandStatus::ConnectionRefused => 0x05,
            Socks5CommandStatus::TtlExpired => 0x06,
            Socks5CommandStatus::CommandNotSupported => 0x07,
            Socks5CommandStatus::AddressTypeNotSupported => 0x08,
            Socks5CommandStatus::Other(other) => other,
        }
    }

    pub fn is_success(self) -> bool {
        matches!(self, Socks5CommandStatus::Succeeded)
    }
}

impl core::fmt::Display for Socks5CommandStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Socks5CommandStatus::Succeeded => write!(f, "succeeded"),
            Socks5CommandStatus::GeneralFailure => write!(f, "general SOCKS server failure"),
            Socks5CommandStatus::NotAllowedByRuleset => write!(f, "connection not allowed by ruleset"),
            Socks5CommandStatus::NetworkUnreachable => write!(f, "network unreachable"),
            Socks5CommandStatus::HostUnreachable => write!(f, "host unreachable"),
            Socks5CommandStatus::ConnectionRefused => write!(f, "connection refused"),
            Socks5CommandStatus::TtlExpired => write!(f, "TTL expired"),
            Socks5CommandStatus::CommandNotSupported => write!(f, "command not supported"),
            Socks5CommandStatus::AddressTypeNotSupported => write!(f, "address type not supported"),
            Socks5CommandStatus::Other(code) => write!(f, "unknown status {code}"),
        }
    }
}

/// Password sub-negotiation outcome: 0 is success, any other byte a failure.
///
/// The raw byte is preserved so replies round-trip exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Socks5PasswordStatus(u8);

impl Socks5PasswordStatus {
    pub const SUCCESS: Self = Self(0x00);
    pub const FAILURE: Self = Self(0xFF);

    fn from_u8(value: u8) -> Self {
        Self(value)
    }

    fn to_u8(self) -> u8 {
        self.0
    }

    pub fn is_success(self) -> bool {
        self.0 == 0x00
    }
}

impl core::fmt::Display for Socks5PasswordStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_success() {
            write!(f, "SUCCESS")
        } else {
            write!(f, "FAILURE")
        }
    }
}

// Messages.
//
// Each carries the outcome of its own decoding, so a malformed frame still
// reaches the consumer as a value with placeholder fields and a cause.

/// Client greeting.
/// ```text
/// +----+----------+----------+
/// |VER | NMETHODS | METHODS  |
/// +----+----------+----------+
/// | 1  |    1     | 1 to 255 |
/// +----+----------+----------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socks5InitialRequest {
    pub methods: Vec<AuthMethod>,
    pub decode_result: DecodeResult,
}

impl Socks5InitialRequest {
    pub fn new(methods: Vec<AuthMethod>) -> Self {
        Self {
            methods,
            decode_result: DecodeResult::Success,
        }
    }
}

/// Server method choice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socks5InitialResponse {
    pub method: AuthMethod,
    pub decode_result: DecodeResult,
}

impl Socks5InitialResponse {
    pub fn new(method: AuthMethod) -> Self {
        Self {
            method,
            decode_result: DecodeResult::Success,
        }
    }
}

/// Password sub-negotiation request.
/// ```text
/// +----+------+----------+------+----------+
/// |VER | ULEN |  UNAME   | PLEN |  PASSWD  |
/// +----+------+----------+------+----------+
/// | 1  |  1   | 1 to 255 |  1   | 1 to 255 |
/// +----+------+----------+------+----------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socks5PasswordAuthRequest {
    pub username: String,
    pub password: String,
    pub decode_result: DecodeResult,
}

impl Socks5PasswordAuthRequest {
    pub fn new(creds: &UserPass) -> Self {
        Self {
            username: creds.username().to_owned(),
            password: creds.password().to_owned(),
            decode_result: DecodeResult::Success,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socks5PasswordAuthResponse {
    pub status: Socks5PasswordStatus,
    pub decode_result: DecodeResult,
}

impl Socks5PasswordAuthResponse {
    pub fn new(status: Socks5PasswordStatus) -> Self {
        Self {
            status,
            decode_result: DecodeResult::Success,
        }
    }
}

/// Command request.
/// ```text
/// +----+-----+-------+------+----------+----------+
/// |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
/// +----+-----+-------+------+----------+----------+
/// | 1  |  1  | X'00' |  1   | Variable |    2     |
/// +----+-----+-------+------+----------+----------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socks5CommandRequest {
    pub command: Socks5Command,
    pub dst: TargetAddr,
    pub decode_result: DecodeResult,
}

impl Socks5CommandRequest {
    pub fn connect(dst: impl ToTargetAddr) -> io::Result<Self> {
        Ok(Self {
            command: Socks5Command::Connect,
            dst: dst.to_target_addr()?,
            decode_result: DecodeResult::Success,
        })
    }
}

/// Command reply; the bound address is kept in wire form since servers may
/// answer with a zeroed address and port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socks5CommandResponse {
    pub status: Socks5CommandStatus,
    pub bound_host: HostAddr,
    pub bound_port: u16,
    pub decode_result: DecodeResult,
}

impl Socks5CommandResponse {
    pub fn granted(bound: SocketAddr) -> Self {
        let bound_host = match bound {
            SocketAddr::V4(addr) => HostAddr::Ipv4(*addr.ip()),
            SocketAddr::V6(addr) => HostAddr::Ipv6(*addr.ip()),
        };
        Self {
            status: Socks5CommandStatus::Succeeded,
            bound_host,
            bound_port: bound.port(),
            decode_result: DecodeResult::Success,
        }
    }

    pub fn failure(status: Socks5CommandStatus) -> Self {
        Self {
            status,
            bound_host: HostAddr::Ipv4(Ipv4Addr::UNSPECIFIED),
            bound_port: 0,
            decode_result: DecodeResult::Success,
        }
    }
}

// Encoders.

pub fn encode_initial_request(request: &Socks5InitialRequest, dst: &mut BytesMut) -> io::Result<()> {
    let nmethods = u8::try_from(request.methods.len()).map_err(io::Error::other)?;
    dst.put_u8(VERSION);
    dst.put_u8(nmethods);
    for method in &request.methods {
        dst.put_u8(method.to_u8());
    }
    Ok(())
}

pub fn encode_initial_response(response: &Socks5InitialResponse, dst: &mut BytesMut) {
    dst.put_slice(&[VERSION, response.method.to_u8()]);
}

pub fn encode_password_request(request: &Socks5PasswordAuthRequest, dst: &mut BytesMut) -> io::Result<()> {
    let username_len = match u8::try_from(request.username.len()) {
        Ok(len) if len > 0 => len,
        _ => return Err(io::Error::new(io::ErrorKind::InvalidInput, "invalid username")),
    };

    let password_len = match u8::try_from(request.password.len()) {
        Ok(len) if len > 0 => len,
        _ => return Err(io::Error::new(io::ErrorKind::InvalidInput, "invalid password")),
    };

    dst.put_slice(&[PASSWORD_VERSION, username_len]);
    dst.put_slice(request.username.as_bytes());
    dst.put_u8(password_len);
    dst.put_slice(request.password.as_bytes());
    Ok(())
}

pub fn encode_password_response(response: &Socks5PasswordAuthResponse, dst: &mut BytesMut) {
    dst.put_slice(&[PASSWORD_VERSION, response.status.to_u8()]);
}

pub fn encode_command_request(request: &Socks5CommandRequest, dst: &mut BytesMut) {
    let host = request.dst.host();
    dst.put_slice(&[VERSION, request.command.to_u8(), 0x00, host_atyp(&host)]);
    write_host(&host, dst);
    dst.put_u16(request.dst.port());
}

pub fn encode_command_response(response: &Socks5CommandResponse, dst: &mut BytesMut) {
    dst.put_slice(&[VERSION, response.status.to_u8(), 0x00, host_atyp(&response.bound_host)]);
    write_host(&response.bound_host, dst);
    dst.put_u16(response.bound_port);
}

// Decoders.
//
// Shared shape: a frame is only consumed once it is complete, so a short
// read "rewinds" for free; a malformed frame produces one synthetic message
// carrying the cause, after which all input on the connection is discarded.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Init,
    Success,
    Failure,
}

macro_rules! stage_decoder {
    ($(#[$attr:meta])* $name:ident) => {
        $(#[$attr])*
        #[derive(Debug)]
        pub struct $name {
            stage: Stage,
        }

        impl Default for $name {
            fn default() -> Self {
                Self { stage: Stage::Init }
            }
        }
    };
}

stage_decoder!(
    /// Server-side greeting stage: decodes `Socks5InitialRequest`, encodes
    /// `Socks5InitialResponse`.
    Socks5GreetingCodec
);
stage_decoder!(
    /// Server-side password sub-negotiation stage.
    Socks5PasswordCodec
);
stage_decoder!(
    /// Server-side command stage.
    Socks5CommandCodec
);
stage_decoder!(
    /// Client-side decoder for the server's method choice.
    Socks5InitialResponseDecoder
);
stage_decoder!(
    /// Client-side decoder for the password sub-negotiation reply.
    Socks5PasswordResponseDecoder
);
stage_decoder!(
    /// Client-side decoder for the command reply.
    Socks5CommandResponseDecoder
);

impl Decoder for Socks5GreetingCodec {
    type Item = Socks5InitialRequest;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.stage {
            Stage::Init => {
                if src.len() < 2 {
                    return Ok(None);
                }

                let version = src[0];
                if version != VERSION {
                    self.stage = Stage::Failure;
                    src.clear();
                    return Ok(Some(Socks5InitialRequest {
                        methods: vec![AuthMethod::NoAuth],
                        decode_result: DecodeResult::Failure(DecodeError::UnsupportedVersion {
                            actual: version,
                            expected: VERSION,
                        }),
                    }));
                }

                let nmethods = usize::from(src[1]);
                if src.len() < 2 + nmethods {
                    return Ok(None);
                }

                src.advance(2);
                let methods = src.split_to(nmethods).iter().map(|&b| AuthMethod::from_u8(b)).collect();

                self.stage = Stage::Success;
                Ok(Some(Socks5InitialRequest::new(methods)))
            }
            Stage::Success => Ok(None),
            Stage::Failure => {
                src.clear();
                Ok(None)
            }
        }
    }
}

impl Encoder<Socks5InitialResponse> for Socks5GreetingCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Socks5InitialResponse, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_initial_response(&item, dst);
        Ok(())
    }
}

impl Decoder for Socks5PasswordCodec {
    type Item = Socks5PasswordAuthRequest;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.stage {
            Stage::Init => {
                if src.len() < 3 {
                    return Ok(None);
                }

                let version = src[0];
                if version != PASSWORD_VERSION {
                    self.stage = Stage::Failure;
                    src.clear();
                    return Ok(Some(Socks5PasswordAuthRequest {
                        username: String::new(),
                        password: String::new(),
                        decode_result: DecodeResult::Failure(DecodeError::UnsupportedVersion {
                            actual: version,
                            expected: PASSWORD_VERSION,
                        }),
                    }));
                }

                // The password length lives behind the username, so every
                // offset is bounds-checked before anything is consumed.
                let username_len = usize::from(src[1]);
                if src.len() < 2 + username_len + 1 {
                    return Ok(None);
                }
                let password_len = usize::from(src[2 + username_len]);
                if src.len() < 3 + username_len + password_len {
                    return Ok(None);
                }

                src.advance(2);
                let username = String::from_utf8_lossy(&src.split_to(username_len)).into_owned();
                src.advance(1);
                let password = String::from_utf8_lossy(&src.split_to(password_len)).into_owned();

                self.stage = Stage::Success;
                Ok(Some(Socks5PasswordAuthRequest {
                    username,
                    password,
                    decode_result: DecodeResult::Success,
                }))
            }
            Stage::Success => Ok(None),
            Stage::Failure => {
                src.clear();
                Ok(None)
            }
        }
    }
}

impl Encoder<Socks5PasswordAuthResponse> for Socks5PasswordCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Socks5PasswordAuthResponse, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_password_response(&item, dst);
        Ok(())
    }
}

impl Decoder for Socks5CommandCodec {
    type Item = Socks5CommandRequest;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.stage {
            Stage::Init => {
                if src.len() < 4 {
                    return Ok(None);
                }

                let version = src[0];
                let command = src[1];
                let atyp = src[3];

                if version != VERSION {
                    return Ok(Some(self.fail(
                        src,
                        DecodeError::UnsupportedVersion {
                            actual: version,
                            expected: VERSION,
                        },
                    )));
                }

                let (host, host_len) = match read_host(atyp, &src[4..]) {
                    Ok(Some(decoded)) => decoded,
                    Ok(None) => return Ok(None),
                    Err(cause) => return Ok(Some(self.fail(src, cause))),
                };

                if src.len() < 4 + host_len + 2 {
                    return Ok(None);
                }

                src.advance(4 + host_len);
                let port = src.get_u16();

                let dst = TargetAddr::from_host(host, port).expect("read_host never yields Unknown");

                self.stage = Stage::Success;
                Ok(Some(Socks5CommandRequest {
                    command: Socks5Command::from_u8(command),
                    dst,
                    decode_result: DecodeResult::Success,
                }))
            }
            Stage::Success => Ok(None),
            Stage::Failure => {
                src.clear();
                Ok(None)
            }
        }
    }
}

impl Socks5CommandCodec {
    fn fail(&mut self, src: &mut BytesMut, cause: DecodeError) -> Socks5CommandRequest {
        self.stage = Stage::Failure;
        src.clear();

        Socks5CommandRequest {
            command: Socks5Command::Connect,
            dst: TargetAddr::Ip(SocketAddr::from(([0, 0, 0, 0], 0))),
            decode_result: DecodeResult::Failure(cause),
        }
    }
}

impl Encoder<Socks5CommandResponse> for Socks5CommandCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Socks5CommandResponse, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_command_response(&item, dst);
        Ok(())
    }
}

impl Decoder for Socks5InitialResponseDecoder {
    type Item = Socks5InitialResponse;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.stage {
            Stage::Init => {
                if src.len() < 2 {
                    return Ok(None);
                }

                let version = src.get_u8();
                if version != VERSION {
                    self.stage = Stage::Failure;
                    src.clear();
                    return Ok(Some(Socks5InitialResponse {
                        method: AuthMethod::NoAuth,
                        decode_result: DecodeResult::Failure(DecodeError::UnsupportedVersion {
                            actual: version,
                            expected: VERSION,
                        }),
                    }));
                }

                let method = AuthMethod::from_u8(src.get_u8());

                self.stage = Stage::Success;
                Ok(Some(Socks5InitialResponse::new(method)))
            }
            Stage::Success => Ok(None),
            Stage::Failure => {
                src.clear();
                Ok(None)
            }
        }
    }
}

impl Decoder for Socks5PasswordResponseDecoder {
    type Item = Socks5PasswordAuthResponse;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.stage {
            Stage::Init => {
                if src.len() < 2 {
                    return Ok(None);
                }

                let version = src.get_u8();
                if version != PASSWORD_VERSION {
                    self.stage = Stage::Failure;
                    src.clear();
                    return Ok(Some(Socks5PasswordAuthResponse {
                        status: Socks5PasswordStatus::FAILURE,
                        decode_result: DecodeResult::Failure(DecodeError::UnsupportedVersion {
                            actual: version,
                            expected: PASSWORD_VERSION,
                        }),
                    }));
                }

                let status = Socks5PasswordStatus::from_u8(src.get_u8());

                self.stage = Stage::Success;
                Ok(Some(Socks5PasswordAuthResponse::new(status)))
            }
            Stage::Success => Ok(None),
            Stage::Failure => {
                src.clear();
                Ok(None)
            }
        }
    }
}

impl Decoder for Socks5CommandResponseDecoder {
    type Item = Socks5CommandResponse;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.stage {
            Stage::Init => {
                if src.len() < 4 {
                    return Ok(None);
                }

                let version = src[0];
                let status = src[1];
                let atyp = src[3];

                if version != VERSION {
                    return Ok(Some(self.fail(
                        src,
                        DecodeError::UnsupportedVersion {
                            actual: version,
                            expected: VERSION,
                        },
                    )));
                }

                let (bound_host, host_len) = match read_host(atyp, &src[4..]) {
                    Ok(Some(decoded)) => decoded,
                    Ok(None) => return Ok(None),
                    Err(cause) => return Ok(Some(self.fail(src, cause))),
                };

                if src.len() < 4 + host_len + 2 {
                    return Ok(None);
                }

                src.advance(4 + host_len);
                let bound_port = src.get_u16();

                self.stage = Stage::Success;
                Ok(Some(Socks5CommandResponse {
                    status: Socks5CommandStatus::from_u8(status),
                    bound_host,
                    bound_port,
                    decode_result: DecodeResult::Success,
                }))
            }
            Stage::Success => Ok(None),
            Stage::Failure => {
                src.clear();
                Ok(None)
            }
        }
    }
}

impl Socks5CommandResponseDecoder {
    fn fail(&mut self, src: &mut BytesMut, cause: DecodeError) -> Socks5CommandResponse {
        self.stage = Stage::Failure;
        src.clear();

        Socks5CommandResponse {
            status: Socks5CommandStatus::GeneralFailure,
            bound_host: HostAddr::Ipv4(Ipv4Addr::UNSPECIFIED),
            bound_port: 0,
            decode_result: DecodeResult::Failure(cause),
        }
    }
}

/// Configuration for a SOCKS5 acceptor.
#[derive(Debug, Default)]
pub struct Socks5AcceptorConfig {
    pub no_auth_required: bool,
    /// Credentials accepted for password authentication.
    pub users: Option<Vec<UserPass>>,
}

/// SOCKS5 request acceptor for usage in proxy servers.
///
/// Performs greeting, optional password sub-negotiation and command stages,
/// replacing the active codec between each.
#[derive(Debug)]
pub struct Socks5Acceptor<S> {
    framed: Framed<S, Socks5CommandCodec>,
    request: Socks5CommandRequest,
}

impl<S> Socks5Acceptor<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Accepts a SOCKS5 stream without requiring any authentication.
    pub async fn accept(stream: S) -> io::Result<Self> {
        let conf = Socks5AcceptorConfig {
            no_auth_required: true,
            ..Socks5AcceptorConfig::default()
        };
        Self::accept_with_config(stream, &conf).await
    }

    /// Accepts a SOCKS5 stream using a user-defined configuration.
    pub async fn accept_with_config(stream: S, conf: &Socks5AcceptorConfig) -> io::Result<Self> {
        let mut greeting_framed = Framed::new(stream, Socks5GreetingCodec::default());

        let greeting = read_frame(&mut greeting_framed).await?;

        if let Some(cause) = greeting.decode_result.failure() {
            let cause = cause.clone();
            greeting_framed
                .send(Socks5InitialResponse::new(AuthMethod::Unaccepted))
                .await?;
            return Err(cause.into());
        }

        let selected_method = greeting.methods.iter().copied().find(|&m| match m {
            AuthMethod::NoAuth if conf.no_auth_required => true,
            AuthMethod::Password if conf.users.is_some() => true,
            _ => false,
        });

        let Some(method) = selected_method else {
            greeting_framed
                .send(Socks5InitialResponse::new(AuthMethod::Unaccepted))
                .await?;
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "no acceptable methods provided",
            ));
        };

        greeting_framed.send(Socks5InitialResponse::new(method)).await?;

        // The active codec is replaced in place between stages; `map_codec`
        // keeps bytes already buffered in either direction.
        let mut command_framed = if method == AuthMethod::Password {
            // This should not panic because it is checked above.
            let users = conf.users.as_deref().expect("username / password list");
            let mut password_framed = greeting_framed.map_codec(|_| Socks5PasswordCodec::default());
            server_password_authentication(&mut password_framed, users).await?;
            password_framed.map_codec(|_| Socks5CommandCodec::default())
        } else {
            greeting_framed.map_codec(|_| Socks5CommandCodec::default())
        };
        let request = read_frame(&mut command_framed).await?;

        if let Some(cause) = request.decode_result.failure() {
            let cause = cause.clone();
            let status = match cause {
                DecodeError::UnsupportedAddressType { .. } => Socks5CommandStatus::AddressTypeNotSupported,
                _ => Socks5CommandStatus::GeneralFailure,
            };
            command_framed.send(Socks5CommandResponse::failure(status)).await?;
            return Err(cause.into());
        }

        Ok(Self {
            framed: command_framed,
            request,
        })
    }

    /// Returns the destination address the proxy server should connect to.
    pub fn dest_addr(&self) -> &TargetAddr {
        &self.request.dst
    }

    pub fn is_connect_command(&self) -> bool {
        matches!(self.request.command, Socks5Command::Connect)
    }

    pub fn is_bind_command(&self) -> bool {
        matches!(self.request.command, Socks5Command::Bind)
    }

    pub fn is_udp_associate_command(&self) -> bool {
        matches!(self.request.command, Socks5Command::UdpAssociate)
    }

    /// Sends the final success reply and hands back the stream along with
    /// any bytes the client already pipelined after its request.
    ///
    /// `bound` is the local address the server used to connect to the
    /// destination.
    pub async fn granted(mut self, bound: SocketAddr) -> io::Result<(S, Bytes)> {
        self.framed.send(Socks5CommandResponse::granted(bound)).await?;
        let parts = self.framed.into_parts();
        Ok((parts.io, parts.read_buf.freeze()))
    }

    /// Sends a failure reply and consumes the stream.
    pub async fn rejected(mut self, status: Socks5CommandStatus) -> io::Result<()> {
        self.framed.send(Socks5CommandResponse::failure(status)).await?;
        Ok(())
    }
}

async fn read_frame<S, C>(framed: &mut Framed<S, C>) -> io::Result<C::Item>
where
    S: AsyncRead + AsyncWrite + Unpin,
    C: Decoder<Error = io::Error>,
{
    framed
        .next()
        .await
        .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "stream eofed"))?
}

async fn server_password_authentication<S>(
    framed: &mut Framed<S, Socks5PasswordCodec>,
    users: &[UserPass],
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = read_frame(framed).await?;

    if let Some(cause) = request.decode_result.failure() {
        let cause = cause.clone();
        framed
            .send(Socks5PasswordAuthResponse::new(Socks5PasswordStatus::FAILURE))
            .await?;
        return Err(cause.into());
    }

    let success = users
        .iter()
        .any(|creds| creds.username() == request.username && creds.password() == request.password);

    if success {
        framed
            .send(Socks5PasswordAuthResponse::new(Socks5PasswordStatus::SUCCESS))
            .await?;
        Ok(())
    } else {
        framed
            .send(Socks5PasswordAuthResponse::new(Socks5PasswordStatus::FAILURE))
            .await?;
        Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "password authentication failed",
        ))
    }
}
