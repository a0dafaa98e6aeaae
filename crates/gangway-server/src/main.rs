//! Standalone proxy server speaking SOCKS4/4a, SOCKS5 and HTTP CONNECT,
//! for exercising gangway clients against a real listener.

use std::io;
use std::sync::Arc;
use std::{env, net::SocketAddr};

use bytes::Bytes;
use gangway_http::HttpConnectAcceptor;
use gangway_socks::socks4::Socks4Status;
use gangway_socks::socks5::Socks5CommandStatus;
use gangway_socks::{Socks4Acceptor, Socks5Acceptor, Socks5AcceptorConfig};
use gangway_types::{TargetAddr, UserPass};
use tokio::io::AsyncWriteExt as _;
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info};

const USAGE: &str = "[--no-auth-required] [--socks4-port <PORT>] [--socks5-port <PORT>] [--http-port <PORT>] [--user <USERNAME>,<PASSWORD>]";

#[tokio::main]
async fn main() -> io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = env::args().collect();
    let args: Vec<&str> = args.iter().skip(1).map(String::as_str).collect();
    let args = parse_args(&args)?;

    if args.show_usage {
        let prgm_name = env::args()
            .next()
            .expect("the first argument should be set by the shell");
        info!("Usage: {prgm_name} {USAGE}");
        return Ok(());
    }

    let conf = Arc::new(Socks5AcceptorConfig {
        no_auth_required: args.no_auth_required,
        users: args
            .user
            .map(|(name, pass)| UserPass::new(name, pass))
            .transpose()?
            .map(|creds| vec![creds]),
    });

    let mut handles = Vec::new();

    if let Some(port) = args.socks5_port {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        info!(port, "listening for SOCKS5 streams");

        let conf = Arc::clone(&conf);
        handles.push(tokio::spawn(async move {
            loop {
                if let Ok((socket, peer)) = listener.accept().await {
                    let conf = Arc::clone(&conf);
                    tokio::spawn(async move {
                        if let Err(error) = process_socks5(socket, conf).await {
                            error!(%peer, %error, "SOCKS5 stream failed");
                        }
                    });
                }
            }
        }));
    }

    if let Some(port) = args.socks4_port {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        info!(port, "listening for SOCKS4 streams");

        handles.push(tokio::spawn(async move {
            loop {
                if let Ok((socket, peer)) = listener.accept().await {
                    tokio::spawn(async move {
                        if let Err(error) = process_socks4(socket).await {
                            error!(%peer, %error, "SOCKS4 stream failed");
                        }
                    });
                }
            }
        }));
    }

    if let Some(port) = args.http_port {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        info!(port, "listening for HTTP CONNECT streams");

        handles.push(tokio::spawn(async move {
            loop {
                if let Ok((socket, peer)) = listener.accept().await {
                    tokio::spawn(async move {
                        if let Err(error) = process_http(socket).await {
                            error!(%peer, %error, "HTTP CONNECT stream failed");
                        }
                    });
                }
            }
        }));
    }

    for handle in handles {
        let _ = handle.await;
    }

    Ok(())
}

#[derive(Default, Debug)]
struct Args<'a> {
    socks4_port: Option<u16>,
    socks5_port: Option<u16>,
    http_port: Option<u16>,
    no_auth_required: bool,
    user: Option<(&'a str, &'a str)>,
    show_usage: bool,
}

fn parse_args<'a>(mut input: &[&'a str]) -> io::Result<Args<'a>> {
    let mut args = Args::default();

    loop {
        match input {
            ["--socks4-port", value, rest @ ..] => {
                args.socks4_port = parse_port("SOCKS4", value)?;
                input = rest;
            }
            ["--socks5-port", value, rest @ ..] => {
                args.socks5_port = parse_port("SOCKS5", value)?;
                input = rest;
            }
            ["--http-port", value, rest @ ..] => {
                args.http_port = parse_port("HTTP", value)?;
                input = rest;
            }
            ["--no-auth-required", rest @ ..] => {
                args.no_auth_required = true;
                input = rest;
            }
            ["--user" | "-u", value, rest @ ..] => {
                let idx = value
                    .find(',')
                    .ok_or_else(|| io::Error::other(format!("malformed username,password: {value}")))?;
                let (user, pass) = value.split_at(idx);
                args.user = Some((user, &pass[1..]));
                input = rest;
            }
            ["--help" | "-h", rest @ ..] => {
                args.show_usage = true;
                input = rest;
            }
            [unexpected_arg, ..] => {
                return Err(io::Error::other(format!("unexpected argument: {unexpected_arg}")));
            }
            [] => break,
        }
    }

    Ok(args)
}

fn parse_port(proto: &str, value: &str) -> io::Result<Option<u16>> {
    value
        .parse::<u16>()
        .map(Some)
        .map_err(|e| io::Error::other(format!("{proto} proxy port value malformed: {e}")))
}

async fn connect_to_dest(dest: &TargetAddr) -> io::Result<TcpStream> {
    match dest {
        TargetAddr::Ip(addr) => TcpStream::connect(addr).await,
        TargetAddr::Domain(domain, port) => TcpStream::connect((domain.as_str(), *port)).await,
    }
}

/// Forwards bytes both ways until either side closes, pushing any bytes the
/// client pipelined behind its handshake to the target first.
async fn relay(mut incoming: TcpStream, mut target: TcpStream, leftover: Bytes) -> io::Result<()> {
    if !leftover.is_empty() {
        target.write_all(&leftover).await?;
    }
    tokio::io::copy_bidirectional(&mut incoming, &mut target).await?;
    Ok(())
}

async fn process_socks5(incoming: TcpStream, conf: Arc<Socks5AcceptorConfig>) -> io::Result<()> {
    let acceptor = Socks5Acceptor::accept_with_config(incoming, &conf).await?;

    if !acceptor.is_connect_command() {
        acceptor.rejected(Socks5CommandStatus::CommandNotSupported).await?;
        return Ok(());
    }

    let dest = acceptor.dest_addr().clone();
    info!(%dest, "SOCKS5 tunnel requested");

    let target = match connect_to_dest(&dest).await {
        Ok(stream) => stream,
        Err(e) => {
            let status = match e.kind() {
                io::ErrorKind::ConnectionRefused => Socks5CommandStatus::ConnectionRefused,
                io::ErrorKind::TimedOut => Socks5CommandStatus::TtlExpired,
                _ => Socks5CommandStatus::HostUnreachable,
            };
            acceptor.rejected(status).await?;
            return Err(e);
        }
    };

    let bound: SocketAddr = target.local_addr()?;
    let (incoming, leftover) = acceptor.granted(bound).await?;

    relay(incoming, target, leftover).await
}

async fn process_socks4(incoming: TcpStream) -> io::Result<()> {
    let acceptor = Socks4Acceptor::accept(incoming).await?;

    if !acceptor.is_connect_command() {
        acceptor.rejected(Socks4Status::Rejected).await?;
        return Ok(());
    }

    let dest = acceptor.dest_addr().clone();
    info!(%dest, "SOCKS4 tunnel requested");

    let target = match connect_to_dest(&dest).await {
        Ok(stream) => stream,
        Err(e) => {
            acceptor.rejected(Socks4Status::Rejected).await?;
            return Err(e);
        }
    };

    let bound = match target.local_addr()? {
        SocketAddr::V4(addr) => addr,
        SocketAddr::V6(_) => "0.0.0.0:0".parse().expect("literal socket address"),
    };
    let (incoming, leftover) = acceptor.granted(bound).await?;

    relay(incoming, target, leftover).await
}

async fn process_http(incoming: TcpStream) -> io::Result<()> {
    let acceptor = HttpConnectAcceptor::accept(incoming).await?;

    let dest = acceptor.dest_addr().clone();
    info!(%dest, "HTTP CONNECT tunnel requested");

    let target = match connect_to_dest(&dest).await {
        Ok(stream) => stream,
        Err(e) => {
            acceptor.rejected(502).await?;
            return Err(e);
        }
    };

    let (incoming, leftover) = acceptor.granted().await?;

    relay(incoming, target, leftover).await
}
