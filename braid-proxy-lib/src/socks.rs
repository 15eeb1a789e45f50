#![forbid(unsafe_code)]

//! Server side of the SOCKS5 (RFC 1928) handshake used by the
//! client-role front end.
//!
//! Only CONNECT with no authentication is supported. The requested
//! target is returned for logging; blocks carry no address, so the
//! remote end of a circuit always forwards to its configured upstream.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NOAUTH: u8 = 0x00;
const METHOD_UNACCEPTABLE: u8 = 0xff;
const CMD_CONNECT: u8 = 0x01;
const ATYP_V4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_V6: u8 = 0x04;
const REP_SUCCESS: u8 = 0x00;
const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
const REP_ATYP_NOT_SUPPORTED: u8 = 0x08;

#[derive(Debug, Error)]
pub enum SocksError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported SOCKS version {0:#04x}")]
    Version(u8),

    #[error("no acceptable authentication method")]
    NoAcceptableMethod,

    #[error("unsupported command {0:#04x}")]
    Command(u8),

    #[error("unsupported address type {0:#04x}")]
    AddressType(u8),

    #[error("malformed domain name")]
    BadDomain,
}

/// Target named in a CONNECT request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    V4(Ipv4Addr, u16),
    V6(Ipv6Addr, u16),
    Domain(String, u16),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::V4(addr, port) => write!(f, "{addr}:{port}"),
            Target::V6(addr, port) => write!(f, "[{addr}]:{port}"),
            Target::Domain(host, port) => write!(f, "{host}:{port}"),
        }
    }
}

/// Run the handshake: method negotiation, then the CONNECT request.
///
/// On success the reply is already written and the stream carries the
/// application bytes next.
pub async fn serve_handshake<S>(stream: &mut S) -> Result<Target, SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    negotiate_method(stream).await?;
    read_connect(stream).await
}

/// Method negotiation: accept NOAUTH, refuse everything else with
/// `05 ff` before failing.
async fn negotiate_method<S>(stream: &mut S) -> Result<(), SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let version = stream.read_u8().await?;
    if version != SOCKS_VERSION {
        return Err(SocksError::Version(version));
    }

    let nmethods = stream.read_u8().await?;
    let mut methods = vec![0u8; nmethods as usize];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&METHOD_NOAUTH) {
        stream
            .write_all(&[SOCKS_VERSION, METHOD_UNACCEPTABLE])
            .await?;
        return Err(SocksError::NoAcceptableMethod);
    }

    stream.write_all(&[SOCKS_VERSION, METHOD_NOAUTH]).await?;
    Ok(())
}

async fn read_connect<S>(stream: &mut S) -> Result<Target, SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    let [version, command, _reserved, atyp] = head;

    if version != SOCKS_VERSION {
        return Err(SocksError::Version(version));
    }
    if command != CMD_CONNECT {
        reply(stream, REP_CMD_NOT_SUPPORTED).await?;
        return Err(SocksError::Command(command));
    }

    let target = match atyp {
        ATYP_V4 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            let port = stream.read_u16().await?;
            Target::V4(Ipv4Addr::from(addr), port)
        }
        ATYP_V6 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
            let port = stream.read_u16().await?;
            Target::V6(Ipv6Addr::from(addr), port)
        }
        ATYP_DOMAIN => {
            let len = stream.read_u8().await?;
            let mut name = vec![0u8; len as usize];
            stream.read_exact(&mut name).await?;
            let port = stream.read_u16().await?;
            let host = String::from_utf8(name).map_err(|_| SocksError::BadDomain)?;
            Target::Domain(host, port)
        }
        other => {
            reply(stream, REP_ATYP_NOT_SUPPORTED).await?;
            return Err(SocksError::AddressType(other));
        }
    };

    reply(stream, REP_SUCCESS).await?;
    Ok(target)
}

/// Write a reply with an all-zero IPv4 bind address.
async fn reply<S>(stream: &mut S, code: u8) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream
        .write_all(&[SOCKS_VERSION, code, 0x00, ATYP_V4, 0, 0, 0, 0, 0, 0])
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    async fn handshake(client_bytes: &[u8]) -> (Result<Target, SocksError>, Vec<u8>) {
        let (mut near, mut far) = duplex(1024);
        far.write_all(client_bytes).await.expect("feed handshake");

        let result = serve_handshake(&mut near).await;
        drop(near);

        let mut replies = Vec::new();
        far.read_to_end(&mut replies).await.expect("collect replies");
        (result, replies)
    }

    #[test]
    fn target_formats_like_an_address() {
        let t = Target::Domain("example.net".into(), 443);
        assert_eq!(t.to_string(), "example.net:443");
        let t = Target::V4(Ipv4Addr::LOCALHOST, 80);
        assert_eq!(t.to_string(), "127.0.0.1:80");
    }

    #[tokio::test]
    async fn noauth_connect_ipv4() {
        let mut bytes = vec![0x05, 0x01, 0x00]; // one method: NOAUTH
        bytes.extend_from_slice(&[0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0x1f, 0x90]);

        let (result, replies) = handshake(&bytes).await;
        assert_eq!(result.unwrap(), Target::V4(Ipv4Addr::new(127, 0, 0, 1), 8080));
        assert_eq!(&replies[..2], &[0x05, 0x00]);
        assert_eq!(&replies[2..], &[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn noauth_among_many_methods() {
        let mut bytes = vec![0x05, 0x09];
        bytes.extend_from_slice(&[0x42; 8]);
        bytes.push(0x00);
        bytes.extend_from_slice(&[0x05, 0x01, 0x00, 0x01, 10, 0, 0, 1, 0x00, 0x50]);

        let (result, replies) = handshake(&bytes).await;
        assert_eq!(result.unwrap(), Target::V4(Ipv4Addr::new(10, 0, 0, 1), 80));
        assert_eq!(&replies[..2], &[0x05, 0x00]);
    }

    #[tokio::test]
    async fn no_acceptable_method_is_refused() {
        let mut bytes = vec![0x05, 0x03];
        bytes.extend_from_slice(&[0x42, 0x42, 0x42]);

        let (result, replies) = handshake(&bytes).await;
        assert!(matches!(result, Err(SocksError::NoAcceptableMethod)));
        assert_eq!(replies, vec![0x05, 0xff]);
    }

    #[tokio::test]
    async fn domain_target_is_parsed() {
        let mut bytes = vec![0x05, 0x01, 0x00];
        bytes.extend_from_slice(&[0x05, 0x01, 0x00, 0x03]);
        bytes.push(11);
        bytes.extend_from_slice(b"example.net");
        bytes.extend_from_slice(&0x01bbu16.to_be_bytes());

        let (result, _) = handshake(&bytes).await;
        assert_eq!(result.unwrap(), Target::Domain("example.net".into(), 443));
    }

    #[tokio::test]
    async fn wrong_version_is_rejected() {
        let (result, replies) = handshake(&[0x04, 0x01, 0x00]).await;
        assert!(matches!(result, Err(SocksError::Version(0x04))));
        assert!(replies.is_empty());
    }

    #[tokio::test]
    async fn bind_command_is_refused() {
        let mut bytes = vec![0x05, 0x01, 0x00];
        bytes.extend_from_slice(&[0x05, 0x02, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);

        let (result, replies) = handshake(&bytes).await;
        assert!(matches!(result, Err(SocksError::Command(0x02))));
        // Negotiation succeeded, then the request was refused.
        assert_eq!(&replies[..2], &[0x05, 0x00]);
        assert_eq!(replies[2..4], [0x05, REP_CMD_NOT_SUPPORTED]);
    }
}
