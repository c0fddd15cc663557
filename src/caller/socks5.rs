//! SOCKS5 front end: handshake, replies and the byte relay.
//!
//! Version 5, NO-AUTH, CONNECT only. IPv4 and domain targets; IPv6 gets
//! "address type not supported".

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::caller::connector::{TunnelReader, TunnelWriter};
use crate::caller::error::TunnelError;
use crate::protocol::{ErrorCode, Target};

const SOCKS_VERSION: u8 = 0x05;
const AUTH_NONE: u8 = 0x00;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const RELAY_BUFFER: usize = 16 * 1024;

#[derive(Debug, Error)]
pub enum Socks5Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported SOCKS version {0}")]
    Version(u8),

    #[error("client offered no acceptable auth method")]
    NoAcceptableAuth,

    #[error("unsupported command {0:#04x}")]
    UnsupportedCommand(u8),

    #[error("unsupported address type {0:#04x}")]
    UnsupportedAddressType(u8),

    #[error("invalid domain name")]
    InvalidDomain,

    #[error("tunnel refused: {0}")]
    Tunnel(TunnelError),
}

/// Reply codes sent after the CONNECT request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reply {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    ConnectionRefused = 0x05,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

impl Reply {
    pub fn for_error(err: &TunnelError) -> Self {
        match err.code() {
            ErrorCode::ConnectionError => Reply::ConnectionRefused,
            _ => Reply::GeneralFailure,
        }
    }
}

/// Write a reply with an unspecified IPv4 bind address.
pub async fn send_reply<S>(stream: &mut S, reply: Reply) -> Result<(), Socks5Error>
where
    S: AsyncWrite + Unpin,
{
    stream
        .write_all(&[SOCKS_VERSION, reply as u8, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await?;
    stream.flush().await?;
    Ok(())
}

/// Run the greeting and read the CONNECT request.
///
/// Rejections are answered on the wire before the error is returned; on
/// success the caller still owes the client a reply.
pub async fn negotiate<S>(stream: &mut S) -> Result<Target, Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS_VERSION {
        return Err(Socks5Error::Version(header[0]));
    }
    let mut methods = vec![0u8; header[1] as usize];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&AUTH_NONE) {
        stream.write_all(&[SOCKS_VERSION, AUTH_NO_ACCEPTABLE]).await?;
        return Err(Socks5Error::NoAcceptableAuth);
    }
    stream.write_all(&[SOCKS_VERSION, AUTH_NONE]).await?;

    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await?;
    if request[0] != SOCKS_VERSION {
        return Err(Socks5Error::Version(request[0]));
    }
    if request[1] != CMD_CONNECT {
        send_reply(stream, Reply::CommandNotSupported).await?;
        return Err(Socks5Error::UnsupportedCommand(request[1]));
    }

    let address = match request[3] {
        ATYP_IPV4 => {
            let mut ip = [0u8; 4];
            stream.read_exact(&mut ip).await?;
            std::net::Ipv4Addr::from(ip).to_string()
        }
        ATYP_DOMAIN => {
            let len = stream.read_u8().await? as usize;
            let mut domain = vec![0u8; len];
            stream.read_exact(&mut domain).await?;
            match String::from_utf8(domain) {
                Ok(domain) if !domain.is_empty() => domain,
                _ => {
                    send_reply(stream, Reply::GeneralFailure).await?;
                    return Err(Socks5Error::InvalidDomain);
                }
            }
        }
        other => {
            // ATYP_IPV6 included
            send_reply(stream, Reply::AddressTypeNotSupported).await?;
            return Err(Socks5Error::UnsupportedAddressType(other));
        }
    };
    let port = stream.read_u16().await?;

    Ok(Target::new(address, port))
}

/// Byte counts of a finished relay.
#[derive(Debug, Default, Clone, Copy)]
pub struct RelayStats {
    pub client_to_tunnel: u64,
    pub tunnel_to_client: u64,
}

/// Shuttle bytes between the client and a tunnel until the tunnel ends.
///
/// Client EOF closes the tunnel writer but keeps delivering responses;
/// tunnel EOF shuts down the client's write side and ends the relay.
pub async fn relay<S>(client: S, mut reader: TunnelReader, writer: TunnelWriter) -> RelayStats
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_rd, mut client_wr) = tokio::io::split(client);
    let up_bytes = AtomicU64::new(0);

    let upstream = async {
        let mut buf = BytesMut::with_capacity(RELAY_BUFFER);
        loop {
            buf.reserve(RELAY_BUFFER);
            match client_rd.read_buf(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    up_bytes.fetch_add(n as u64, Ordering::Relaxed);
                    if writer.send(buf.split().freeze()).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    tracing::debug!(error = %e, "Client read failed");
                    break;
                }
            }
        }
        writer.close();
    };

    let downstream = async {
        let mut written = 0u64;
        while let Some(item) = reader.recv().await {
            match item {
                Ok(bytes) => {
                    if let Err(e) = client_wr.write_all(&bytes).await {
                        tracing::debug!(error = %e, "Client write failed");
                        return written;
                    }
                    written += bytes.len() as u64;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Tunnel failed");
                    return written;
                }
            }
        }
        let _ = client_wr.shutdown().await;
        written
    };

    tokio::pin!(upstream, downstream);
    let tunnel_to_client = tokio::select! {
        written = &mut downstream => written,
        _ = &mut upstream => downstream.await,
    };
    RelayStats {
        client_to_tunnel: up_bytes.load(Ordering::Relaxed),
        tunnel_to_client,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    async fn run(bytes: &[u8]) -> (Result<Target, Socks5Error>, Vec<u8>) {
        let (mut client, mut server) = duplex(1024);
        client.write_all(bytes).await.unwrap();
        let result = negotiate(&mut server).await;
        drop(server);
        let mut written = Vec::new();
        client.read_to_end(&mut written).await.unwrap();
        (result, written)
    }

    #[tokio::test]
    async fn connect_to_domain() {
        let mut req = vec![5, 1, 0, 5, 1, 0, 3, 11];
        req.extend_from_slice(b"example.com");
        req.extend_from_slice(&443u16.to_be_bytes());

        let (result, written) = run(&req).await;
        assert_eq!(result.unwrap(), Target::new("example.com", 443));
        assert_eq!(written, vec![5, 0]);
    }

    #[tokio::test]
    async fn connect_to_ipv4() {
        let (result, _) = run(&[5, 2, 2, 0, 5, 1, 0, 1, 10, 0, 0, 7, 0, 80]).await;
        assert_eq!(result.unwrap(), Target::new("10.0.0.7", 80));
    }

    #[tokio::test]
    async fn rejects_auth_only_clients() {
        let (result, written) = run(&[5, 1, 2]).await;
        assert!(matches!(result, Err(Socks5Error::NoAcceptableAuth)));
        assert_eq!(written, vec![5, 0xFF]);
    }

    #[tokio::test]
    async fn rejects_bind_and_udp() {
        for cmd in [0x02, 0x03] {
            let (result, written) = run(&[5, 1, 0, 5, cmd, 0, 1, 1, 2, 3, 4, 0, 80]).await;
            assert!(matches!(result, Err(Socks5Error::UnsupportedCommand(c)) if c == cmd));
            assert_eq!(written[2..4], [5, 0x07]);
        }
    }

    #[tokio::test]
    async fn rejects_ipv6() {
        let (result, written) = run(&[5, 1, 0, 5, 1, 0, ATYP_IPV6]).await;
        assert!(matches!(result, Err(Socks5Error::UnsupportedAddressType(4))));
        assert_eq!(written[2..4], [5, 0x08]);
    }

    #[test]
    fn maps_tunnel_errors_to_replies() {
        let refused = TunnelError::Remote { code: ErrorCode::ConnectionError, message: "refused".into() };
        let timeout = TunnelError::Remote { code: ErrorCode::Timeout, message: "timed out".into() };
        assert_eq!(Reply::for_error(&refused), Reply::ConnectionRefused);
        assert_eq!(Reply::for_error(&timeout), Reply::GeneralFailure);
    }
}
