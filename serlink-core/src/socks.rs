//! Minimal SOCKS5 CONNECT client (RFC 1928), no authentication.
//!
//! Used when a SOCKS5 endpoint is configured: service sockets are opened
//! through it instead of directly. Callers treat every failure here exactly
//! like a direct connect failure.

use std::net::{Ipv4Addr, SocketAddr};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const VERSION: u8 = 0x05;
const NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

#[derive(Debug, Error)]
pub enum SocksError {
    #[error("socks connection failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("server accepted none of our authentication methods")]
    NoAcceptableAuth,
    #[error("malformed server reply")]
    Malformed,
    #[error("target hostname too long for socks")]
    HostTooLong,
    #[error("connect request rejected with code {0:#04x}")]
    Rejected(u8),
}

/// Open a TCP connection to `host:port` through the SOCKS5 server at
/// `server`. `host` may be a literal IPv4 address or a domain name.
pub async fn connect(server: SocketAddr, host: &str, port: u16) -> Result<TcpStream, SocksError> {
    let mut stream = TcpStream::connect(server).await?;

    // Greeting: version 5, one method, no auth.
    stream.write_all(&[VERSION, 1, NO_AUTH]).await?;
    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != VERSION || choice[1] != NO_AUTH {
        return Err(SocksError::NoAcceptableAuth);
    }

    // Connect request.
    let mut request = vec![VERSION, CMD_CONNECT, 0x00];
    match host.parse::<Ipv4Addr>() {
        Ok(addr) => {
            request.push(ATYP_IPV4);
            request.extend_from_slice(&addr.octets());
        }
        Err(_) => {
            if host.len() > 255 {
                return Err(SocksError::HostTooLong);
            }
            request.push(ATYP_DOMAIN);
            request.push(host.len() as u8);
            request.extend_from_slice(host.as_bytes());
        }
    }
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;

    // Reply: status at offset 1, then the bound address, which we discard.
    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await?;
    if reply[0] != VERSION {
        return Err(SocksError::Malformed);
    }
    if reply[1] != 0x00 {
        return Err(SocksError::Rejected(reply[1]));
    }
    let bound_len = match reply[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize
        }
        _ => return Err(SocksError::Malformed),
    };
    let mut bound = vec![0u8; bound_len + 2];
    stream.read_exact(&mut bound).await?;

    Ok(stream)
}
