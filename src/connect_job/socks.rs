//! SOCKS connect job: a transport socket to the proxy, then the SOCKS4 or
//! SOCKS5 CONNECT handshake for the destination.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

use crate::connect_job::transport::{TransportConnectJobFactory, TransportParams};
use crate::connect_job::{ConnectJobFailure, ConnectTiming, ConnectedSocket};
use crate::error::NetError;
use crate::net::address::HostPortPair;
use crate::net::resolver::HostResolver;
use crate::pool::{ConnectJobFactory, ConnectionGroupKey, LoadState, LoadStateCell, RequestPriority, SocketPool};

const SOCKS4_VERSION: u8 = 0x04;
const SOCKS4_CMD_CONNECT: u8 = 0x01;
const SOCKS4_GRANTED: u8 = 0x5a;

const SOCKS5_VERSION: u8 = 0x05;
const SOCKS5_NO_AUTH: u8 = 0x00;
const SOCKS5_CMD_CONNECT: u8 = 0x01;
const SOCKS5_SUCCEEDED: u8 = 0x00;
const SOCKS5_HOST_UNREACHABLE: u8 = 0x04;
const SOCKS5_ATYP_IPV4: u8 = 0x01;
const SOCKS5_ATYP_DOMAIN: u8 = 0x03;
const SOCKS5_ATYP_IPV6: u8 = 0x04;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksVersion {
    V4,
    V5,
}

/// A SOCKS proxy and the destination to reach through it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocksParams {
    /// Transport connect to the proxy itself.
    pub transport: TransportParams,
    pub destination: HostPortPair,
    pub version: SocksVersion,
}

pub struct SocksConnectJobFactory {
    transport_pool: Arc<SocketPool<TransportConnectJobFactory>>,
    /// SOCKS4 cannot carry names, so the destination is resolved here.
    resolver: Arc<dyn HostResolver>,
    timeout: Duration,
}

impl SocksConnectJobFactory {
    pub fn new(
        transport_pool: Arc<SocketPool<TransportConnectJobFactory>>,
        resolver: Arc<dyn HostResolver>,
        timeout: Duration,
    ) -> Self {
        Self {
            transport_pool,
            resolver,
            timeout,
        }
    }

    async fn socks4_address(&self, destination: &HostPortPair) -> Result<Ipv4Addr, NetError> {
        if let Some(IpAddr::V4(ip)) = destination.ip_literal() {
            return Ok(ip);
        }
        let addrs = self.resolver.resolve(destination).await?;
        let found = addrs.iter().find_map(|addr| match addr.ip() {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(_) => None,
        });
        found.ok_or_else(|| NetError::NameNotResolved(destination.host.clone()))
    }
}

#[async_trait]
impl ConnectJobFactory for SocksConnectJobFactory {
    type Params = SocksParams;

    fn connection_timeout(&self) -> Duration {
        self.transport_pool.factory().connection_timeout() + self.timeout
    }

    async fn connect(
        &self,
        key: &ConnectionGroupKey,
        params: &SocksParams,
        priority: RequestPriority,
        load_state: &LoadStateCell,
    ) -> Result<ConnectedSocket, ConnectJobFailure> {
        load_state.set(LoadState::Connecting);
        let mut handle = self
            .transport_pool
            .request_socket(key, params.transport.clone(), priority)
            .await
            .map_err(|e| {
                tracing::debug!(group = %key, error = %e.error, "Transport to SOCKS proxy failed");
                NetError::ProxyConnectionFailed
            })?;
        let mut timing = ConnectTiming::default();
        timing.merge_lower(handle.connect_timing());

        let handshake_start = Instant::now();
        match params.version {
            SocksVersion::V4 => {
                let ip = self.socks4_address(&params.destination).await?;
                socks4_handshake(&mut handle, ip, params.destination.port).await?;
            }
            SocksVersion::V5 => socks5_handshake(&mut handle, &params.destination).await?,
        }
        tracing::debug!(
            group = %key,
            version = ?params.version,
            elapsed_ms = handshake_start.elapsed().as_millis() as u64,
            "SOCKS handshake complete"
        );
        Ok(ConnectedSocket::new(Box::new(handle), timing))
    }
}

/// EOF or I/O failure mid-handshake is a SOCKS failure, not a transport one.
fn handshake_io(_: std::io::Error) -> NetError {
    NetError::SocksConnectionFailed
}

/// SOCKS4 CONNECT to an IPv4 address, empty user id.
pub async fn socks4_handshake<S>(stream: &mut S, ip: Ipv4Addr, port: u16) -> Result<(), NetError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let mut request = Vec::with_capacity(9);
    request.push(SOCKS4_VERSION);
    request.push(SOCKS4_CMD_CONNECT);
    request.extend_from_slice(&port.to_be_bytes());
    request.extend_from_slice(&ip.octets());
    request.push(0x00);
    stream.write_all(&request).await.map_err(handshake_io)?;

    let mut reply = [0u8; 8];
    stream.read_exact(&mut reply).await.map_err(handshake_io)?;
    if reply[1] != SOCKS4_GRANTED {
        tracing::debug!(code = reply[1], "SOCKS4 request rejected");
        return Err(NetError::SocksConnectionFailed);
    }
    Ok(())
}

/// SOCKS5 CONNECT without authentication. Names are passed to the proxy
/// for resolution.
pub async fn socks5_handshake<S>(stream: &mut S, destination: &HostPortPair) -> Result<(), NetError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    stream
        .write_all(&[SOCKS5_VERSION, 1, SOCKS5_NO_AUTH])
        .await
        .map_err(handshake_io)?;
    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await.map_err(handshake_io)?;
    if choice[0] != SOCKS5_VERSION || choice[1] != SOCKS5_NO_AUTH {
        tracing::debug!(version = choice[0], method = choice[1], "SOCKS5 method negotiation failed");
        return Err(NetError::SocksConnectionFailed);
    }

    let mut request = vec![SOCKS5_VERSION, SOCKS5_CMD_CONNECT, 0x00];
    match destination.ip_literal() {
        Some(IpAddr::V4(ip)) => {
            request.push(SOCKS5_ATYP_IPV4);
            request.extend_from_slice(&ip.octets());
        }
        Some(IpAddr::V6(ip)) => {
            request.push(SOCKS5_ATYP_IPV6);
            request.extend_from_slice(&ip.octets());
        }
        None => {
            let name = destination.host.as_bytes();
            let len = u8::try_from(name.len()).map_err(|_| NetError::SocksConnectionFailed)?;
            request.push(SOCKS5_ATYP_DOMAIN);
            request.push(len);
            request.extend_from_slice(name);
        }
    }
    request.extend_from_slice(&destination.port.to_be_bytes());
    stream.write_all(&request).await.map_err(handshake_io)?;

    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await.map_err(handshake_io)?;
    if reply[0] != SOCKS5_VERSION {
        return Err(NetError::SocksConnectionFailed);
    }
    match reply[1] {
        SOCKS5_SUCCEEDED => {}
        SOCKS5_HOST_UNREACHABLE => return Err(NetError::SocksConnectionHostUnreachable),
        code => {
            tracing::debug!(code, "SOCKS5 request rejected");
            return Err(NetError::SocksConnectionFailed);
        }
    }

    // Bound address, then port; the values are not used.
    let bound_len = match reply[3] {
        SOCKS5_ATYP_IPV4 => 4,
        SOCKS5_ATYP_IPV6 => 16,
        SOCKS5_ATYP_DOMAIN => stream.read_u8().await.map_err(handshake_io)? as usize,
        _ => return Err(NetError::SocksConnectionFailed),
    };
    let mut bound = vec![0u8; bound_len + 2];
    stream.read_exact(&mut bound).await.map_err(handshake_io)?;
    Ok(())
}
