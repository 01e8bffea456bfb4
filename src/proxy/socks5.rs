//! Client-side SOCKS5 front end.
//!
//! Listens on a local port, accepts SOCKS5 CONNECT requests and hands each
//! one to a [`RequestHandler`]. The handler decides whether the connection
//! is admitted; only an admitted request is answered (via
//! [`SocksRequest::accept`]). A rejected request is dropped, which closes
//! the connection without a reply.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;

use crate::error::{Error, Result};

const SOCKS_VERSION: u8 = 0x05;
const CMD_CONNECT: u8 = 0x01;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NONE_ACCEPTABLE: u8 = 0xFF;

const REPLY_SUCCESS: [u8; 10] = [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
const REPLY_COMMAND_UNSUPPORTED: [u8; 10] = [0x05, 0x07, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
const REPLY_ADDRESS_UNSUPPORTED: [u8; 10] = [0x05, 0x08, 0x00, 0x01, 0, 0, 0, 0, 0, 0];

/// Destination requested by a SOCKS5 client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    /// IPv4 or IPv6 address
    Ip(SocketAddr),
    /// Fully qualified domain name
    Domain(String, u16),
}

impl TargetAddr {
    /// Destination port.
    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::Ip(addr) => addr.port(),
            TargetAddr::Domain(_, port) => *port,
        }
    }

    /// Raw address bytes: IP octets or the domain name.
    pub fn host_bytes(&self) -> Vec<u8> {
        match self {
            TargetAddr::Ip(SocketAddr::V4(addr)) => addr.ip().octets().to_vec(),
            TargetAddr::Ip(SocketAddr::V6(addr)) => addr.ip().octets().to_vec(),
            TargetAddr::Domain(name, _) => name.as_bytes().to_vec(),
        }
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ip(addr) => write!(f, "{}", addr),
            TargetAddr::Domain(name, port) => write!(f, "{}:{}", name, port),
        }
    }
}

/// A local byte stream a flow can be relayed from.
pub trait LocalStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> LocalStream for T {}

/// Read side of an accepted local connection.
pub type LocalReader = Box<dyn AsyncRead + Send + Unpin>;

/// Write side of an accepted local connection.
pub type LocalWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A parsed CONNECT request waiting for admission.
pub struct SocksRequest {
    target: TargetAddr,
    peer: Option<SocketAddr>,
    stream: Box<dyn LocalStream>,
}

impl SocksRequest {
    /// Wrap a stream whose handshake has been read up to the request.
    pub fn new(target: TargetAddr, stream: impl LocalStream + 'static) -> Self {
        Self {
            target,
            peer: None,
            stream: Box::new(stream),
        }
    }

    /// Attach the address of the local client.
    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    /// Requested destination.
    pub fn target(&self) -> &TargetAddr {
        &self.target
    }

    /// Address of the local client, when known.
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Send the success reply and hand out the raw connection halves.
    pub async fn accept(self) -> Result<(LocalReader, LocalWriter)> {
        let mut stream = self.stream;
        stream
            .write_all(&REPLY_SUCCESS)
            .await
            .map_err(Error::LocalSocket)?;

        let (reader, writer) = tokio::io::split(stream);
        Ok((Box::new(reader), Box::new(writer)))
    }
}

/// Receives every parsed SOCKS5 request.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Admit or reject one request. On error the request has been dropped
    /// and the local connection is closed.
    async fn handle_request(&self, request: SocksRequest) -> Result<()>;
}

/// Run the SOCKS5 listener, passing every CONNECT request to `handler`.
pub async fn run_socks5_server(listen_addr: &str, handler: Arc<dyn RequestHandler>) -> Result<()> {
    let listener = TcpListener::bind(listen_addr).await?;
    tracing::info!("SOCKS5 proxy listening on {}", listen_addr);

    loop {
        match listener.accept().await {
            Ok((mut client, peer)) => {
                tracing::debug!("SOCKS5 connection from {}", peer);
                let handler = Arc::clone(&handler);

                tokio::spawn(async move {
                    let _ = client.set_nodelay(true);
                    let target = match handshake(&mut client).await {
                        Ok(target) => target,
                        Err(e) => {
                            tracing::debug!("SOCKS5 handshake from {} failed: {}", peer, e);
                            return;
                        }
                    };

                    let request = SocksRequest::new(target, client).with_peer(peer);
                    if let Err(e) = handler.handle_request(request).await {
                        tracing::debug!("SOCKS5 request from {} rejected: {}", peer, e);
                    }
                });
            }
            Err(e) => {
                tracing::warn!("Accept error: {}", e);
            }
        }
    }
}

/// Read the greeting and the CONNECT request, returning the destination.
///
/// The final reply is left to [`SocksRequest::accept`].
pub async fn handshake<S>(client: &mut S) -> Result<TargetAddr>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // === Greeting ===
    let mut head = [0u8; 2];
    client.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(Error::Socks(format!("unsupported version 0x{:02x}", head[0])));
    }

    let mut methods = vec![0u8; head[1] as usize];
    client.read_exact(&mut methods).await?;
    if !methods.contains(&METHOD_NO_AUTH) {
        client
            .write_all(&[SOCKS_VERSION, METHOD_NONE_ACCEPTABLE])
            .await?;
        return Err(Error::Socks("no acceptable auth method".into()));
    }
    client.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;

    // === Request ===
    let mut req = [0u8; 4];
    client.read_exact(&mut req).await?;
    if req[0] != SOCKS_VERSION {
        return Err(Error::Socks(format!("unsupported version 0x{:02x}", req[0])));
    }
    if req[1] != CMD_CONNECT {
        client.write_all(&REPLY_COMMAND_UNSUPPORTED).await?;
        return Err(Error::Socks(format!("unsupported command 0x{:02x}", req[1])));
    }

    let target = match req[3] {
        0x01 => {
            let mut ip_port = [0u8; 6];
            client.read_exact(&mut ip_port).await?;
            let ip = Ipv4Addr::new(ip_port[0], ip_port[1], ip_port[2], ip_port[3]);
            let port = u16::from_be_bytes([ip_port[4], ip_port[5]]);
            TargetAddr::Ip(SocketAddr::new(IpAddr::V4(ip), port))
        }
        0x03 => {
            let mut len = [0u8; 1];
            client.read_exact(&mut len).await?;
            let mut domain_port = vec![0u8; len[0] as usize + 2];
            client.read_exact(&mut domain_port).await?;

            let split = domain_port.len() - 2;
            let port = u16::from_be_bytes([domain_port[split], domain_port[split + 1]]);
            let domain = String::from_utf8(domain_port[..split].to_vec())
                .map_err(|_| Error::Socks("domain is not valid UTF-8".into()))?;
            TargetAddr::Domain(domain, port)
        }
        0x04 => {
            let mut ip_port = [0u8; 18];
            client.read_exact(&mut ip_port).await?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&ip_port[..16]);
            let port = u16::from_be_bytes([ip_port[16], ip_port[17]]);
            TargetAddr::Ip(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        atyp => {
            client.write_all(&REPLY_ADDRESS_UNSUPPORTED).await?;
            return Err(Error::Socks(format!("unsupported address type 0x{:02x}", atyp)));
        }
    };

    Ok(target)
}
