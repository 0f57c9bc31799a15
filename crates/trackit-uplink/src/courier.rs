use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use tokio::io::AsyncWriteExt;
use tokio::net::{lookup_host, TcpStream, UdpSocket};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Udp,
    Tcp,
}

impl Transport {
    pub const ALL: [Transport; 2] = [Transport::Udp, Transport::Tcp];

    pub fn other(self) -> Transport {
        match self {
            Transport::Udp => Transport::Tcp,
            Transport::Tcp => Transport::Udp,
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Transport::Udp => "udp",
            Transport::Tcp => "tcp",
        })
    }
}

impl FromStr for Transport {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "udp" => Ok(Transport::Udp),
            "tcp" => Ok(Transport::Tcp),
            other => anyhow::bail!("unknown transport: {}", other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Destination {
    pub host: String,
    pub port: u16,
}

impl Destination {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Delivers one payload to one destination.
pub trait Courier: Send + Sync + 'static {
    fn deliver(
        &self,
        transport: Transport,
        dest: &Destination,
        payload: &[u8],
    ) -> impl Future<Output = Result<()>> + Send;
}

/// Real sockets. Host names are resolved on every send, never cached.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetCourier;

impl Courier for NetCourier {
    async fn deliver(&self, transport: Transport, dest: &Destination, payload: &[u8]) -> Result<()> {
        match transport {
            Transport::Udp => send_datagram(dest, payload).await,
            Transport::Tcp => send_stream(dest, payload).await,
        }
    }
}

async fn send_datagram(dest: &Destination, payload: &[u8]) -> Result<()> {
    let addrs: Vec<SocketAddr> = lookup_host((dest.host.as_str(), dest.port))
        .await
        .with_context(|| format!("resolve {}", dest))?
        .collect();
    anyhow::ensure!(!addrs.is_empty(), "no address for {}", dest);
    send_to_first(&addrs, payload).await.with_context(|| format!("udp {}", dest))
}

// Resolved addresses in order, like TcpStream::connect; the last error wins.
async fn send_to_first(addrs: &[SocketAddr], payload: &[u8]) -> Result<()> {
    let mut last = None;
    for &addr in addrs {
        match send_one(addr, payload).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                debug!("udp: {} failed, trying next address: {:#}", addr, e);
                last = Some(e);
            }
        }
    }
    Err(last.unwrap_or_else(|| anyhow::anyhow!("no address to send to")))
}

async fn send_one(addr: SocketAddr, payload: &[u8]) -> Result<()> {
    let local: SocketAddr = if addr.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(local).await.context("bind udp socket")?;
    let n = socket.send_to(payload, addr).await.with_context(|| format!("send to {}", addr))?;
    anyhow::ensure!(n == payload.len(), "short datagram: {} of {} bytes", n, payload.len());
    Ok(())
}

// One-shot: connect, write, flush, close.
async fn send_stream(dest: &Destination, payload: &[u8]) -> Result<()> {
    let mut tcp = TcpStream::connect((dest.host.as_str(), dest.port))
        .await
        .with_context(|| format!("connect {}", dest))?;
    tcp.write_all(payload).await.context("write")?;
    tcp.flush().await.context("flush")?;
    tcp.shutdown().await.context("shutdown")?;
    Ok(())
}
