use std::{io, time::Duration};

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::forwarder::datagram::{UDP_IDLE_TIMEOUT, UdpStream};

/// A bidirectional async byte stream.
///
/// Rust trait objects can only have a single non-auto "principal" trait, so we
/// wrap `AsyncRead + AsyncWrite` into a single trait.
pub trait AsyncStream: tokio::io::AsyncRead + tokio::io::AsyncWrite {}
impl<T> AsyncStream for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + ?Sized {}

pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

/// Opens outbound connections, both to the connector and to local services.
#[async_trait]
pub trait Dialer: Send + Sync {
    fn name(&self) -> &'static str;
    /// Stream connection; used for the connector and for TCP services.
    async fn dial(&self, addr: &str) -> io::Result<BoxedStream>;
    /// Connected datagram socket for UDP services.
    async fn dial_udp(&self, addr: &str) -> io::Result<BoxedStream>;
}

#[derive(Debug, Clone)]
pub struct NetDialer {
    /// `None` dials without a deadline.
    timeout: Option<Duration>,
    udp_idle: Duration,
}

impl Default for NetDialer {
    fn default() -> Self {
        Self::new(None, UDP_IDLE_TIMEOUT)
    }
}

impl NetDialer {
    pub fn new(timeout: Option<Duration>, udp_idle: Duration) -> Self {
        Self {
            timeout: timeout.filter(|t| !t.is_zero()),
            udp_idle: if udp_idle.is_zero() { UDP_IDLE_TIMEOUT } else { udp_idle },
        }
    }

    async fn bounded<T, F>(&self, addr: &str, fut: F) -> io::Result<T>
    where
        F: Future<Output = io::Result<T>>,
    {
        match self.timeout {
            Some(t) => tokio::time::timeout(t, fut).await.map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("dial {addr}: timed out after {}", humantime::format_duration(t)),
                )
            })?,
            None => fut.await,
        }
    }
}

#[async_trait]
impl Dialer for NetDialer {
    fn name(&self) -> &'static str {
        "net"
    }

    async fn dial(&self, addr: &str) -> io::Result<BoxedStream> {
        let c = self.bounded(addr, TcpStream::connect(addr)).await?;
        c.set_nodelay(true)?;
        Ok(Box::new(c))
    }

    async fn dial_udp(&self, addr: &str) -> io::Result<BoxedStream> {
        let s = self.bounded(addr, UdpStream::connect(addr, self.udp_idle)).await?;
        Ok(Box::new(Box::pin(s)))
    }
}
