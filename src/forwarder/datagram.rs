//! A connected UDP socket exposed as a byte stream so the proxy can splice it
//! with a tunnel connection.
//!
//! Each write sends one datagram and each read yields one datagram. Datagram
//! boundaries are not carried over the tunnel: whatever one tunnel read returns
//! goes out as one datagram. Reads report EOF once no traffic has passed in
//! either direction for the idle timeout; an empty datagram also reads as EOF.

use std::{
    io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use pin_project_lite::pin_project;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::UdpSocket,
    time::{Instant, Sleep},
};

pub const UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

pin_project! {
    /// Not `Unpin`; box-pin it to use it as a `BoxedStream`.
    pub struct UdpStream {
        socket: UdpSocket,
        idle: Duration,
        #[pin]
        deadline: Sleep,
    }
}

impl UdpStream {
    /// Binds an ephemeral socket of the target's family and connects it.
    pub async fn connect(addr: &str, idle: Duration) -> io::Result<Self> {
        let target = tokio::net::lookup_host(addr).await?.next().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("resolve {addr}: no address"))
        })?;
        let bind = if target.is_ipv4() {
            SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0)
        } else {
            SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 0)
        };

        let socket = UdpSocket::bind(bind).await?;
        socket.connect(target).await?;
        Ok(Self {
            socket,
            idle,
            deadline: tokio::time::sleep(idle),
        })
    }
}

impl AsyncRead for UdpStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let mut this = self.project();
        match this.socket.poll_recv(cx, buf) {
            Poll::Ready(Ok(())) => {
                this.deadline.as_mut().reset(Instant::now() + *this.idle);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(err)) => Poll::Ready(Err(err)),
            // Idle: nothing filled, which callers read as EOF.
            Poll::Pending => match this.deadline.poll(cx) {
                Poll::Ready(()) => Poll::Ready(Ok(())),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

impl AsyncWrite for UdpStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.project();
        match this.socket.poll_send(cx, data) {
            Poll::Ready(Ok(n)) => {
                this.deadline.reset(Instant::now() + *this.idle);
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
