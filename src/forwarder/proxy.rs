//! Splices a tunnel connection and a local connection.
//!
//! Each direction runs as its own task. Whichever finishes first ends the
//! proxy: the other task is aborted and both connections are closed. Bytes the
//! slower direction still had in flight are dropped.

use std::{
    fmt, io,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    task::{JoinError, JoinHandle},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Bytes from the connector side to the local service.
    ToLocal,
    /// Bytes from the local service to the connector side.
    ToRemote,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::ToLocal => "to_local",
            Direction::ToRemote => "to_remote",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Copy buffer per direction; large enough for any UDP datagram.
pub const COPY_BUFFER_BYTES: usize = 64 * 1024;

#[derive(Debug)]
pub struct ProxyOutcome {
    /// The direction whose completion ended the proxy.
    pub first: Direction,
    /// Bytes delivered to the local service, including a cancelled copy's share.
    pub to_local: u64,
    /// Bytes delivered to the connector side.
    pub to_remote: u64,
    /// Set when the first direction ended with an I/O error instead of EOF.
    pub error: Option<io::Error>,
}

impl ProxyOutcome {
    pub fn bytes(&self, direction: Direction) -> u64 {
        match direction {
            Direction::ToLocal => self.to_local,
            Direction::ToRemote => self.to_remote,
        }
    }
}

async fn copy_then_shutdown<R, W>(mut r: R, mut w: W, carried: Arc<AtomicU64>) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_BYTES];
    let res = async {
        loop {
            let n = r.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            w.write_all(&buf[..n]).await?;
            carried.fetch_add(n as u64, Ordering::Relaxed);
        }
    }
    .await;
    let _ = w.shutdown().await;
    res
}

/// Owns a copy task and aborts it when dropped, so cancelling `splice`
/// cancels both directions with it.
struct CopyTask(JoinHandle<io::Result<()>>);

impl Drop for CopyTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl CopyTask {
    fn spawn<R, W>(r: R, w: W, carried: &Arc<AtomicU64>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self(tokio::spawn(copy_then_shutdown(r, w, carried.clone())))
    }

    async fn cancel(mut self) {
        self.0.abort();
        // Awaiting makes sure the task's halves are dropped before we return.
        let _ = (&mut self.0).await;
    }
}

fn flatten(res: Result<io::Result<()>, JoinError>) -> Option<io::Error> {
    match res {
        Ok(Ok(())) => None,
        Ok(Err(err)) => Some(err),
        Err(join_err) => Some(io::Error::other(join_err)),
    }
}

/// Runs until the first direction completes, then closes both connections.
pub async fn splice<A, B>(tunnel: A, local: B) -> ProxyOutcome
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (tunnel_rd, tunnel_wr) = tokio::io::split(tunnel);
    let (local_rd, local_wr) = tokio::io::split(local);

    let to_local_bytes = Arc::new(AtomicU64::new(0));
    let to_remote_bytes = Arc::new(AtomicU64::new(0));

    let mut to_local = CopyTask::spawn(tunnel_rd, local_wr, &to_local_bytes);
    let mut to_remote = CopyTask::spawn(local_rd, tunnel_wr, &to_remote_bytes);

    let (first, res) = tokio::select! {
        res = &mut to_local.0 => {
            to_remote.cancel().await;
            (Direction::ToLocal, res)
        }
        res = &mut to_remote.0 => {
            to_local.cancel().await;
            (Direction::ToRemote, res)
        }
    };

    ProxyOutcome {
        first,
        to_local: to_local_bytes.load(Ordering::Relaxed),
        to_remote: to_remote_bytes.load(Ordering::Relaxed),
        error: flatten(res),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn forwards_both_ways_until_first_eof() {
        let (tunnel, mut tunnel_peer) = tokio::io::duplex(1024);
        let (local, mut local_peer) = tokio::io::duplex(1024);

        let proxy = tokio::spawn(splice(tunnel, local));

        tunnel_peer.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        local_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        local_peer.write_all(b"world").await.unwrap();
        tunnel_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");

        local_peer.shutdown().await.unwrap();
        let out = proxy.await.unwrap();
        assert_eq!(out.first, Direction::ToRemote);
        assert_eq!(out.to_remote, 5);
        assert_eq!(out.to_local, 5);
        assert_eq!(out.bytes(Direction::ToLocal), 5);
        assert!(out.error.is_none());

        // Both sides observe the close.
        let mut rest = Vec::new();
        assert_eq!(tunnel_peer.read_to_end(&mut rest).await.unwrap(), 0);
        assert_eq!(local_peer.read_to_end(&mut rest).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn first_eof_closes_both_even_with_queued_bytes() {
        // Small buffers so the local->tunnel copy stalls with bytes queued.
        let (tunnel, mut tunnel_peer) = tokio::io::duplex(64);
        let (local, local_peer) = tokio::io::duplex(64);

        let proxy = tokio::spawn(splice(tunnel, local));

        const TOTAL: usize = 16 * 1024;
        let writer = tokio::spawn(async move {
            let mut local_peer = local_peer;
            let res = local_peer.write_all(&vec![7u8; TOTAL]).await;
            (res, local_peer)
        });

        // Let the slow direction fill up; nobody reads on the tunnel side.
        tokio::time::sleep(Duration::from_millis(50)).await;
        tunnel_peer.shutdown().await.unwrap();

        let out = tokio::time::timeout(Duration::from_secs(5), proxy)
            .await
            .expect("proxy must end on first eof")
            .unwrap();
        assert_eq!(out.first, Direction::ToLocal);

        // The local side is closed: its pending write fails and reads see EOF.
        let (res, mut local_peer) = tokio::time::timeout(Duration::from_secs(5), writer)
            .await
            .unwrap()
            .unwrap();
        assert!(res.is_err());
        let mut rest = Vec::new();
        assert_eq!(local_peer.read_to_end(&mut rest).await.unwrap(), 0);
        assert!(local_peer.write_all(b"late").await.is_err());

        // The loser's in-flight bytes were dropped.
        let mut got = Vec::new();
        tunnel_peer.read_to_end(&mut got).await.unwrap();
        assert!(got.len() < TOTAL);
        assert!(tunnel_peer.write_all(b"late").await.is_err());

        // The cancelled direction still reports what it delivered.
        assert!(out.to_remote > 0);
        assert!(out.to_remote <= got.len() as u64);
        assert_eq!(out.to_local, 0);
    }

    #[tokio::test]
    async fn cancelling_splice_stops_both_copies() {
        let (tunnel, mut tunnel_peer) = tokio::io::duplex(1024);
        let (local, mut local_peer) = tokio::io::duplex(1024);

        let proxy = tokio::spawn(splice(tunnel, local));

        tunnel_peer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        local_peer.read_exact(&mut buf).await.unwrap();

        proxy.abort();
        assert!(proxy.await.unwrap_err().is_cancelled());

        // Nothing written after the cancel reaches the local side, which sees EOF.
        let _ = tunnel_peer.write_all(b"late").await;
        let mut rest = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(5), local_peer.read_to_end(&mut rest))
            .await
            .expect("local side must be closed")
            .unwrap();
        assert_eq!(n, 0);
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn peer_drop_ends_proxy() {
        let (tunnel, tunnel_peer) = tokio::io::duplex(64);
        let (local, mut local_peer) = tokio::io::duplex(64);

        let proxy = tokio::spawn(splice(tunnel, local));
        drop(tunnel_peer);

        let out = proxy.await.unwrap();
        assert_eq!(out.first, Direction::ToLocal);
        let mut rest = Vec::new();
        assert_eq!(local_peer.read_to_end(&mut rest).await.unwrap(), 0);
    }
}
