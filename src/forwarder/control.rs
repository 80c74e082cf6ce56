//! The control connection: registration handshake and inbound tunnel requests.
//!
//! Notifications carry no length prefix. Every receive is taken as exactly one
//! request whose first two bytes name the remote port; anything after that in
//! the same receive is dropped. This matches what the rendezvous server sends
//! today (one write per request) and is kept as-is for wire compatibility.

use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::forwarder::{
    codec::{self, FramingError, ProtocolError},
    registry::ConnectorInfo,
    transport::{BoxedStream, Dialer},
};

pub const RECV_BUFFER_BYTES: usize = 1024;

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("control: dial {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("control: register: {0}")]
    Register(#[source] io::Error),
    #[error("control: read: {0}")]
    Read(#[source] io::Error),
    #[error("control: connection closed by connector")]
    Eof,
    #[error("control: {0}")]
    Framing(#[from] FramingError),
    #[error("control: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("control: channel already terminated")]
    Closed,
}

/// One inbound notification: the connector wants a tunnel for `remote_port`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelRequest {
    pub remote_port: u16,
}

pub struct ControlChannel<S> {
    conn: Option<S>,
    buf: Box<[u8; RECV_BUFFER_BYTES]>,
}

impl ControlChannel<BoxedStream> {
    /// Dials the connector and performs the registration handshake.
    pub async fn connect(
        dialer: &dyn Dialer,
        connector: &str,
        secret: u64,
        info: &ConnectorInfo,
    ) -> Result<Self, ControlError> {
        let conn = dialer
            .dial(connector)
            .await
            .map_err(|source| ControlError::Dial {
                addr: connector.to_string(),
                source,
            })?;
        Self::register(conn, secret, info).await
    }
}

impl<S> ControlChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Sends the control registration frame followed by the registry payload.
    pub async fn register(mut conn: S, secret: u64, info: &ConnectorInfo) -> Result<Self, ControlError> {
        let json = info.to_json().map_err(ProtocolError::from)?;
        let payload = codec::registry_frame(&json)?;

        conn.write_all(&codec::registration_frame(codec::CONTROL_PORT, secret))
            .await
            .map_err(ControlError::Register)?;
        conn.write_all(&payload).await.map_err(ControlError::Register)?;
        conn.flush().await.map_err(ControlError::Register)?;

        tracing::debug!(ports = info.ports.len(), json_bytes = json.len(), "control: registered");

        Ok(Self {
            conn: Some(conn),
            buf: Box::new([0u8; RECV_BUFFER_BYTES]),
        })
    }

    /// Waits for the next tunnel request.
    ///
    /// Any failure ends the channel for good: the connection is dropped and later
    /// calls return [`ControlError::Closed`]. Cancel safe; a cancelled call
    /// consumes nothing.
    pub async fn next_request(&mut self) -> Result<TunnelRequest, ControlError> {
        let Some(conn) = self.conn.as_mut() else {
            return Err(ControlError::Closed);
        };

        let res = match conn.read(&mut self.buf[..]).await {
            Ok(0) => Err(ControlError::Eof),
            Ok(n) => codec::decode_u16(&self.buf[..n])
                .map(|remote_port| TunnelRequest { remote_port })
                .map_err(ControlError::from),
            Err(err) => Err(ControlError::Read(err)),
        };

        if res.is_err() {
            self.conn = None;
        }
        res
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.conn.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forwarder::registry::{PortMapping, PortType};

    fn info() -> ConnectorInfo {
        ConnectorInfo {
            ports: vec![PortMapping {
                port_remote: 8080,
                port_local: 3000,
                local_ip: "127.0.0.1".into(),
                port_type: PortType::Tcp,
                tunnel_type: PortType::Tcp,
            }],
        }
    }

    #[tokio::test]
    async fn handshake_bytes() {
        let (a, mut b) = tokio::io::duplex(4096);
        let _ch = ControlChannel::register(a, 42, &info()).await.unwrap();

        let mut head = [0u8; 10];
        b.read_exact(&mut head).await.unwrap();
        assert_eq!(head, [0, 0, 0, 0, 0, 0, 0, 0, 0, 42]);

        let n = b.read_u16().await.unwrap() as usize;
        let mut body = vec![0u8; n];
        b.read_exact(&mut body).await.unwrap();
        assert_eq!(ConnectorInfo::from_json(&body).unwrap(), info());
    }

    #[tokio::test]
    async fn one_receive_is_one_request() {
        let (a, mut b) = tokio::io::duplex(4096);
        let mut ch = ControlChannel::register(a, 7, &ConnectorInfo::default()).await.unwrap();

        // Trailing bytes in the same receive are discarded.
        b.write_all(&[0x1f, 0x90, 0xde, 0xad]).await.unwrap();
        assert_eq!(ch.next_request().await.unwrap(), TunnelRequest { remote_port: 8080 });

        b.write_all(&[0x00, 0x16]).await.unwrap();
        assert_eq!(ch.next_request().await.unwrap().remote_port, 22);
        assert!(!ch.is_closed());
    }

    #[tokio::test]
    async fn short_receive_terminates() {
        let (a, mut b) = tokio::io::duplex(4096);
        let mut ch = ControlChannel::register(a, 7, &ConnectorInfo::default()).await.unwrap();

        b.write_all(&[0x1f]).await.unwrap();
        match ch.next_request().await {
            Err(ControlError::Framing(e)) => assert_eq!(e, FramingError { needed: 2, got: 1 }),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(ch.is_closed());

        // Non-restartable even if more data shows up.
        b.write_all(&[0x1f, 0x90]).await.unwrap();
        assert!(matches!(ch.next_request().await, Err(ControlError::Closed)));
    }

    #[tokio::test]
    async fn peer_close_terminates() {
        let (a, b) = tokio::io::duplex(4096);
        let mut ch = ControlChannel::register(a, 7, &ConnectorInfo::default()).await.unwrap();
        drop(b);
        assert!(matches!(ch.next_request().await, Err(ControlError::Eof)));
        assert!(matches!(ch.next_request().await, Err(ControlError::Closed)));
    }

    #[tokio::test]
    async fn register_fails_when_peer_gone() {
        let (a, b) = tokio::io::duplex(64);
        drop(b);
        let res = ControlChannel::register(a, 7, &info()).await;
        assert!(matches!(res, Err(ControlError::Register(_))));
    }
}
