use std::{fmt, io, sync::Arc};

use thiserror::Error;
use tokio::io::AsyncWriteExt;

use crate::forwarder::{
    codec,
    control::TunnelRequest,
    registry::{PortMapping, PortRegistry, PortType},
    transport::{BoxedStream, Dialer},
};

/// Lifecycle of a single tunnel. Any failure moves straight to `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Dialing,
    TunnelEstablished,
    LocalConnected,
    Proxying,
    Closed,
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TunnelState::Dialing => "dialing",
            TunnelState::TunnelEstablished => "tunnel_established",
            TunnelState::LocalConnected => "local_connected",
            TunnelState::Proxying => "proxying",
            TunnelState::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("tunnel dial {addr}: {source}")]
    TunnelDial {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("tunnel register: {0}")]
    TunnelRegister(#[source] io::Error),
    #[error("local dial {addr}: {source}")]
    LocalDial {
        addr: String,
        #[source]
        source: io::Error,
    },
}

impl TunnelError {
    /// Short label for logs and metrics.
    pub fn stage(&self) -> &'static str {
        match self {
            TunnelError::TunnelDial { .. } => "tunnel_dial",
            TunnelError::TunnelRegister(_) => "tunnel_register",
            TunnelError::LocalDial { .. } => "local_dial",
        }
    }
}

/// Read-only state shared by every tunnel task.
pub struct TunnelContext {
    pub connector: String,
    pub secret: u64,
    pub registry: PortRegistry,
    pub dialer: Arc<dyn Dialer>,
}

impl fmt::Debug for TunnelContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelContext")
            .field("connector", &self.connector)
            .field("ports", &self.registry.ports().len())
            .field("dialer", &self.dialer.name())
            .finish_non_exhaustive()
    }
}

/// A tagged tunnel connection paired with its local connection, ready to proxy.
pub struct Established {
    pub mapping: PortMapping,
    pub tunnel: BoxedStream,
    pub local: BoxedStream,
}

impl fmt::Debug for Established {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Established")
            .field("mapping", &self.mapping)
            .finish_non_exhaustive()
    }
}

/// Dials the connector for `req` and tags the new connection with the
/// requested port and the shared secret.
pub async fn open_tunnel(ctx: &TunnelContext, req: TunnelRequest) -> Result<BoxedStream, TunnelError> {
    let mut tunnel = ctx
        .dialer
        .dial(&ctx.connector)
        .await
        .map_err(|source| TunnelError::TunnelDial {
            addr: ctx.connector.clone(),
            source,
        })?;

    let frame = codec::registration_frame(req.remote_port, ctx.secret);
    tunnel
        .write_all(&frame)
        .await
        .map_err(TunnelError::TunnelRegister)?;
    tunnel.flush().await.map_err(TunnelError::TunnelRegister)?;
    Ok(tunnel)
}

/// Dials the local service for `mapping`, over UDP when the mapping says so.
/// On failure the tunnel connection is shut down before it is dropped.
pub async fn dial_local(
    ctx: &TunnelContext,
    mapping: &PortMapping,
    mut tunnel: BoxedStream,
) -> Result<(BoxedStream, BoxedStream), TunnelError> {
    let addr = mapping.local_addr();
    let dialed = match mapping.port_type {
        PortType::Tcp => ctx.dialer.dial(&addr).await,
        PortType::Udp => ctx.dialer.dial_udp(&addr).await,
    };
    match dialed {
        Ok(local) => Ok((tunnel, local)),
        Err(source) => {
            let _ = tunnel.shutdown().await;
            drop(tunnel);
            Err(TunnelError::LocalDial { addr, source })
        }
    }
}

/// Resolves, dials and tags the tunnel, then dials the local target.
pub async fn establish(ctx: &TunnelContext, req: TunnelRequest) -> Result<Established, TunnelError> {
    let mapping = ctx.registry.lookup(req.remote_port);
    let tunnel = open_tunnel(ctx, req).await?;

    tracing::debug!(
        remote_port = req.remote_port,
        state = %TunnelState::TunnelEstablished,
        "tunnel: connector accepted"
    );

    let (tunnel, local) = dial_local(ctx, &mapping, tunnel).await?;

    tracing::debug!(
        remote_port = req.remote_port,
        local = %mapping.local_addr(),
        state = %TunnelState::LocalConnected,
        "tunnel: local connected"
    );

    Ok(Established { mapping, tunnel, local })
}
