use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{Semaphore, watch},
    task::JoinSet,
};

use crate::forwarder::{
    config::Config,
    control::{ControlChannel, TunnelRequest},
    proxy::{self, Direction},
    registry::{PortRegistry, PortType},
    telemetry,
    transport::{Dialer, NetDialer},
    tunnel::{self, TunnelContext, TunnelState},
};

/// Runs the control loop and one tracked task per inbound tunnel request.
pub struct Orchestrator {
    ctx: Arc<TunnelContext>,
    limiter: Option<Arc<Semaphore>>,
    max_tunnels: usize,
    shutdown_timeout: Duration,
}

impl Orchestrator {
    pub fn new(cfg: &Config) -> Self {
        let dialer = NetDialer::new(Some(cfg.limits.dial_timeout), cfg.limits.udp_idle_timeout);
        Self::with_dialer(cfg, Arc::new(dialer))
    }

    pub fn with_dialer(cfg: &Config, dialer: Arc<dyn Dialer>) -> Self {
        let limiter = match cfg.limits.max_tunnels {
            0 => None,
            n => Some(Arc::new(Semaphore::new(n))),
        };
        Self {
            ctx: Arc::new(TunnelContext {
                connector: cfg.connector.clone(),
                secret: cfg.code,
                registry: PortRegistry::new(cfg.ports.clone()),
                dialer,
            }),
            limiter,
            max_tunnels: cfg.limits.max_tunnels,
            shutdown_timeout: cfg.limits.shutdown_timeout,
        }
    }

    /// Registers with the connector and serves tunnel requests until the
    /// control channel fails (an error) or `shutdown` flips to true (Ok).
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let info = self.ctx.registry.connector_info();
        let mut control = ControlChannel::connect(
            self.ctx.dialer.as_ref(),
            &self.ctx.connector,
            self.ctx.secret,
            &info,
        )
        .await?;

        tracing::info!(
            connector = %self.ctx.connector,
            transport = %self.ctx.dialer.name(),
            ports = info.ports.len(),
            max_tunnels = self.max_tunnels,
            "control: connected"
        );
        for p in info.ports.iter().filter(|p| p.port_type == PortType::Udp) {
            tracing::info!(
                remote_port = p.port_remote,
                local = %p.local_addr(),
                tunnel_type = %p.tunnel_type,
                "control: udp mapping; local side is dialed as datagrams"
            );
        }

        let mut tunnels = JoinSet::new();
        let res = loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break Ok(());
                    }
                }
                req = control.next_request() => match req {
                    Ok(req) => self.spawn_tunnel(&mut tunnels, req),
                    Err(err) => break Err(err),
                },
                Some(done) = tunnels.join_next(), if !tunnels.is_empty() => {
                    if let Err(err) = done {
                        if err.is_panic() {
                            tracing::error!(err = %err, "tunnel: task panicked");
                        }
                    }
                }
            }
        };

        match res {
            Ok(()) => {
                tracing::info!("control: shutting down");
                drain(tunnels, self.shutdown_timeout).await;
                Ok(())
            }
            Err(err) => {
                tracing::error!(
                    connector = %self.ctx.connector,
                    err = %err,
                    active_tunnels = tunnels.len(),
                    "control: channel terminated"
                );
                tunnels.shutdown().await;
                Err(err.into())
            }
        }
    }

    fn spawn_tunnel(&self, tunnels: &mut JoinSet<()>, req: TunnelRequest) {
        let ctx = self.ctx.clone();
        let limiter = self.limiter.clone();
        tunnels.spawn(run_tunnel(ctx, limiter, req));
    }
}

async fn run_tunnel(ctx: Arc<TunnelContext>, limiter: Option<Arc<Semaphore>>, req: TunnelRequest) {
    // Queue here rather than in the control loop so receives never block.
    let _permit = match limiter {
        Some(sem) => match sem.acquire_owned().await {
            Ok(p) => Some(p),
            Err(_) => return,
        },
        None => None,
    };
    let _active = telemetry::ActiveTunnelGuard::new();

    tracing::debug!(remote_port = req.remote_port, state = %TunnelState::Dialing, "tunnel: requested");

    let est = match tunnel::establish(&ctx, req).await {
        Ok(est) => est,
        Err(err) => {
            telemetry::record_failure(err.stage());
            tracing::warn!(
                remote_port = req.remote_port,
                stage = err.stage(),
                err = %err,
                state = %TunnelState::Closed,
                "tunnel: establish failed"
            );
            return;
        }
    };

    let local = est.mapping.local_addr();
    tracing::debug!(
        remote_port = req.remote_port,
        local = %local,
        proto = %est.mapping.port_type,
        state = %TunnelState::Proxying,
        "tunnel: proxying"
    );

    let out = proxy::splice(est.tunnel, est.local).await;
    for d in [Direction::ToLocal, Direction::ToRemote] {
        telemetry::record_bytes(d, out.bytes(d));
    }

    match &out.error {
        Some(err) => tracing::debug!(
            remote_port = req.remote_port,
            local = %local,
            first = %out.first,
            to_local = out.to_local,
            to_remote = out.to_remote,
            err = %err,
            state = %TunnelState::Closed,
            "tunnel: ended with error"
        ),
        None => tracing::debug!(
            remote_port = req.remote_port,
            local = %local,
            first = %out.first,
            to_local = out.to_local,
            to_remote = out.to_remote,
            state = %TunnelState::Closed,
            "tunnel: closed"
        ),
    }
}

async fn drain(mut tunnels: JoinSet<()>, timeout: Duration) {
    if tunnels.is_empty() {
        return;
    }
    tracing::info!(
        active = tunnels.len(),
        timeout = %humantime::format_duration(timeout),
        "tunnel: draining"
    );

    let wait_all = async {
        while tunnels.join_next().await.is_some() {}
    };
    let timed_out = tokio::time::timeout(timeout, wait_all).await.is_err();
    if timed_out {
        tracing::warn!(remaining = tunnels.len(), "tunnel: drain timed out; aborting");
        tunnels.shutdown().await;
    }
}
