use std::path::PathBuf;

use anyhow::Context;

use crate::forwarder::{
    config::{self, Config, LoggingConfig, ResolvedConfigPath},
    logging,
    orchestrator::Orchestrator,
    telemetry,
};

/// Runs the forwarder until it is stopped or hits a fatal error.
///
/// Fatal configuration and control errors are logged and end the run with
/// `Ok(())`: the process exits without a distinguishing status and is expected
/// to be restarted by its supervisor.
pub async fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let (resolved, cfg) = match load(config_path) {
        Ok(v) => v,
        Err(err) => {
            // No config means no logging section; log with the defaults.
            let _logrt = logging::init(&LoggingConfig::default()).ok();
            tracing::error!(err = %format!("{err:#}"), "config: fatal");
            return Ok(());
        }
    };

    let logrt = logging::init(&cfg.logging)?;
    let _logrt_guard = logrt; // keep alive

    for key in &cfg.unknown_keys {
        tracing::warn!(config = %resolved.path.display(), key = %key, "config: ignoring unknown key");
    }
    if cfg.ports.is_empty() {
        tracing::warn!(config = %resolved.path.display(), "config: no ports configured");
    }

    tracing::info!(
        config = %resolved.path.display(),
        source = %resolved.source,
        connector = %cfg.connector,
        ports = cfg.ports.len(),
        max_tunnels = cfg.limits.max_tunnels,
        dial_timeout = %humantime::format_duration(cfg.limits.dial_timeout),
        "forwarder: starting"
    );

    if let Err(err) = serve(&cfg).await {
        tracing::error!(err = %format!("{err:#}"), "forwarder: fatal");
    }
    Ok(())
}

fn load(config_path: Option<PathBuf>) -> anyhow::Result<(ResolvedConfigPath, Config)> {
    let resolved = config::resolve_config_path(config_path)?;
    let cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;
    Ok((resolved, cfg))
}

/// Serves until a shutdown signal (Ok) or a control failure (Err). There is
/// no reconnect.
async fn serve(cfg: &Config) -> anyhow::Result<()> {
    if let Some(addr) = cfg.metrics_addr {
        telemetry::init_prometheus(addr)?;
        tracing::info!(metrics_addr = %addr, "metrics: serving prometheus");
    }

    let orchestrator = Orchestrator::new(cfg);
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut running = std::pin::pin!(orchestrator.run(shutdown_rx));

    tokio::select! {
        res = &mut running => res,
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
            let _ = shutdown_tx.send(true);
            running.await
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(err = %err, "shutdown: SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
