pub mod app;
pub mod codec;
pub mod config;
pub mod control;
pub mod datagram;
pub mod logging;
pub mod orchestrator;
pub mod proxy;
pub mod registry;
pub mod telemetry;
pub mod transport;
pub mod tunnel;

pub async fn run(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    app::run(config_path).await
}
