mod forwarder;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "local-forwarder",
    version,
    about = "Reverse-tunnel client: exposes local services through a remote connector"
)]
struct Cli {
    /// Path to the config file (.json/.toml/.yaml/.yml). If omitted, uses LOCAL_FORWARDER_CONFIG; then auto-detects config.json > config.toml > config.yaml > config.yml in the working directory; then falls back to the OS default path (Linux: /etc/local-forwarder/config.json; others: user config dir).
    #[arg(long, env = "LOCAL_FORWARDER_CONFIG")]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    forwarder::run(cli.config).await
}
