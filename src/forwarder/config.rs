use std::{
    collections::BTreeMap,
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::{Deserialize, de::IgnoredAny};

use crate::forwarder::{
    datagram::UDP_IDLE_TIMEOUT,
    registry::{PortMapping, PortType},
};

pub const CONFIG_ENV: &str = "LOCAL_FORWARDER_CONFIG";

const CANDIDATES: [&str; 4] = ["config.json", "config.toml", "config.yaml", "config.yml"];

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
    Default,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Default => write!(f, "default"),
        }
    }
}

pub fn resolve_config_path(explicit_flag_path: Option<PathBuf>) -> anyhow::Result<ResolvedConfigPath> {
    resolve_config_path_in(explicit_flag_path, Path::new("."))
}

fn resolve_config_path_in(
    explicit_flag_path: Option<PathBuf>,
    cwd: &Path,
) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit_flag_path {
        return Ok(ResolvedConfigPath {
            path: normalize_explicit_path(&p)?,
            source: ConfigPathSource::Flag,
        });
    }

    // clap maps the env var into the flag already; this covers callers that
    // bypass the CLI.
    if let Some(p) = std::env::var_os(CONFIG_ENV) {
        if !p.is_empty() {
            return Ok(ResolvedConfigPath {
                path: normalize_explicit_path(Path::new(&p))?,
                source: ConfigPathSource::Env,
            });
        }
    }

    if let Ok(p) = discover_config_path(cwd) {
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        });
    }

    Ok(ResolvedConfigPath {
        path: default_config_path()?,
        source: ConfigPathSource::Default,
    })
}

fn normalize_explicit_path(p: &Path) -> anyhow::Result<PathBuf> {
    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    if let Ok(m) = fs::metadata(p) {
        if m.is_dir() {
            return Ok(discover_config_path(p).unwrap_or_else(|_| p.join(CANDIDATES[0])));
        }
    }
    Ok(p.to_path_buf())
}

fn discover_config_path(dir: &Path) -> anyhow::Result<PathBuf> {
    for c in CANDIDATES {
        let p = dir.join(c);
        if let Ok(m) = fs::metadata(&p) {
            if m.is_file() {
                return Ok(p);
            }
        }
    }
    anyhow::bail!("config: no config.* found in {}", dir.display())
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        return Ok(PathBuf::from("/etc/local-forwarder/config.json"));
    }

    #[cfg(not(target_os = "linux"))]
    {
        let proj = directories::ProjectDirs::from("dev", "local-forwarder", "local-forwarder")
            .context("config: resolve user config dir")?;
        Ok(proj.config_dir().join("config.json"))
    }
}

/// Validated, immutable configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub connector: String,
    pub code: u64,
    pub ports: Vec<PortMapping>,
    pub logging: LoggingConfig,
    pub limits: Limits,
    pub metrics_addr: Option<SocketAddr>,
    /// Keys present in the file but not understood; reported once logging is up.
    pub unknown_keys: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
            output: "stderr".into(),
            add_source: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Limits {
    /// Concurrently proxied tunnels; 0 means unbounded.
    pub max_tunnels: usize,
    /// Applies to every dial; zero means no deadline.
    pub dial_timeout: Duration,
    /// How long in-flight tunnels may drain after a shutdown signal.
    pub shutdown_timeout: Duration,
    /// A UDP tunnel closes after this long without a datagram either way.
    pub udp_idle_timeout: Duration,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_tunnels: 0,
            dial_timeout: Duration::ZERO,
            shutdown_timeout: Duration::from_secs(5),
            udp_idle_timeout: UDP_IDLE_TIMEOUT,
        }
    }
}

#[derive(Debug, Deserialize)]
struct FileConfig {
    #[serde(default)]
    connector: String,
    #[serde(default)]
    code: u64,
    #[serde(default)]
    ports: Vec<FilePort>,

    logging: Option<FileLogging>,

    max_tunnels: Option<i64>,
    dial_timeout_ms: Option<i64>,
    shutdown_timeout_ms: Option<i64>,
    udp_idle_timeout_ms: Option<i64>,
    #[serde(default)]
    metrics_addr: String,

    #[serde(flatten)]
    unknown: BTreeMap<String, IgnoredAny>,
}

#[derive(Debug, Deserialize)]
struct FilePort {
    #[serde(default)]
    remote: u16,
    #[serde(default)]
    local: u16,
    #[serde(default)]
    ip: String,
    #[serde(default, rename = "type")]
    port_type: String,
    #[serde(default, rename = "tunnelType")]
    tunnel_type: String,

    #[serde(flatten)]
    unknown: BTreeMap<String, IgnoredAny>,
}

#[derive(Debug, Deserialize)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let fc: FileConfig = match ext.as_str() {
        "json" => serde_json::from_str(&s).with_context(|| format!("parse json {}", path.display()))?,
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        _ => anyhow::bail!("config: unsupported config extension {:?} (expected .json, .toml or .yaml/.yml)", ext),
    };

    Config::from_file_config(fc)
}

fn millis(v: Option<i64>, default: Duration) -> Duration {
    match v {
        Some(ms) => Duration::from_millis(ms.max(0) as u64),
        None => default,
    }
}

impl Config {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let connector = fc.connector.trim().to_string();
        if connector.is_empty() {
            anyhow::bail!("config: connector is required (host:port)");
        }

        let defaults = Limits::default();
        let limits = Limits {
            max_tunnels: fc.max_tunnels.unwrap_or(0).max(0) as usize,
            dial_timeout: millis(fc.dial_timeout_ms, defaults.dial_timeout),
            shutdown_timeout: millis(fc.shutdown_timeout_ms, defaults.shutdown_timeout),
            udp_idle_timeout: millis(fc.udp_idle_timeout_ms, defaults.udp_idle_timeout),
        };

        let mut unknown_keys: Vec<String> = fc.unknown.into_keys().collect();
        for (i, p) in fc.ports.iter().enumerate() {
            unknown_keys.extend(p.unknown.keys().map(|k| format!("ports[{i}].{k}")));
        }

        let metrics_addr = match fc.metrics_addr.trim() {
            "" => None,
            a => Some(
                a.parse::<SocketAddr>()
                    .with_context(|| format!("config: invalid metrics_addr {a:?}"))?,
            ),
        };

        let mut logging = LoggingConfig::default();
        if let Some(l) = &fc.logging {
            if let Some(level) = l.level.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
                logging.level = level.to_string();
            }
            if let Some(fmt) = l.format.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
                logging.format = fmt.to_string();
            }
            if let Some(out) = l.output.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
                logging.output = out.to_string();
            }
            logging.add_source = l.add_source;
        }

        let ports = fc
            .ports
            .into_iter()
            .map(|p| PortMapping {
                port_remote: p.remote,
                port_local: p.local,
                local_ip: p.ip.trim().to_string(),
                port_type: PortType::normalize(&p.port_type),
                tunnel_type: PortType::normalize(&p.tunnel_type),
            })
            .collect();

        Ok(Config {
            connector,
            code: fc.code,
            ports,
            logging,
            limits,
            metrics_addr,
            unknown_keys,
        })
    }
}
