use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortType {
    #[default]
    Tcp,
    Udp,
}

impl PortType {
    /// Case-insensitive; anything other than "udp" is TCP.
    pub fn normalize(s: &str) -> Self {
        if s.trim().eq_ignore_ascii_case("udp") {
            PortType::Udp
        } else {
            PortType::Tcp
        }
    }
}

impl fmt::Display for PortType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortType::Tcp => write!(f, "tcp"),
            PortType::Udp => write!(f, "udp"),
        }
    }
}

/// A remote-facing port and the local service it forwards to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub port_remote: u16,
    pub port_local: u16,
    pub local_ip: String,
    pub port_type: PortType,
    pub tunnel_type: PortType,
}

impl PortMapping {
    /// `ip:port` suitable for a dial; IPv6 literals are bracketed.
    pub fn local_addr(&self) -> String {
        let ip = self.local_ip.trim();
        if ip.contains(':') && !ip.starts_with('[') {
            format!("[{ip}]:{}", self.port_local)
        } else {
            format!("{ip}:{}", self.port_local)
        }
    }
}

/// Registry payload sent on the control connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectorInfo {
    pub ports: Vec<PortMapping>,
}

impl ConnectorInfo {
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    #[cfg(test)]
    pub fn from_json(b: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(b)
    }
}

/// Read-only lookup from remote port to local target.
#[derive(Debug, Clone, Default)]
pub struct PortRegistry {
    ports: Vec<PortMapping>,
}

impl PortRegistry {
    pub fn new(ports: Vec<PortMapping>) -> Self {
        Self { ports }
    }

    pub fn ports(&self) -> &[PortMapping] {
        &self.ports
    }

    pub fn connector_info(&self) -> ConnectorInfo {
        ConnectorInfo {
            ports: self.ports.clone(),
        }
    }

    /// Later entries win over earlier ones for the same remote port. Unknown
    /// ports resolve to the zero mapping so the local dial fails downstream.
    pub fn lookup(&self, remote_port: u16) -> PortMapping {
        self.ports
            .iter()
            .rev()
            .find(|p| p.port_remote == remote_port)
            .cloned()
            .unwrap_or_default()
    }
}
