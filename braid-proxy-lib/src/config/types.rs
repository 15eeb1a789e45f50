#![forbid(unsafe_code)]

use std::net::SocketAddr;

use serde::Deserialize;

/// Operating role of this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Accept upstream streams locally and fan them out over dialed
    /// downstream connections.
    Client,
    /// Accept downstream connections and open the upstream target for
    /// each new circuit.
    Server,
}

/// Flavor of the client-role front end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Frontend {
    /// A plain TCP listener; every accepted stream becomes a circuit.
    #[default]
    Plain,
    /// A SOCKS5 handshake precedes the stream.
    Socks5,
}

/// One downstream dial target; every circuit gets a connection to each.
#[derive(Debug, Clone, Deserialize)]
pub struct Downstream {
    /// "host:port"
    pub address: String,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct CircuitConfig {
    /// Grace period before a circuit with no downstream connections is
    /// force-closed, in milliseconds.
    #[serde(default = "default_axe_timeout_ms")]
    pub axe_timeout_ms: u64,
}

impl Default for CircuitConfig {
    fn default() -> CircuitConfig {
        CircuitConfig { axe_timeout_ms: default_axe_timeout_ms() }
    }
}

fn default_axe_timeout_ms() -> u64 {
    100
}

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub mode: Mode,
    /// Address to listen on: the front end (client role) or the
    /// downstream side (server role).
    pub listen: SocketAddr,
    /// Downstream addresses the client role dials; they are the
    /// round-robin members of every circuit, in configuration order.
    #[serde(default)]
    pub downstreams: Vec<Downstream>,
    /// Target the server role connects to for each new circuit,
    /// "host:port".
    #[serde(default)]
    pub upstream: Option<String>,
    /// Front-end flavor for the client role.
    #[serde(default)]
    pub frontend: Frontend,
    #[serde(default)]
    pub circuit: CircuitConfig,
    /// Bind address for the Prometheus text endpoint (optional).
    #[serde(default)]
    pub metrics: Option<SocketAddr>,
}
