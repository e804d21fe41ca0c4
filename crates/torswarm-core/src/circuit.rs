use std::fmt;

use serde::{Deserialize, Serialize};

/// Local SOCKS listener that routes into one Tor circuit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SocksEndpoint {
    pub host: String,
    pub port: u16,
}

impl SocksEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Proxy URL with remote DNS resolution, so hostnames never leak locally.
    pub fn proxy_url(&self) -> String {
        format!("socks5h://{}:{}", self.host, self.port)
    }

    /// Proxy URL carrying per-generation SOCKS credentials.
    ///
    /// Tor isolates streams by SOCKS username (`IsolateSOCKSAuth`, on by
    /// default), so requests of a new generation never share a circuit with
    /// those of an older one.
    pub fn isolated_proxy_url(&self, generation: u64) -> String {
        format!(
            "socks5h://torswarm-g{generation}:x@{}:{}",
            self.host, self.port
        )
    }
}

impl fmt::Display for SocksEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Freshness of a circuit's identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CircuitHealth {
    /// Newly built; no fetch has gone through it yet.
    Fresh,
    /// Served at least one fetch.
    InUse,
    /// Tor could not build a usable circuit; out of rotation.
    Exhausted,
    /// A new circuit is being built.
    Renewing,
}

impl fmt::Display for CircuitHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CircuitHealth::Fresh => "fresh",
            CircuitHealth::InUse => "in-use",
            CircuitHealth::Exhausted => "exhausted",
            CircuitHealth::Renewing => "renewing",
        };
        write!(f, "{s}")
    }
}

/// One managed identity: a control session plus its SOCKS endpoint.
///
/// Handles are moved by value out of the pool on `acquire` and back on
/// `release`, so holding one is proof of exclusive checkout.
#[derive(Debug)]
pub struct CircuitHandle<S> {
    pub(crate) slot: usize,
    pub(crate) generation: u64,
    pub(crate) endpoint: SocksEndpoint,
    pub(crate) health: CircuitHealth,
    pub(crate) session: S,
}

impl<S> CircuitHandle<S> {
    pub(crate) fn new(slot: usize, endpoint: SocksEndpoint, session: S) -> Self {
        Self {
            slot,
            generation: 0,
            endpoint,
            health: CircuitHealth::Fresh,
            session,
        }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn endpoint(&self) -> &SocksEndpoint {
        &self.endpoint
    }

    pub fn health(&self) -> CircuitHealth {
        self.health
    }

    /// Record that a fetch went through this circuit.
    pub fn mark_used(&mut self) {
        if self.health == CircuitHealth::Fresh {
            self.health = CircuitHealth::InUse;
        }
    }
}
