//! Cluster node addresses
//!
//! Equality and hashing consider only `(host, port)`; the TLS flag rides
//! along so addresses parsed from a TLS control connection produce TLS
//! connections in turn.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;

use crate::utils::ProtocolError;

/// Address of one cluster node
#[derive(Debug, Clone)]
pub struct NodeAddress {
    host: String,
    port: u16,
    tls: bool,
}

impl NodeAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            tls: false,
        }
    }

    /// Parse `host:port`, optionally prefixed with a `redis://` or
    /// `rediss://` scheme.
    pub fn parse(s: &str) -> Result<Self, ProtocolError> {
        let (rest, tls) = if let Some(rest) = s.strip_prefix("rediss://") {
            (rest, true)
        } else if let Some(rest) = s.strip_prefix("redis://") {
            (rest, false)
        } else {
            (s, false)
        };

        // rsplit so IPv6 literals with colons keep their host part intact
        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| ProtocolError::InvalidAddress(s.to_string()))?;
        if host.is_empty() {
            return Err(ProtocolError::InvalidAddress(s.to_string()));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| ProtocolError::InvalidAddress(s.to_string()))?;

        Ok(Self {
            host: host.trim_matches(['[', ']']).to_string(),
            port,
            tls,
        })
    }

    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_tls(&self) -> bool {
        self.tls
    }

    /// Whether the host part is a literal IP rather than a hostname.
    pub fn is_ip(&self) -> bool {
        self.host.parse::<IpAddr>().is_ok()
    }

    /// Same host and port with the IP substituted for the hostname.
    pub fn resolved(&self, ip: IpAddr) -> Self {
        Self {
            host: ip.to_string(),
            port: self.port,
            tls: self.tls,
        }
    }
}

impl PartialEq for NodeAddress {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.port == other.port
    }
}

impl Eq for NodeAddress {}

impl Hash for NodeAddress {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.hash(state);
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
