//! Cluster manager configuration

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::client::nat_map::{IdentityNatMapper, NatMapper};
use crate::cluster::address::NodeAddress;
use crate::utils::{ClusterError, Result};

/// Where read commands may be routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadMode {
    /// Reads go to the master only; slave pools are not initialized for reads.
    Master,
    /// Reads go to slaves.
    #[default]
    Slave,
    /// Reads are balanced over master and slaves.
    MasterSlave,
}

/// Authentication configuration
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub password: String,
    pub username: Option<String>,
}

/// TLS settings for control connections.
///
/// With no CA path the platform trust store is used; `skip_verify`
/// disables certificate verification entirely. `sni` overrides the
/// server name when nodes are addressed by IP.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    pub skip_verify: bool,
    pub ca_cert: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
    pub sni: Option<String>,
}

impl TlsConfig {
    /// Certificate and key paths when mutual TLS is configured; `None`
    /// unless both are present.
    pub fn client_identity(&self) -> Option<(&Path, &Path)> {
        match (&self.client_cert, &self.client_key) {
            (Some(cert), Some(key)) => Some((cert.as_path(), key.as_path())),
            _ => None,
        }
    }
}

/// Complete cluster manager configuration
#[derive(Clone)]
pub struct ClusterConfig {
    /// Seed addresses used for bootstrap (at least one required).
    pub node_addresses: Vec<NodeAddress>,
    /// Delay between topology monitor ticks.
    pub scan_interval: Duration,
    /// Fail startup unless all 16384 slots are covered.
    pub check_slots_coverage: bool,
    /// Read routing mode; slave clients are read-only unless `Master`.
    pub read_mode: ReadMode,
    /// Skip slave discovery and balancer setup entirely.
    pub check_skip_slaves_init: bool,
    /// Timeout for opening a control connection.
    pub connect_timeout: Duration,
    pub auth: Option<AuthConfig>,
    pub tls: Option<TlsConfig>,
    /// Address translation for clusters behind NAT.
    pub nat_mapper: Arc<dyn NatMapper>,
}

impl ClusterConfig {
    pub fn new(node_addresses: Vec<NodeAddress>) -> Self {
        Self {
            node_addresses,
            scan_interval: Duration::from_secs(5),
            check_slots_coverage: true,
            read_mode: ReadMode::default(),
            check_skip_slaves_init: false,
            connect_timeout: Duration::from_secs(10),
            auth: None,
            tls: None,
            nat_mapper: Arc::new(IdentityNatMapper),
        }
    }

    pub fn scan_interval(mut self, interval: Duration) -> Self {
        self.scan_interval = interval;
        self
    }

    pub fn check_slots_coverage(mut self, check: bool) -> Self {
        self.check_slots_coverage = check;
        self
    }

    pub fn read_mode(mut self, mode: ReadMode) -> Self {
        self.read_mode = mode;
        self
    }

    pub fn check_skip_slaves_init(mut self, skip: bool) -> Self {
        self.check_skip_slaves_init = skip;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn auth(mut self, auth: AuthConfig) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn nat_mapper(mut self, mapper: Arc<dyn NatMapper>) -> Self {
        self.nat_mapper = mapper;
        self
    }

    /// Whether slave clients should be opened read-only.
    pub fn readonly_slaves(&self) -> bool {
        self.read_mode != ReadMode::Master
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_addresses.is_empty() {
            return Err(ClusterError::Config(
                "at least one cluster node must be defined".to_string(),
            ));
        }
        Ok(())
    }

    /// Seed hostname for periodic re-resolution: set only when a single
    /// non-IP seed was supplied.
    pub fn config_endpoint_host(&self) -> Option<String> {
        match self.node_addresses.as_slice() {
            [seed] if !seed.is_ip() => Some(seed.host().to_string()),
            _ => None,
        }
    }
}
