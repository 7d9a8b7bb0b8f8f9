//! Configuration module

pub mod cluster_config;

pub use cluster_config::{AuthConfig, ClusterConfig, ReadMode, TlsConfig};
