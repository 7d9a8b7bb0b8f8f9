//! Error types for the cluster client

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Connection-related errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("failed to connect to {addr}: {source}")]
    ConnectFailed {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("TLS handshake failed: {0}")]
    TlsFailed(String),

    #[error("connection closed unexpectedly")]
    Closed,

    #[error("connect timeout after {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// RESP protocol and `CLUSTER NODES` format errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("unexpected response: expected {expected}, got {actual}")]
    UnexpectedResponse { expected: String, actual: String },

    #[error("server error: {0}")]
    ServerError(String),

    #[error("empty CLUSTER NODES response")]
    EmptyNodes,

    #[error("malformed cluster node line: {0}")]
    MalformedNodeLine(String),

    #[error("invalid node address: {0}")]
    InvalidAddress(String),
}

/// Top-level cluster manager error
#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to resolve {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("master node {node_id} doesn't have an address")]
    MasterWithoutAddress { node_id: String },

    #[error("no entry bound for slot {0}")]
    NoEntryForSlot(u16),

    #[error("failed to add master {address} for slot ranges {ranges}: server has FAIL flag")]
    MasterFailed { address: String, ranges: String },

    #[error(
        "not all slots are covered, only {available} slots are available \
         (set check_slots_coverage = false to skip this check){}",
        format_failed_masters(failed_masters)
    )]
    Coverage {
        available: usize,
        failed_masters: Vec<String>,
    },

    #[error(
        "can't connect to any cluster seed server {seeds:?}{}",
        format_last_error(last_error)
    )]
    NoSeedsAvailable {
        seeds: Vec<String>,
        last_error: Option<String>,
    },

    #[error(
        "can't connect to servers, failed masters according to cluster status: \
         {masters:?}{}",
        format_last_error(last_error)
    )]
    FailedMasters {
        masters: Vec<String>,
        last_error: Option<String>,
    },
}

fn format_failed_masters(failed: &[String]) -> String {
    if failed.is_empty() {
        String::new()
    } else {
        format!(", failed masters according to cluster status: {failed:?}")
    }
}

fn format_last_error(last: &Option<String>) -> String {
    match last {
        Some(e) => format!(" (last error: {e})"),
        None => String::new(),
    }
}

pub type Result<T> = std::result::Result<T, ClusterError>;
