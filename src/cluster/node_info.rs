//! `CLUSTER NODES` gossip parsing
//!
//! Format per line:
//! `<id> <ip:port@cport> <flags> <master> <ping-sent> <pong-recv> <config-epoch> <link-state> <slot> <slot> ... <slot>`

use crate::utils::ProtocolError;

use super::address::NodeAddress;
use super::partition::SlotRange;
use super::slot::MAX_SLOT;

/// Flags a node can carry in the gossip snapshot.
///
/// Unknown tokens (e.g. the probabilistic `fail?`) are ignored; only a
/// definitive `fail` marks a node failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeFlag {
    Master,
    Slave,
    Myself,
    Fail,
    Handshake,
    Noaddr,
}

impl NodeFlag {
    fn parse(token: &str) -> Option<Self> {
        match token {
            "master" => Some(NodeFlag::Master),
            "slave" | "replica" => Some(NodeFlag::Slave),
            "myself" => Some(NodeFlag::Myself),
            "fail" => Some(NodeFlag::Fail),
            "handshake" => Some(NodeFlag::Handshake),
            "noaddr" => Some(NodeFlag::Noaddr),
            _ => None,
        }
    }
}

/// One parsed gossip line.
#[derive(Debug, Clone)]
pub struct RawNodeInfo {
    pub node_id: String,
    pub address: Option<NodeAddress>,
    pub flags: Vec<NodeFlag>,
    pub slave_of: Option<String>,
    pub slot_ranges: Vec<SlotRange>,
}

impl RawNodeInfo {
    pub fn has_flag(&self, flag: NodeFlag) -> bool {
        self.flags.contains(&flag)
    }
}

/// Parse a full `CLUSTER NODES` response.
///
/// Addresses inherit `tls` from the connection the snapshot came over, so
/// a TLS control connection yields TLS node addresses.
pub fn parse_cluster_nodes(text: &str, tls: bool) -> Result<Vec<RawNodeInfo>, ProtocolError> {
    let mut nodes = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        nodes.push(parse_node_line(line, tls)?);
    }

    if nodes.is_empty() {
        return Err(ProtocolError::EmptyNodes);
    }
    Ok(nodes)
}

/// Parse a single gossip line.
pub fn parse_node_line(line: &str, tls: bool) -> Result<RawNodeInfo, ProtocolError> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 8 {
        return Err(ProtocolError::MalformedNodeLine(line.to_string()));
    }

    let node_id = parts[0].to_string();
    let address = parse_gossip_address(parts[1], tls);

    let flags: Vec<NodeFlag> = parts[2].split(',').filter_map(NodeFlag::parse).collect();

    let slave_of = if parts[3] != "-" {
        Some(parts[3].to_string())
    } else {
        None
    };

    let mut slot_ranges = Vec::new();
    for token in &parts[8..] {
        if let Some(range) = parse_slot_token(token) {
            slot_ranges.push(range);
        }
    }

    Ok(RawNodeInfo {
        node_id,
        address,
        flags,
        slave_of,
        slot_ranges,
    })
}

/// Parse the address field.
///
/// Forms seen in the wild: `host:port@cport`, `host:port`, and the
/// ElastiCache `host:port@cport,hostname` variant. A node that lost its
/// address gossips `:0@0`, which yields `None`.
fn parse_gossip_address(field: &str, tls: bool) -> Option<NodeAddress> {
    let field = field.split(',').next().unwrap_or(field);
    let host_port = field.split('@').next().unwrap_or(field);

    let (host, port) = host_port.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    let port: u16 = port.parse().ok()?;

    Some(NodeAddress::new(host.trim_matches(['[', ']']), port).with_tls(tls))
}

/// Parse a slot token: `N` or `N-M`. Migrating tokens (`[...]`) and
/// out-of-range values are ignored for partition assignment.
fn parse_slot_token(token: &str) -> Option<SlotRange> {
    if token.contains('[') {
        return None;
    }

    let (start, end) = match token.split_once('-') {
        Some((start, end)) => (start.parse().ok()?, end.parse().ok()?),
        None => {
            let slot: u16 = token.parse().ok()?;
            (slot, slot)
        }
    };

    if start > end || end >= MAX_SLOT {
        return None;
    }
    Some(SlotRange::new(start, end))
}
