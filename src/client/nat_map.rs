//! NAT address translation
//!
//! Clusters behind NAT gossip internal addresses; a [`NatMapper`] rewrites
//! them to externally reachable ones before any connection is opened.

use std::collections::HashMap;
use std::fmt;

use crate::cluster::address::NodeAddress;

/// Address translation hook applied to every gossiped address.
pub trait NatMapper: Send + Sync + fmt::Debug {
    fn map(&self, address: NodeAddress) -> NodeAddress;
}

/// Default mapper: addresses pass through unchanged.
#[derive(Debug, Default)]
pub struct IdentityNatMapper;

impl NatMapper for IdentityNatMapper {
    fn map(&self, address: NodeAddress) -> NodeAddress {
        address
    }
}

/// Fixed host:port translation table. Unmapped addresses pass through.
#[derive(Debug, Default)]
pub struct StaticNatMapper {
    mapping: HashMap<NodeAddress, NodeAddress>,
}

impl StaticNatMapper {
    pub fn new(mapping: HashMap<NodeAddress, NodeAddress>) -> Self {
        Self { mapping }
    }
}

impl NatMapper for StaticNatMapper {
    fn map(&self, address: NodeAddress) -> NodeAddress {
        match self.mapping.get(&address) {
            Some(mapped) => mapped.clone().with_tls(address.is_tls()),
            None => address,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_passes_through() {
        let addr = NodeAddress::new("10.0.0.1", 7000);
        assert_eq!(IdentityNatMapper.map(addr.clone()), addr);
    }

    #[test]
    fn static_mapping_translates_and_keeps_tls() {
        let mut mapping = HashMap::new();
        mapping.insert(
            NodeAddress::new("10.0.0.1", 7000),
            NodeAddress::new("203.0.113.5", 17000),
        );
        let mapper = StaticNatMapper::new(mapping);

        let mapped = mapper.map(NodeAddress::new("10.0.0.1", 7000).with_tls(true));
        assert_eq!(mapped.host(), "203.0.113.5");
        assert_eq!(mapped.port(), 17000);
        assert!(mapped.is_tls());

        let untouched = mapper.map(NodeAddress::new("10.0.0.9", 7000));
        assert_eq!(untouched.host(), "10.0.0.9");
    }
}
