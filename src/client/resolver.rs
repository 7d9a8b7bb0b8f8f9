//! Hostname resolution
//!
//! The partition parser resolves gossiped hostnames to literal IPs before
//! they enter the routing state; the monitor re-resolves the configured
//! endpoint hostname to enumerate candidate nodes.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;

use crate::cluster::address::NodeAddress;

/// Async hostname resolver.
#[async_trait]
pub trait AddressResolver: Send + Sync {
    /// Resolve a hostname to all its socket addresses, in resolver order.
    async fn resolve_all(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>>;
}

/// System resolver backed by `tokio::net::lookup_host`.
#[derive(Debug, Default)]
pub struct DnsResolver;

#[async_trait]
impl AddressResolver for DnsResolver {
    async fn resolve_all(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port)).await?.collect();
        if addrs.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no addresses found for {host}"),
            ));
        }
        Ok(addrs)
    }
}

/// Resolve a node address to a literal IP, keeping port and TLS flag.
///
/// Addresses that are already literal IPs skip the resolver round-trip.
pub async fn resolve_address(
    resolver: &dyn AddressResolver,
    address: &NodeAddress,
) -> io::Result<NodeAddress> {
    if address.is_ip() {
        return Ok(address.clone());
    }
    let resolved = resolver.resolve_all(address.host(), address.port()).await?;
    match resolved.first() {
        Some(socket) => Ok(address.resolved(socket.ip())),
        None => Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no addresses found for {}", address.host()),
        )),
    }
}
