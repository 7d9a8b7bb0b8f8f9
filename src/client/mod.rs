//! Client connection layer

pub mod nat_map;
pub mod node_connection;
pub mod pool;
pub mod resolver;
pub mod subscribe;
#[cfg(feature = "tls")]
pub mod tls;

pub use nat_map::{IdentityNatMapper, NatMapper, StaticNatMapper};
pub use node_connection::{ControlPlane, NodeConnection, NodeConnections};
pub use pool::{
    BasicPool, BasicPoolFactory, ClientHandle, ConnectionPool, FreezeReason, NodeRole,
    PoolFactory, PoolMember,
};
pub use resolver::{AddressResolver, DnsResolver};
pub use subscribe::{NoopSubscribeService, SubscribeService};
