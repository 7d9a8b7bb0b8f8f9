//! Utility modules

pub mod error;
pub mod resp;
pub mod shutdown;

pub use error::{ClusterError, ConnectionError, ProtocolError, Result};
pub use resp::{RespEncoder, RespValue};
pub use shutdown::{LatchGuard, ShutdownLatch};
