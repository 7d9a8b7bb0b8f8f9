//! Pubsub subscription hooks
//!
//! The topology manager notifies the subscription layer when an entry is
//! torn down and when slots change ownership so pubsub subscriptions can
//! be reattached to the node now serving them.

use std::sync::Arc;

use crate::cluster::entry::MasterSlaveEntry;

/// Subscription-layer callbacks invoked by the topology manager.
pub trait SubscribeService: Send + Sync {
    /// An entry has been removed; drop subscriptions bound to it.
    fn remove(&self, entry: &Arc<MasterSlaveEntry>);

    /// A slot changed ownership; reattach subscriptions keyed to it.
    fn reattach_pubsub(&self, slot: u16);
}

/// Default implementation for clients without a pubsub layer.
#[derive(Debug, Default)]
pub struct NoopSubscribeService;

impl SubscribeService for NoopSubscribeService {
    fn remove(&self, _entry: &Arc<MasterSlaveEntry>) {}

    fn reattach_pubsub(&self, _slot: u16) {}
}
