//! Callback contracts between the membership layer and the code built on it.

use async_trait::async_trait;

use super::error::ClusterError;
use super::types::Node;

/// Hooks the membership layer calls into. Invoked from its background tasks,
/// concurrently with application threads.
pub trait Delegate: Send + Sync {
    /// Metadata advertised for the local node, at most `limit` bytes.
    fn node_meta(&self, limit: usize) -> Vec<u8>;

    /// A user message arrived, either piggybacked on gossip or over a stream.
    fn notify_msg(&self, msg: &[u8]);

    /// Pending user broadcasts fitting in `limit` bytes, `overhead` of which
    /// the enclosing packet already uses.
    fn get_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>>;

    /// Full local state sent during a push/pull exchange.
    fn local_state(&self, join: bool) -> Vec<u8>;

    /// State received from a remote node during a push/pull exchange.
    fn merge_remote_state(&self, buf: &[u8], join: bool);
}

/// Membership change notifications. All methods default to no-ops.
pub trait EventDelegate: Send + Sync {
    fn notify_join(&self, _node: &Node) {}

    fn notify_leave(&self, _node: &Node) {}

    fn notify_update(&self, _node: &Node) {}
}

/// The slice of the membership layer a message channel needs for reliable
/// fan-out.
#[async_trait]
pub trait ClusterTransport: Send + Sync {
    /// Current members excluding the local node.
    fn other_members(&self) -> Vec<Node>;

    /// Current member count including the local node.
    fn num_members(&self) -> usize;

    /// Delivers `msg` to `node` over a stream connection.
    async fn send_reliable(&self, node: &Node, msg: &[u8]) -> Result<(), ClusterError>;
}
