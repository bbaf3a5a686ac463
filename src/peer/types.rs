use serde::Serialize;

use crate::membership::{EventDelegate, Node};

/// Where a peer is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PeerState {
    Created,
    Joining,
    Joined,
    Stopped,
}

/// Logs membership changes.
pub struct PeerEvents;

impl EventDelegate for PeerEvents {
    fn notify_join(&self, node: &Node) {
        tracing::info!("Node joined: {} at {}", node.id, node.addr);
    }

    fn notify_leave(&self, node: &Node) {
        tracing::info!("Node left: {} at {} ({:?})", node.id, node.addr, node.state);
    }

    fn notify_update(&self, node: &Node) {
        tracing::debug!(
            "Node updated: {} at {} ({:?}, inc={})",
            node.id,
            node.addr,
            node.state,
            node.incarnation
        );
    }
}
