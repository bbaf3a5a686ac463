use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

/// Cluster-unique node name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct NodeId(pub String);

impl NodeId {
    /// Generates a random node name.
    pub fn new() -> Self {
        Self(format!("node-{}", uuid::Uuid::new_v4()))
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeState {
    Alive,
    Suspect,
    Dead,
    /// Departed voluntarily.
    Left,
}

impl NodeState {
    /// Whether the node still counts as a cluster member.
    pub fn is_member(self) -> bool {
        matches!(self, NodeState::Alive | NodeState::Suspect)
    }
}

/// Represents a single member in the cluster.
///
/// `addr` serves both the UDP gossip socket and the TCP stream listener.
/// The `incarnation` field is a logical clock used to order updates and resolve
/// conflicts (e.g., refuting a false "Suspect" claim).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub addr: SocketAddr,
    /// Opaque metadata published by the delegate.
    pub meta: Vec<u8>,
    pub state: NodeState,
    pub incarnation: u64,

    #[serde(skip)]
    pub last_seen: Option<Instant>,
}

/// Datagrams exchanged over UDP.
///
/// `broadcasts` carries user messages drained from the retransmission queue,
/// piggybacked on whatever packet is going out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum GossipMessage {
    Ping {
        from: NodeId,
        incarnation: u64,
        broadcasts: Vec<Vec<u8>>,
    },

    Ack {
        from: NodeId,
        incarnation: u64,
        members: Vec<Node>,
        broadcasts: Vec<Vec<u8>>,
    },

    Gossip {
        from: NodeId,
        broadcasts: Vec<Vec<u8>>,
    },

    Suspect {
        node_id: NodeId,
        incarnation: u64,
    },

    Alive {
        node_id: NodeId,
        incarnation: u64,
    },

    Leave {
        node_id: NodeId,
        incarnation: u64,
    },
}

/// Frames exchanged over a TCP stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StreamMessage {
    /// Full-state exchange: the sender's view of the cluster plus its
    /// delegate's local state. Answered with a `PushPull` from the receiver.
    PushPull {
        node: Node,
        members: Vec<Node>,
        join: bool,
        user_state: Vec<u8>,
    },

    /// Reliable point-to-point user message.
    User(Vec<u8>),
}
