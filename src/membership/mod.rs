//! Membership & Discovery Module
//!
//! Implements a Gossip-based membership protocol (inspired by SWIM) that the shard
//! layer uses as its transport substrate. Nodes use this service to discover each
//! other, detect failures, and carry user broadcasts.
//!
//! ## Core Mechanisms
//! - **Gossip Protocol**: Periodic UDP pings/acks exchange member lists; queued user
//!   broadcasts are piggybacked on outgoing packets and on dedicated gossip rounds.
//! - **Failure Detection**: Uses a "Suspect" -> "Dead" transition model with timeouts.
//! - **Incarnation Numbers**: Solves conflict resolution when node state (Alive/Suspect) is disputed.
//! - **Stream Channel**: A TCP listener on the gossip port carries reliable point-to-point
//!   messages and full-state push/pull exchanges (on join and periodically).
//! - **Delegates**: Everything above the membership layer plugs in through [`Delegate`]
//!   and [`EventDelegate`].

pub mod delegate;
pub mod error;
pub mod queue;
pub mod service;
pub mod types;

pub use delegate::{ClusterTransport, Delegate, EventDelegate};
pub use error::ClusterError;
pub use queue::TransmitLimitedQueue;
pub use service::MembershipService;
pub use types::{Node, NodeId, NodeState};

#[cfg(test)]
mod tests;
