//! Shard Routing Module
//!
//! Lets independent data owners share one gossip substrate. Each owner registers a
//! [`Shard`] under a unique name and gets back a [`Channel`] to publish updates on.
//!
//! ## Core Concepts
//! - **Payload envelope**: every message on the wire is a list of `{key, data}` records,
//!   the key being the name of the shard that produced the data.
//! - **Registry**: [`ShardRegistry`] routes inbound messages and full-state snapshots to
//!   the shard named by each record. It is the delegate the membership layer calls.
//! - **Dual-path dissemination**: small messages ride the gossip retransmission queue;
//!   oversized ones go point-to-point over streams to every other member.
//! - **Anti-entropy**: on join and periodically, whole-registry snapshots are exchanged
//!   and merged, repairing anything gossip missed.

pub mod channel;
pub mod codec;
pub mod registry;

pub use channel::{Channel, Spreader, is_oversized};
pub use codec::Payload;
pub use registry::ShardRegistry;


/// A named unit of replicated data owned by the application.
pub trait Shard: Send + Sync {
    /// Registry-unique, non-empty name. Used as the routing key on the wire.
    fn name(&self) -> &str;

    /// Self-contained snapshot of the shard, sent to other nodes during
    /// anti-entropy exchanges.
    fn marshal_binary(&self) -> anyhow::Result<Vec<u8>>;

    /// Absorbs a remote snapshot or delta. Must tolerate re-delivery of the same
    /// data and must not assume any prior state.
    fn merge(&self, data: &[u8]) -> anyhow::Result<()>;
}
