//! Sharded Gossip Replication Library
//!
//! Lets several independent data owners in one process share a single gossip-based
//! cluster membership. Each owner registers a named shard, publishes updates through
//! its own channel, and receives the updates and full-state snapshots other nodes
//! publish under the same name.
//!
//! ## Architecture Modules
//!
//! - **`peer`**: The per-node handle. Owns configuration, the shard registry and the
//!   membership service, and runs the join/retry/stop lifecycle.
//! - **`shard`**: The routing layer. The payload envelope codec, the registry that
//!   dispatches inbound data by shard name, and the channels that choose between
//!   gossip and reliable point-to-point delivery.
//! - **`membership`**: The cluster substrate. A UDP gossip protocol (SWIM-like) for
//!   discovery and failure detection, plus a TCP side channel for reliable sends and
//!   push/pull state exchange.
//! - **`config`**: Options with defaults, TOML loading and address resolution.
//! - **`error`**: The crate error type.

pub mod config;
pub mod error;
pub mod membership;
pub mod peer;
pub mod shard;

pub use config::{MembershipConfig, Options};
pub use error::{Error, Result};
pub use peer::{Peer, PeerState};
pub use shard::{Channel, Shard, ShardRegistry, Spreader};
