//! Peer Module
//!
//! The per-node handle applications hold. A [`Peer`] owns the shard registry and
//! the membership service, wires one into the other, and drives the node through
//! its lifecycle.
//!
//! ## Lifecycle
//! 1. **Create**: [`Peer::new`] validates options, binds the gossip port and starts
//!    the membership loops. The node is a cluster of one.
//! 2. **Join**: [`Peer::join`] contacts the known peers every `join_ttl` until one
//!    answers, giving up after `join_retry` failed attempts. The first successful
//!    contact exchanges full shard state in both directions.
//! 3. **Stop**: [`Peer::stop`] announces departure, shuts the membership layer down
//!    and closes every shard channel. Stopping twice is harmless.

pub mod service;
pub mod types;

pub use service::Peer;
pub use types::{PeerEvents, PeerState};
