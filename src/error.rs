//! Crate-level error type.

use crate::membership::error::ClusterError;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// A shard reported an empty name on registration.
    #[error("shard name is empty")]
    EmptyShardName,

    /// Another shard already owns this name.
    #[error("shard `{0}` is already registered")]
    DuplicateShard(String),

    /// Payload envelope could not be encoded or decoded.
    #[error("payload codec error: {0}")]
    Codec(#[from] bincode::Error),

    /// The shard was removed or the peer stopped.
    #[error("message channel for shard `{0}` is closed")]
    ChannelClosed(String),

    /// Every join attempt failed.
    #[error("join retry timeout after {attempts} attempt(s)")]
    JoinTimeout { attempts: u32 },

    /// The caller cancelled the join loop.
    #[error("join cancelled")]
    Cancelled,

    /// Operation on a peer that has been stopped.
    #[error("peer is stopped")]
    Stopped,

    /// Invalid or unreadable configuration.
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Cluster(#[from] ClusterError),
}
