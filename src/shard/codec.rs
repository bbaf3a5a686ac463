//! Wire envelope shared by gossip broadcasts, reliable sends and full-state
//! exchange.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Binds a shard name to data produced by that shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub key: String,
    pub data: Vec<u8>,
}

impl Payload {
    pub fn new(key: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            data: data.into(),
        }
    }
}

pub fn encode_payloads(payloads: &[Payload]) -> Result<Vec<u8>> {
    Ok(bincode::serialize(payloads)?)
}

pub fn decode_payloads(buf: &[u8]) -> Result<Vec<Payload>> {
    Ok(bincode::deserialize(buf)?)
}
