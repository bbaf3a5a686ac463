//! Shard Registry
//!
//! Maps shard names to the application objects that own them, and implements the
//! membership [`Delegate`] so inbound gossip, reliable messages and full-state
//! exchanges land in the right shard.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, OnceLock, Weak};
use tokio_util::sync::CancellationToken;

use super::Shard;
use super::channel::Channel;
use super::codec::{Payload, decode_payloads, encode_payloads};
use crate::error::{Error, Result};
use crate::membership::{ClusterTransport, Delegate, TransmitLimitedQueue};

/// Capacity of each channel's oversized-message queue.
pub const FANOUT_QUEUE_CAPACITY: usize = 200;

/// Late-bound handle to the membership layer. The registry is built before the
/// membership service (which needs it as its delegate), so the service is
/// attached afterwards.
pub(crate) type TransportSlot = Arc<OnceLock<Weak<dyn ClusterTransport>>>;

struct ShardEntry {
    shard: Arc<dyn Shard>,
    stop: CancellationToken,
}

pub struct ShardRegistry {
    shards: RwLock<HashMap<String, ShardEntry>>,
    broadcasts: Arc<TransmitLimitedQueue>,
    transport: TransportSlot,
    udp_buffer_size: usize,
    shutdown: CancellationToken,
}

impl ShardRegistry {
    /// Creates an empty registry. Cancelling `shutdown` closes every channel the
    /// registry hands out.
    pub fn new(udp_buffer_size: usize, retransmit_mult: usize, shutdown: CancellationToken) -> Self {
        let transport: TransportSlot = Arc::new(OnceLock::new());

        let slot = transport.clone();
        let broadcasts = Arc::new(TransmitLimitedQueue::new(retransmit_mult, move || {
            slot.get()
                .and_then(Weak::upgrade)
                .map_or(1, |transport| transport.num_members())
        }));

        Self {
            shards: RwLock::new(HashMap::new()),
            broadcasts,
            transport,
            udp_buffer_size,
            shutdown,
        }
    }

    /// Connects the registry to the membership layer used for member counts and
    /// reliable fan-out. Only the first call has an effect.
    pub fn attach_transport(&self, transport: Weak<dyn ClusterTransport>) {
        if self.transport.set(transport).is_err() {
            tracing::warn!("Cluster transport already attached to shard registry");
        }
    }

    /// Registers `shard` and returns the channel it publishes on.
    ///
    /// # Errors
    /// * [`Error::EmptyShardName`] if the shard has no name.
    /// * [`Error::DuplicateShard`] if the name is taken. The existing registration
    ///   is left untouched.
    /// * [`Error::Stopped`] if the owning peer has stopped.
    pub fn add_shard(&self, shard: Arc<dyn Shard>) -> Result<Channel> {
        let name = shard.name().to_string();
        if name.is_empty() {
            return Err(Error::EmptyShardName);
        }
        if self.shutdown.is_cancelled() {
            return Err(Error::Stopped);
        }

        let stop = self.shutdown.child_token();
        match self.shards.write().entry(name.clone()) {
            Entry::Occupied(_) => return Err(Error::DuplicateShard(name)),
            Entry::Vacant(slot) => {
                slot.insert(ShardEntry {
                    shard,
                    stop: stop.clone(),
                });
            }
        }

        tracing::info!("Registered shard: {}", name);

        Ok(Channel::spawn(
            name,
            self.broadcasts.clone(),
            self.transport.clone(),
            self.udp_buffer_size,
            FANOUT_QUEUE_CAPACITY,
            stop,
        ))
    }

    pub fn get_shard(&self, name: &str) -> Option<Arc<dyn Shard>> {
        self.shards.read().get(name).map(|entry| entry.shard.clone())
    }

    /// Unregisters `name` and closes its channel. Removing an unknown name is a
    /// no-op.
    pub fn remove_shard(&self, name: &str) -> Option<Arc<dyn Shard>> {
        let entry = self.shards.write().remove(name)?;
        entry.stop.cancel();
        tracing::info!("Removed shard: {}", name);
        Some(entry.shard)
    }

    /// Registered names, sorted.
    pub fn shard_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.shards.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn shard_count(&self) -> usize {
        self.shards.read().len()
    }

    /// Messages still waiting in the gossip retransmission queue.
    pub fn pending_broadcasts(&self) -> usize {
        self.broadcasts.len()
    }

    /// Hands every record to the shard named by its key.
    fn route(&self, payloads: Vec<Payload>, source: &str) {
        for payload in payloads {
            let Some(shard) = self.get_shard(&payload.key) else {
                tracing::debug!(
                    "{}: no local shard {:?}, dropping {} bytes",
                    source,
                    payload.key,
                    payload.data.len()
                );
                continue;
            };

            if let Err(e) = shard.merge(&payload.data) {
                tracing::error!("{}: merge into shard {:?} failed: {:#}", source, payload.key, e);
            }
        }
    }
}

impl Delegate for ShardRegistry {
    fn node_meta(&self, _limit: usize) -> Vec<u8> {
        Vec::new()
    }

    fn notify_msg(&self, msg: &[u8]) {
        if msg.is_empty() {
            return;
        }

        match decode_payloads(msg) {
            Ok(payloads) => self.route(payloads, "NotifyMsg"),
            Err(e) => tracing::warn!("NotifyMsg: dropping undecodable batch: {}", e),
        }
    }

    fn get_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>> {
        self.broadcasts.get_broadcasts(overhead, limit)
    }

    fn local_state(&self, _join: bool) -> Vec<u8> {
        let shards: Vec<(String, Arc<dyn Shard>)> = self
            .shards
            .read()
            .iter()
            .map(|(name, entry)| (name.clone(), entry.shard.clone()))
            .collect();

        if shards.is_empty() {
            return Vec::new();
        }

        let mut payloads = Vec::with_capacity(shards.len());
        for (name, shard) in shards {
            match shard.marshal_binary() {
                Ok(data) => payloads.push(Payload { key: name, data }),
                Err(e) => {
                    // Never hand out a partial snapshot.
                    tracing::warn!("LocalState: snapshot of shard {:?} failed: {:#}", name, e);
                    return Vec::new();
                }
            }
        }

        match encode_payloads(&payloads) {
            Ok(buf) => buf,
            Err(e) => {
                tracing::warn!("LocalState: encode error: {}", e);
                Vec::new()
            }
        }
    }

    fn merge_remote_state(&self, buf: &[u8], join: bool) {
        if buf.is_empty() {
            return;
        }

        match decode_payloads(buf) {
            Ok(payloads) => {
                tracing::debug!(
                    "MergeRemoteState: {} shard snapshot(s) (join={})",
                    payloads.len(),
                    join
                );
                self.route(payloads, "MergeRemoteState");
            }
            Err(e) => tracing::warn!("MergeRemoteState: decode error: {}", e),
        }
    }
}
