//! Message Channel
//!
//! The per-shard publishing handle. Small messages go on the shared gossip
//! retransmission queue. Oversized ones would not fit a gossip packet, so they are
//! queued for a single worker that sends each one over a stream to every other
//! member and waits for all sends before starting the next message. That keeps
//! the number of open connections at most the member count, however deep the
//! queue gets.

use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::codec::{Payload, encode_payloads};
use super::registry::TransportSlot;
use crate::error::{Error, Result};
use crate::membership::{ClusterTransport, TransmitLimitedQueue};

/// Publishes shard updates to the rest of the cluster.
pub trait Spreader: Send + Sync {
    /// Sends `msg` to every other node. Delivery is best effort.
    fn broadcast(&self, msg: &[u8]) -> Result<()>;
}

/// Whether an encoded message is too big for the gossip path.
pub fn is_oversized(encoded_len: usize, udp_buffer_size: usize) -> bool {
    encoded_len > udp_buffer_size / 2
}

#[derive(Clone)]
pub struct Channel {
    shard_name: String,
    broadcasts: Arc<TransmitLimitedQueue>,
    outbound: mpsc::Sender<Vec<u8>>,
    udp_buffer_size: usize,
    stop: CancellationToken,
}

impl Channel {
    pub(crate) fn spawn(
        shard_name: String,
        broadcasts: Arc<TransmitLimitedQueue>,
        transport: TransportSlot,
        udp_buffer_size: usize,
        capacity: usize,
        stop: CancellationToken,
    ) -> Self {
        let (outbound, inbound) = mpsc::channel(capacity);

        tokio::spawn(fanout_loop(
            shard_name.clone(),
            inbound,
            transport,
            stop.clone(),
        ));

        Self {
            shard_name,
            broadcasts,
            outbound,
            udp_buffer_size,
            stop,
        }
    }

    pub fn shard_name(&self) -> &str {
        &self.shard_name
    }

    /// True once the shard was removed or the peer stopped.
    pub fn is_closed(&self) -> bool {
        self.stop.is_cancelled()
    }
}

impl Spreader for Channel {
    fn broadcast(&self, msg: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ChannelClosed(self.shard_name.clone()));
        }

        let encoded = encode_payloads(&[Payload::new(self.shard_name.as_str(), msg)])?;

        if !is_oversized(encoded.len(), self.udp_buffer_size) {
            self.broadcasts.queue_broadcast(encoded);
            return Ok(());
        }

        match self.outbound.try_send(encoded) {
            Ok(()) => {
                tracing::debug!("Shard {:?}: queued oversized message for reliable fan-out", self.shard_name);
            }
            Err(TrySendError::Full(dropped)) => {
                tracing::warn!(
                    "Shard {:?}: reliable fan-out queue full, dropping {} byte message",
                    self.shard_name,
                    dropped.len()
                );
            }
            Err(TrySendError::Closed(_)) => {
                return Err(Error::ChannelClosed(self.shard_name.clone()));
            }
        }

        Ok(())
    }
}

async fn fanout_loop(
    shard_name: String,
    mut inbound: mpsc::Receiver<Vec<u8>>,
    transport: TransportSlot,
    stop: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            msg = inbound.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        let Some(transport) = transport.get().and_then(Weak::upgrade) else {
            tracing::warn!(
                "Shard {:?}: no cluster transport attached, dropping {} byte message",
                shard_name,
                msg.len()
            );
            continue;
        };

        fan_out(&shard_name, transport, msg).await;
    }

    inbound.close();
    tracing::debug!("Shard {:?}: reliable fan-out stopped", shard_name);
}

/// Sends `msg` to every other member concurrently and returns once all sends
/// have finished.
async fn fan_out(shard_name: &str, transport: Arc<dyn ClusterTransport>, msg: Vec<u8>) {
    let nodes = transport.other_members();
    if nodes.is_empty() {
        return;
    }

    let msg: Arc<[u8]> = msg.into();
    let mut sends = JoinSet::new();

    for node in nodes {
        let transport = transport.clone();
        let msg = msg.clone();
        sends.spawn(async move {
            let result = transport.send_reliable(&node, &msg).await;
            (node, result)
        });
    }

    while let Some(joined) = sends.join_next().await {
        match joined {
            Ok((_, Ok(()))) => {}
            Ok((node, Err(e))) => {
                tracing::error!(
                    "Shard {:?}: reliable send to {:?} failed: {}",
                    shard_name,
                    node.id,
                    e
                );
            }
            Err(e) => tracing::error!("Shard {:?}: send task failed: {}", shard_name, e),
        }
    }
}
