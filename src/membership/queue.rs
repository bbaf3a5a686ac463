//! Transmit-limited broadcast queue.
//!
//! Holds user messages waiting to be piggybacked on gossip packets. Every time a
//! message is handed out its transmit count goes up; once it reaches the
//! retransmit limit for the current cluster size it is retired. Messages sent
//! the fewest times go first so fresh updates are not starved by old ones.

use parking_lot::Mutex;

/// Bytes a message costs on top of its own length inside a packet (the bincode
/// length prefix of a `Vec<u8>`).
pub const PER_MESSAGE_OVERHEAD: usize = 8;

/// Pending messages kept at most. Past this the oldest message is dropped, so a
/// node with nobody to gossip to does not accumulate updates forever.
pub const MAX_PENDING_BROADCASTS: usize = 1024;

struct QueuedBroadcast {
    transmits: usize,
    id: u64,
    msg: Vec<u8>,
}

#[derive(Default)]
struct QueueInner {
    items: Vec<QueuedBroadcast>,
    next_id: u64,
}

pub struct TransmitLimitedQueue {
    retransmit_mult: usize,
    num_nodes: Box<dyn Fn() -> usize + Send + Sync>,
    inner: Mutex<QueueInner>,
}

impl TransmitLimitedQueue {
    /// `num_nodes` is queried on every drain so the retransmit limit tracks
    /// cluster size.
    pub fn new<F>(retransmit_mult: usize, num_nodes: F) -> Self
    where
        F: Fn() -> usize + Send + Sync + 'static,
    {
        Self {
            retransmit_mult,
            num_nodes: Box::new(num_nodes),
            inner: Mutex::new(QueueInner::default()),
        }
    }

    pub fn queue_broadcast(&self, msg: Vec<u8>) {
        let mut inner = self.inner.lock();
        if inner.items.len() >= MAX_PENDING_BROADCASTS {
            let oldest = inner
                .items
                .iter()
                .enumerate()
                .min_by_key(|(_, item)| item.id)
                .map(|(pos, _)| pos);
            if let Some(pos) = oldest {
                let dropped = inner.items.swap_remove(pos);
                tracing::debug!(
                    "Broadcast queue full, dropping oldest message ({} bytes, {} transmit(s))",
                    dropped.msg.len(),
                    dropped.transmits
                );
            }
        }

        let id = inner.next_id;
        inner.next_id += 1;
        inner.items.push(QueuedBroadcast {
            transmits: 0,
            id,
            msg,
        });
    }

    /// Returns messages whose combined size (each charged `overhead` plus its
    /// length) fits in `limit - overhead`.
    pub fn get_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>> {
        let mut inner = self.inner.lock();
        if inner.items.is_empty() || limit <= overhead {
            return Vec::new();
        }

        let transmit_limit = retransmit_limit(self.retransmit_mult, (self.num_nodes)());

        // Least transmitted first, newest first among equals.
        inner
            .items
            .sort_by(|a, b| a.transmits.cmp(&b.transmits).then(b.id.cmp(&a.id)));

        let mut remaining = limit - overhead;
        let mut selected = Vec::new();

        for item in inner.items.iter_mut() {
            let cost = item.msg.len() + PER_MESSAGE_OVERHEAD;
            if cost > remaining {
                continue;
            }
            remaining -= cost;
            item.transmits += 1;
            selected.push(item.msg.clone());
        }

        inner.items.retain(|item| item.transmits < transmit_limit);

        selected
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every pending message.
    pub fn reset(&self) {
        self.inner.lock().items.clear();
    }
}

/// `mult * ceil(log10(n + 1))`, never below one.
pub fn retransmit_limit(retransmit_mult: usize, num_nodes: usize) -> usize {
    let scale = ((num_nodes as f64) + 1.0).log10().ceil() as usize;
    (retransmit_mult * scale).max(1)
}
