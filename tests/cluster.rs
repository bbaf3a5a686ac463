//! Multi-node scenarios over loopback: gossip convergence, the reliable path for
//! oversized messages, and state exchange on join.

use parking_lot::Mutex;
use shard_gossip::{Options, Peer, PeerState, Shard, Spreader};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

struct OrderShard {
    ids: Mutex<BTreeSet<u64>>,
}

impl OrderShard {
    fn new(ids: &[u64]) -> Arc<Self> {
        Arc::new(Self {
            ids: Mutex::new(ids.iter().copied().collect()),
        })
    }

    fn insert(&self, ids: &[u64]) {
        self.ids.lock().extend(ids.iter().copied());
    }

    fn ids(&self) -> Vec<u64> {
        self.ids.lock().iter().copied().collect()
    }
}

impl Shard for OrderShard {
    fn name(&self) -> &str {
        "orders"
    }

    fn marshal_binary(&self) -> anyhow::Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.ids())?)
    }

    fn merge(&self, data: &[u8]) -> anyhow::Result<()> {
        let ids: Vec<u64> = serde_json::from_slice(data)?;
        self.insert(&ids);
        Ok(())
    }
}

struct Node {
    peer: Peer,
    orders: Arc<OrderShard>,
    channel: shard_gossip::Channel,
}

fn options(known_peers: Vec<String>, udp_buffer_size: usize) -> Options {
    let mut options = Options::default();
    options.known_peers = known_peers;
    options.join_ttl = Duration::from_millis(20);
    options.join_retry = 5;
    options.membership.bind_port = 0;
    options.membership.udp_buffer_size = udp_buffer_size;
    options.membership.retransmit_mult = 3;
    options.membership.gossip_interval = Duration::from_millis(20);
    options.membership.probe_interval = Duration::from_millis(50);
    options.membership.tcp_timeout = Duration::from_millis(500);
    options.membership.leave_timeout = Duration::from_millis(200);
    options
}

async fn start_node(seed: Option<&Node>, initial: &[u64], udp_buffer_size: usize) -> Node {
    let known = seed
        .map(|node| vec![node.peer.address().to_string()])
        .unwrap_or_default();

    let peer = Peer::new(options(known, udp_buffer_size)).await.unwrap();
    let orders = OrderShard::new(initial);
    let channel = peer.add_shard(orders.clone()).unwrap();
    peer.join(&CancellationToken::new()).await.unwrap();
    assert_eq!(peer.state(), PeerState::Joined);

    Node {
        peer,
        orders,
        channel,
    }
}

/// A founder plus two nodes joined through it, all aware of each other.
async fn start_cluster(udp_buffer_size: usize) -> (Node, Node, Node) {
    let a = start_node(None, &[], udp_buffer_size).await;
    let b = start_node(Some(&a), &[], udp_buffer_size).await;
    let c = start_node(Some(&a), &[], udp_buffer_size).await;

    wait_until("full membership", || {
        [&a, &b, &c].iter().all(|node| node.peer.member_count() == 3)
    })
    .await;

    (a, b, c)
}

async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn stop_all(nodes: &[&Node]) {
    for node in nodes {
        node.peer.stop().await.unwrap();
    }
}

#[tokio::test]
async fn test_small_updates_converge_through_gossip() {
    let (a, b, c) = start_cluster(1400).await;

    a.orders.insert(&[1]);
    a.channel.broadcast(b"[1]").unwrap();
    a.orders.insert(&[2]);
    a.channel.broadcast(b"[2]").unwrap();

    wait_until("B and C to hold both orders", || {
        b.orders.ids() == vec![1, 2] && c.orders.ids() == vec![1, 2]
    })
    .await;

    stop_all(&[&a, &b, &c]).await;
}

#[tokio::test]
async fn test_oversized_update_takes_reliable_path() {
    let (a, b, c) = start_cluster(200).await;

    let ids: Vec<u64> = (1000..1060).collect();
    let delta = serde_json::to_vec(&ids).unwrap();
    assert!(shard_gossip::shard::is_oversized(delta.len(), 200));

    a.orders.insert(&ids);
    a.channel.broadcast(&delta).unwrap();

    wait_until("B and C to receive the large delta", || {
        b.orders.ids() == ids && c.orders.ids() == ids
    })
    .await;
    assert_eq!(a.peer.registry().pending_broadcasts(), 0);

    stop_all(&[&a, &b, &c]).await;
}

#[tokio::test]
async fn test_join_exchanges_existing_state() {
    let a = start_node(None, &[1, 2, 3], 1400).await;
    let b = start_node(Some(&a), &[9], 1400).await;

    // The joiner merges the founder's snapshot before join returns.
    assert_eq!(b.orders.ids(), vec![1, 2, 3, 9]);

    wait_until("founder to merge the joiner's snapshot", || {
        a.orders.ids() == vec![1, 2, 3, 9]
    })
    .await;

    stop_all(&[&a, &b]).await;
}

#[tokio::test]
async fn test_stopped_node_leaves_cluster() {
    let (a, b, c) = start_cluster(1400).await;

    c.peer.stop().await.unwrap();
    c.peer.stop().await.unwrap();

    wait_until("A and B to drop C", || {
        a.peer.member_count() == 2 && b.peer.member_count() == 2
    })
    .await;
    assert!(c.channel.broadcast(b"[5]").is_err());

    stop_all(&[&a, &b]).await;
}
