//! Membership Module Tests
//!
//! Validates the fundamental components of the cluster membership system.
//!
//! ## Test Scopes
//! - **Data Structures**: Ensures uniqueness of IDs and correct serialization of wire protocol messages.
//! - **Service Logic**: Verifies initialization, joining via push/pull, reliable sends and departure.
//! - **Dissemination**: Checks that queued user broadcasts ride gossip packets to other members.

#[cfg(test)]
mod tests {
    use crate::config::MembershipConfig;
    use crate::membership::delegate::{Delegate, EventDelegate};
    use crate::membership::error::ClusterError;
    use crate::membership::queue::TransmitLimitedQueue;
    use crate::membership::service::MembershipService;
    use crate::membership::types::{GossipMessage, Node, NodeId, NodeState, StreamMessage};
    use parking_lot::Mutex;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    // ============================================================
    // NODE ID TESTS
    // ============================================================

    #[test]
    fn test_node_id_is_unique() {
        let id1 = NodeId::new();
        let id2 = NodeId::new();

        assert_ne!(id1, id2, "Each NodeId should be unique");
        assert!(id1.to_string().starts_with("node-"));
    }

    #[test]
    fn test_node_id_hash() {
        use std::collections::HashSet;

        let mut set = HashSet::new();
        set.insert(NodeId("node-1".to_string()));
        set.insert(NodeId("node-1".to_string())); // duplicate
        set.insert(NodeId("node-2".to_string()));

        assert_eq!(set.len(), 2, "HashSet should have 2 unique NodeIds");
    }

    // ============================================================
    // NODE STATE TESTS
    // ============================================================

    #[test]
    fn test_node_state_membership() {
        assert!(NodeState::Alive.is_member());
        assert!(NodeState::Suspect.is_member());
        assert!(!NodeState::Dead.is_member());
        assert!(!NodeState::Left.is_member());
    }

    // ============================================================
    // WIRE FORMAT TESTS
    // ============================================================

    fn sample_node() -> Node {
        Node {
            id: NodeId("node-a".to_string()),
            addr: "127.0.0.1:5000".parse().unwrap(),
            meta: vec![1, 2],
            state: NodeState::Suspect,
            incarnation: 7,
            last_seen: Some(Instant::now()),
        }
    }

    #[test]
    fn test_node_serialization_skips_last_seen() {
        let encoded = bincode::serialize(&sample_node()).unwrap();
        let decoded: Node = bincode::deserialize(&encoded).unwrap();

        assert_eq!(decoded.id, NodeId("node-a".to_string()));
        assert_eq!(decoded.state, NodeState::Suspect);
        assert_eq!(decoded.incarnation, 7);
        assert_eq!(decoded.meta, vec![1, 2]);
        assert!(decoded.last_seen.is_none());
    }

    #[test]
    fn test_ack_carries_members_and_broadcasts() {
        let msg = GossipMessage::Ack {
            from: NodeId("node-b".to_string()),
            incarnation: 3,
            members: vec![sample_node()],
            broadcasts: vec![b"one".to_vec(), b"two".to_vec()],
        };

        let encoded = bincode::serialize(&msg).unwrap();
        match bincode::deserialize::<GossipMessage>(&encoded).unwrap() {
            GossipMessage::Ack {
                from,
                incarnation,
                members,
                broadcasts,
            } => {
                assert_eq!(from.0, "node-b");
                assert_eq!(incarnation, 3);
                assert_eq!(members.len(), 1);
                assert_eq!(broadcasts, vec![b"one".to_vec(), b"two".to_vec()]);
            }
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_stream_user_message() {
        let encoded = bincode::serialize(&StreamMessage::User(b"payload".to_vec())).unwrap();

        match bincode::deserialize::<StreamMessage>(&encoded).unwrap() {
            StreamMessage::User(msg) => assert_eq!(msg, b"payload"),
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    // ============================================================
    // SERVICE FIXTURES
    // ============================================================

    /// Delegate that records everything the service hands it.
    struct RecordingDelegate {
        state: Vec<u8>,
        queue: TransmitLimitedQueue,
        received: Mutex<Vec<Vec<u8>>>,
        merged: Mutex<Vec<(Vec<u8>, bool)>>,
    }

    impl RecordingDelegate {
        fn new(state: &[u8]) -> Arc<Self> {
            Arc::new(Self {
                state: state.to_vec(),
                queue: TransmitLimitedQueue::new(3, || 2),
                received: Mutex::new(Vec::new()),
                merged: Mutex::new(Vec::new()),
            })
        }

        fn received(&self) -> Vec<Vec<u8>> {
            self.received.lock().clone()
        }

        fn merged(&self) -> Vec<(Vec<u8>, bool)> {
            self.merged.lock().clone()
        }
    }

    impl Delegate for RecordingDelegate {
        fn node_meta(&self, _limit: usize) -> Vec<u8> {
            Vec::new()
        }

        fn notify_msg(&self, msg: &[u8]) {
            self.received.lock().push(msg.to_vec());
        }

        fn get_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>> {
            self.queue.get_broadcasts(overhead, limit)
        }

        fn local_state(&self, _join: bool) -> Vec<u8> {
            self.state.clone()
        }

        fn merge_remote_state(&self, buf: &[u8], join: bool) {
            self.merged.lock().push((buf.to_vec(), join));
        }
    }

    #[derive(Default)]
    struct CountingEvents {
        joins: AtomicUsize,
        leaves: AtomicUsize,
    }

    impl EventDelegate for CountingEvents {
        fn notify_join(&self, _node: &Node) {
            self.joins.fetch_add(1, Ordering::SeqCst);
        }

        fn notify_leave(&self, _node: &Node) {
            self.leaves.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Fixture {
        service: Arc<MembershipService>,
        delegate: Arc<RecordingDelegate>,
        events: Arc<CountingEvents>,
    }

    fn test_config() -> MembershipConfig {
        MembershipConfig {
            gossip_interval: Duration::from_millis(20),
            probe_interval: Duration::from_millis(50),
            tcp_timeout: Duration::from_millis(500),
            ..MembershipConfig::default()
        }
    }

    async fn start(name: &str, state: &[u8]) -> Fixture {
        let delegate = RecordingDelegate::new(state);
        let events = Arc::new(CountingEvents::default());
        let bind: SocketAddr = "127.0.0.1:0".parse().unwrap();

        let service = MembershipService::create(
            test_config(),
            NodeId(name.to_string()),
            bind,
            delegate.clone(),
            events.clone(),
        )
        .await
        .expect("service should bind");

        Fixture {
            service,
            delegate,
            events,
        }
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not met in time");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    // ============================================================
    // SERVICE TESTS
    // ============================================================

    #[tokio::test]
    async fn test_service_initialization() {
        let node = start("solo", b"").await;

        assert_eq!(node.service.num_members(), 1);
        assert!(node.service.other_members().is_empty());
        assert_ne!(node.service.local_addr().port(), 0);
        assert_eq!(node.service.local_node.state, NodeState::Alive);

        node.service.shutdown();
    }

    #[tokio::test]
    async fn test_join_exchanges_members_and_state() {
        let a = start("node-a", b"state-a").await;
        let b = start("node-b", b"state-b").await;

        let contacted = a.service.join(&[b.service.local_addr()]).await.unwrap();
        assert_eq!(contacted, 1);

        assert_eq!(a.service.num_members(), 2);
        assert_eq!(a.delegate.merged(), vec![(b"state-b".to_vec(), true)]);
        assert_eq!(a.events.joins.load(Ordering::SeqCst), 1);

        wait_until(|| b.service.num_members() == 2).await;
        wait_until(|| !b.delegate.merged().is_empty()).await;
        assert_eq!(b.delegate.merged()[0], (b"state-a".to_vec(), true));

        a.service.shutdown();
        b.service.shutdown();
    }

    #[tokio::test]
    async fn test_join_empty_list_is_ok() {
        let node = start("lonely", b"").await;

        assert_eq!(node.service.join(&[]).await.unwrap(), 0);

        node.service.shutdown();
    }

    #[tokio::test]
    async fn test_join_unreachable_fails() {
        let node = start("stranded", b"").await;
        let nowhere: SocketAddr = "127.0.0.1:1".parse().unwrap();

        let result = node.service.join(&[nowhere]).await;

        assert!(matches!(
            result,
            Err(ClusterError::JoinFailed { attempted: 1, .. })
        ));
        node.service.shutdown();
    }

    #[tokio::test]
    async fn test_send_reliable_delivers_to_delegate() {
        let a = start("sender", b"").await;
        let b = start("receiver", b"").await;
        a.service.join(&[b.service.local_addr()]).await.unwrap();

        let target = a.service.other_members().pop().unwrap();
        a.service.send_reliable(&target, b"hello").await.unwrap();

        wait_until(|| b.delegate.received().contains(&b"hello".to_vec())).await;

        a.service.shutdown();
        b.service.shutdown();
    }

    #[tokio::test]
    async fn test_queued_broadcast_rides_gossip() {
        let a = start("gossiper", b"").await;
        let b = start("listener", b"").await;
        a.service.join(&[b.service.local_addr()]).await.unwrap();

        a.delegate.queue.queue_broadcast(b"rumour".to_vec());

        wait_until(|| b.delegate.received().contains(&b"rumour".to_vec())).await;
        wait_until(|| a.delegate.queue.is_empty()).await;

        a.service.shutdown();
        b.service.shutdown();
    }

    #[tokio::test]
    async fn test_leave_is_observed_and_idempotent() {
        let a = start("leaver", b"").await;
        let b = start("stayer", b"").await;
        a.service.join(&[b.service.local_addr()]).await.unwrap();
        wait_until(|| b.service.num_members() == 2).await;

        a.service.leave(Duration::from_millis(200)).await.unwrap();
        a.service.leave(Duration::from_millis(200)).await.unwrap();

        wait_until(|| b.service.num_members() == 1).await;
        assert_eq!(b.events.leaves.load(Ordering::SeqCst), 1);

        let departed = b.service.get_member(&a.service.local_node.id).unwrap();
        assert_eq!(departed.state, NodeState::Left);

        a.service.shutdown();
        b.service.shutdown();
    }

    #[tokio::test]
    async fn test_join_after_shutdown_fails() {
        let node = start("closed", b"").await;
        node.service.shutdown();

        assert!(node.service.is_shutdown());
        assert!(matches!(
            node.service.join(&[]).await,
            Err(ClusterError::Shutdown)
        ));
    }
}
