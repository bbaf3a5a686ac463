use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use rand::seq::SliceRandom;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::delegate::{ClusterTransport, Delegate, EventDelegate};
use super::error::ClusterError;
use super::types::{GossipMessage, Node, NodeId, NodeState, StreamMessage};
use crate::config::MembershipConfig;

const FAILURE_DETECTION_INTERVAL: Duration = Duration::from_millis(500);
const MAX_UDP_PACKET: usize = 65536;
const MAX_STREAM_FRAME: usize = 32 * 1024 * 1024;
const META_MAX_SIZE: usize = 512;
const BIND_ATTEMPTS: usize = 10;

/// SWIM-style membership over UDP, with a TCP side channel for reliable sends
/// and full-state push/pull.
pub struct MembershipService {
    pub local_node: Node,
    members: Arc<DashMap<NodeId, Node>>,
    socket: Arc<UdpSocket>,
    incarnation: AtomicU64,
    config: MembershipConfig,
    delegate: Arc<dyn Delegate>,
    events: Arc<dyn EventDelegate>,
    shutdown: CancellationToken,
    left: AtomicBool,
}

impl MembershipService {
    /// Binds the gossip socket and stream listener on `bind_addr` and starts all
    /// background loops. The node is alone until [`MembershipService::join`].
    pub async fn create(
        config: MembershipConfig,
        name: NodeId,
        bind_addr: SocketAddr,
        delegate: Arc<dyn Delegate>,
        events: Arc<dyn EventDelegate>,
    ) -> Result<Arc<Self>, ClusterError> {
        let (listener, socket) = bind_transport(bind_addr).await?;
        let addr = socket.local_addr()?;
        if addr.ip().is_unspecified() {
            tracing::warn!(
                "Advertising unspecified address {}; peers will not be able to reach this node",
                addr
            );
        }

        let mut meta = delegate.node_meta(META_MAX_SIZE);
        meta.truncate(META_MAX_SIZE);

        let local_node = Node {
            id: name,
            addr,
            meta,
            state: NodeState::Alive,
            incarnation: 1,
            last_seen: Some(Instant::now()),
        };

        let members = Arc::new(DashMap::new());
        members.insert(local_node.id.clone(), local_node.clone());

        let service = Arc::new(Self {
            local_node,
            members,
            socket: Arc::new(socket),
            incarnation: AtomicU64::new(1),
            config,
            delegate,
            events,
            shutdown: CancellationToken::new(),
            left: AtomicBool::new(false),
        });

        service.clone().start(listener);

        Ok(service)
    }

    fn start(self: Arc<Self>, listener: TcpListener) {
        info!(
            "Starting membership service for {} on {}",
            self.local_node.id, self.local_node.addr
        );

        tokio::spawn(self.clone().receive_loop());
        tokio::spawn(self.clone().accept_loop(listener));
        tokio::spawn(self.clone().probe_loop());
        tokio::spawn(self.clone().gossip_loop());
        tokio::spawn(self.clone().failure_detection_loop());
        tokio::spawn(self.push_pull_loop());
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_node.addr
    }

    /// Alive and suspect members, the local node included.
    pub fn members(&self) -> Vec<Node> {
        self.members
            .iter()
            .filter(|entry| entry.value().state.is_member())
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn num_members(&self) -> usize {
        self.members
            .iter()
            .filter(|entry| entry.value().state.is_member())
            .count()
    }

    /// Members other than the local node, as a freshly built list.
    pub fn other_members(&self) -> Vec<Node> {
        self.members()
            .into_iter()
            .filter(|node| node.id != self.local_node.id)
            .collect()
    }

    /// Current view of the local node (state and incarnation included).
    pub fn local_node(&self) -> Node {
        self.local_snapshot()
    }

    pub fn get_member(&self, node_id: &NodeId) -> Option<Node> {
        self.members.get(node_id).map(|entry| entry.value().clone())
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Exchanges full state with every address. Returns how many were reached;
    /// fails only when none was.
    pub async fn join(&self, addrs: &[SocketAddr]) -> Result<usize, ClusterError> {
        if self.is_shutdown() {
            return Err(ClusterError::Shutdown);
        }

        let mut contacted = 0;
        let mut last_error = None;

        for addr in addrs {
            match self.push_pull(*addr, true).await {
                Ok(()) => {
                    info!("Joined cluster via {}", addr);
                    contacted += 1;
                }
                Err(e) => {
                    tracing::warn!("Failed to join via {}: {}", addr, e);
                    last_error = Some(e.to_string());
                }
            }
        }

        match last_error {
            Some(last_error) if contacted == 0 => Err(ClusterError::JoinFailed {
                attempted: addrs.len(),
                last_error,
            }),
            _ => Ok(contacted),
        }
    }

    /// Sends `msg` to `node` over a fresh stream connection.
    pub async fn send_reliable(&self, node: &Node, msg: &[u8]) -> Result<(), ClusterError> {
        let encoded = bincode::serialize(&StreamMessage::User(msg.to_vec()))?;
        if encoded.len() > MAX_STREAM_FRAME {
            return Err(ClusterError::MessageTooLarge(encoded.len()));
        }
        let target = node.addr;

        let exchange = async {
            let stream = TcpStream::connect(target).await?;
            let mut framed = Framed::new(stream, stream_codec());
            framed.send(Bytes::from(encoded)).await?;
            SinkExt::<Bytes>::close(&mut framed).await?;
            Ok::<(), ClusterError>(())
        };

        tokio::time::timeout(self.config.tcp_timeout, exchange)
            .await
            .map_err(|_| ClusterError::Timeout(node.id.to_string()))?
    }

    /// Announces departure to the alive members. Bounded by `timeout`; a second
    /// call is a no-op.
    pub async fn leave(&self, timeout: Duration) -> Result<(), ClusterError> {
        if self.left.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let incarnation = self.incarnation.fetch_add(1, Ordering::AcqRel) + 1;
        if let Some(mut me) = self.members.get_mut(&self.local_node.id) {
            me.state = NodeState::Left;
            me.incarnation = incarnation;
        }

        let msg = GossipMessage::Leave {
            node_id: self.local_node.id.clone(),
            incarnation,
        };

        if tokio::time::timeout(timeout, self.broadcast_message(&msg))
            .await
            .is_err()
        {
            tracing::warn!("Leave announcement timed out after {:?}", timeout);
        }

        info!("Node {} left the cluster", self.local_node.id);
        Ok(())
    }

    /// Stops every background loop.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!("Shutting down membership service {}", self.local_node.id);
            self.shutdown.cancel();
        }
    }

    // --- Stream side (push/pull, reliable sends) ---

    async fn push_pull(&self, addr: SocketAddr, join: bool) -> Result<(), ClusterError> {
        let request = bincode::serialize(&self.push_pull_message(join))?;

        let exchange = async {
            let stream = TcpStream::connect(addr).await?;
            let mut framed = Framed::new(stream, stream_codec());
            framed.send(Bytes::from(request)).await?;
            let reply = framed
                .next()
                .await
                .ok_or_else(|| ClusterError::StreamClosed(addr.to_string()))??;
            Ok::<StreamMessage, ClusterError>(bincode::deserialize(&reply)?)
        };

        let reply = tokio::time::timeout(self.config.tcp_timeout, exchange)
            .await
            .map_err(|_| ClusterError::Timeout(addr.to_string()))??;

        match reply {
            StreamMessage::PushPull {
                node,
                members,
                user_state,
                ..
            } => {
                self.merge_remote(node, members, &user_state, join);
                Ok(())
            }
            StreamMessage::User(_) => Err(ClusterError::Serialization(format!(
                "unexpected user frame in push/pull reply from {}",
                addr
            ))),
        }
    }

    fn push_pull_message(&self, join: bool) -> StreamMessage {
        StreamMessage::PushPull {
            node: self.local_snapshot(),
            members: self.member_snapshot(),
            join,
            user_state: self.delegate.local_state(join),
        }
    }

    fn merge_remote(&self, node: Node, members: Vec<Node>, user_state: &[u8], join: bool) {
        self.merge_member(node);
        for member in members {
            self.merge_member(member);
        }
        if !user_state.is_empty() {
            self.delegate.merge_remote_state(user_state, join);
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, src)) => {
                    let service = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = service.handle_stream(stream).await {
                            tracing::warn!("Stream from {} failed: {}", src, e);
                        }
                    });
                }
                Err(e) => {
                    tracing::error!("Failed to accept stream connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn handle_stream(&self, stream: TcpStream) -> Result<(), ClusterError> {
        let mut framed = Framed::new(stream, stream_codec());

        let frame = tokio::time::timeout(self.config.tcp_timeout, framed.next())
            .await
            .map_err(|_| ClusterError::Timeout("inbound stream".to_string()))?;
        let Some(frame) = frame else {
            return Ok(());
        };

        match bincode::deserialize::<StreamMessage>(&frame?)? {
            StreamMessage::User(msg) => {
                tracing::debug!("Received reliable message ({} bytes)", msg.len());
                self.delegate.notify_msg(&msg);
            }
            StreamMessage::PushPull {
                node,
                members,
                join,
                user_state,
            } => {
                tracing::debug!("Push/pull from {:?} (join={})", node.id, join);
                // Reply with our state as it was before absorbing theirs.
                let reply = bincode::serialize(&self.push_pull_message(join))?;
                tokio::time::timeout(self.config.tcp_timeout, framed.send(Bytes::from(reply)))
                    .await
                    .map_err(|_| ClusterError::Timeout(node.id.to_string()))??;
                self.merge_remote(node, members, &user_state, join);
            }
        }

        Ok(())
    }

    async fn push_pull_loop(self: Arc<Self>) {
        if self.config.push_pull_interval.is_zero() {
            return;
        }

        let mut interval = tokio::time::interval(self.config.push_pull_interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            let Some(target) = self.random_members(1).pop() else {
                continue;
            };

            match self.push_pull(target.addr, false).await {
                Ok(()) => tracing::debug!("Periodic push/pull with {:?} done", target.id),
                Err(e) => tracing::warn!("Periodic push/pull with {:?} failed: {}", target.id, e),
            }
        }
    }

    // --- Datagram side (probe, gossip, failure detection) ---

    async fn probe_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.probe_interval);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            let Some(target) = self.random_members(1).pop() else {
                continue;
            };

            let incarnation = self.incarnation.load(Ordering::Acquire);
            let encoded = self.encode_with_broadcasts(|broadcasts| GossipMessage::Ping {
                from: self.local_node.id.clone(),
                incarnation,
                broadcasts,
            });

            match encoded {
                Ok((packet, _)) => {
                    self.send_packet(&packet, target.addr).await;
                    tracing::trace!("Sent ping to {:?}", target.id);
                }
                Err(e) => tracing::error!("Failed to serialize ping: {}", e),
            }
        }
    }

    async fn gossip_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.gossip_interval);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            for target in self.random_members(self.config.gossip_nodes) {
                let encoded = self.encode_with_broadcasts(|broadcasts| GossipMessage::Gossip {
                    from: self.local_node.id.clone(),
                    broadcasts,
                });

                match encoded {
                    Ok((_, 0)) => break,
                    Ok((packet, count)) => {
                        self.send_packet(&packet, target.addr).await;
                        tracing::trace!("Gossiped {} message(s) to {:?}", count, target.id);
                    }
                    Err(e) => {
                        tracing::error!("Failed to serialize gossip: {}", e);
                        break;
                    }
                }
            }
        }
    }

    async fn receive_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; MAX_UDP_PACKET];

        loop {
            let received = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => received,
            };

            match received {
                Ok((len, src)) => match bincode::deserialize::<GossipMessage>(&buf[..len]) {
                    Ok(msg) => self.handle_message(msg, src).await,
                    Err(e) => {
                        tracing::warn!("Failed to deserialize message from {}: {}", src, e);
                    }
                },
                Err(e) => {
                    tracing::error!("Failed to receive UDP packet: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn handle_message(&self, msg: GossipMessage, src: SocketAddr) {
        match msg {
            GossipMessage::Ping {
                from,
                incarnation,
                broadcasts,
            } => {
                self.handle_ping(from, incarnation, src).await;
                self.deliver(broadcasts);
            }

            GossipMessage::Ack {
                from,
                incarnation,
                members,
                broadcasts,
            } => {
                tracing::trace!("Received ack from {:?} with {} members", from, members.len());
                self.mark_seen(&from, Some(incarnation));
                for member in members {
                    self.merge_member(member);
                }
                self.deliver(broadcasts);
            }

            GossipMessage::Gossip { from, broadcasts } => {
                self.mark_seen(&from, None);
                self.deliver(broadcasts);
            }

            GossipMessage::Suspect {
                node_id,
                incarnation,
            } => {
                self.handle_suspect(node_id, incarnation).await;
            }

            GossipMessage::Alive {
                node_id,
                incarnation,
            } => {
                self.handle_alive(node_id, incarnation);
            }

            GossipMessage::Leave {
                node_id,
                incarnation,
            } => {
                self.handle_leave(node_id, incarnation);
            }
        }
    }

    fn deliver(&self, broadcasts: Vec<Vec<u8>>) {
        for msg in broadcasts {
            self.delegate.notify_msg(&msg);
        }
    }

    async fn handle_ping(&self, from: NodeId, from_incarnation: u64, src: SocketAddr) {
        tracing::trace!("Received ping from {:?}", from);

        if !self.mark_seen(&from, Some(from_incarnation)) {
            info!("Discovered new member via ping: {:?} at {}", from, src);

            let new_node = Node {
                id: from,
                addr: src,
                meta: Vec::new(),
                state: NodeState::Alive,
                incarnation: from_incarnation,
                last_seen: Some(Instant::now()),
            };

            self.members.insert(new_node.id.clone(), new_node.clone());
            self.events.notify_join(&new_node);
        }

        let members = self.member_snapshot();
        let incarnation = self.incarnation.load(Ordering::Acquire);
        let encoded = self.encode_with_broadcasts(|broadcasts| GossipMessage::Ack {
            from: self.local_node.id.clone(),
            incarnation,
            members: members.clone(),
            broadcasts,
        });

        match encoded {
            Ok((packet, _)) => self.send_packet(&packet, src).await,
            Err(e) => tracing::error!("Failed to serialize ack: {}", e),
        }
    }

    /// Records direct contact with a known member. Returns `false` for unknown
    /// senders.
    fn mark_seen(&self, from: &NodeId, incarnation: Option<u64>) -> bool {
        let mut revived = None;

        match self.members.get_mut(from) {
            Some(mut member) => {
                member.last_seen = Some(Instant::now());

                let newer = incarnation.filter(|inc| *inc > member.incarnation);
                if let Some(inc) = newer {
                    member.incarnation = inc;
                }

                let revive = match member.state {
                    NodeState::Alive => false,
                    NodeState::Suspect | NodeState::Dead => true,
                    NodeState::Left => newer.is_some(),
                };
                if revive {
                    let was_member = member.state.is_member();
                    member.state = NodeState::Alive;
                    revived = Some((was_member, member.clone()));
                }
            }
            None => return false,
        }

        match revived {
            Some((true, node)) => self.events.notify_update(&node),
            Some((false, node)) => self.events.notify_join(&node),
            None => {}
        }

        true
    }

    fn merge_member(&self, new_member: Node) {
        if new_member.id == self.local_node.id {
            return;
        }

        enum Change {
            Joined(Node),
            Left(Node),
            Updated(Node),
        }

        let change = match self.members.get_mut(&new_member.id) {
            Some(mut existing) => {
                if new_member.incarnation > existing.incarnation {
                    tracing::debug!(
                        "Updating {:?}: inc {} -> {}",
                        new_member.id,
                        existing.incarnation,
                        new_member.incarnation,
                    );

                    let was_member = existing.state.is_member();
                    existing.state = new_member.state;
                    existing.incarnation = new_member.incarnation;
                    existing.addr = new_member.addr;
                    existing.meta = new_member.meta;
                    existing.last_seen = Some(Instant::now());

                    match (was_member, existing.state.is_member()) {
                        (false, true) => Some(Change::Joined(existing.clone())),
                        (true, false) => Some(Change::Left(existing.clone())),
                        _ => Some(Change::Updated(existing.clone())),
                    }
                } else if new_member.incarnation == existing.incarnation
                    && new_member.state == NodeState::Alive
                    && existing.state == NodeState::Suspect
                {
                    info!("{:?} refuted suspicion", new_member.id);
                    existing.state = NodeState::Alive;
                    existing.last_seen = Some(Instant::now());
                    Some(Change::Updated(existing.clone()))
                } else {
                    None
                }
            }
            None if new_member.state.is_member() => {
                info!(
                    "Discovered new member: {:?} at {}",
                    new_member.id, new_member.addr
                );

                let mut member_with_timestamp = new_member;
                member_with_timestamp.last_seen = Some(Instant::now());

                self.members.insert(
                    member_with_timestamp.id.clone(),
                    member_with_timestamp.clone(),
                );
                Some(Change::Joined(member_with_timestamp))
            }
            None => None,
        };

        match change {
            Some(Change::Joined(node)) => self.events.notify_join(&node),
            Some(Change::Left(node)) => self.events.notify_leave(&node),
            Some(Change::Updated(node)) => self.events.notify_update(&node),
            None => {}
        }
    }

    async fn handle_suspect(&self, node_id: NodeId, incarnation: u64) {
        if node_id == self.local_node.id {
            if self.left.load(Ordering::Acquire) {
                return;
            }

            let current = self.incarnation.load(Ordering::Acquire);
            if incarnation < current {
                return;
            }

            let refuted = incarnation.max(current) + 1;
            self.incarnation.store(refuted, Ordering::Release);
            if let Some(mut me) = self.members.get_mut(&node_id) {
                me.incarnation = refuted;
                me.state = NodeState::Alive;
            }

            info!("Refuting suspicion of {:?} with incarnation {}", node_id, refuted);
            let msg = GossipMessage::Alive {
                node_id,
                incarnation: refuted,
            };
            self.broadcast_message(&msg).await;
            return;
        }

        let suspected = match self.members.get_mut(&node_id) {
            Some(mut existing)
                if incarnation >= existing.incarnation && existing.state == NodeState::Alive =>
            {
                existing.state = NodeState::Suspect;
                existing.incarnation = incarnation;
                Some(existing.clone())
            }
            Some(_) => None,
            None => {
                tracing::debug!("Suspected node {:?} doesn't exist", node_id);
                None
            }
        };

        if let Some(node) = suspected {
            info!("Node {:?} at {} suspected", node.id, node.addr);
            self.events.notify_update(&node);
        }
    }

    fn handle_alive(&self, node_id: NodeId, incarnation: u64) {
        let alive = match self.members.get_mut(&node_id) {
            Some(mut existing) => {
                let refutes = incarnation > existing.incarnation
                    || (incarnation == existing.incarnation
                        && existing.state == NodeState::Suspect);
                if refutes && existing.state != NodeState::Left {
                    let was_member = existing.state.is_member();
                    existing.state = NodeState::Alive;
                    existing.incarnation = incarnation;
                    existing.last_seen = Some(Instant::now());
                    Some((was_member, existing.clone()))
                } else {
                    None
                }
            }
            None => {
                tracing::debug!("Alive message for unknown node {:?}", node_id);
                None
            }
        };

        match alive {
            Some((true, node)) => {
                info!("Node {:?} at {} is alive (inc={})", node.id, node.addr, incarnation);
                self.events.notify_update(&node);
            }
            Some((false, node)) => self.events.notify_join(&node),
            None => {}
        }
    }

    fn handle_leave(&self, node_id: NodeId, incarnation: u64) {
        if node_id == self.local_node.id {
            return;
        }

        let departed = match self.members.get_mut(&node_id) {
            Some(mut existing)
                if incarnation >= existing.incarnation && existing.state != NodeState::Left =>
            {
                existing.state = NodeState::Left;
                existing.incarnation = incarnation;
                Some(existing.clone())
            }
            _ => None,
        };

        if let Some(node) = departed {
            info!("Node {:?} at {} left the cluster", node.id, node.addr);
            self.events.notify_leave(&node);
        }
    }

    async fn failure_detection_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(FAILURE_DETECTION_INTERVAL);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            let now = Instant::now();
            let mut suspected = Vec::new();
            let mut dead = Vec::new();

            for mut entry in self.members.iter_mut() {
                let member = entry.value_mut();

                if member.id == self.local_node.id {
                    continue;
                }

                let Some(last_seen) = member.last_seen else {
                    member.last_seen = Some(now);
                    continue;
                };
                let elapsed = now.duration_since(last_seen);

                match member.state {
                    NodeState::Alive if elapsed > self.config.suspect_timeout => {
                        tracing::warn!(
                            "Node {:?} suspected (no contact for {:?})",
                            member.id,
                            elapsed
                        );
                        member.state = NodeState::Suspect;
                        suspected.push(member.clone());
                    }
                    NodeState::Suspect if elapsed > self.config.dead_timeout => {
                        tracing::warn!(
                            "Node {:?} declared DEAD (no contact for {:?})",
                            member.id,
                            elapsed
                        );
                        member.state = NodeState::Dead;
                        dead.push(member.clone());
                    }
                    _ => {}
                }
            }

            if !dead.is_empty() {
                for node in &dead {
                    self.events.notify_leave(node);
                }
                info!("Cluster size now: {} members", self.num_members());
            }

            for node in suspected {
                self.events.notify_update(&node);
                let msg = GossipMessage::Suspect {
                    node_id: node.id,
                    incarnation: node.incarnation,
                };
                self.broadcast_message(&msg).await;
            }
        }
    }

    // --- Helpers ---

    /// Builds a packet and fills whatever room `udp_buffer_size` leaves with
    /// queued user broadcasts. Returns the packet and how many were included.
    fn encode_with_broadcasts<F>(&self, build: F) -> Result<(Vec<u8>, usize), ClusterError>
    where
        F: Fn(Vec<Vec<u8>>) -> GossipMessage,
    {
        let overhead = bincode::serialized_size(&build(Vec::new()))? as usize;
        let broadcasts = self
            .delegate
            .get_broadcasts(overhead, self.config.udp_buffer_size);
        let count = broadcasts.len();
        Ok((bincode::serialize(&build(broadcasts))?, count))
    }

    async fn send_packet(&self, packet: &[u8], addr: SocketAddr) {
        if let Err(e) = self.socket.send_to(packet, addr).await {
            tracing::warn!("Failed to send packet to {}: {}", addr, e);
        }
    }

    async fn broadcast_message(&self, msg: &GossipMessage) {
        let encoded = match bincode::serialize(msg) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::error!("Failed to serialize {:?}: {}", msg, e);
                return;
            }
        };

        let targets: Vec<SocketAddr> = self
            .members
            .iter()
            .filter(|entry| {
                let member = entry.value();
                member.id != self.local_node.id && member.state.is_member()
            })
            .map(|entry| entry.value().addr)
            .collect();

        for addr in targets {
            self.send_packet(&encoded, addr).await;
        }
    }

    /// Up to `count` random members other than the local node.
    fn random_members(&self, count: usize) -> Vec<Node> {
        let mut others = self.other_members();
        others.shuffle(&mut rand::thread_rng());
        others.truncate(count);
        others
    }

    fn local_snapshot(&self) -> Node {
        self.get_member(&self.local_node.id)
            .unwrap_or_else(|| self.local_node.clone())
    }

    fn member_snapshot(&self) -> Vec<Node> {
        self.members
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }
}

#[async_trait]
impl ClusterTransport for MembershipService {
    fn other_members(&self) -> Vec<Node> {
        MembershipService::other_members(self)
    }

    fn num_members(&self) -> usize {
        MembershipService::num_members(self)
    }

    async fn send_reliable(&self, node: &Node, msg: &[u8]) -> Result<(), ClusterError> {
        MembershipService::send_reliable(self, node, msg).await
    }
}

fn stream_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_STREAM_FRAME)
        .new_codec()
}

/// Binds the stream listener and the gossip socket on the same port. With port
/// 0 the OS-picked TCP port may already be taken for UDP, so retry a few times.
async fn bind_transport(bind_addr: SocketAddr) -> Result<(TcpListener, UdpSocket), ClusterError> {
    let attempts = if bind_addr.port() == 0 { BIND_ATTEMPTS } else { 1 };
    let mut last_error = None;

    for _ in 0..attempts {
        let listener = TcpListener::bind(bind_addr).await?;
        let tcp_addr = listener.local_addr()?;

        match UdpSocket::bind(tcp_addr).await {
            Ok(socket) => return Ok((listener, socket)),
            Err(e) => {
                tracing::debug!("UDP bind on {} failed: {}", tcp_addr, e);
                last_error = Some(e);
            }
        }
    }

    Err(last_error
        .map(ClusterError::Io)
        .unwrap_or_else(|| ClusterError::Io(std::io::Error::other("transport bind failed"))))
}
