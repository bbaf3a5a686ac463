use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::{Instant, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::types::{PeerEvents, PeerState};
use crate::config::{Options, resolve_addr, resolve_peers};
use crate::error::{Error, Result};
use crate::membership::{ClusterTransport, MembershipService, Node, NodeId};
use crate::shard::{Channel, Shard, ShardRegistry};

pub struct Peer {
    options: Options,
    membership: Arc<MembershipService>,
    registry: Arc<ShardRegistry>,
    shutdown: CancellationToken,
    state: Mutex<PeerState>,
}

impl Peer {
    /// Starts a node that is not yet part of any cluster.
    ///
    /// # Errors
    /// [`Error::Config`] for invalid options or an unresolvable bind address,
    /// [`Error::Cluster`] when the gossip port cannot be bound.
    pub async fn new(options: Options) -> Result<Self> {
        options.validate()?;

        let config = options.membership.clone();
        let name = if config.name.is_empty() {
            NodeId::new()
        } else {
            NodeId(config.name.clone())
        };
        let bind_addr = resolve_addr(&config.bind_addr, config.bind_port).await?;

        let shutdown = CancellationToken::new();
        let registry = Arc::new(ShardRegistry::new(
            config.udp_buffer_size,
            config.retransmit_mult,
            shutdown.clone(),
        ));

        let membership = MembershipService::create(
            config,
            name,
            bind_addr,
            registry.clone(),
            Arc::new(PeerEvents),
        )
        .await?;

        let transport: Arc<dyn ClusterTransport> = membership.clone();
        registry.attach_transport(Arc::downgrade(&transport));

        info!(
            "Peer {} listening on {}",
            membership.local_node.id,
            membership.local_addr()
        );

        Ok(Self {
            options,
            membership,
            registry,
            shutdown,
            state: Mutex::new(PeerState::Created),
        })
    }

    /// Joins the cluster through the configured known peers.
    ///
    /// An attempt is made every `join_ttl`. After `join_retry` failed attempts
    /// (at least one) this gives up with [`Error::JoinTimeout`]. Cancelling
    /// `cancel` stops the peer and returns [`Error::Cancelled`]. With no known
    /// peers the node founds a new cluster and this returns at once.
    pub async fn join(&self, cancel: &CancellationToken) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                PeerState::Stopped => return Err(Error::Stopped),
                PeerState::Joined => return Ok(()),
                _ => *state = PeerState::Joining,
            }
        }

        if self.options.known_peers.is_empty() {
            info!("No known peers, starting a new cluster");
            self.set_state(PeerState::Joined);
            return Ok(());
        }

        let ttl = self.options.join_ttl;
        let max_attempts = self.options.join_retry.max(1);
        let mut ticker = interval_at(Instant::now() + ttl, ttl);
        let mut attempts = 0u32;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Join cancelled, stopping peer");
                    if let Err(e) = self.stop().await {
                        tracing::warn!("Stop after cancelled join failed: {}", e);
                    }
                    return Err(Error::Cancelled);
                }
                _ = self.shutdown.cancelled() => return Err(Error::Stopped),
                _ = ticker.tick() => {}
            }

            let port = self.options.membership.bind_port;
            let addrs = resolve_peers(&self.options.known_peers, port).await;

            let outcome = if addrs.is_empty() {
                Err("no known peer could be resolved".to_string())
            } else {
                self.membership.join(&addrs).await.map_err(|e| e.to_string())
            };

            match outcome {
                Ok(contacted) => {
                    info!(
                        "Joined cluster via {} peer(s), {} member(s) known",
                        contacted,
                        self.member_count()
                    );
                    self.set_state(PeerState::Joined);
                    return Ok(());
                }
                Err(e) => {
                    attempts += 1;
                    tracing::warn!("Join attempt {}/{} failed: {}", attempts, max_attempts, e);
                    if attempts >= max_attempts {
                        self.set_state(PeerState::Created);
                        return Err(Error::JoinTimeout { attempts });
                    }
                }
            }
        }
    }

    /// Leaves the cluster and releases every background task. Safe to call more
    /// than once, with or without a prior join.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if *state == PeerState::Stopped {
                return Ok(());
            }
            *state = PeerState::Stopped;
        }

        let left = self
            .membership
            .leave(self.options.membership.leave_timeout)
            .await;
        self.membership.shutdown();
        self.shutdown.cancel();

        info!("Peer {} stopped", self.membership.local_node.id);
        left.map_err(Error::from)
    }

    pub fn add_shard(&self, shard: Arc<dyn Shard>) -> Result<Channel> {
        self.registry.add_shard(shard)
    }

    pub fn get_shard(&self, name: &str) -> Option<Arc<dyn Shard>> {
        self.registry.get_shard(name)
    }

    pub fn remove_shard(&self, name: &str) -> Option<Arc<dyn Shard>> {
        self.registry.remove_shard(name)
    }

    pub fn registry(&self) -> &Arc<ShardRegistry> {
        &self.registry
    }

    /// Address the gossip socket and stream listener are bound to.
    pub fn address(&self) -> SocketAddr {
        self.membership.local_addr()
    }

    pub fn name(&self) -> &str {
        &self.membership.local_node.id.0
    }

    /// Live members, this node included.
    pub fn member_count(&self) -> usize {
        self.membership.num_members()
    }

    pub fn other_nodes(&self) -> Vec<Node> {
        self.membership.other_members()
    }

    pub fn state(&self) -> PeerState {
        *self.state.lock()
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    fn set_state(&self, next: PeerState) {
        let mut state = self.state.lock();
        if *state != PeerState::Stopped {
            *state = next;
        }
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.membership.shutdown();
        self.shutdown.cancel();
    }
}
