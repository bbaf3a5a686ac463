use axum::Json;
use axum::http::StatusCode;
use axum::{
    Router,
    extract::Extension,
    routing::{get, post},
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use shard_gossip::{Channel, Error, Options, Peer, Shard, Spreader};
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 3 {
        eprintln!(
            "Usage: {} --bind <addr:port> [--peer <addr:port>]... [--http <addr:port>] [--name <name>] [--config <file.toml>]",
            args[0]
        );
        eprintln!("Example: {} --bind 127.0.0.1:7946", args[0]);
        eprintln!(
            "Example: {} --bind 127.0.0.1:7947 --peer 127.0.0.1:7946",
            args[0]
        );

        std::process::exit(1);
    }

    let mut options = Options::default();
    let mut bind_addr: Option<SocketAddr> = None;
    let mut http_addr: Option<SocketAddr> = None;
    let mut name: Option<String> = None;
    let mut peers: Vec<String> = vec![];

    let mut i = 1;
    while i < args.len() {
        let value = args.get(i + 1).cloned();
        match (args[i].as_str(), value) {
            ("--config", Some(path)) => {
                options = Options::load(&path)?;
                i += 2;
            }
            ("--bind", Some(addr)) => {
                bind_addr = Some(addr.parse()?);
                i += 2;
            }
            ("--http", Some(addr)) => {
                http_addr = Some(addr.parse()?);
                i += 2;
            }
            ("--name", Some(value)) => {
                name = Some(value);
                i += 2;
            }
            ("--peer", Some(addr)) => {
                peers.push(addr);
                i += 2;
            }
            _ => {
                i += 1;
            }
        }
    }

    // Command line wins over the config file.
    if let Some(addr) = bind_addr {
        options.membership.bind_addr = addr.ip().to_string();
        options.membership.bind_port = addr.port();
    }
    if let Some(name) = name {
        options.membership.name = name;
    }
    options.known_peers.extend(peers);

    if options.known_peers.is_empty() {
        tracing::info!("Starting as seed node (founder)");
    } else {
        tracing::info!("Known peers: {:?}", options.known_peers);
    }

    // 1. Peer (gossip + stream transport):
    let peer = Arc::new(Peer::new(options).await?);
    tracing::info!("Node {} bound to {}", peer.name(), peer.address());

    // 2. Shards:
    let orders = Arc::new(OrderBook::new("orders"));
    let channel = peer.add_shard(orders.clone())?;

    // 3. Join, aborting on Ctrl+C:
    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Ctrl+C received, shutting down");
            }
            shutdown.cancel();
        }
    });

    match peer.join(&shutdown).await {
        Ok(()) => {}
        Err(Error::Cancelled) => return Ok(()),
        Err(e) => {
            peer.stop().await?;
            return Err(e.into());
        }
    }

    // 4. Spawn stats reporter:
    let stats_peer = peer.clone();
    let stats_orders = orders.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(5));

        loop {
            interval.tick().await;
            tracing::info!(
                "Cluster stats: {} member(s), {} order(s), {} queued broadcast(s)",
                stats_peer.member_count(),
                stats_orders.len(),
                stats_peer.registry().pending_broadcasts()
            );
        }
    });

    // 5. HTTP Router:
    let app = Router::new()
        .route("/order", post(handle_add_orders))
        .route("/orders", get(handle_list_orders))
        .route("/members", get(handle_members))
        .layer(Extension(orders))
        .layer(Extension(channel))
        .layer(Extension(peer.clone()));

    // 6. Start HTTP server:
    let http_addr = match http_addr {
        Some(addr) => addr,
        None => {
            let gossip = peer.address();
            SocketAddr::new(gossip.ip(), gossip.port().wrapping_add(1000))
        }
    };

    tracing::info!("HTTP server listening on {}", http_addr);
    tracing::info!("Press Ctrl+C to shutdown");

    let listener = tokio::net::TcpListener::bind(http_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    peer.stop().await?;

    Ok(())
}

/// Grow-only set of order ids. Snapshots and deltas share one encoding, a JSON
/// array of ids.
struct OrderBook {
    name: String,
    ids: Mutex<BTreeSet<u64>>,
}

impl OrderBook {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ids: Mutex::new(BTreeSet::new()),
        }
    }

    /// Inserts `ids` and returns the ones that were new.
    fn insert(&self, ids: &[u64]) -> Vec<u64> {
        let mut current = self.ids.lock();
        ids.iter().copied().filter(|id| current.insert(*id)).collect()
    }

    fn ids(&self) -> Vec<u64> {
        self.ids.lock().iter().copied().collect()
    }

    fn len(&self) -> usize {
        self.ids.lock().len()
    }
}

impl Shard for OrderBook {
    fn name(&self) -> &str {
        &self.name
    }

    fn marshal_binary(&self) -> anyhow::Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.ids())?)
    }

    fn merge(&self, data: &[u8]) -> anyhow::Result<()> {
        let ids: Vec<u64> = serde_json::from_slice(data)?;
        let added = self.insert(&ids);
        if !added.is_empty() {
            tracing::debug!("Merged {} new order(s) into {}", added.len(), self.name);
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct AddOrdersRequest {
    ids: Vec<u64>,
}

#[derive(Debug, Serialize)]
struct OrdersResponse {
    ids: Vec<u64>,
}

#[derive(Debug, Serialize)]
struct MemberInfo {
    name: String,
    addr: SocketAddr,
    state: String,
}

async fn handle_add_orders(
    Extension(orders): Extension<Arc<OrderBook>>,
    Extension(channel): Extension<Channel>,
    Json(req): Json<AddOrdersRequest>,
) -> (StatusCode, Json<OrdersResponse>) {
    let added = orders.insert(&req.ids);
    if added.is_empty() {
        return (StatusCode::OK, Json(OrdersResponse { ids: added }));
    }

    let delta = match serde_json::to_vec(&added) {
        Ok(delta) => delta,
        Err(e) => {
            tracing::error!("Failed to encode order delta: {}", e);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(OrdersResponse { ids: added }),
            );
        }
    };

    match channel.broadcast(&delta) {
        Ok(()) => (StatusCode::CREATED, Json(OrdersResponse { ids: added })),
        Err(e) => {
            tracing::error!("Failed to broadcast orders: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(OrdersResponse { ids: added }),
            )
        }
    }
}

async fn handle_list_orders(
    Extension(orders): Extension<Arc<OrderBook>>,
) -> Json<OrdersResponse> {
    Json(OrdersResponse { ids: orders.ids() })
}

async fn handle_members(Extension(peer): Extension<Arc<Peer>>) -> Json<Vec<MemberInfo>> {
    let members = peer
        .other_nodes()
        .into_iter()
        .map(|node| MemberInfo {
            name: node.id.to_string(),
            addr: node.addr,
            state: format!("{:?}", node.state),
        })
        .collect();

    Json(members)
}
