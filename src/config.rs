//! Peer configuration.
//!
//! Every struct is `#[serde(default)]`, so a TOML file only needs the fields it
//! overrides. Durations use humantime notation (`"100ms"`, `"15s"`).

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Top-level options supplied to [`crate::peer::Peer::new`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// `host[:port]` addresses of existing members contacted on join.
    pub known_peers: Vec<String>,
    /// Delay between join attempts.
    #[serde(with = "humantime_serde")]
    pub join_ttl: Duration,
    /// Number of failed join attempts tolerated before giving up.
    pub join_retry: u32,
    /// Gossip layer tuning.
    pub membership: MembershipConfig,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            known_peers: Vec::new(),
            join_ttl: Duration::from_secs(1),
            join_retry: 3,
            membership: MembershipConfig::default(),
        }
    }
}

impl Options {
    /// Parses options from a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|err| Error::Config(err.to_string()))
    }

    /// Reads and parses a TOML options file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|err| Error::Config(format!("failed to read {}: {err}", path.display())))?;
        Self::from_toml_str(&content)
    }

    /// Rejects settings the background loops cannot run with.
    pub fn validate(&self) -> Result<()> {
        let m = &self.membership;
        let intervals = [
            ("join_ttl", self.join_ttl),
            ("membership.gossip_interval", m.gossip_interval),
            ("membership.probe_interval", m.probe_interval),
            ("membership.tcp_timeout", m.tcp_timeout),
        ];
        if let Some((field, _)) = intervals.iter().find(|(_, value)| value.is_zero()) {
            return Err(Error::Config(format!("{field} must be greater than zero")));
        }
        if m.udp_buffer_size == 0 {
            return Err(Error::Config("membership.udp_buffer_size must be greater than zero".into()));
        }
        Ok(())
    }
}

/// Membership layer settings. Defaults follow a loopback/LAN profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MembershipConfig {
    /// Unique node name. Generated when empty.
    pub name: String,
    /// IP or hostname to bind. Must resolve to an address peers can reach.
    pub bind_addr: String,
    /// Port shared by the UDP gossip socket and the TCP stream listener. `0`
    /// picks a free port.
    pub bind_port: u16,
    /// Largest UDP packet the gossip layer builds. Payloads larger than half of
    /// this travel over the reliable stream path instead.
    pub udp_buffer_size: usize,
    /// Scales how many times a gossip broadcast is retransmitted.
    pub retransmit_mult: usize,
    /// Period of the broadcast gossip round.
    #[serde(with = "humantime_serde")]
    pub gossip_interval: Duration,
    /// Random members contacted per gossip round.
    pub gossip_nodes: usize,
    /// Period of the liveness probe.
    #[serde(with = "humantime_serde")]
    pub probe_interval: Duration,
    /// Silence after which an alive member becomes suspect.
    #[serde(with = "humantime_serde")]
    pub suspect_timeout: Duration,
    /// Silence after which a suspect member is declared dead.
    #[serde(with = "humantime_serde")]
    pub dead_timeout: Duration,
    /// Period of background full-state exchange. Zero disables it.
    #[serde(with = "humantime_serde")]
    pub push_pull_interval: Duration,
    /// Connect and exchange deadline for stream operations.
    #[serde(with = "humantime_serde")]
    pub tcp_timeout: Duration,
    /// Upper bound on announcing departure during stop.
    #[serde(with = "humantime_serde")]
    pub leave_timeout: Duration,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            bind_addr: "127.0.0.1".to_string(),
            bind_port: 7946,
            udp_buffer_size: 1400,
            retransmit_mult: 2,
            gossip_interval: Duration::from_millis(100),
            gossip_nodes: 3,
            probe_interval: Duration::from_secs(1),
            suspect_timeout: Duration::from_secs(5),
            dead_timeout: Duration::from_secs(10),
            push_pull_interval: Duration::from_secs(15),
            tcp_timeout: Duration::from_secs(1),
            leave_timeout: Duration::from_secs(1),
        }
    }
}

/// Resolves `host[:port]` to a socket address, preferring IPv4.
///
/// `default_port` is used when the input carries no port.
pub async fn resolve_addr(host: &str, default_port: u16) -> Result<SocketAddr> {
    if let Ok(addr) = host.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, default_port));
    }

    let target = if has_port(host) {
        host.to_string()
    } else {
        format!("{host}:{default_port}")
    };

    let candidates: Vec<SocketAddr> = tokio::net::lookup_host(&target)
        .await
        .map_err(|err| Error::Config(format!("failed to resolve {host}: {err}")))?
        .collect();

    candidates
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| candidates.first())
        .copied()
        .ok_or_else(|| Error::Config(format!("no address found for {host}")))
}

/// Resolves every entry, skipping the ones that fail.
pub async fn resolve_peers(peers: &[String], default_port: u16) -> Vec<SocketAddr> {
    let mut resolved = Vec::with_capacity(peers.len());
    for peer in peers {
        match resolve_addr(peer, default_port).await {
            Ok(addr) => resolved.push(addr),
            Err(e) => tracing::warn!(peer = %peer, error = %e, "Skipping unresolvable peer"),
        }
    }
    resolved
}

fn has_port(host: &str) -> bool {
    match host.rsplit_once(':') {
        Some((name, port)) => !name.is_empty() && !name.contains(':') && port.parse::<u16>().is_ok(),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = Options::default();
        assert_eq!(options.join_retry, 3);
        assert_eq!(options.join_ttl, Duration::from_secs(1));
        assert!(options.known_peers.is_empty());
        assert_eq!(options.membership.udp_buffer_size, 1400);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let options = Options::from_toml_str(
            r#"
            known_peers = ["10.0.0.1:7946", "10.0.0.2"]
            join_retry = 1

            [membership]
            name = "node-a"
            gossip_interval = "50ms"
            udp_buffer_size = 100
            "#,
        )
        .expect("valid config");

        assert_eq!(options.known_peers.len(), 2);
        assert_eq!(options.join_retry, 1);
        assert_eq!(options.join_ttl, Duration::from_secs(1));
        assert_eq!(options.membership.name, "node-a");
        assert_eq!(options.membership.gossip_interval, Duration::from_millis(50));
        assert_eq!(options.membership.udp_buffer_size, 100);
        assert_eq!(options.membership.retransmit_mult, 2);
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = Options::from_toml_str("join_retry = \"many\"").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_validate_rejects_zero_intervals() {
        assert!(Options::default().validate().is_ok());

        let mut options = Options::default();
        options.membership.gossip_interval = Duration::ZERO;
        let err = options.validate().unwrap_err();
        assert!(err.to_string().contains("gossip_interval"));

        let mut options = Options::default();
        options.join_ttl = Duration::ZERO;
        assert!(matches!(options.validate(), Err(Error::Config(_))));

        let mut options = Options::default();
        options.membership.udp_buffer_size = 0;
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_has_port() {
        assert!(has_port("localhost:7946"));
        assert!(!has_port("localhost"));
        assert!(!has_port("::1"));
    }

    #[tokio::test]
    async fn test_resolve_literal_addresses() {
        let addr = resolve_addr("127.0.0.1:9000", 7946).await.unwrap();
        assert_eq!(addr, "127.0.0.1:9000".parse().unwrap());

        let addr = resolve_addr("127.0.0.1", 7946).await.unwrap();
        assert_eq!(addr.port(), 7946);
    }

    #[tokio::test]
    async fn test_resolve_localhost_prefers_ipv4() {
        let addr = resolve_addr("localhost", 7000).await.unwrap();
        assert_eq!(addr.port(), 7000);
        assert!(addr.ip().is_loopback());
    }

    #[tokio::test]
    async fn test_resolve_peers_skips_failures() {
        let peers = vec![
            "127.0.0.1:7001".to_string(),
            "no-such-host.invalid".to_string(),
        ];
        let resolved = resolve_peers(&peers, 7946).await;
        assert_eq!(resolved, vec!["127.0.0.1:7001".parse::<SocketAddr>().unwrap()]);
    }
}
