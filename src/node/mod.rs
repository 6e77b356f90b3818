use std::net::SocketAddr;
use std::sync::Arc;
use anyhow::Context;
use clap::Parser;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use crate::config::Config;
use crate::discovery::{Beacon, BeaconSettings};
use crate::error::PunchError;
use crate::nat::{self, StunBinding};
use crate::session::{ChannelListener, SessionEvent, SessionHandle, SessionRegistry};

pub mod console;
pub mod main;
pub mod models;
pub mod prettylog;

use models::{NodeStatus, PeerInfo};

/// UDP hole punching peer
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// TOML configuration file (defaults apply when absent)
    #[arg(default_value = "udpunch.toml")]
    pub config: String,

    /// Shared P2P socket address (e.g., 0.0.0.0:9000)
    #[arg(short, long)]
    pub bind: Option<String>,

    /// Keep-alive interval in milliseconds (timeout becomes 3x)
    #[arg(long)]
    pub interval_ms: Option<u64>,

    /// STUN server host:port
    #[arg(long)]
    pub stun_server: Option<String>,

    /// Disable the STUN pseudo-peer
    #[arg(long)]
    pub no_stun: bool,

    /// Disable LAN multicast discovery
    #[arg(long)]
    pub no_beacon: bool,

    /// Peers to connect to at startup (host:port, repeatable)
    #[arg(short, long)]
    pub peer: Vec<String>,
}

impl Args {
    /// Apply command line overrides on top of the file configuration
    pub fn apply(&self, config: &mut Config) {
        if let Some(bind) = &self.bind {
            config.session.bind_addr = bind.clone();
        }
        if let Some(interval_ms) = self.interval_ms {
            config.session.keepalive_interval_ms = interval_ms;
            config.session.timeout_ms = None;
        }
        if let Some(server) = &self.stun_server {
            config.stun.server = server.clone();
        }
        if self.no_stun {
            config.stun.enabled = false;
        }
        if self.no_beacon {
            config.beacon.enabled = false;
        }
    }
}

/// Addresses this node is reachable on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenAddrs {
    pub lan: Option<SocketAddr>,
    pub wan: Option<SocketAddr>,
}

struct DiscoveryTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// A running peer: session registry, STUN pseudo-peer and LAN beacon
pub struct Node {
    registry: Arc<SessionRegistry>,
    stun_server: Option<SocketAddr>,
    mapped_rx: Option<watch::Receiver<Option<SocketAddr>>>,
    beacon: Option<Beacon>,
    discovery: Mutex<Option<DiscoveryTask>>,
}

impl Node {
    /// Build and start every component enabled in `config`
    ///
    /// Returns the node and the stream of peer session events. STUN and beacon
    /// failures are logged and leave the node running without them.
    pub async fn start(config: Config) -> anyhow::Result<(Node, mpsc::UnboundedReceiver<SessionEvent>)> {
        config.validate()?;
        let (listener, events) = ChannelListener::channel();
        let registry = Arc::new(SessionRegistry::from_config(&config.session, Arc::new(listener))?);
        let beacon_settings = if config.beacon.enabled {
            Some(BeaconSettings::try_from(&config.beacon)?)
        } else {
            None
        };

        let mut stun_server = None;
        let mut mapped_rx = None;
        if config.stun.enabled {
            match nat::resolve_server(&config.stun.server).await {
                Ok(server) => {
                    let (_, rx) = nat::attach_resolver(&registry, server, Arc::new(StunBinding), config.stun.timing()?).await;
                    stun_server = Some(server);
                    mapped_rx = Some(rx);
                }
                Err(e) => tracing::warn!("STUN disabled: {:#}", e),
            }
        }

        registry.start().await.context("Failed to start session registry")?;
        let Some(local) = registry.local_addr() else {
            registry.stop().await;
            anyhow::bail!("Session registry has no local address");
        };

        let mut node = Node {
            registry,
            stun_server,
            mapped_rx,
            beacon: None,
            discovery: Mutex::new(None),
        };

        if let Some(settings) = beacon_settings {
            let (beacon, discovered) = Beacon::new(settings, local.port());
            match beacon.start().await {
                Ok(()) => {
                    node.spawn_discovery(discovered).await;
                    node.beacon = Some(beacon);
                }
                Err(e) => tracing::warn!("LAN discovery disabled: {}", e),
            }
        }

        Ok((node, events))
    }

    /// Register and start a session for every discovered peer not yet known
    async fn spawn_discovery(&self, mut discovered: mpsc::UnboundedReceiver<SocketAddr>) {
        let registry = self.registry.clone();
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            loop {
                let peer = tokio::select! {
                    _ = token.cancelled() => break,
                    peer = discovered.recv() => match peer {
                        Some(peer) => peer,
                        None => break,
                    },
                };

                let (session, created) = registry.insert(peer, Default::default()).await;
                if created {
                    session.start().await;
                }
            }
        });

        *self.discovery.lock().await = Some(DiscoveryTask { cancel, handle });
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Register `remote` (if new) and start probing it
    pub async fn connect(&self, remote: SocketAddr) -> SessionHandle {
        let session = self.registry.add(remote).await;
        session.start().await;
        session
    }

    pub async fn send(&self, remote: SocketAddr, payload: &[u8]) -> Result<(), PunchError> {
        self.registry.send(remote, payload).await
    }

    /// Latest reflexive address reported by the STUN server
    pub fn reflexive_addr(&self) -> Option<SocketAddr> {
        self.mapped_rx.as_ref().and_then(|rx| *rx.borrow())
    }

    pub fn listen_addrs(&self) -> ListenAddrs {
        ListenAddrs {
            lan: self.registry.local_addr(),
            wan: self.reflexive_addr(),
        }
    }

    /// Snapshot of every peer session except the STUN pseudo-peer
    pub async fn status(&self) -> NodeStatus {
        let now = Instant::now();
        let mut peers: Vec<PeerInfo> = self
            .registry
            .sessions()
            .await
            .into_iter()
            .filter(|s| Some(s.remote()) != self.stun_server)
            .map(|s| PeerInfo {
                addr: s.remote().to_string(),
                state: s.state().to_string(),
                last_receive_ms_ago: s
                    .last_receive_at()
                    .map(|at| now.saturating_duration_since(at).as_millis() as u64),
            })
            .collect();
        peers.sort_by(|a, b| a.addr.cmp(&b.addr));

        let listen = self.listen_addrs();
        NodeStatus {
            lan: listen.lan.map(|a| a.to_string()),
            wan: listen.wan.map(|a| a.to_string()),
            stun_server: self.stun_server.map(|a| a.to_string()),
            beacon: self.beacon.is_some(),
            peers,
        }
    }

    /// Stop discovery, the beacon and the registry, in that order
    pub async fn shutdown(self) {
        if let Some(DiscoveryTask { cancel, handle }) = self.discovery.lock().await.take() {
            cancel.cancel();
            if let Err(e) = handle.await {
                tracing::error!("Discovery task ended abnormally: {}", e);
            }
        }
        if let Some(beacon) = &self.beacon {
            beacon.stop().await;
        }
        self.registry.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline_config() -> Config {
        let mut config = Config::default();
        config.session.bind_addr = "127.0.0.1:0".to_string();
        config.session.keepalive_interval_ms = 50;
        config.stun.enabled = false;
        config.beacon.enabled = false;
        config
    }

    #[test]
    fn test_args_override_config() {
        let args = Args::parse_from([
            "udpunch",
            "custom.toml",
            "--bind",
            "0.0.0.0:9000",
            "--interval-ms",
            "1000",
            "--no-beacon",
            "--peer",
            "10.0.0.5:9000",
            "--peer",
            "10.0.0.6:9000",
        ]);
        assert_eq!(args.config, "custom.toml");
        assert_eq!(args.peer.len(), 2);

        let mut config = Config::default();
        config.session.timeout_ms = Some(10_000);
        args.apply(&mut config);
        assert_eq!(config.session.bind_addr, "0.0.0.0:9000");
        assert_eq!(config.session.timing().unwrap().timeout().as_millis(), 3000);
        assert!(!config.beacon.enabled);
        assert!(config.stun.enabled);
    }

    #[tokio::test]
    async fn test_node_connect_and_status() {
        let (node, _events) = Node::start(offline_config()).await.unwrap();
        let lan = node.listen_addrs().lan.unwrap();
        assert_eq!(lan.ip().to_string(), "127.0.0.1");
        assert_eq!(node.reflexive_addr(), None);

        let remote: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let session = node.connect(remote).await;
        assert!(session.is_running().await);
        let again = node.connect(remote).await;
        assert!(Arc::ptr_eq(&session, &again));

        let status = node.status().await;
        assert_eq!(status.peers.len(), 1);
        assert_eq!(status.peers[0].state, "connecting");
        assert_eq!(status.peers[0].last_receive_ms_ago, None);
        assert!(!status.beacon);

        node.shutdown().await;
        assert_eq!(session.state(), crate::session::SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_failed_start_releases_socket() {
        let port = std::net::UdpSocket::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let mut config = offline_config();
        config.session.bind_addr = format!("127.0.0.1:{}", port);
        config.beacon.enabled = true;
        config.beacon.multicast_addr = std::net::Ipv4Addr::new(10, 0, 0, 1);

        assert!(Node::start(config).await.is_err());
        tokio_test::assert_ok!(tokio::net::UdpSocket::bind(("127.0.0.1", port)).await);
    }

    #[tokio::test]
    async fn test_node_rejects_invalid_timing() {
        let mut config = offline_config();
        config.session.timeout_ms = Some(10);
        assert!(Node::start(config).await.is_err());
    }
}
