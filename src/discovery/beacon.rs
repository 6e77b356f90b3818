use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use crate::config::BeaconConfig;
use crate::discovery::{classify, encode_port, InterfaceAddresses, LocalAddresses};
use crate::error::{ConfigError, PunchError};
use crate::session::RECV_ERROR_BACKOFF;
use crate::utils;

/// Beacon frames are two bytes; anything up to this size is read and then rejected
const BEACON_BUFFER_SIZE: usize = 2048;

/// Multicast group, port and cadence of the beacon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeaconSettings {
    pub group: Ipv4Addr,
    pub port: u16,
    pub interval: Duration,
}

impl Default for BeaconSettings {
    fn default() -> Self {
        Self {
            group: Ipv4Addr::new(224, 0, 0, 1),
            port: 12345,
            interval: Duration::from_millis(1000),
        }
    }
}

impl TryFrom<&BeaconConfig> for BeaconSettings {
    type Error = ConfigError;

    fn try_from(config: &BeaconConfig) -> Result<Self, Self::Error> {
        Ok(Self {
            group: config.group()?,
            port: config.multicast_port,
            interval: config.announce_interval()?,
        })
    }
}

struct Running {
    socket: Arc<UdpSocket>,
    /// Interface addresses the group was joined on
    joined: Vec<Ipv4Addr>,
    cancel: CancellationToken,
    sender: JoinHandle<()>,
    receiver: JoinHandle<()>,
}

/// LAN multicast announcer and listener
///
/// While running, announces "I listen for P2P on port N" every interval and
/// pushes each newly heard peer address (source IP + advertised port) into
/// the discovery channel. A given address is reported once per run; the host's
/// own site-local addresses are never reported.
pub struct Beacon {
    settings: BeaconSettings,
    p2p_port: u16,
    local: Arc<dyn LocalAddresses>,
    discovered_tx: mpsc::UnboundedSender<SocketAddr>,
    running: Mutex<Option<Running>>,
}

impl Beacon {
    /// Beacon advertising `p2p_port`, plus the receiver of discovered peers
    pub fn new(settings: BeaconSettings, p2p_port: u16) -> (Self, mpsc::UnboundedReceiver<SocketAddr>) {
        let (discovered_tx, discovered_rx) = mpsc::unbounded_channel();
        let beacon = Self {
            settings,
            p2p_port,
            local: Arc::new(InterfaceAddresses),
            discovered_tx,
            running: Mutex::new(None),
        };
        (beacon, discovered_rx)
    }

    /// Replace the self-address source
    pub fn with_local_addresses(mut self, local: Arc<dyn LocalAddresses>) -> Self {
        self.local = local;
        self
    }

    pub fn settings(&self) -> BeaconSettings {
        self.settings
    }

    pub fn p2p_port(&self) -> u16 {
        self.p2p_port
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Bind the beacon port, join the group on every site-local interface and
    /// launch the sender and receiver tasks; no-op while already running
    pub async fn start(&self) -> Result<(), PunchError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        let socket = Arc::new(bind_multicast(self.settings.port)?);
        let joined = join_site_local(&socket, self.settings.group);
        if joined.is_empty() {
            tracing::warn!("Beacon joined {} on no interface, only the default route will be used", self.settings.group);
        }

        let cancel = CancellationToken::new();
        let sender = tokio::spawn(run_sender(
            socket.clone(),
            self.settings,
            self.p2p_port,
            cancel.clone(),
        ));
        let receiver = tokio::spawn(run_receiver(
            socket.clone(),
            self.local.clone(),
            self.discovered_tx.clone(),
            cancel.clone(),
        ));

        *running = Some(Running {
            socket,
            joined,
            cancel,
            sender,
            receiver,
        });
        tracing::info!(
            "Beacon started on {}:{}, advertising P2P port {}",
            self.settings.group,
            self.settings.port,
            self.p2p_port
        );
        Ok(())
    }

    /// Halt both tasks, leave the group and close the socket
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        let Some(Running { socket, joined, cancel, sender, receiver }) = running.take() else {
            return;
        };

        cancel.cancel();
        for (name, handle) in [("sender", sender), ("receiver", receiver)] {
            if let Err(e) = handle.await {
                tracing::error!("Beacon {} ended abnormally: {}", name, e);
            }
        }

        for interface in joined {
            if let Err(e) = socket.leave_multicast_v4(self.settings.group, interface) {
                tracing::warn!("Failed to leave {} on {}: {}", self.settings.group, interface, e);
            }
        }
        tracing::info!("Beacon stopped");
    }
}

/// UDP socket on `0.0.0.0:port` that other beacons on this host may share
fn bind_multicast(port: u16) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_multicast_loop_v4(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)).into())?;
    UdpSocket::from_std(socket.into())
}

/// Join `group` once per interface that has a site-local address
fn join_site_local(socket: &UdpSocket, group: Ipv4Addr) -> Vec<Ipv4Addr> {
    let interfaces = match utils::site_local_interfaces() {
        Ok(interfaces) => interfaces,
        Err(e) => {
            tracing::warn!("Failed to list network interfaces: {}", e);
            return Vec::new();
        }
    };

    let mut joined = Vec::new();
    for (name, addresses) in interfaces {
        let Some(interface) = addresses.first().copied() else {
            continue;
        };
        match socket.join_multicast_v4(group, interface) {
            Ok(()) => {
                tracing::debug!("Joined {} on {} ({})", group, name, interface);
                joined.push(interface);
            }
            Err(e) => tracing::warn!("Failed to join {} on {} ({}): {}", group, name, interface, e),
        }
    }
    joined
}

async fn run_sender(socket: Arc<UdpSocket>, settings: BeaconSettings, p2p_port: u16, cancel: CancellationToken) {
    let target = SocketAddr::V4(SocketAddrV4::new(settings.group, settings.port));
    let frame = encode_port(p2p_port);
    let mut ticker = tokio::time::interval(settings.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = socket.send_to(&frame, target).await {
                    tracing::warn!("Beacon send to {} failed: {}", target, e);
                } else {
                    tracing::trace!("Beacon announced port {} to {}", p2p_port, target);
                }
            }
        }
    }
}

async fn run_receiver(
    socket: Arc<UdpSocket>,
    local: Arc<dyn LocalAddresses>,
    discovered_tx: mpsc::UnboundedSender<SocketAddr>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; BEACON_BUFFER_SIZE];
    let mut seen: HashSet<SocketAddr> = HashSet::new();

    loop {
        let (len, source) = tokio::select! {
            _ = cancel.cancelled() => break,
            result = socket.recv_from(&mut buf) => match result {
                Ok(received) => received,
                Err(e) => {
                    tracing::warn!("Beacon recv_from error: {}", e);
                    tokio::time::sleep(RECV_ERROR_BACKOFF).await;
                    continue;
                }
            },
        };

        // recomputed per datagram so interface changes are picked up
        let addresses = match local.addresses() {
            Ok(addresses) => addresses,
            Err(e) => {
                tracing::warn!("Failed to read local addresses, ignoring beacon from {}: {}", source, e);
                continue;
            }
        };

        let peer = match classify(source, &buf[..len], &addresses) {
            Ok(Some(peer)) => peer,
            Ok(None) => continue,
            Err(e) => {
                tracing::debug!("Ignored beacon from {}: {}", source, e);
                continue;
            }
        };

        if seen.insert(peer) {
            tracing::info!("Discovered peer {} via beacon", peer);
            if discovered_tx.send(peer).is_err() {
                tracing::debug!("Discovery channel closed, dropping {}", peer);
            }
        }
    }
}
