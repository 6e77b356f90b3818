use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use crate::config::SessionConfig;
use crate::error::PunchError;
use crate::session::peer::{PeerSession, SessionHandle};
use crate::session::udp_server::{Transport, UDPServer};
use crate::session::{
    EmptyProbe, PayloadGenerator, SessionListener, Timing, DEFAULT_INBOX_CAPACITY, DEFAULT_SEND_TIMEOUT,
};

/// Per-session overrides applied when a peer is first registered
#[derive(Default, Clone)]
pub struct SessionOptions {
    /// Keepalive/timeout pair, registry default when `None`
    pub timing: Option<Timing>,

    /// Probe payload source, zero-length probe when `None`
    pub generator: Option<Arc<dyn PayloadGenerator>>,

    /// Event consumer, registry listener when `None`
    pub listener: Option<Arc<dyn SessionListener>>,
}

struct ServerTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Registry of peer sessions multiplexed over one UDP socket
///
/// Maps remote address to exactly one [`PeerSession`]. The socket is opened by
/// `start()`, shared by every session for sending, and read only by the
/// registry's receive loop. The map is guarded by a `RwLock` so dispatch
/// lookups and discovery-driven inserts can run concurrently.
pub struct SessionRegistry {
    bind_addr: SocketAddr,
    timing: Timing,
    inbox_capacity: usize,

    /// Default listener for sessions registered without an override
    listener: Arc<dyn SessionListener>,

    sessions: Arc<RwLock<HashMap<SocketAddr, SessionHandle>>>,
    transport: Arc<Transport>,

    /// Receive loop, `Some` while the registry is active
    server: Mutex<Option<ServerTask>>,
}

impl SessionRegistry {
    pub fn new(bind_addr: SocketAddr, timing: Timing, listener: Arc<dyn SessionListener>) -> Self {
        Self {
            bind_addr,
            timing,
            inbox_capacity: DEFAULT_INBOX_CAPACITY,
            listener,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            transport: Arc::new(Transport::new(DEFAULT_SEND_TIMEOUT)),
            server: Mutex::new(None),
        }
    }

    /// Build from the `[session]` table; invalid timing or address yields `PunchError::Config`
    pub fn from_config(config: &SessionConfig, listener: Arc<dyn SessionListener>) -> Result<Self, PunchError> {
        Ok(Self::new(config.bind_addr()?, config.timing()?, listener)
            .with_send_timeout(config.send_timeout())
            .with_inbox_capacity(config.inbox_capacity))
    }

    pub fn with_send_timeout(mut self, send_timeout: Duration) -> Self {
        self.transport = Arc::new(Transport::new(send_timeout));
        self
    }

    pub fn with_inbox_capacity(mut self, inbox_capacity: usize) -> Self {
        self.inbox_capacity = inbox_capacity;
        self
    }

    pub fn timing(&self) -> Timing {
        self.timing
    }

    /// Register a peer with registry defaults; returns the existing session if present
    pub async fn add(&self, remote: SocketAddr) -> SessionHandle {
        self.insert(remote, SessionOptions::default()).await.0
    }

    /// Register a peer with overrides; an existing session is returned untouched
    pub async fn add_with(&self, remote: SocketAddr, options: SessionOptions) -> SessionHandle {
        self.insert(remote, options).await.0
    }

    /// Register a peer, reporting whether a new session was created
    ///
    /// The lookup and the insert happen under one write lock, so concurrent
    /// callers for the same address always end up with the same session.
    pub async fn insert(&self, remote: SocketAddr, options: SessionOptions) -> (SessionHandle, bool) {
        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(&remote) {
            tracing::debug!("{} already registered", remote);
            return (existing.clone(), false);
        }

        let session = Arc::new(PeerSession::new(
            remote,
            options.timing.unwrap_or(self.timing),
            options.generator.unwrap_or_else(|| Arc::new(EmptyProbe)),
            options.listener.unwrap_or_else(|| self.listener.clone()),
            self.transport.clone(),
            self.inbox_capacity,
        ));
        sessions.insert(remote, session.clone());
        tracing::info!("Added peer {}", remote);
        (session, true)
    }

    pub async fn get(&self, remote: &SocketAddr) -> Option<SessionHandle> {
        self.sessions.read().await.get(remote).cloned()
    }

    pub async fn sessions(&self) -> Vec<SessionHandle> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    pub async fn is_running(&self) -> bool {
        self.server.lock().await.is_some()
    }

    /// Address of the shared socket, `None` while stopped
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.socket().and_then(|s| s.local_addr().ok())
    }

    /// Open the socket, launch the receive loop and start every registered session
    ///
    /// No-op when already active.
    pub async fn start(&self) -> Result<(), PunchError> {
        let mut server = self.server.lock().await;
        if server.is_some() {
            return Ok(());
        }

        let socket = Arc::new(UdpSocket::bind(self.bind_addr).await?);
        self.transport.open(socket.clone());

        let cancel = CancellationToken::new();
        let udp_server = UDPServer::new(socket, self.sessions.clone(), cancel.clone());
        let handle = tokio::spawn(udp_server.serve());
        *server = Some(ServerTask { cancel, handle });

        for session in self.sessions().await {
            session.start().await;
        }

        tracing::info!("Session registry started on {:?}", self.local_addr());
        Ok(())
    }

    /// Stop every session, join the receive loop and close the socket
    ///
    /// No-op when not active.
    pub async fn stop(&self) {
        let mut server = self.server.lock().await;
        let Some(ServerTask { cancel, handle }) = server.take() else {
            return;
        };

        for session in self.sessions().await {
            session.stop().await;
        }

        cancel.cancel();
        if let Err(e) = handle.await {
            tracing::error!("Receive loop ended abnormally: {}", e);
        }

        self.transport.close();
        tracing::info!("Session registry stopped");
    }

    /// Write a datagram to `remote` on the shared socket
    ///
    /// Works for any address, registered or not; replies from an unregistered
    /// address are still dropped by the receive loop.
    pub async fn send(&self, remote: SocketAddr, payload: &[u8]) -> Result<(), PunchError> {
        self.transport.send_to(payload, remote).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConfigError;
    use crate::session::{ChannelListener, SessionState};

    fn registry() -> SessionRegistry {
        let (listener, _rx) = ChannelListener::channel();
        SessionRegistry::new(
            "127.0.0.1:0".parse().unwrap(),
            Timing::with_interval(Duration::from_millis(50)).unwrap(),
            Arc::new(listener),
        )
    }

    #[tokio::test]
    async fn test_add_is_idempotent() {
        let registry = registry();
        let remote: SocketAddr = "10.0.0.5:9000".parse().unwrap();

        let first = registry.add(remote).await;
        let second = registry.add(remote).await;
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len().await, 1);
        assert_eq!(first.state(), SessionState::Connecting);
        assert!(!first.is_running().await);

        let (third, created) = registry.insert(remote, SessionOptions::default()).await;
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &third));
    }

    #[tokio::test]
    async fn test_concurrent_add_single_session() {
        let registry = Arc::new(registry());
        let remote: SocketAddr = "10.0.0.6:9000".parse().unwrap();

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move { registry.insert(remote, SessionOptions::default()).await }));
        }

        let mut created = 0;
        let mut handles = Vec::new();
        for task in tasks {
            let (session, was_created) = task.await.unwrap();
            if was_created {
                created += 1;
            }
            handles.push(session);
        }
        assert_eq!(created, 1);
        assert!(handles.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_options_override_timing() {
        let registry = registry();
        let remote: SocketAddr = "10.0.0.7:3478".parse().unwrap();
        let timing = Timing::new(Duration::from_millis(200), Duration::from_millis(700)).unwrap();

        let session = registry
            .add_with(remote, SessionOptions { timing: Some(timing), ..Default::default() })
            .await;
        assert_eq!(session.timing(), timing);
        assert_eq!(registry.get(&remote).await.unwrap().timing(), timing);
        assert!(registry.get(&"10.0.0.8:1".parse().unwrap()).await.is_none());
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() {
        let registry = registry();
        let session = registry.add("127.0.0.1:9".parse().unwrap()).await;

        tokio_test::assert_ok!(registry.start().await);
        let local = registry.local_addr().unwrap();
        tokio_test::assert_ok!(registry.start().await);
        assert_eq!(registry.local_addr(), Some(local));
        assert!(registry.is_running().await);
        assert!(session.is_running().await);

        registry.stop().await;
        registry.stop().await;
        assert!(!registry.is_running().await);
        assert!(registry.local_addr().is_none());
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[test]
    fn test_from_config_rejects_invalid_timing() {
        let (listener, _rx) = ChannelListener::channel();
        let mut config = SessionConfig::default();
        config.keepalive_interval_ms = 1000;
        config.timeout_ms = Some(500);

        let err = SessionRegistry::from_config(&config, Arc::new(listener)).err().unwrap();
        assert!(matches!(err, PunchError::Config(ConfigError::TimeoutNotAboveInterval { .. })));
        assert!(!err.is_io());
    }

    #[tokio::test]
    async fn test_send_when_stopped_fails() {
        let registry = registry();
        let err = registry.send("127.0.0.1:9".parse().unwrap(), b"hi").await.unwrap_err();
        assert!(matches!(err, PunchError::NotRunning));
    }
}
