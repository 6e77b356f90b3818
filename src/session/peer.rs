use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use crate::error::PunchError;
use crate::session::liveness::Liveness;
use crate::session::udp_server::Transport;
use crate::session::{contain, PayloadGenerator, SessionEvent, SessionListener, SessionState, Timing};

/// Shared reference to a registered session
pub type SessionHandle = Arc<PeerSession>;

/// Datagram handed from the receive loop to a session worker
struct Inbound {
    payload: Bytes,
    at: Instant,
}

struct Worker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// One logical UDP session with a single remote address
///
/// Owns a worker task that sends a probe every keepalive interval and
/// consumes the datagrams the registry's receive loop routes here. Probe,
/// timeout check and inbound handling all happen in that one task, so the
/// listener never sees a disconnect racing a message of the same peer.
pub struct PeerSession {
    remote: SocketAddr,

    /// Shared with the worker; locked only for single transitions
    liveness: Arc<Mutex<Liveness>>,

    generator: Arc<dyn PayloadGenerator>,
    listener: Arc<dyn SessionListener>,

    /// Shared socket slot of the owning registry
    transport: Arc<Transport>,

    inbox_capacity: usize,

    /// Sender half of the worker inbox, `None` while the session is not running
    inbox: Mutex<Option<mpsc::Sender<Inbound>>>,

    worker: tokio::sync::Mutex<Option<Worker>>,
}

impl PeerSession {
    pub(crate) fn new(
        remote: SocketAddr,
        timing: Timing,
        generator: Arc<dyn PayloadGenerator>,
        listener: Arc<dyn SessionListener>,
        transport: Arc<Transport>,
        inbox_capacity: usize,
    ) -> Self {
        Self {
            remote,
            liveness: Arc::new(Mutex::new(Liveness::new(timing))),
            generator,
            listener,
            transport,
            inbox_capacity: inbox_capacity.max(1),
            inbox: Mutex::new(None),
            worker: tokio::sync::Mutex::new(None),
        }
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn state(&self) -> SessionState {
        self.lock_liveness().state()
    }

    pub fn last_receive_at(&self) -> Option<Instant> {
        self.lock_liveness().last_receive_at()
    }

    pub fn timing(&self) -> Timing {
        self.lock_liveness().timing()
    }

    pub async fn is_running(&self) -> bool {
        self.worker.lock().await.is_some()
    }

    /// Send an application payload to this peer on the shared socket
    pub async fn send(&self, payload: &[u8]) -> Result<(), PunchError> {
        self.transport.send_to(payload, self.remote).await
    }

    /// Start probing; no-op while already running
    pub async fn start(&self) {
        let mut worker = self.worker.lock().await;
        if worker.is_some() {
            return;
        }

        let (inbox_tx, inbox_rx) = mpsc::channel(self.inbox_capacity);
        self.lock_liveness().start();
        *self.inbox.lock().unwrap_or_else(|e| e.into_inner()) = Some(inbox_tx);

        let cancel = CancellationToken::new();
        let task = SessionTask {
            remote: self.remote,
            liveness: self.liveness.clone(),
            generator: self.generator.clone(),
            listener: self.listener.clone(),
            transport: self.transport.clone(),
        };
        let handle = tokio::spawn(task.run(inbox_rx, cancel.clone()));

        *worker = Some(Worker { cancel, handle });
        tracing::info!("{} session started", self.remote);
    }

    /// Stop probing and wait for the worker to exit; the session ends `Disconnected`
    pub async fn stop(&self) {
        let mut worker = self.worker.lock().await;
        self.inbox.lock().unwrap_or_else(|e| e.into_inner()).take();

        if let Some(Worker { cancel, handle }) = worker.take() {
            cancel.cancel();
            if let Err(e) = handle.await {
                tracing::error!("{} session worker ended abnormally: {}", self.remote, e);
            }
            tracing::info!("{} session stopped", self.remote);
        }
        self.lock_liveness().stop();
    }

    /// Hand a datagram to the worker without waiting
    ///
    /// Called from the receive loop, which must never block on one peer.
    pub(crate) fn deliver(&self, payload: Bytes, at: Instant) {
        let inbox = self.inbox.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = inbox.as_ref() else {
            tracing::debug!("{} session not running, dropped {} bytes", self.remote, payload.len());
            return;
        };

        match tx.try_send(Inbound { payload, at }) {
            Ok(()) => {}
            Err(TrySendError::Full(inbound)) => {
                tracing::warn!("{} inbox full, dropped {} bytes", self.remote, inbound.payload.len());
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!("{} inbox closed", self.remote);
            }
        }
    }

    fn lock_liveness(&self) -> std::sync::MutexGuard<'_, Liveness> {
        self.liveness.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("remote", &self.remote)
            .field("state", &self.state())
            .finish()
    }
}

/// State moved into the spawned worker
struct SessionTask {
    remote: SocketAddr,
    liveness: Arc<Mutex<Liveness>>,
    generator: Arc<dyn PayloadGenerator>,
    listener: Arc<dyn SessionListener>,
    transport: Arc<Transport>,
}

impl SessionTask {
    async fn run(self, mut inbox_rx: mpsc::Receiver<Inbound>, cancel: CancellationToken) {
        let interval = self.lock_liveness().timing().interval();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                // inbound first so a datagram queued at tick time still counts
                Some(inbound) = inbox_rx.recv() => {
                    self.on_datagram(inbound);
                }

                _ = ticker.tick() => {
                    self.on_tick(&mut inbox_rx).await;
                }
            }
        }
    }

    fn on_datagram(&self, inbound: Inbound) {
        let arrival = self.lock_liveness().on_datagram(inbound.payload.len(), inbound.at);

        if arrival.connected {
            tracing::info!("{} connected", self.remote);
            self.emit(SessionEvent::Connected(self.remote));
        }

        if arrival.deliver {
            tracing::debug!("{} received {} bytes", self.remote, inbound.payload.len());
            self.emit(SessionEvent::Message(self.remote, inbound.payload));
        } else {
            tracing::trace!("{} heartbeat", self.remote);
        }
    }

    async fn on_tick(&self, inbox_rx: &mut mpsc::Receiver<Inbound>) {
        if let Some(payload) = contain(self.remote, "payload generator", || self.generator.generate()) {
            match self.transport.send_to(&payload, self.remote).await {
                Ok(()) => tracing::trace!("{} probe sent ({} bytes)", self.remote, payload.len()),
                Err(PunchError::NotRunning) => tracing::debug!("{} probe skipped, socket closed", self.remote),
                Err(e) => tracing::warn!("{} probe failed: {}", self.remote, e),
            }
        }

        // datagrams queued while the generator or send was slow count before the check
        while let Ok(inbound) = inbox_rx.try_recv() {
            self.on_datagram(inbound);
        }

        let timed_out = self.lock_liveness().on_tick(Instant::now());
        if timed_out {
            tracing::info!("{} timed out, probing again", self.remote);
            self.emit(SessionEvent::Disconnected(self.remote));
        }
    }

    fn emit(&self, event: SessionEvent) {
        contain(self.remote, "listener", || self.listener.on_event(event));
    }

    fn lock_liveness(&self) -> std::sync::MutexGuard<'_, Liveness> {
        self.liveness.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{ChannelListener, EmptyProbe};
    use std::time::Duration;

    fn session(listener: ChannelListener) -> PeerSession {
        PeerSession::new(
            "127.0.0.1:9".parse().unwrap(),
            Timing::with_interval(Duration::from_millis(20)).unwrap(),
            Arc::new(EmptyProbe),
            Arc::new(listener),
            Arc::new(Transport::new(Duration::from_millis(100))),
            8,
        )
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() {
        let (listener, _rx) = ChannelListener::channel();
        let session = session(listener);
        assert_eq!(session.state(), SessionState::Connecting);
        assert!(!session.is_running().await);

        session.start().await;
        session.start().await;
        assert!(session.is_running().await);

        session.stop().await;
        session.stop().await;
        assert!(!session.is_running().await);
        assert_eq!(session.state(), SessionState::Disconnected);

        session.start().await;
        assert_eq!(session.state(), SessionState::Connecting);
        session.stop().await;
    }

    #[tokio::test]
    async fn test_deliver_orders_connect_before_message() {
        let (listener, mut rx) = ChannelListener::channel();
        let session = session(listener);
        session.start().await;

        session.deliver(Bytes::from_static(b"hi"), Instant::now());
        session.deliver(Bytes::new(), Instant::now());
        session.deliver(Bytes::from_static(b"there"), Instant::now());

        let remote = session.remote();
        assert_eq!(rx.recv().await, Some(SessionEvent::Connected(remote)));
        assert_eq!(rx.recv().await, Some(SessionEvent::Message(remote, Bytes::from_static(b"hi"))));
        assert_eq!(rx.recv().await, Some(SessionEvent::Message(remote, Bytes::from_static(b"there"))));
        assert_eq!(session.state(), SessionState::Connected);

        session.stop().await;
    }

    #[tokio::test]
    async fn test_idle_session_drops_datagrams() {
        let (listener, mut rx) = ChannelListener::channel();
        let session = session(listener);

        session.deliver(Bytes::from_static(b"early"), Instant::now());
        assert!(rx.try_recv().is_err());
        assert_eq!(session.state(), SessionState::Connecting);
        assert_eq!(session.last_receive_at(), None);
    }

    #[tokio::test]
    async fn test_send_without_socket_is_io_error() {
        let (listener, _rx) = ChannelListener::channel();
        let session = session(listener);
        let err = session.send(b"x").await.unwrap_err();
        assert!(err.is_io());
    }

    #[tokio::test]
    async fn test_failing_generator_keeps_worker_alive() {
        struct Broken;
        impl PayloadGenerator for Broken {
            fn generate(&self) -> crate::Result<Vec<u8>> {
                panic!("generator exploded")
            }
        }

        let (listener, mut rx) = ChannelListener::channel();
        let session = PeerSession::new(
            "127.0.0.1:9".parse().unwrap(),
            Timing::with_interval(Duration::from_millis(10)).unwrap(),
            Arc::new(Broken),
            Arc::new(listener),
            Arc::new(Transport::new(Duration::from_millis(100))),
            8,
        );
        session.start().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // worker survived several failing ticks and still handles traffic
        session.deliver(Bytes::from_static(b"ping"), Instant::now());
        assert_eq!(rx.recv().await, Some(SessionEvent::Connected(session.remote())));
        session.stop().await;
    }
}
