use std::fmt;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;
use bytes::Bytes;
use tokio::sync::mpsc;
use crate::error::ConfigError;

mod liveness;
pub mod peer;
pub mod registry;
mod udp_server;

pub use liveness::Liveness;
pub use peer::{PeerSession, SessionHandle};
pub use registry::SessionRegistry;

/// Largest datagram the receive loop accepts (maximum UDP payload)
const RECV_BUFFER_SIZE: usize = 65535;

/// Pause after a failed `recv_from` so a broken socket does not spin its loop
pub(crate) const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Default keepalive cadence for peer sessions
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_millis(3000);

/// Default liveness timeout is this many keepalive intervals
pub const DEFAULT_TIMEOUT_FACTOR: u32 = 3;

/// Default per-session inbox depth
pub const DEFAULT_INBOX_CAPACITY: usize = 256;

/// Default deadline for a single send on the shared socket
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Keepalive interval and liveness timeout of a session
///
/// The timeout is always strictly greater than the interval, otherwise a
/// healthy peer would be reported as gone between two of its probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    interval: Duration,
    timeout: Duration,
}

impl Timing {
    pub fn new(interval: Duration, timeout: Duration) -> Result<Self, ConfigError> {
        if interval.is_zero() {
            return Err(ConfigError::ZeroInterval);
        }
        if timeout <= interval {
            return Err(ConfigError::TimeoutNotAboveInterval {
                interval_ms: interval.as_millis() as u64,
                timeout_ms: timeout.as_millis() as u64,
            });
        }
        Ok(Self { interval, timeout })
    }

    /// Timing with the default timeout of three intervals
    pub fn with_interval(interval: Duration) -> Result<Self, ConfigError> {
        Self::new(interval, interval * DEFAULT_TIMEOUT_FACTOR)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            interval: DEFAULT_KEEPALIVE_INTERVAL,
            timeout: DEFAULT_KEEPALIVE_INTERVAL * DEFAULT_TIMEOUT_FACTOR,
        }
    }
}

/// Liveness state of a peer session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Probing, nothing heard yet (or silence exceeded the timeout)
    Connecting,
    /// At least one datagram seen within the timeout
    Connected,
    /// Explicitly stopped, no more probes
    Disconnected,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Connected => write!(f, "connected"),
            SessionState::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Notification emitted by a peer session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// First datagram after (re)entering `Connecting`
    Connected(SocketAddr),
    /// Silence exceeded the timeout, session is probing again
    Disconnected(SocketAddr),
    /// Non-empty application payload
    Message(SocketAddr, Bytes),
}

impl SessionEvent {
    pub fn addr(&self) -> SocketAddr {
        match self {
            SessionEvent::Connected(addr)
            | SessionEvent::Disconnected(addr)
            | SessionEvent::Message(addr, _) => *addr,
        }
    }
}

/// Consumer of session events
///
/// Invoked from the owning session's worker, one event at a time and in
/// datagram order. Errors and panics are logged by the worker and never stop it.
pub trait SessionListener: Send + Sync {
    fn on_event(&self, event: SessionEvent) -> crate::Result<()>;
}

/// Listener forwarding every event into an mpsc channel
#[derive(Clone)]
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl ChannelListener {
    pub fn new(tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { tx }
    }

    /// Listener plus the receiving half the application drains
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl SessionListener for ChannelListener {
    fn on_event(&self, event: SessionEvent) -> crate::Result<()> {
        self.tx
            .send(event)
            .map_err(|e| format!("event channel closed, dropped {:?}", e.0).into())
    }
}

/// Source of the datagram sent on every keepalive tick
pub trait PayloadGenerator: Send + Sync {
    fn generate(&self) -> crate::Result<Vec<u8>>;
}

impl<F> PayloadGenerator for F
where
    F: Fn() -> crate::Result<Vec<u8>> + Send + Sync,
{
    fn generate(&self) -> crate::Result<Vec<u8>> {
        self()
    }
}

/// Zero-length keepalive probe
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyProbe;

impl PayloadGenerator for EmptyProbe {
    fn generate(&self) -> crate::Result<Vec<u8>> {
        Ok(Vec::new())
    }
}

/// Run a user hook, turning both errors and panics into a logged failure
pub(crate) fn contain<T>(remote: SocketAddr, what: &str, hook: impl FnOnce() -> crate::Result<T>) -> Option<T> {
    match catch_unwind(AssertUnwindSafe(hook)) {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            tracing::warn!("{} {} failed: {}", remote, what, e);
            None
        }
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!("{} {} panicked: {}", remote, what, reason);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timing_defaults_to_three_intervals() {
        let timing = Timing::with_interval(Duration::from_millis(1000)).unwrap();
        assert_eq!(timing.timeout(), Duration::from_millis(3000));
        assert_eq!(Timing::default().timeout(), Duration::from_millis(9000));
    }

    #[test]
    fn test_timing_rejects_bad_relationship() {
        assert_eq!(
            Timing::new(Duration::ZERO, Duration::from_secs(1)),
            Err(ConfigError::ZeroInterval)
        );
        assert!(Timing::new(Duration::from_secs(2), Duration::from_secs(2)).is_err());
        assert!(Timing::new(Duration::from_secs(2), Duration::from_secs(1)).is_err());
        assert!(Timing::new(Duration::from_secs(1), Duration::from_millis(1001)).is_ok());
    }

    #[test]
    fn test_contain_swallows_error_and_panic() {
        let remote: SocketAddr = "127.0.0.1:9".parse().unwrap();
        assert_eq!(contain(remote, "ok", || Ok(7)), Some(7));
        assert_eq!(contain::<()>(remote, "err", || Err("nope".into())), None);
        assert_eq!(contain::<()>(remote, "panic", || panic!("boom")), None);
    }

    #[tokio::test]
    async fn test_channel_listener_forwards() {
        let (listener, mut rx) = ChannelListener::channel();
        let remote: SocketAddr = "10.0.0.5:9000".parse().unwrap();
        listener.on_event(SessionEvent::Connected(remote)).unwrap();
        assert_eq!(rx.recv().await, Some(SessionEvent::Connected(remote)));

        drop(rx);
        assert!(listener.on_event(SessionEvent::Disconnected(remote)).is_err());
    }

    #[test]
    fn test_empty_probe() {
        assert!(EmptyProbe.generate().unwrap().is_empty());
        let custom = || -> crate::Result<Vec<u8>> { Ok(vec![1, 2]) };
        assert_eq!(custom.generate().unwrap(), vec![1, 2]);
    }
}
