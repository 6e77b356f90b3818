//! Traffic-driven liveness state machine
//!
//! UDP has no connection concept, so a peer is "connected" purely because
//! datagrams from it arrived recently. This type holds no sockets and no
//! clocks of its own: callers feed it the current instant, which keeps every
//! transition deterministic.

use tokio::time::Instant;
use crate::session::{SessionState, Timing};

/// What an inbound datagram means for the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arrival {
    /// First datagram since the session (re)entered `Connecting`
    pub connected: bool,
    /// Payload must reach the listener (zero-length datagrams are heartbeats)
    pub deliver: bool,
}

#[derive(Debug, Clone)]
pub struct Liveness {
    state: SessionState,

    /// Time of the last inbound datagram
    ///
    /// - `None`: nothing received since start or since the last timeout
    /// - `Some(instant)`: a timeout check is armed against this instant
    last_receive_at: Option<Instant>,

    timing: Timing,
}

impl Liveness {
    pub fn new(timing: Timing) -> Self {
        Self {
            state: SessionState::Connecting,
            last_receive_at: None,
            timing,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn last_receive_at(&self) -> Option<Instant> {
        self.last_receive_at
    }

    pub fn timing(&self) -> Timing {
        self.timing
    }

    /// Enter `Connecting` with no liveness record
    pub fn start(&mut self) {
        self.state = SessionState::Connecting;
        self.last_receive_at = None;
    }

    /// Explicit stop, the only way to reach `Disconnected`
    pub fn stop(&mut self) {
        self.state = SessionState::Disconnected;
        self.last_receive_at = None;
    }

    /// Record an inbound datagram of `len` bytes received at `now`
    pub fn on_datagram(&mut self, len: usize, now: Instant) -> Arrival {
        let connected = self.last_receive_at.is_none();
        if connected {
            self.state = SessionState::Connected;
        }
        self.last_receive_at = Some(now);
        Arrival {
            connected,
            deliver: len > 0,
        }
    }

    /// Keepalive tick; returns true exactly once per silence longer than the timeout
    pub fn on_tick(&mut self, now: Instant) -> bool {
        match self.last_receive_at {
            Some(last) if now.saturating_duration_since(last) > self.timing.timeout() => {
                self.last_receive_at = None;
                self.state = SessionState::Connecting;
                true
            }
            _ => false,
        }
    }
}
