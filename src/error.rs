//! Error taxonomy for the session layer
//!
//! Three families of failure exist:
//! - I/O failures on a socket (bind, send, receive, multicast join)
//! - decode failures of a wire payload (STUN response, beacon frame)
//! - configuration failures, raised once at construction
//!
//! Workers never propagate these out of their loop; they log and keep going.
//! Only the synchronous entry points (`start`, `send`, `Timing::new`) return them.

use std::fmt;
use std::fmt::Display;
use std::io;

/// Failure of a session-layer operation
#[derive(Debug)]
pub enum PunchError {
    /// Socket bind/send/receive/join failure
    Io(io::Error),

    /// The shared socket is not open (registry never started or already stopped)
    NotRunning,

    /// A send did not complete within the configured deadline
    Timeout,

    /// Invalid configuration detected at construction
    Config(ConfigError),
}

impl std::error::Error for PunchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PunchError::Io(e) => Some(e),
            PunchError::Config(e) => Some(e),
            _ => None,
        }
    }
}

impl Display for PunchError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PunchError::Io(e) => write!(fmt, "io error: {}", e),
            PunchError::NotRunning => "socket is not open".fmt(fmt),
            PunchError::Timeout => "send timed out".fmt(fmt),
            PunchError::Config(e) => write!(fmt, "config error: {}", e),
        }
    }
}

impl From<io::Error> for PunchError {
    fn from(e: io::Error) -> Self {
        PunchError::Io(e)
    }
}

impl From<ConfigError> for PunchError {
    fn from(e: ConfigError) -> Self {
        PunchError::Config(e)
    }
}

impl PunchError {
    /// Whether this error belongs to the I/O family (closed socket and send
    /// deadline included)
    pub fn is_io(&self) -> bool {
        matches!(self, PunchError::Io(_) | PunchError::NotRunning | PunchError::Timeout)
    }
}

/// Malformed payload received from the network
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Buffer shorter than the fixed header
    TooShort,

    /// Frame length differs from the only accepted length
    BadLength(usize),

    /// Magic cookie missing or message type outside the STUN range
    NotStun,

    /// STUN message is not a binding success/error response
    UnexpectedClass(u16),

    /// Server answered with a binding error response
    ErrorResponse,

    /// Success response carried no (XOR-)MAPPED-ADDRESS attribute
    MissingMappedAddress,

    /// Address family other than IPv4/IPv6
    UnsupportedFamily(u8),
}

impl std::error::Error for DecodeError {}

impl Display for DecodeError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DecodeError::TooShort => "payload too short".fmt(fmt),
            DecodeError::BadLength(len) => write!(fmt, "unexpected payload length {}", len),
            DecodeError::NotStun => "not a stun message".fmt(fmt),
            DecodeError::UnexpectedClass(t) => write!(fmt, "unexpected stun message type 0x{:04x}", t),
            DecodeError::ErrorResponse => "stun binding error response".fmt(fmt),
            DecodeError::MissingMappedAddress => "no mapped address in stun response".fmt(fmt),
            DecodeError::UnsupportedFamily(f) => write!(fmt, "unsupported address family 0x{:02x}", f),
        }
    }
}

/// Invalid configuration value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Keepalive interval must be positive
    ZeroInterval,

    /// Liveness timeout must be strictly greater than the keepalive interval
    TimeoutNotAboveInterval { interval_ms: u64, timeout_ms: u64 },

    /// A configured address could not be parsed
    InvalidAddress(String),
}

impl std::error::Error for ConfigError {}

impl Display for ConfigError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::ZeroInterval => "keepalive interval must be greater than zero".fmt(fmt),
            ConfigError::TimeoutNotAboveInterval { interval_ms, timeout_ms } => write!(
                fmt,
                "timeout {}ms must be greater than keepalive interval {}ms",
                timeout_ms, interval_ms
            ),
            ConfigError::InvalidAddress(addr) => write!(fmt, "invalid address: {}", addr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_family() {
        assert!(PunchError::NotRunning.is_io());
        assert!(PunchError::Timeout.is_io());
        assert!(PunchError::from(io::Error::other("boom")).is_io());
        assert!(!PunchError::from(ConfigError::ZeroInterval).is_io());
    }

    #[test]
    fn test_display() {
        let e = ConfigError::TimeoutNotAboveInterval { interval_ms: 1000, timeout_ms: 500 };
        assert_eq!(e.to_string(), "timeout 500ms must be greater than keepalive interval 1000ms");
        assert_eq!(DecodeError::BadLength(3).to_string(), "unexpected payload length 3");
    }
}
