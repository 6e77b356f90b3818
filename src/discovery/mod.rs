//! Same-subnet peer discovery
//!
//! A [`Beacon`] multicasts the local P2P port and reports every other host it
//! hears from. The wire payload is exactly two bytes: the port as a big-endian
//! `u16`. Anything else on the group is ignored.

use std::collections::HashSet;
use std::io;
use std::net::{IpAddr, SocketAddr};
use crate::error::DecodeError;
use crate::utils;

pub mod beacon;

pub use beacon::{Beacon, BeaconSettings};

/// Size of a beacon frame
pub const BEACON_FRAME_LEN: usize = 2;

pub fn encode_port(port: u16) -> [u8; BEACON_FRAME_LEN] {
    port.to_be_bytes()
}

pub fn decode_port(payload: &[u8]) -> Result<u16, DecodeError> {
    let bytes: [u8; BEACON_FRAME_LEN] = payload
        .try_into()
        .map_err(|_| DecodeError::BadLength(payload.len()))?;
    Ok(u16::from_be_bytes(bytes))
}

/// Source of the host's own addresses, used to drop self-announcements
pub trait LocalAddresses: Send + Sync {
    fn addresses(&self) -> io::Result<HashSet<IpAddr>>;
}

/// Site-local addresses of the current network interfaces, re-read on every call
#[derive(Debug, Default, Clone, Copy)]
pub struct InterfaceAddresses;

impl LocalAddresses for InterfaceAddresses {
    fn addresses(&self) -> io::Result<HashSet<IpAddr>> {
        Ok(utils::site_local_addresses()?.into_iter().collect())
    }
}

/// Fixed address set
#[derive(Debug, Default, Clone)]
pub struct StaticAddresses(pub HashSet<IpAddr>);

impl LocalAddresses for StaticAddresses {
    fn addresses(&self) -> io::Result<HashSet<IpAddr>> {
        Ok(self.0.clone())
    }
}

/// Turn one received beacon datagram into a peer address
///
/// `Ok(None)` for our own announcements, `Err` for a malformed frame.
pub fn classify(
    source: SocketAddr,
    payload: &[u8],
    local: &HashSet<IpAddr>,
) -> Result<Option<SocketAddr>, DecodeError> {
    if local.contains(&source.ip()) {
        return Ok(None);
    }
    let port = decode_port(payload)?;
    Ok(Some(SocketAddr::new(source.ip(), port)))
}
