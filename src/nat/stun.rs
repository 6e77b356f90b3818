//! STUN binding request/response codec (RFC 5389)
//!
//! Only what a keepalive-driven reflexive lookup needs: a bare binding
//! request, and parsing of MAPPED-ADDRESS / XOR-MAPPED-ADDRESS out of the
//! response. Requests carry a fresh random transaction ID; responses are not
//! matched against it, since the pseudo-peer session keeps no per-request state.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use crate::error::DecodeError;
use crate::nat::ReflexiveResolver;

/// STUN message types (RFC 5389)
const STUN_BINDING_REQUEST: u16 = 0x0001;
const STUN_BINDING_RESPONSE: u16 = 0x0101;
const STUN_BINDING_ERROR: u16 = 0x0111;

/// STUN attributes
const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

/// STUN magic cookie (RFC 5389)
const MAGIC_COOKIE: u32 = 0x2112A442;

const HEADER_LEN: usize = 20;

const FAMILY_IPV4: u8 = 0x01;
const FAMILY_IPV6: u8 = 0x02;

/// Binding request generator and response decoder
#[derive(Debug, Default, Clone, Copy)]
pub struct StunBinding;

impl ReflexiveResolver for StunBinding {
    fn request(&self) -> Vec<u8> {
        build_binding_request(&rand::random::<[u8; 12]>())
    }

    fn decode(&self, response: &[u8]) -> Result<SocketAddr, DecodeError> {
        parse_binding_response(response)
    }
}

/// Build a STUN binding request without attributes
pub fn build_binding_request(transaction_id: &[u8; 12]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(HEADER_LEN);
    packet.extend_from_slice(&STUN_BINDING_REQUEST.to_be_bytes());
    packet.extend_from_slice(&0u16.to_be_bytes());
    packet.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    packet.extend_from_slice(transaction_id);
    packet
}

/// Extract the reflexive address from a binding success response
///
/// XOR-MAPPED-ADDRESS wins over MAPPED-ADDRESS when both are present.
pub fn parse_binding_response(data: &[u8]) -> Result<SocketAddr, DecodeError> {
    if data.len() < HEADER_LEN {
        return Err(DecodeError::TooShort);
    }

    let msg_type = u16::from_be_bytes([data[0], data[1]]);
    let msg_len = u16::from_be_bytes([data[2], data[3]]) as usize;
    let magic = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);

    // top two bits of a STUN message are always zero
    if magic != MAGIC_COOKIE || msg_type & 0xc000 != 0 {
        return Err(DecodeError::NotStun);
    }
    match msg_type {
        STUN_BINDING_RESPONSE => {}
        STUN_BINDING_ERROR => return Err(DecodeError::ErrorResponse),
        other => return Err(DecodeError::UnexpectedClass(other)),
    }
    if data.len() < HEADER_LEN + msg_len {
        return Err(DecodeError::TooShort);
    }

    let transaction_id = &data[8..HEADER_LEN];
    let end = HEADER_LEN + msg_len;
    let mut mapped = None;
    let mut xor_mapped = None;

    let mut pos = HEADER_LEN;
    while pos + 4 <= end {
        let attr_type = u16::from_be_bytes([data[pos], data[pos + 1]]);
        let attr_len = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
        pos += 4;
        if pos + attr_len > end {
            return Err(DecodeError::TooShort);
        }

        let value = &data[pos..pos + attr_len];
        match attr_type {
            ATTR_MAPPED_ADDRESS => mapped = Some(parse_address(value, None)?),
            ATTR_XOR_MAPPED_ADDRESS => xor_mapped = Some(parse_address(value, Some(transaction_id))?),
            _ => {}
        }

        // attributes are padded to 4 bytes
        pos += (attr_len + 3) & !3;
    }

    xor_mapped.or(mapped).ok_or(DecodeError::MissingMappedAddress)
}

/// Parse (XOR-)MAPPED-ADDRESS; `transaction_id` is set for the XOR variant
fn parse_address(value: &[u8], transaction_id: Option<&[u8]>) -> Result<SocketAddr, DecodeError> {
    if value.len() < 4 {
        return Err(DecodeError::TooShort);
    }

    let family = value[1];
    let mut port = u16::from_be_bytes([value[2], value[3]]);
    let cookie = MAGIC_COOKIE.to_be_bytes();
    if transaction_id.is_some() {
        port ^= (MAGIC_COOKIE >> 16) as u16;
    }

    let ip = match family {
        FAMILY_IPV4 => {
            let raw: [u8; 4] = value.get(4..8).ok_or(DecodeError::TooShort)?.try_into().map_err(|_| DecodeError::TooShort)?;
            let mut octets = raw;
            if transaction_id.is_some() {
                for (octet, mask) in octets.iter_mut().zip(cookie.iter()) {
                    *octet ^= mask;
                }
            }
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        FAMILY_IPV6 => {
            let raw: [u8; 16] = value.get(4..20).ok_or(DecodeError::TooShort)?.try_into().map_err(|_| DecodeError::TooShort)?;
            let mut octets = raw;
            if let Some(transaction_id) = transaction_id {
                let mask = cookie.iter().chain(transaction_id.iter());
                for (octet, mask) in octets.iter_mut().zip(mask) {
                    *octet ^= mask;
                }
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        other => return Err(DecodeError::UnsupportedFamily(other)),
    };

    Ok(SocketAddr::new(ip, port))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Binding success response carrying one XOR-MAPPED-ADDRESS for `mapped`
    pub(crate) fn binding_response(transaction_id: &[u8; 12], mapped: SocketAddr) -> Vec<u8> {
        let cookie = MAGIC_COOKIE.to_be_bytes();
        let mut value = vec![0u8];
        let port = mapped.port() ^ (MAGIC_COOKIE >> 16) as u16;
        match mapped.ip() {
            IpAddr::V4(ip) => {
                value.push(FAMILY_IPV4);
                value.extend_from_slice(&port.to_be_bytes());
                value.extend(ip.octets().iter().zip(cookie.iter()).map(|(a, b)| a ^ b));
            }
            IpAddr::V6(ip) => {
                value.push(FAMILY_IPV6);
                value.extend_from_slice(&port.to_be_bytes());
                let mask = cookie.iter().chain(transaction_id.iter());
                value.extend(ip.octets().iter().zip(mask).map(|(a, b)| a ^ b));
            }
        }

        let mut packet = Vec::new();
        packet.extend_from_slice(&STUN_BINDING_RESPONSE.to_be_bytes());
        packet.extend_from_slice(&((4 + value.len()) as u16).to_be_bytes());
        packet.extend_from_slice(&cookie);
        packet.extend_from_slice(transaction_id);
        packet.extend_from_slice(&ATTR_XOR_MAPPED_ADDRESS.to_be_bytes());
        packet.extend_from_slice(&(value.len() as u16).to_be_bytes());
        packet.extend_from_slice(&value);
        packet
    }

    #[test]
    fn test_request_layout() {
        let request = build_binding_request(&[7u8; 12]);
        assert_eq!(request.len(), 20);
        assert_eq!(&request[0..2], &[0x00, 0x01]);
        assert_eq!(&request[2..4], &[0x00, 0x00]);
        assert_eq!(&request[4..8], &[0x21, 0x12, 0xa4, 0x42]);
        assert_eq!(&request[8..20], &[7u8; 12]);
    }

    #[test]
    fn test_requests_use_fresh_transaction_ids() {
        let a = StunBinding.request();
        let b = StunBinding.request();
        assert_eq!(a.len(), 20);
        assert_ne!(a[8..20], b[8..20]);
    }

    #[test]
    fn test_xor_mapped_ipv4() {
        let mapped: SocketAddr = "203.0.113.7:54321".parse().unwrap();
        let response = binding_response(&[1u8; 12], mapped);
        assert_eq!(StunBinding.decode(&response), Ok(mapped));
    }

    #[test]
    fn test_xor_mapped_ipv6() {
        let mapped: SocketAddr = "[2001:db8::42]:3478".parse().unwrap();
        let response = binding_response(&[9u8; 12], mapped);
        assert_eq!(parse_binding_response(&response), Ok(mapped));
    }

    #[test]
    fn test_plain_mapped_address() {
        // RFC 3489 style MAPPED-ADDRESS, padded attribute before it
        let mut packet = Vec::new();
        packet.extend_from_slice(&STUN_BINDING_RESPONSE.to_be_bytes());
        packet.extend_from_slice(&20u16.to_be_bytes());
        packet.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        packet.extend_from_slice(&[0u8; 12]);
        // SOFTWARE attribute, 3 bytes + 1 padding
        packet.extend_from_slice(&[0x80, 0x22, 0x00, 0x03, b'a', b'b', b'c', 0x00]);
        packet.extend_from_slice(&[0x00, 0x01, 0x00, 0x08, 0x00, 0x01, 0x1f, 0x90, 198, 51, 100, 1]);
        assert_eq!(parse_binding_response(&packet), Ok("198.51.100.1:8080".parse().unwrap()));
    }

    #[test]
    fn test_rejects_malformed() {
        assert_eq!(parse_binding_response(&[0u8; 4]), Err(DecodeError::TooShort));
        assert_eq!(parse_binding_response(b"hello from a peer, not stun!"), Err(DecodeError::NotStun));

        let request = build_binding_request(&[0u8; 12]);
        assert_eq!(parse_binding_response(&request), Err(DecodeError::UnexpectedClass(STUN_BINDING_REQUEST)));

        let mut error = build_binding_request(&[0u8; 12]);
        error[0..2].copy_from_slice(&STUN_BINDING_ERROR.to_be_bytes());
        assert_eq!(parse_binding_response(&error), Err(DecodeError::ErrorResponse));

        let mut empty = build_binding_request(&[0u8; 12]);
        empty[0..2].copy_from_slice(&STUN_BINDING_RESPONSE.to_be_bytes());
        assert_eq!(parse_binding_response(&empty), Err(DecodeError::MissingMappedAddress));

        let mut truncated = binding_response(&[1u8; 12], "203.0.113.7:1".parse().unwrap());
        truncated.truncate(truncated.len() - 2);
        assert_eq!(parse_binding_response(&truncated), Err(DecodeError::TooShort));
    }
}
