//! Minimal IP header inspection
//!
//! The pipeline only ever needs three things from an inner packet: whether
//! it is IPv4 or IPv6 at all, and its source and destination addresses.
//! Anything else belongs to the network stack on the far side of the tun
//! seam.

use std::net::IpAddr;

const IPV4_HDR_LEN: usize = 20;
const IPV6_HDR_LEN: usize = 40;

/// IP version of the packet, if it is a well-formed v4/v6 header start
pub(crate) fn version(pkt: &[u8]) -> Option<u8> {
    match pkt.first()? >> 4 {
        4 if pkt.len() >= IPV4_HDR_LEN => Some(4),
        6 if pkt.len() >= IPV6_HDR_LEN => Some(6),
        _ => None,
    }
}

pub(crate) fn src_addr(pkt: &[u8]) -> Option<IpAddr> {
    match version(pkt)? {
        4 => {
            let octets: [u8; 4] = pkt[12..16].try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        _ => {
            let octets: [u8; 16] = pkt[8..24].try_into().ok()?;
            Some(IpAddr::from(octets))
        }
    }
}

pub(crate) fn dst_addr(pkt: &[u8]) -> Option<IpAddr> {
    match version(pkt)? {
        4 => {
            let octets: [u8; 4] = pkt[16..20].try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        _ => {
            let octets: [u8; 16] = pkt[24..40].try_into().ok()?;
            Some(IpAddr::from(octets))
        }
    }
}

/// Build a minimal IPv4 header + payload for tests
#[cfg(test)]
pub(crate) fn test_ipv4_packet(src: [u8; 4], dst: [u8; 4], payload: &[u8]) -> Vec<u8> {
    let total = IPV4_HDR_LEN + payload.len();
    let mut pkt = vec![0u8; total];
    pkt[0] = 0x45;
    pkt[2..4].copy_from_slice(&(total as u16).to_be_bytes());
    pkt[8] = 64;
    pkt[9] = 17;
    pkt[12..16].copy_from_slice(&src);
    pkt[16..20].copy_from_slice(&dst);
    pkt[IPV4_HDR_LEN..].copy_from_slice(payload);
    pkt
}
