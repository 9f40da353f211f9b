//! Peer transport-address binding
//!
//! A binding records where a peer currently is (its remote socket address)
//! and which local address we last used to reach it. Bindings are replaced
//! wholesale when a peer floats to a new observed source address, never
//! mutated field by field across an address-family change.

use std::net::{IpAddr, SocketAddr};

/// Remote and local transport addresses for one peer.
///
/// Stream-oriented transports carry no binding: the connection itself
/// identifies the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    /// Remote endpoint the peer transmits from and we transmit to
    pub remote: SocketAddr,
    /// Local address learned from inbound packet destinations
    pub local: Option<IpAddr>,
}

impl Binding {
    pub fn new(remote: SocketAddr) -> Self {
        Self {
            remote,
            local: None,
        }
    }

    /// Check whether an inbound packet's source matches this binding
    pub fn src_match(&self, src: &SocketAddr) -> bool {
        self.remote == *src
    }

    /// Build the replacement binding used when the peer floats.
    ///
    /// The learned local address survives only within the same address
    /// family.
    pub fn floated(&self, remote: SocketAddr) -> Self {
        let local = if self.remote.is_ipv4() == remote.is_ipv4() {
            self.local
        } else {
            None
        };
        Self { remote, local }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_src_match() {
        let bind = Binding::new(addr("1.2.3.4:5000"));
        assert!(bind.src_match(&addr("1.2.3.4:5000")));
        assert!(!bind.src_match(&addr("1.2.3.4:6000")));
        assert!(!bind.src_match(&addr("1.2.3.5:5000")));
    }

    #[test]
    fn test_float_keeps_local_within_family() {
        let mut bind = Binding::new(addr("1.2.3.4:5000"));
        bind.local = Some("192.168.0.1".parse().unwrap());

        let floated = bind.floated(addr("1.2.3.4:6000"));
        assert_eq!(floated.remote, addr("1.2.3.4:6000"));
        assert_eq!(floated.local, bind.local);
    }

    #[test]
    fn test_float_drops_local_across_families() {
        let mut bind = Binding::new(addr("1.2.3.4:5000"));
        bind.local = Some("192.168.0.1".parse().unwrap());

        let floated = bind.floated(addr("[2001:db8::1]:5000"));
        assert_eq!(floated.local, None);
    }
}
