use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use rdm_types::PeerAddress;

/// Which side of a connection drives channel setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Owns the single channel between two distinct endpoints.
    Initiator,
    /// Waits for the initiator's request; its own attempts are probes only.
    Acceptor,
    /// Local and remote address are the same endpoint.
    Loopback,
}

impl Role {
    /// The role the other side computes for the same pair.
    pub fn mirror(self) -> Role {
        match self {
            Role::Initiator => Role::Acceptor,
            Role::Acceptor => Role::Initiator,
            Role::Loopback => Role::Loopback,
        }
    }
}

/// Decide the local role for a connection from `local` to `remote`.
///
/// Addresses are ordered by their wire image, so both peers reach mirrored
/// answers without exchanging anything. The lower address initiates.
pub fn arbitrate(local: &PeerAddress, remote: &PeerAddress) -> Role {
    match local.to_bytes().cmp(&remote.to_bytes()) {
        Ordering::Less => Role::Initiator,
        Ordering::Greater => Role::Acceptor,
        Ordering::Equal => Role::Loopback,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(a: u8, b: u8, c: u8, d: u8, port: u16) -> PeerAddress {
        PeerAddress::from_octets(a, b, c, d, port)
    }

    #[test]
    fn test_loopback() {
        let a = addr(10, 0, 0, 1, 7000);
        assert_eq!(arbitrate(&a, &a), Role::Loopback);
    }

    #[test]
    fn test_lower_address_initiates() {
        let a1 = addr(10, 0, 0, 1, 7000);
        let a2 = addr(10, 0, 0, 2, 7000);
        assert_eq!(arbitrate(&a1, &a2), Role::Initiator);
        assert_eq!(arbitrate(&a2, &a1), Role::Acceptor);
    }

    #[test]
    fn test_symmetry_over_many_pairs() {
        let addrs = [
            addr(10, 0, 0, 1, 7000),
            addr(10, 0, 0, 1, 7001),
            addr(10, 0, 1, 0, 80),
            addr(192, 168, 1, 5, 7000),
            addr(1, 2, 3, 4, 65535),
            addr(255, 255, 255, 255, 0),
        ];
        for a in &addrs {
            for b in &addrs {
                let ab = arbitrate(a, b);
                let ba = arbitrate(b, a);
                assert_eq!(ab.mirror(), ba, "{} vs {}", a, b);
                assert_eq!(ab == Role::Loopback, a == b);
            }
        }
    }

    #[test]
    fn test_port_participates() {
        // Same host, different ports: still two distinct endpoints.
        let a = addr(10, 0, 0, 1, 7000);
        let b = addr(10, 0, 0, 1, 7001);
        assert_ne!(arbitrate(&a, &b), Role::Loopback);
    }
}
