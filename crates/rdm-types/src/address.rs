use std::cmp::Ordering;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Length of the peer address image exchanged on the wire (a `sockaddr_in`).
pub const FIXED_ADDR_LEN: usize = 16;

/// `AF_INET` as stored in the first two bytes of the address image.
const AF_INET: u16 = 2;

/// IPv4 peer address identifying one endpoint on the fabric.
///
/// On the wire it is the 16-byte `sockaddr_in` image: family (little-endian
/// `u16`), port (big-endian), IPv4 address (big-endian), 8 zero bytes.
/// Ordering is lexicographic over that image so both sides of a connection
/// derive the same order from the same two addresses.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddress {
    /// IPv4 address in host byte order.
    pub ip: u32,
    /// Port number in host byte order.
    pub port: u16,
}

impl PeerAddress {
    /// Create a new address.
    pub fn new(ip: u32, port: u16) -> Self {
        Self { ip, port }
    }

    /// Create an address from four octets and a port.
    pub fn from_octets(a: u8, b: u8, c: u8, d: u8, port: u16) -> Self {
        Self {
            ip: u32::from_be_bytes([a, b, c, d]),
            port,
        }
    }

    /// Return the four IP octets.
    pub fn octets(&self) -> [u8; 4] {
        self.ip.to_be_bytes()
    }

    /// Encode as the fixed-length `sockaddr_in` image.
    pub fn to_bytes(&self) -> [u8; FIXED_ADDR_LEN] {
        let mut out = [0u8; FIXED_ADDR_LEN];
        out[0..2].copy_from_slice(&AF_INET.to_le_bytes());
        out[2..4].copy_from_slice(&self.port.to_be_bytes());
        out[4..8].copy_from_slice(&self.ip.to_be_bytes());
        out
    }

    /// Decode from the fixed-length `sockaddr_in` image.
    ///
    /// Only the first [`FIXED_ADDR_LEN`] bytes are read.
    pub fn from_bytes(buf: &[u8]) -> std::result::Result<Self, AddressParseError> {
        if buf.len() < FIXED_ADDR_LEN {
            return Err(AddressParseError::Truncated { have: buf.len() });
        }
        let family = u16::from_le_bytes([buf[0], buf[1]]);
        if family != AF_INET {
            return Err(AddressParseError::UnsupportedFamily(family));
        }
        let port = u16::from_be_bytes([buf[2], buf[3]]);
        let ip = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        Ok(Self { ip, port })
    }
}

impl Ord for PeerAddress {
    fn cmp(&self, other: &Self) -> Ordering {
        self.to_bytes().cmp(&other.to_bytes())
    }
}

impl PartialOrd for PeerAddress {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl From<SocketAddrV4> for PeerAddress {
    fn from(addr: SocketAddrV4) -> Self {
        Self {
            ip: u32::from(*addr.ip()),
            port: addr.port(),
        }
    }
}

impl From<PeerAddress> for SocketAddrV4 {
    fn from(addr: PeerAddress) -> Self {
        SocketAddrV4::new(Ipv4Addr::from(addr.ip), addr.port)
    }
}

impl fmt::Debug for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.octets();
        write!(f, "{}.{}.{}.{}:{}", a, b, c, d, self.port)
    }
}

impl FromStr for PeerAddress {
    type Err = AddressParseError;

    /// Parse an address string like `"192.168.1.1:7471"`.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (ip_str, port_str) = s.rsplit_once(':').ok_or(AddressParseError::MissingPort)?;
        let port: u16 = port_str
            .parse()
            .map_err(|_| AddressParseError::InvalidPort)?;
        let ip: Ipv4Addr = ip_str.parse().map_err(|_| AddressParseError::InvalidIp)?;
        Ok(Self {
            ip: u32::from(ip),
            port,
        })
    }
}

/// Errors when parsing or decoding a `PeerAddress`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressParseError {
    #[error("missing port")]
    MissingPort,
    #[error("invalid port number")]
    InvalidPort,
    #[error("invalid IP address")]
    InvalidIp,
    #[error("address image truncated: {have} of 16 bytes")]
    Truncated { have: usize },
    #[error("unsupported address family {0}")]
    UnsupportedFamily(u16),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_display() {
        let addr = PeerAddress::from_octets(192, 168, 1, 100, 7471);
        assert_eq!(format!("{}", addr), "192.168.1.100:7471");
    }

    #[test]
    fn test_address_parse() {
        let addr: PeerAddress = "10.0.0.1:9999".parse().unwrap();
        assert_eq!(addr.octets(), [10, 0, 0, 1]);
        assert_eq!(addr.port, 9999);
    }

    #[test]
    fn test_address_parse_errors() {
        assert!("10.0.0.1".parse::<PeerAddress>().is_err());
        assert!("10.0.0:80".parse::<PeerAddress>().is_err());
        assert!("10.0.0.1:99999".parse::<PeerAddress>().is_err());
        assert!("host:80".parse::<PeerAddress>().is_err());
    }

    #[test]
    fn test_sockaddr_image_layout() {
        let addr = PeerAddress::from_octets(10, 1, 2, 3, 0x1234);
        let image = addr.to_bytes();
        assert_eq!(&image[0..2], &[2, 0]);
        assert_eq!(&image[2..4], &[0x12, 0x34]);
        assert_eq!(&image[4..8], &[10, 1, 2, 3]);
        assert_eq!(&image[8..], &[0u8; 8]);
        assert_eq!(PeerAddress::from_bytes(&image).unwrap(), addr);
    }

    #[test]
    fn test_from_bytes_errors() {
        assert_eq!(
            PeerAddress::from_bytes(&[2, 0, 1]),
            Err(AddressParseError::Truncated { have: 3 })
        );
        let mut image = PeerAddress::from_octets(1, 2, 3, 4, 5).to_bytes();
        image[0] = 10;
        assert_eq!(
            PeerAddress::from_bytes(&image),
            Err(AddressParseError::UnsupportedFamily(10))
        );
    }

    #[test]
    fn test_ordering_follows_image() {
        let a = PeerAddress::from_octets(10, 0, 0, 2, 7000);
        let b = PeerAddress::from_octets(10, 0, 0, 1, 7001);
        // Port precedes the IP in the image.
        assert!(a < b);
        let c = PeerAddress::from_octets(10, 0, 0, 1, 7000);
        assert!(c < a);
        assert_eq!(a.cmp(&a), Ordering::Equal);
    }

    #[test]
    fn test_socket_addr_conversion() {
        let sock: SocketAddrV4 = "172.16.0.1:443".parse().unwrap();
        let addr = PeerAddress::from(sock);
        assert_eq!(SocketAddrV4::from(addr), sock);
    }

    #[test]
    fn test_address_serde() {
        let addr = PeerAddress::from_octets(127, 0, 0, 1, 3000);
        let json = serde_json::to_string(&addr).unwrap();
        let parsed: PeerAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(addr, parsed);
    }
}
