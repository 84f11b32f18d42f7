//! Handshake payload carried in connect/accept private data.
//!
//! Layout, all integers little-endian:
//!
//! ```text
//! [local address: 16 bytes, sockaddr_in image]
//! [recv pool rkey: u32][recv pool addr: usize]   only when not loopback
//! [send pool rkey: u32][send pool addr: usize]   and both pools registered
//! ```
//!
//! The address field uses the pointer width of the host, so both peers must
//! share it.

use std::mem::size_of;

use byteorder::{ByteOrder, LittleEndian};
use bytes::Bytes;

use rdm_types::{
    make_error_msg, CmCode, PeerAddress, Result, Status, StatusCode, FIXED_ADDR_LEN,
};
use rdm_verbs::RemoteRegion;

use crate::arbiter::Role;
use crate::connection::{ConnState, Connection};

/// Reject payload marking an inbound request as the losing half of a
/// simultaneous connect.
pub const REJECT_COLLISION_MARKER: u32 = 0xdead_beef;

const PTR_WIDTH: usize = size_of::<usize>();

/// Bytes taken by the key section.
pub const KEYS_LEN: usize = 2 * (4 + PTR_WIDTH);

/// Remote keys exchanged during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteKeys {
    pub recv: RemoteRegion,
    pub send: RemoteRegion,
}

/// Decoded handshake payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrivateData {
    pub address: PeerAddress,
    pub keys: Option<RemoteKeys>,
}

fn write_ptr(buf: &mut [u8], value: u64) {
    if PTR_WIDTH == 8 {
        LittleEndian::write_u64(buf, value);
    } else {
        LittleEndian::write_u32(buf, value as u32);
    }
}

fn read_ptr(buf: &[u8]) -> u64 {
    if PTR_WIDTH == 8 {
        LittleEndian::read_u64(buf)
    } else {
        u64::from(LittleEndian::read_u32(buf))
    }
}

fn read_bytes<'a>(buf: &'a [u8], offset: &mut usize, n: usize) -> Result<&'a [u8]> {
    if buf.len() - *offset < n {
        return make_error_msg(
            StatusCode::INVALID_FORMAT,
            format!(
                "private data truncated: need {} bytes at offset {}, have {}",
                n,
                *offset,
                buf.len() - *offset
            ),
        );
    }
    let slice = &buf[*offset..*offset + n];
    *offset += n;
    Ok(slice)
}

impl PrivateData {
    pub fn encoded_len(&self) -> usize {
        FIXED_ADDR_LEN + if self.keys.is_some() { KEYS_LEN } else { 0 }
    }

    pub fn encode(&self) -> Result<Bytes> {
        let len = self.encoded_len();
        let mut out = Vec::new();
        if out.try_reserve_exact(len).is_err() {
            return make_error_msg(CmCode::RESOURCE_EXHAUSTED, "private data buffer");
        }
        out.resize(len, 0);
        out[..FIXED_ADDR_LEN].copy_from_slice(&self.address.to_bytes());
        if let Some(keys) = &self.keys {
            let mut off = FIXED_ADDR_LEN;
            for region in [keys.recv, keys.send] {
                LittleEndian::write_u32(&mut out[off..off + 4], region.rkey);
                off += 4;
                write_ptr(&mut out[off..off + PTR_WIDTH], region.addr);
                off += PTR_WIDTH;
            }
        }
        Ok(Bytes::from(out))
    }

    /// Decode a payload. A payload holding only the address decodes with
    /// `keys == None`; anything past the key section is ignored.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut offset = 0;
        let address = PeerAddress::from_bytes(read_bytes(buf, &mut offset, FIXED_ADDR_LEN)?)
            .map_err(|e| Status::with_message(StatusCode::INVALID_FORMAT, e.to_string()))?;
        if buf.len() - offset < KEYS_LEN {
            return Ok(Self {
                address,
                keys: None,
            });
        }
        let mut regions = [RemoteRegion::default(); 2];
        for region in regions.iter_mut() {
            region.rkey = LittleEndian::read_u32(read_bytes(buf, &mut offset, 4)?);
            region.addr = read_ptr(read_bytes(buf, &mut offset, PTR_WIDTH)?);
        }
        Ok(Self {
            address,
            keys: Some(RemoteKeys {
                recv: regions[0],
                send: regions[1],
            }),
        })
    }
}

/// Build the payload for a connect or accept from the connection's own
/// registered pools.
pub fn pack(conn: &Connection) -> Result<Bytes> {
    let keys = match (&conn.regions, conn.role) {
        (Some(regions), Role::Initiator | Role::Acceptor) => Some(RemoteKeys {
            recv: regions.recv.mr().remote(),
            send: regions.send.mr().remote(),
        }),
        _ => None,
    };
    PrivateData {
        address: conn.local,
        keys,
    }
    .encode()
}

/// Apply a received payload to the connection's remote mirror.
///
/// A loopback connection mirrors its own pools instead of reading the wire.
/// Otherwise the peer address is only taken while the connection is still
/// allocated, and the keys only when the payload carries them.
pub fn unpack(data: &[u8], conn: &mut Connection) -> Result<()> {
    if conn.role == Role::Loopback {
        if let Some(regions) = &conn.regions {
            conn.remote_recv = regions.recv.mr().remote();
            conn.remote_send = regions.send.mr().remote();
            conn.remote_send_head = conn.remote_send.addr;
        }
        return Ok(());
    }

    let decoded = PrivateData::decode(data)?;
    if conn.state == ConnState::Allocated {
        conn.peer = decoded.address;
    }
    if let Some(keys) = decoded.keys {
        conn.remote_recv = keys.recv;
        conn.remote_send = keys.send;
        conn.remote_send_head = keys.send.addr;
    }
    Ok(())
}

/// The reject payload for a collision.
pub fn collision_marker() -> [u8; 4] {
    let mut out = [0u8; 4];
    LittleEndian::write_u32(&mut out, REJECT_COLLISION_MARKER);
    out
}

pub fn is_collision_marker(data: &[u8]) -> bool {
    data.len() >= 4 && LittleEndian::read_u32(&data[..4]) == REJECT_COLLISION_MARKER
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EndpointConfig;
    use crate::registrar;
    use rdm_types::EndpointId;
    use rdm_verbs::sim::SimFabric;
    use std::sync::Weak;

    fn a1() -> PeerAddress {
        PeerAddress::from_octets(10, 0, 0, 1, 7000)
    }

    fn a2() -> PeerAddress {
        PeerAddress::from_octets(10, 0, 0, 2, 7000)
    }

    fn conn(local: PeerAddress, peer: PeerAddress, role: Role) -> Connection {
        Connection::new(EndpointId(1), local, peer, role, 1, Weak::new())
    }

    #[test]
    fn test_layout() {
        let data = PrivateData {
            address: a1(),
            keys: Some(RemoteKeys {
                recv: RemoteRegion {
                    rkey: 0x11223344,
                    addr: 0x1000,
                },
                send: RemoteRegion {
                    rkey: 0x55667788,
                    addr: 0x2000,
                },
            }),
        };
        let bytes = data.encode().unwrap();
        assert_eq!(bytes.len(), FIXED_ADDR_LEN + KEYS_LEN);
        assert_eq!(&bytes[..FIXED_ADDR_LEN], &a1().to_bytes());
        assert_eq!(&bytes[16..20], &[0x44, 0x33, 0x22, 0x11]);
        assert_eq!(read_ptr(&bytes[20..20 + PTR_WIDTH]), 0x1000);
        let send_off = 20 + PTR_WIDTH;
        assert_eq!(
            LittleEndian::read_u32(&bytes[send_off..send_off + 4]),
            0x55667788
        );
        assert_eq!(PrivateData::decode(&bytes).unwrap(), data);
    }

    #[test]
    fn test_address_only() {
        let data = PrivateData {
            address: a2(),
            keys: None,
        };
        let bytes = data.encode().unwrap();
        assert_eq!(bytes.len(), FIXED_ADDR_LEN);
        let decoded = PrivateData::decode(&bytes).unwrap();
        assert_eq!(decoded.address, a2());
        assert!(decoded.keys.is_none());
    }

    #[test]
    fn test_decode_truncated_address() {
        let err = PrivateData::decode(&[2, 0, 0]).unwrap_err();
        assert_eq!(err.code(), StatusCode::INVALID_FORMAT);
    }

    #[test]
    fn test_pack_unpack_between_peers() {
        let fabric = SimFabric::new();
        let dev = fabric.device("d1");
        let config = EndpointConfig::default();

        let mut initiator = conn(a1(), a2(), Role::Initiator);
        registrar::prepare(dev.as_ref(), &config, &mut initiator.regions).unwrap();
        let bytes = pack(&initiator).unwrap();
        assert_eq!(bytes.len(), FIXED_ADDR_LEN + KEYS_LEN);

        // The acceptor learns the initiator's address and pools.
        let mut acceptor = conn(a2(), PeerAddress::new(0, 0), Role::Acceptor);
        unpack(&bytes, &mut acceptor).unwrap();
        let regions = initiator.regions.as_ref().unwrap();
        assert_eq!(acceptor.peer(), a1());
        assert_eq!(acceptor.remote_recv(), regions.recv.mr().remote());
        assert_eq!(acceptor.remote_send(), regions.send.mr().remote());
        assert_eq!(acceptor.remote_send_head(), regions.send.mr().addr);

        // Unpacking again is harmless.
        unpack(&bytes, &mut acceptor).unwrap();
        assert_eq!(acceptor.remote_recv(), regions.recv.mr().remote());
    }

    #[test]
    fn test_unpack_keeps_confirmed_address() {
        let mut c = conn(a2(), a1(), Role::Acceptor);
        c.state = ConnState::Started;
        let bytes = PrivateData {
            address: PeerAddress::from_octets(10, 9, 9, 9, 1),
            keys: None,
        }
        .encode()
        .unwrap();
        unpack(&bytes, &mut c).unwrap();
        assert_eq!(c.peer(), a1());
        assert!(!c.remote_recv().valid());
    }

    #[test]
    fn test_loopback_mirrors_own_pools() {
        let fabric = SimFabric::new();
        let dev = fabric.device("d1");
        let mut c = conn(a1(), a1(), Role::Loopback);

        // Nothing registered yet: nothing to mirror, and no keys packed.
        assert_eq!(pack(&c).unwrap().len(), FIXED_ADDR_LEN);
        unpack(&[], &mut c).unwrap();
        assert!(!c.remote_recv().valid());

        registrar::prepare(dev.as_ref(), &EndpointConfig::default(), &mut c.regions).unwrap();
        assert_eq!(pack(&c).unwrap().len(), FIXED_ADDR_LEN);
        unpack(&[], &mut c).unwrap();
        let regions = c.regions.as_ref().unwrap();
        assert_eq!(c.remote_recv, regions.recv.mr().remote());
        assert_eq!(c.remote_send, regions.send.mr().remote());
    }

    #[test]
    fn test_collision_marker() {
        let marker = collision_marker();
        assert_eq!(marker, [0xef, 0xbe, 0xad, 0xde]);
        assert!(is_collision_marker(&marker));
        assert!(!is_collision_marker(&[0xef, 0xbe]));
        assert!(!is_collision_marker(&[0, 0, 0, 0]));
        assert!(!is_collision_marker(&a1().to_bytes()));
    }
}
