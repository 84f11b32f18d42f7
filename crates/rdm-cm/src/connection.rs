//! One connection between a local endpoint and a peer address.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Weak;

use serde::{Deserialize, Serialize};

use rdm_types::{ChannelId, EndpointId, PeerAddress, QpHandle};
use rdm_verbs::RemoteRegion;

use crate::arbiter::Role;
use crate::directory::PeerRecord;
use crate::registrar::ConnRegions;
use crate::request::PooledRequest;

/// Connection lifecycle. States only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnState {
    Allocated,
    Started,
    Established,
    Rejected,
    Closed,
}

/// A channel id and the queue pair attached to it, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelHandle {
    pub id: ChannelId,
    pub qp: Option<QpHandle>,
}

impl ChannelHandle {
    pub fn new(id: ChannelId) -> Self {
        Self { id, qp: None }
    }
}

/// Which of a connection's channels an event or operation refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelSlot {
    Primary,
    /// The inbound half of a loopback connection.
    Secondary,
}

/// The channels backing a connection.
///
/// Only a loopback connection has a second channel: its own inbound request,
/// standing in for the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channels {
    Unbound,
    Single(ChannelHandle),
    Loopback {
        primary: ChannelHandle,
        secondary: Option<ChannelHandle>,
    },
}

impl Channels {
    pub fn primary(&self) -> Option<&ChannelHandle> {
        match self {
            Channels::Unbound => None,
            Channels::Single(h) => Some(h),
            Channels::Loopback { primary, .. } => Some(primary),
        }
    }

    pub fn secondary(&self) -> Option<&ChannelHandle> {
        match self {
            Channels::Loopback { secondary, .. } => secondary.as_ref(),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, slot: ChannelSlot) -> Option<&mut ChannelHandle> {
        match (self, slot) {
            (Channels::Single(h), ChannelSlot::Primary) => Some(h),
            (Channels::Loopback { primary, .. }, ChannelSlot::Primary) => Some(primary),
            (Channels::Loopback { secondary, .. }, ChannelSlot::Secondary) => secondary.as_mut(),
            _ => None,
        }
    }

    /// Install `handle` in `slot`. Fails when the slot is taken or does not
    /// exist for this shape.
    pub(crate) fn bind(&mut self, role: Role, slot: ChannelSlot, handle: ChannelHandle) -> bool {
        match (*self, role, slot) {
            (Channels::Unbound, Role::Loopback, ChannelSlot::Primary) => {
                *self = Channels::Loopback {
                    primary: handle,
                    secondary: None,
                };
                true
            }
            (Channels::Unbound, _, ChannelSlot::Primary) => {
                *self = Channels::Single(handle);
                true
            }
            (
                Channels::Loopback {
                    primary,
                    secondary: None,
                },
                Role::Loopback,
                ChannelSlot::Secondary,
            ) => {
                *self = Channels::Loopback {
                    primary,
                    secondary: Some(handle),
                };
                true
            }
            _ => false,
        }
    }

    pub fn slot_of(&self, id: ChannelId) -> Option<ChannelSlot> {
        if self.primary().map(|h| h.id) == Some(id) {
            Some(ChannelSlot::Primary)
        } else if self.secondary().map(|h| h.id) == Some(id) {
            Some(ChannelSlot::Secondary)
        } else {
            None
        }
    }

    /// Remove the channel with `id`, returning its handle. The primary of a
    /// loopback pair only leaves through `take_all`.
    pub(crate) fn detach(&mut self, id: ChannelId) -> Option<ChannelHandle> {
        match *self {
            Channels::Single(h) if h.id == id => {
                *self = Channels::Unbound;
                Some(h)
            }
            Channels::Loopback {
                primary,
                secondary: Some(s),
            } if s.id == id => {
                *self = Channels::Loopback {
                    primary,
                    secondary: None,
                };
                Some(s)
            }
            _ => None,
        }
    }

    /// Take every handle, primary first.
    pub(crate) fn take_all(&mut self) -> [Option<ChannelHandle>; 2] {
        let out = [self.primary().copied(), self.secondary().copied()];
        *self = Channels::Unbound;
        out
    }

    /// Queue pair that receives for this connection: the inbound half for a
    /// loopback connection posting to itself, else the primary.
    pub fn recv_qp(&self) -> Option<QpHandle> {
        match self {
            Channels::Loopback { secondary, .. } => secondary.and_then(|h| h.qp),
            _ => self.primary().and_then(|h| h.qp),
        }
    }
}

/// One reliable channel between a local endpoint and one remote address.
pub struct Connection {
    pub(crate) endpoint: EndpointId,
    pub(crate) local: PeerAddress,
    pub(crate) peer: PeerAddress,
    /// Work-request id used for every receive posted on this connection.
    pub(crate) token: u64,
    pub(crate) role: Role,
    pub(crate) state: ConnState,
    pub(crate) channels: Channels,
    /// Short-lived outbound channel of an acceptor; see `CmContext::connect`.
    pub(crate) probe: Option<ChannelId>,
    pub(crate) regions: Option<ConnRegions>,

    pub(crate) remote_recv: RemoteRegion,
    pub(crate) remote_send: RemoteRegion,
    pub(crate) remote_send_head: u64,

    pub(crate) sends_outgoing: AtomicU32,
    pub(crate) recv_preposted: usize,
    pub(crate) exp_counter: u64,
    pub(crate) unexp_counter: u64,

    pub(crate) postponed: VecDeque<PooledRequest>,
    pub(crate) record: Weak<PeerRecord>,
}

impl Connection {
    pub(crate) fn new(
        endpoint: EndpointId,
        local: PeerAddress,
        peer: PeerAddress,
        role: Role,
        token: u64,
        record: Weak<PeerRecord>,
    ) -> Self {
        Self {
            endpoint,
            local,
            peer,
            token,
            role,
            state: ConnState::Allocated,
            channels: Channels::Unbound,
            probe: None,
            regions: None,
            remote_recv: RemoteRegion::default(),
            remote_send: RemoteRegion::default(),
            remote_send_head: 0,
            sends_outgoing: AtomicU32::new(0),
            recv_preposted: 0,
            exp_counter: 0,
            unexp_counter: 0,
            postponed: VecDeque::new(),
            record,
        }
    }

    pub fn endpoint(&self) -> EndpointId {
        self.endpoint
    }

    pub fn local(&self) -> PeerAddress {
        self.local
    }

    pub fn peer(&self) -> PeerAddress {
        self.peer
    }

    pub fn token(&self) -> u64 {
        self.token
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn channels(&self) -> &Channels {
        &self.channels
    }

    pub fn probe(&self) -> Option<ChannelId> {
        self.probe
    }

    pub fn regions(&self) -> Option<&ConnRegions> {
        self.regions.as_ref()
    }

    /// Peer receive pool, valid once established.
    pub fn remote_recv(&self) -> RemoteRegion {
        self.remote_recv
    }

    /// Peer send pool, valid once established.
    pub fn remote_send(&self) -> RemoteRegion {
        self.remote_send
    }

    pub fn remote_send_head(&self) -> u64 {
        self.remote_send_head
    }

    pub fn recv_preposted(&self) -> usize {
        self.recv_preposted
    }

    pub fn sends_outgoing(&self) -> u32 {
        self.sends_outgoing.load(Ordering::Acquire)
    }

    /// Account for a send posted by the data path.
    pub fn add_outgoing_send(&self) -> u32 {
        self.sends_outgoing.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Account for a completed send.
    pub fn complete_outgoing_send(&self) -> u32 {
        let prev = self
            .sends_outgoing
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        prev.saturating_sub(1)
    }

    /// Record a received message as expected or unexpected.
    pub fn count_message(&mut self, expected: bool) {
        if expected {
            self.exp_counter += 1;
        } else {
            self.unexp_counter += 1;
        }
    }

    pub fn postponed_len(&self) -> usize {
        self.postponed.len()
    }

    /// Whether the peer record owning this connection still exists.
    pub fn has_record(&self) -> bool {
        self.record.strong_count() > 0
    }

    /// Every channel id the connection currently owns, probe included.
    pub(crate) fn channel_ids(&self) -> Vec<ChannelId> {
        self.channels
            .primary()
            .iter()
            .chain(self.channels.secondary().iter())
            .map(|h| h.id)
            .chain(self.probe)
            .collect()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.endpoint)
            .field("peer", &self.peer)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("channels", &self.channels)
            .field("probe", &self.probe)
            .field("registered", &self.regions.is_some())
            .field("recv_preposted", &self.recv_preposted)
            .field("postponed", &self.postponed.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(id: u64) -> ChannelHandle {
        ChannelHandle::new(ChannelId(id))
    }

    #[test]
    fn test_single_binding() {
        let mut ch = Channels::Unbound;
        assert!(ch.bind(Role::Initiator, ChannelSlot::Primary, handle(1)));
        assert!(!ch.bind(Role::Initiator, ChannelSlot::Primary, handle(2)));
        assert!(!ch.bind(Role::Initiator, ChannelSlot::Secondary, handle(2)));
        assert_eq!(ch.primary().unwrap().id, ChannelId(1));
        assert!(ch.secondary().is_none());
        assert_eq!(ch.slot_of(ChannelId(1)), Some(ChannelSlot::Primary));
        assert_eq!(ch.slot_of(ChannelId(2)), None);
    }

    #[test]
    fn test_loopback_binding() {
        let mut ch = Channels::Unbound;
        assert!(!ch.bind(Role::Loopback, ChannelSlot::Secondary, handle(2)));
        assert!(ch.bind(Role::Loopback, ChannelSlot::Primary, handle(1)));
        assert!(ch.recv_qp().is_none());
        assert!(ch.bind(Role::Loopback, ChannelSlot::Secondary, handle(2)));
        assert!(!ch.bind(Role::Loopback, ChannelSlot::Secondary, handle(3)));
        assert_eq!(ch.slot_of(ChannelId(2)), Some(ChannelSlot::Secondary));

        ch.get_mut(ChannelSlot::Secondary).unwrap().qp = Some(QpHandle(9));
        ch.get_mut(ChannelSlot::Primary).unwrap().qp = Some(QpHandle(8));
        assert_eq!(ch.recv_qp(), Some(QpHandle(9)));
    }

    #[test]
    fn test_recv_qp_single() {
        let mut ch = Channels::Single(ChannelHandle {
            id: ChannelId(1),
            qp: Some(QpHandle(5)),
        });
        assert_eq!(ch.recv_qp(), Some(QpHandle(5)));
        assert!(ch.get_mut(ChannelSlot::Secondary).is_none());
    }

    #[test]
    fn test_detach_and_take_all() {
        let mut ch = Channels::Loopback {
            primary: handle(1),
            secondary: Some(handle(2)),
        };
        assert_eq!(ch.detach(ChannelId(2)), Some(handle(2)));
        assert!(ch.secondary().is_none());
        assert_eq!(ch.detach(ChannelId(7)), None);
        assert_eq!(ch.detach(ChannelId(1)), None);

        let mut single = Channels::Single(handle(3));
        assert_eq!(single.detach(ChannelId(3)), Some(handle(3)));
        assert_eq!(single, Channels::Unbound);

        let mut ch = Channels::Loopback {
            primary: handle(1),
            secondary: Some(handle(2)),
        };
        let [p, s] = ch.take_all();
        assert_eq!(p, Some(handle(1)));
        assert_eq!(s, Some(handle(2)));
        assert_eq!(ch, Channels::Unbound);
    }

    #[test]
    fn test_connection_counters() {
        let a = PeerAddress::from_octets(10, 0, 0, 1, 7000);
        let b = PeerAddress::from_octets(10, 0, 0, 2, 7000);
        let mut conn = Connection::new(EndpointId(1), a, b, Role::Initiator, 3, Weak::new());
        assert_eq!(conn.state(), ConnState::Allocated);
        assert!(!conn.has_record());

        assert_eq!(conn.add_outgoing_send(), 1);
        assert_eq!(conn.add_outgoing_send(), 2);
        assert_eq!(conn.complete_outgoing_send(), 1);
        assert_eq!(conn.sends_outgoing(), 1);

        conn.count_message(true);
        conn.count_message(false);
        conn.count_message(false);
        assert_eq!(conn.exp_counter, 1);
        assert_eq!(conn.unexp_counter, 2);

        conn.probe = Some(ChannelId(4));
        conn.channels = Channels::Single(handle(5));
        assert_eq!(conn.channel_ids(), vec![ChannelId(5), ChannelId(4)]);
    }
}
