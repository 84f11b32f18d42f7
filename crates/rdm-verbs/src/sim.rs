//! An in-process fabric implementing [`CmDevice`].
//!
//! Every device opened on one `SimFabric` shares a single state table, so
//! a connect issued on one device produces a CONNECT_REQUEST on whichever
//! device listens at the destination address, and accept/reject/disconnect
//! deliver the matching events to both sides. Device names must be unique
//! within a fabric.
//!
//! Faults are armed per device and per call site with
//! [`SimDevice::fail_after`]: after `n` more successful calls the next one
//! fails with [`VerbsError::Injected`], once.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use rdm_types::{ChannelId, CqHandle, PeerAddress, QpHandle};

use crate::buf::{AccessFlags, MemoryRegion, RdmaBuf};
use crate::device::{CmDevice, DeviceAttr};
use crate::error::{VerbsError, VerbsResult};
use crate::event::{CmEventKind, RawCmEvent, REJECT_CONSUMER_DEFINED};
use crate::wr::{ConnParam, QpInitAttr, RecvWorkRequest, WorkCompletion};

/// Device calls a fault can be armed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    RegMr,
    DeregMr,
    CreateQp,
    DestroyQp,
    DestroyChannel,
    PostRecv,
    Connect,
    Accept,
    ResolveRoute,
}

impl FaultPoint {
    fn op(self) -> &'static str {
        match self {
            FaultPoint::RegMr => "ibv_reg_mr",
            FaultPoint::DeregMr => "ibv_dereg_mr",
            FaultPoint::CreateQp => "rdma_create_qp",
            FaultPoint::DestroyQp => "rdma_destroy_qp",
            FaultPoint::DestroyChannel => "rdma_destroy_id",
            FaultPoint::PostRecv => "ibv_post_recv",
            FaultPoint::Connect => "rdma_connect",
            FaultPoint::Accept => "rdma_accept",
            FaultPoint::ResolveRoute => "rdma_resolve_route",
        }
    }
}

struct SimChannel {
    device: String,
    local: Option<PeerAddress>,
    remote: Option<PeerAddress>,
    peer: Option<ChannelId>,
    qp: Option<QpHandle>,
    listening: bool,
}

impl SimChannel {
    fn new(device: &str) -> Self {
        Self {
            device: device.to_string(),
            local: None,
            remote: None,
            peer: None,
            qp: None,
            listening: false,
        }
    }
}

struct SimQp {
    device: String,
    posted: Vec<RecvWorkRequest>,
}

struct SimCq {
    device: String,
    completions: VecDeque<WorkCompletion>,
}

#[derive(Default)]
struct FabricState {
    next_handle: u64,
    next_key: u32,
    channels: HashMap<ChannelId, SimChannel>,
    listeners: HashMap<PeerAddress, ChannelId>,
    qps: HashMap<QpHandle, SimQp>,
    mrs: HashMap<u32, String>,
    cqs: HashMap<CqHandle, SimCq>,
    events: HashMap<String, VecDeque<RawCmEvent>>,
    acked: HashMap<String, usize>,
    faults: HashMap<(String, FaultPoint), usize>,
}

impl FabricState {
    fn next_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn push_event(&mut self, device: &str, event: RawCmEvent) {
        tracing::trace!(device, kind = %event.kind, channel = %event.id, "sim event queued");
        self.events
            .entry(device.to_string())
            .or_default()
            .push_back(event);
    }

    fn check_fault(&mut self, device: &str, point: FaultPoint) -> VerbsResult<()> {
        let key = (device.to_string(), point);
        if let Some(remaining) = self.faults.get_mut(&key) {
            if *remaining == 0 {
                self.faults.remove(&key);
                tracing::debug!(device, op = point.op(), "injected fault fired");
                return Err(VerbsError::Injected { op: point.op() });
            }
            *remaining -= 1;
        }
        Ok(())
    }

    fn channel(&self, id: ChannelId) -> VerbsResult<&SimChannel> {
        self.channels.get(&id).ok_or(VerbsError::UnknownChannel(id))
    }

    fn channel_mut(&mut self, id: ChannelId) -> VerbsResult<&mut SimChannel> {
        self.channels
            .get_mut(&id)
            .ok_or(VerbsError::UnknownChannel(id))
    }

    fn device_of(&self, id: ChannelId) -> VerbsResult<String> {
        Ok(self.channel(id)?.device.clone())
    }
}

/// A simulated fabric connecting any number of [`SimDevice`]s.
#[derive(Clone, Default)]
pub struct SimFabric {
    state: Arc<Mutex<FabricState>>,
}

impl SimFabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a device with default limits.
    pub fn device(&self, name: &str) -> Arc<SimDevice> {
        self.device_with_attr(DeviceAttr::new(name))
    }

    pub fn device_with_attr(&self, attr: DeviceAttr) -> Arc<SimDevice> {
        Arc::new(SimDevice {
            attr,
            state: Arc::clone(&self.state),
        })
    }

    /// Number of channels alive on the whole fabric.
    pub fn live_channels(&self) -> usize {
        self.state.lock().channels.len()
    }

    /// Number of queue pairs alive on the whole fabric.
    pub fn live_qps(&self) -> usize {
        self.state.lock().qps.len()
    }

    /// Number of registered memory regions on the whole fabric.
    pub fn registered_regions(&self) -> usize {
        self.state.lock().mrs.len()
    }

    /// Receive work requests posted to `qp` so far, in posting order.
    pub fn posted_receives(&self, qp: QpHandle) -> Vec<RecvWorkRequest> {
        self.state
            .lock()
            .qps
            .get(&qp)
            .map(|q| q.posted.clone())
            .unwrap_or_default()
    }
}

/// One device on a [`SimFabric`].
pub struct SimDevice {
    attr: DeviceAttr,
    state: Arc<Mutex<FabricState>>,
}

impl SimDevice {
    pub fn name(&self) -> &str {
        &self.attr.name
    }

    /// Let `successes` more calls at `point` succeed, then fail the next one.
    pub fn fail_after(&self, point: FaultPoint, successes: usize) {
        self.state
            .lock()
            .faults
            .insert((self.attr.name.clone(), point), successes);
    }

    /// Queue an arbitrary event on this device.
    pub fn inject_event(&self, event: RawCmEvent) {
        self.state.lock().push_event(&self.attr.name, event);
    }

    pub fn pending_events(&self) -> usize {
        self.state
            .lock()
            .events
            .get(&self.attr.name)
            .map_or(0, VecDeque::len)
    }

    pub fn acked_events(&self) -> usize {
        self.state
            .lock()
            .acked
            .get(&self.attr.name)
            .copied()
            .unwrap_or(0)
    }

    /// Channels alive on this device.
    pub fn live_channels(&self) -> usize {
        let state = self.state.lock();
        state
            .channels
            .values()
            .filter(|c| c.device == self.attr.name)
            .count()
    }

    /// Queue pairs alive on this device.
    pub fn live_qps(&self) -> usize {
        let state = self.state.lock();
        state
            .qps
            .values()
            .filter(|q| q.device == self.attr.name)
            .count()
    }

    /// Memory regions registered on this device.
    pub fn registered_regions(&self) -> usize {
        let state = self.state.lock();
        state
            .mrs
            .values()
            .filter(|d| **d == self.attr.name)
            .count()
    }

    /// The queue pair attached to `id`, if any.
    pub fn qp_of(&self, id: ChannelId) -> Option<QpHandle> {
        self.state.lock().channels.get(&id).and_then(|c| c.qp)
    }

    /// Queue a send completion as if the hardware had finished a send.
    pub fn push_send_completion(&self, cq: CqHandle, wc: WorkCompletion) -> VerbsResult<()> {
        let mut state = self.state.lock();
        let cq = state.cqs.get_mut(&cq).ok_or(VerbsError::UnknownCq(cq))?;
        cq.completions.push_back(wc);
        Ok(())
    }
}

impl CmDevice for SimDevice {
    fn attr(&self) -> &DeviceAttr {
        &self.attr
    }

    fn create_cq(&self, _depth: u32) -> VerbsResult<CqHandle> {
        let mut state = self.state.lock();
        let cq = CqHandle(state.next_handle());
        state.cqs.insert(
            cq,
            SimCq {
                device: self.attr.name.clone(),
                completions: VecDeque::new(),
            },
        );
        Ok(cq)
    }

    fn destroy_cq(&self, cq: CqHandle) -> VerbsResult<()> {
        let mut state = self.state.lock();
        match state.cqs.get(&cq) {
            Some(c) if c.device == self.attr.name => {
                state.cqs.remove(&cq);
                Ok(())
            }
            _ => Err(VerbsError::UnknownCq(cq)),
        }
    }

    fn create_channel(&self) -> VerbsResult<ChannelId> {
        let mut state = self.state.lock();
        let id = ChannelId(state.next_handle());
        state.channels.insert(id, SimChannel::new(&self.attr.name));
        Ok(id)
    }

    fn destroy_channel(&self, id: ChannelId) -> VerbsResult<()> {
        let mut state = self.state.lock();
        state.check_fault(&self.attr.name, FaultPoint::DestroyChannel)?;
        let channel = state
            .channels
            .remove(&id)
            .ok_or(VerbsError::UnknownChannel(id))?;
        if let Some(qp) = channel.qp {
            state.qps.remove(&qp);
        }
        if channel.listening {
            state.listeners.retain(|_, listener| *listener != id);
        }
        if let Some(peer) = channel.peer {
            if let Some(p) = state.channels.get_mut(&peer) {
                if p.peer == Some(id) {
                    p.peer = None;
                }
            }
        }
        for queue in state.events.values_mut() {
            queue.retain(|e| e.id != id);
        }
        Ok(())
    }

    fn listen(&self, id: ChannelId, addr: PeerAddress) -> VerbsResult<()> {
        let mut state = self.state.lock();
        if state.listeners.contains_key(&addr) {
            return Err(VerbsError::AddressInUse(addr));
        }
        let channel = state.channel_mut(id)?;
        channel.local = Some(addr);
        channel.listening = true;
        state.listeners.insert(addr, id);
        Ok(())
    }

    fn resolve_addr(
        &self,
        id: ChannelId,
        src: PeerAddress,
        dst: PeerAddress,
        _timeout_ms: u32,
    ) -> VerbsResult<()> {
        let mut state = self.state.lock();
        let channel = state.channel_mut(id)?;
        channel.local = Some(src);
        channel.remote = Some(dst);
        let event = if state.listeners.contains_key(&dst) {
            RawCmEvent::new(CmEventKind::AddrResolved, id)
        } else {
            RawCmEvent::new(CmEventKind::AddrError, id).with_status(-libc::EADDRNOTAVAIL)
        };
        state.push_event(&self.attr.name, event);
        Ok(())
    }

    fn resolve_route(&self, id: ChannelId, _timeout_ms: u32) -> VerbsResult<()> {
        let mut state = self.state.lock();
        state.check_fault(&self.attr.name, FaultPoint::ResolveRoute)?;
        if state.channel(id)?.remote.is_none() {
            return Err(VerbsError::NotConnected(id));
        }
        state.push_event(&self.attr.name, RawCmEvent::new(CmEventKind::RouteResolved, id));
        Ok(())
    }

    fn create_qp(&self, id: ChannelId, attr: &QpInitAttr) -> VerbsResult<QpHandle> {
        let mut state = self.state.lock();
        state.check_fault(&self.attr.name, FaultPoint::CreateQp)?;
        if state.channel(id)?.qp.is_some() {
            return Err(VerbsError::QpExists(id));
        }
        for cq in [attr.send_cq, attr.recv_cq] {
            if !state.cqs.contains_key(&cq) {
                return Err(VerbsError::UnknownCq(cq));
            }
        }
        let qp = QpHandle(state.next_handle());
        state.qps.insert(
            qp,
            SimQp {
                device: self.attr.name.clone(),
                posted: Vec::new(),
            },
        );
        state.channel_mut(id)?.qp = Some(qp);
        Ok(qp)
    }

    fn destroy_qp(&self, id: ChannelId) -> VerbsResult<()> {
        let mut state = self.state.lock();
        state.check_fault(&self.attr.name, FaultPoint::DestroyQp)?;
        let qp = state
            .channel_mut(id)?
            .qp
            .take()
            .ok_or(VerbsError::NoQp(id))?;
        state.qps.remove(&qp);
        Ok(())
    }

    fn connect(&self, id: ChannelId, param: &ConnParam) -> VerbsResult<()> {
        let mut state = self.state.lock();
        state.check_fault(&self.attr.name, FaultPoint::Connect)?;
        let channel = state.channel(id)?;
        let (local, remote) = match (channel.local, channel.remote) {
            (Some(local), Some(remote)) => (local, remote),
            _ => return Err(VerbsError::NotConnected(id)),
        };
        let Some(listener) = state.listeners.get(&remote).copied() else {
            state.push_event(
                &self.attr.name,
                RawCmEvent::new(CmEventKind::Unreachable, id).with_status(-libc::ECONNREFUSED),
            );
            return Ok(());
        };
        let listener_device = state.device_of(listener)?;
        let request = ChannelId(state.next_handle());
        state.channels.insert(
            request,
            SimChannel {
                local: Some(remote),
                remote: Some(local),
                peer: Some(id),
                ..SimChannel::new(&listener_device)
            },
        );
        state.channel_mut(id)?.peer = Some(request);
        state.push_event(
            &listener_device,
            RawCmEvent::new(CmEventKind::ConnectRequest, request)
                .with_listen_id(listener)
                .with_private_data(param.private_data.clone()),
        );
        Ok(())
    }

    fn accept(&self, id: ChannelId, param: &ConnParam) -> VerbsResult<()> {
        let mut state = self.state.lock();
        state.check_fault(&self.attr.name, FaultPoint::Accept)?;
        let channel = state.channel(id)?;
        if channel.qp.is_none() {
            return Err(VerbsError::NoQp(id));
        }
        let peer = channel.peer.ok_or(VerbsError::NotConnected(id))?;
        let peer_device = state
            .device_of(peer)
            .map_err(|_| VerbsError::NotConnected(id))?;
        state.push_event(
            &peer_device,
            RawCmEvent::new(CmEventKind::Established, peer)
                .with_private_data(param.private_data.clone()),
        );
        state.push_event(&self.attr.name, RawCmEvent::new(CmEventKind::Established, id));
        Ok(())
    }

    fn reject(&self, id: ChannelId, private_data: &[u8]) -> VerbsResult<()> {
        let mut state = self.state.lock();
        let peer = state
            .channel_mut(id)?
            .peer
            .take()
            .ok_or(VerbsError::NotConnected(id))?;
        if let Ok(p) = state.channel_mut(peer) {
            p.peer = None;
            let device = p.device.clone();
            state.push_event(
                &device,
                RawCmEvent::new(CmEventKind::Rejected, peer)
                    .with_status(REJECT_CONSUMER_DEFINED)
                    .with_private_data(Bytes::copy_from_slice(private_data)),
            );
        }
        Ok(())
    }

    fn disconnect(&self, id: ChannelId) -> VerbsResult<()> {
        let mut state = self.state.lock();
        let peer = state
            .channel_mut(id)?
            .peer
            .take()
            .ok_or(VerbsError::NotConnected(id))?;
        let peer_device = match state.channel_mut(peer) {
            Ok(p) => {
                p.peer = None;
                Some(p.device.clone())
            }
            Err(_) => None,
        };
        state.push_event(&self.attr.name, RawCmEvent::new(CmEventKind::Disconnected, id));
        if let Some(device) = &peer_device {
            state.push_event(device, RawCmEvent::new(CmEventKind::Disconnected, peer));
        }
        state.push_event(&self.attr.name, RawCmEvent::new(CmEventKind::TimewaitExit, id));
        if let Some(device) = &peer_device {
            state.push_event(device, RawCmEvent::new(CmEventKind::TimewaitExit, peer));
        }
        Ok(())
    }

    fn get_cm_event(&self) -> VerbsResult<Option<RawCmEvent>> {
        let mut state = self.state.lock();
        Ok(state
            .events
            .get_mut(&self.attr.name)
            .and_then(VecDeque::pop_front))
    }

    fn ack_cm_event(&self, _event: RawCmEvent) -> VerbsResult<()> {
        let mut state = self.state.lock();
        *state.acked.entry(self.attr.name.clone()).or_default() += 1;
        Ok(())
    }

    fn reg_mr(&self, buf: &mut RdmaBuf, _access: AccessFlags) -> VerbsResult<MemoryRegion> {
        let mut state = self.state.lock();
        state.check_fault(&self.attr.name, FaultPoint::RegMr)?;
        if buf.is_empty() || buf.len() as u64 > self.attr.max_mr_size {
            return Err(VerbsError::Os {
                op: "ibv_reg_mr",
                errno: libc::EINVAL,
            });
        }
        state.next_key += 1;
        let lkey = state.next_key;
        state.mrs.insert(lkey, self.attr.name.clone());
        Ok(MemoryRegion {
            addr: buf.addr(),
            length: buf.len(),
            lkey,
            rkey: lkey | 0x8000_0000,
        })
    }

    fn dereg_mr(&self, mr: MemoryRegion) -> VerbsResult<()> {
        let mut state = self.state.lock();
        state.check_fault(&self.attr.name, FaultPoint::DeregMr)?;
        state
            .mrs
            .remove(&mr.lkey)
            .map(|_| ())
            .ok_or(VerbsError::UnknownMr(mr.lkey))
    }

    fn post_recv(&self, qp: QpHandle, chain: &[RecvWorkRequest]) -> VerbsResult<()> {
        let mut state = self.state.lock();
        state.check_fault(&self.attr.name, FaultPoint::PostRecv)?;
        let q = state.qps.get_mut(&qp).ok_or(VerbsError::UnknownQp(qp))?;
        q.posted.extend_from_slice(chain);
        Ok(())
    }

    fn poll_send_cq(&self, cq: CqHandle, max: usize) -> VerbsResult<Vec<WorkCompletion>> {
        let mut state = self.state.lock();
        let c = state.cqs.get_mut(&cq).ok_or(VerbsError::UnknownCq(cq))?;
        let n = max.min(c.completions.len());
        Ok(c.completions.drain(..n).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wr::{WcOpcode, WcStatus};

    fn addr(last: u8) -> PeerAddress {
        PeerAddress::from_octets(10, 0, 0, last, 7000)
    }

    fn qp_attr(dev: &SimDevice) -> QpInitAttr {
        let cq = dev.create_cq(16).unwrap();
        QpInitAttr {
            send_cq: cq,
            recv_cq: cq,
            max_send_wr: 16,
            max_recv_wr: 16,
            max_send_sge: 1,
            max_recv_sge: 1,
            max_inline_data: 64,
        }
    }

    #[test]
    fn test_connect_accept_flow() {
        let fabric = SimFabric::new();
        let d1 = fabric.device("d1");
        let d2 = fabric.device("d2");

        let listener = d2.create_channel().unwrap();
        d2.listen(listener, addr(2)).unwrap();

        let id = d1.create_channel().unwrap();
        d1.resolve_addr(id, addr(1), addr(2), 1000).unwrap();
        let ev = d1.get_cm_event().unwrap().unwrap();
        assert_eq!(ev.kind, CmEventKind::AddrResolved);
        d1.ack_cm_event(ev).unwrap();
        assert_eq!(d1.acked_events(), 1);

        d1.resolve_route(id, 1000).unwrap();
        assert_eq!(
            d1.get_cm_event().unwrap().unwrap().kind,
            CmEventKind::RouteResolved
        );

        let param = ConnParam {
            private_data: Bytes::from_static(b"hello"),
            responder_resources: 2,
            initiator_depth: 2,
        };
        d1.connect(id, &param).unwrap();
        let req = d2.get_cm_event().unwrap().unwrap();
        assert_eq!(req.kind, CmEventKind::ConnectRequest);
        assert_eq!(req.listen_id, Some(listener));
        assert_eq!(req.private_data(), b"hello");

        let attr = qp_attr(&d2);
        d2.create_qp(req.id, &attr).unwrap();
        d2.accept(req.id, &ConnParam::default()).unwrap();

        let est1 = d1.get_cm_event().unwrap().unwrap();
        assert_eq!(est1.kind, CmEventKind::Established);
        assert_eq!(est1.id, id);
        let est2 = d2.get_cm_event().unwrap().unwrap();
        assert_eq!(est2.kind, CmEventKind::Established);
        assert_eq!(est2.id, req.id);
        assert!(d1.get_cm_event().unwrap().is_none());
    }

    #[test]
    fn test_resolve_without_listener() {
        let fabric = SimFabric::new();
        let d1 = fabric.device("d1");
        let id = d1.create_channel().unwrap();
        d1.resolve_addr(id, addr(1), addr(9), 1000).unwrap();
        let ev = d1.get_cm_event().unwrap().unwrap();
        assert_eq!(ev.kind, CmEventKind::AddrError);
        assert_eq!(ev.status, -libc::EADDRNOTAVAIL);
    }

    #[test]
    fn test_reject_delivers_payload() {
        let fabric = SimFabric::new();
        let d1 = fabric.device("d1");
        let d2 = fabric.device("d2");
        let listener = d2.create_channel().unwrap();
        d2.listen(listener, addr(2)).unwrap();
        let id = d1.create_channel().unwrap();
        d1.resolve_addr(id, addr(1), addr(2), 1000).unwrap();
        d1.connect(id, &ConnParam::default()).unwrap();
        let req = d2.get_cm_event().unwrap().unwrap();
        d2.reject(req.id, &[0xef, 0xbe, 0xad, 0xde]).unwrap();

        let _addr_resolved = d1.get_cm_event().unwrap().unwrap();
        let rej = d1.get_cm_event().unwrap().unwrap();
        assert_eq!(rej.kind, CmEventKind::Rejected);
        assert_eq!(rej.status, REJECT_CONSUMER_DEFINED);
        assert_eq!(rej.private_data(), &[0xef, 0xbe, 0xad, 0xde]);
    }

    #[test]
    fn test_listen_address_in_use() {
        let fabric = SimFabric::new();
        let d1 = fabric.device("d1");
        let a = d1.create_channel().unwrap();
        let b = d1.create_channel().unwrap();
        d1.listen(a, addr(1)).unwrap();
        assert_eq!(
            d1.listen(b, addr(1)).unwrap_err(),
            VerbsError::AddressInUse(addr(1))
        );
        d1.destroy_channel(a).unwrap();
        d1.listen(b, addr(1)).unwrap();
    }

    #[test]
    fn test_fault_fires_once() {
        let fabric = SimFabric::new();
        let d1 = fabric.device("d1");
        d1.fail_after(FaultPoint::RegMr, 1);
        let mut buf = RdmaBuf::try_allocate(64).unwrap();
        assert!(d1.reg_mr(&mut buf, AccessFlags::LOCAL_WRITE).is_ok());
        assert_eq!(
            d1.reg_mr(&mut buf, AccessFlags::LOCAL_WRITE).unwrap_err(),
            VerbsError::Injected { op: "ibv_reg_mr" }
        );
        let mr = d1.reg_mr(&mut buf, AccessFlags::LOCAL_WRITE).unwrap();
        assert_eq!(d1.registered_regions(), 2);
        d1.dereg_mr(mr).unwrap();
        assert_eq!(d1.registered_regions(), 1);
        assert_eq!(d1.dereg_mr(mr).unwrap_err(), VerbsError::UnknownMr(mr.lkey));
    }

    #[test]
    fn test_qp_lifecycle_and_recv_posting() {
        let fabric = SimFabric::new();
        let d1 = fabric.device("d1");
        let id = d1.create_channel().unwrap();
        let attr = qp_attr(&d1);
        let qp = d1.create_qp(id, &attr).unwrap();
        assert_eq!(d1.create_qp(id, &attr).unwrap_err(), VerbsError::QpExists(id));
        assert_eq!(d1.qp_of(id), Some(qp));

        let chain = [RecvWorkRequest { wr_id: 5, sge: None }; 3];
        d1.post_recv(qp, &chain).unwrap();
        assert_eq!(fabric.posted_receives(qp).len(), 3);

        d1.destroy_qp(id).unwrap();
        assert_eq!(d1.destroy_qp(id).unwrap_err(), VerbsError::NoQp(id));
        assert_eq!(fabric.live_qps(), 0);
    }

    #[test]
    fn test_destroy_channel_drops_qp_and_events() {
        let fabric = SimFabric::new();
        let d1 = fabric.device("d1");
        let listener = d1.create_channel().unwrap();
        d1.listen(listener, addr(1)).unwrap();
        let id = d1.create_channel().unwrap();
        let attr = qp_attr(&d1);
        d1.create_qp(id, &attr).unwrap();
        d1.resolve_addr(id, addr(1), addr(1), 1000).unwrap();
        assert_eq!(d1.pending_events(), 1);

        d1.destroy_channel(id).unwrap();
        assert_eq!(d1.pending_events(), 0);
        assert_eq!(d1.live_qps(), 0);
        assert_eq!(d1.live_channels(), 1);
    }

    #[test]
    fn test_disconnect_notifies_both_sides() {
        let fabric = SimFabric::new();
        let d1 = fabric.device("d1");
        let d2 = fabric.device("d2");
        let listener = d2.create_channel().unwrap();
        d2.listen(listener, addr(2)).unwrap();
        let id = d1.create_channel().unwrap();
        d1.resolve_addr(id, addr(1), addr(2), 1000).unwrap();
        d1.connect(id, &ConnParam::default()).unwrap();
        let req = d2.get_cm_event().unwrap().unwrap();
        let attr = qp_attr(&d2);
        d2.create_qp(req.id, &attr).unwrap();
        d2.accept(req.id, &ConnParam::default()).unwrap();
        while d1.get_cm_event().unwrap().is_some() {}
        while d2.get_cm_event().unwrap().is_some() {}

        d1.disconnect(id).unwrap();
        let kinds: Vec<_> = std::iter::from_fn(|| d2.get_cm_event().unwrap())
            .map(|e| e.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![CmEventKind::Disconnected, CmEventKind::TimewaitExit]
        );
        assert_eq!(d1.disconnect(id).unwrap_err(), VerbsError::NotConnected(id));
    }

    #[test]
    fn test_poll_send_cq() {
        let fabric = SimFabric::new();
        let d1 = fabric.device("d1");
        let cq = d1.create_cq(8).unwrap();
        let wc = WorkCompletion {
            wr_id: 1,
            status: WcStatus::Success,
            opcode: WcOpcode::Send,
            byte_len: 0,
        };
        for _ in 0..3 {
            d1.push_send_completion(cq, wc).unwrap();
        }
        assert_eq!(d1.poll_send_cq(cq, 2).unwrap().len(), 2);
        assert_eq!(d1.poll_send_cq(cq, 2).unwrap().len(), 1);
        assert!(d1.poll_send_cq(cq, 2).unwrap().is_empty());
        d1.destroy_cq(cq).unwrap();
        assert_eq!(d1.poll_send_cq(cq, 1).unwrap_err(), VerbsError::UnknownCq(cq));
    }
}
