//! Local endpoints and the completion hook used on disconnect.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;

use rdm_types::{ChannelId, CqHandle, EndpointId, PeerAddress, Result, StatusCode};
use rdm_verbs::{CmDevice, QpInitAttr};

use crate::config::EndpointConfig;
use crate::error::device_error;
use crate::request::PooledRequest;

/// A local endpoint: one listening address with its completion queues,
/// buffer sizing and the queue of requests ready for the data path.
pub struct Endpoint {
    id: EndpointId,
    address: PeerAddress,
    config: EndpointConfig,
    listener: ChannelId,
    send_cq: CqHandle,
    recv_cq: CqHandle,
    closing: AtomicBool,
    active: AtomicUsize,
    posted: Mutex<VecDeque<PooledRequest>>,
}

impl Endpoint {
    pub(crate) fn new(
        id: EndpointId,
        address: PeerAddress,
        config: EndpointConfig,
        listener: ChannelId,
        send_cq: CqHandle,
        recv_cq: CqHandle,
    ) -> Self {
        Self {
            id,
            address,
            config,
            listener,
            send_cq,
            recv_cq,
            closing: AtomicBool::new(false),
            active: AtomicUsize::new(0),
            posted: Mutex::new(VecDeque::new()),
        }
    }

    pub fn id(&self) -> EndpointId {
        self.id
    }

    pub fn address(&self) -> PeerAddress {
        self.address
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    pub fn listener(&self) -> ChannelId {
        self.listener
    }

    pub fn send_cq(&self) -> CqHandle {
        self.send_cq
    }

    pub fn recv_cq(&self) -> CqHandle {
        self.recv_cq
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub(crate) fn set_closing(&self) -> bool {
        self.closing.swap(true, Ordering::AcqRel)
    }

    /// Connections of this endpoint currently established.
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn connection_established(&self) -> usize {
        self.active.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn connection_closed(&self) -> usize {
        let prev = self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        prev.saturating_sub(1)
    }

    /// Hand a request to the data path.
    pub(crate) fn post(&self, request: PooledRequest) {
        self.posted.lock().push_back(request);
    }

    pub(crate) fn post_all(&self, requests: impl IntoIterator<Item = PooledRequest>) -> usize {
        let mut posted = self.posted.lock();
        let before = posted.len();
        posted.extend(requests);
        posted.len() - before
    }

    /// Requests waiting for the data path.
    pub fn posted_len(&self) -> usize {
        self.posted.lock().len()
    }

    /// Take the next posted request; the data path's entry point.
    pub fn take_posted(&self) -> Option<PooledRequest> {
        self.posted.lock().pop_front()
    }

    /// Return every posted request to its pool.
    pub(crate) fn sweep_posted(&self) -> usize {
        let drained: Vec<PooledRequest> = self.posted.lock().drain(..).collect();
        drained.len()
    }

    pub(crate) fn qp_init_attr(&self, device_max_sge: u32) -> QpInitAttr {
        QpInitAttr {
            send_cq: self.send_cq,
            recv_cq: self.recv_cq,
            max_send_wr: self.config.sq_depth as u32,
            max_recv_wr: self.config.rq_depth as u32,
            max_send_sge: device_max_sge.min(1),
            max_recv_sge: device_max_sge.min(1),
            max_inline_data: self.config.max_inline,
        }
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("closing", &self.is_closing())
            .field("active", &self.active_connections())
            .finish()
    }
}

/// Entry point into the data path for draining send completions when a
/// peer disconnects.
pub trait CompletionProcessor: Send + Sync {
    /// Process whatever send completions are already queued for `endpoint`.
    /// Must not block waiting for new ones.
    fn process_send_completions(&self, device: &dyn CmDevice, endpoint: &Endpoint)
        -> Result<usize>;
}

/// Polls the endpoint's send queue in batches until it comes back empty.
#[derive(Debug, Clone, Copy)]
pub struct DrainSendQueue {
    pub batch: usize,
}

impl CompletionProcessor for DrainSendQueue {
    fn process_send_completions(
        &self,
        device: &dyn CmDevice,
        endpoint: &Endpoint,
    ) -> Result<usize> {
        let mut total = 0;
        loop {
            let completions = device
                .poll_send_cq(endpoint.send_cq(), self.batch.max(1))
                .map_err(|e| device_error(StatusCode::IO_ERROR, "poll send completions", e))?;
            if completions.is_empty() {
                return Ok(total);
            }
            for wc in completions.iter().filter(|wc| !wc.is_success()) {
                tracing::debug!(endpoint = %endpoint.id(), wr_id = wc.wr_id, status = ?wc.status, "send completed with error");
            }
            total += completions.len();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RequestPool;
    use rdm_verbs::sim::SimFabric;
    use rdm_verbs::{WcOpcode, WcStatus, WorkCompletion};

    fn endpoint(send_cq: CqHandle, recv_cq: CqHandle) -> Endpoint {
        Endpoint::new(
            EndpointId(1),
            PeerAddress::from_octets(10, 0, 0, 1, 7000),
            EndpointConfig::default(),
            ChannelId(1),
            send_cq,
            recv_cq,
        )
    }

    #[test]
    fn test_active_counter() {
        let ep = endpoint(CqHandle(1), CqHandle(2));
        assert_eq!(ep.connection_established(), 1);
        assert_eq!(ep.connection_established(), 2);
        assert_eq!(ep.connection_closed(), 1);
        assert_eq!(ep.connection_closed(), 0);
        assert_eq!(ep.connection_closed(), 0);
        assert_eq!(ep.active_connections(), 0);
    }

    #[test]
    fn test_closing_flag() {
        let ep = endpoint(CqHandle(1), CqHandle(2));
        assert!(!ep.is_closing());
        assert!(!ep.set_closing());
        assert!(ep.set_closing());
        assert!(ep.is_closing());
    }

    #[test]
    fn test_posted_queue_and_sweep() {
        let pool = RequestPool::new(4);
        let ep = endpoint(CqHandle(1), CqHandle(2));
        ep.post(pool.acquire().unwrap());
        let n = ep.post_all(vec![pool.acquire().unwrap(), pool.acquire().unwrap()]);
        assert_eq!(n, 2);
        assert_eq!(ep.posted_len(), 3);
        assert_eq!(pool.available(), 1);

        let first = ep.take_posted().unwrap();
        drop(first);
        assert_eq!(pool.available(), 2);

        assert_eq!(ep.sweep_posted(), 2);
        assert_eq!(ep.posted_len(), 0);
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn test_qp_init_attr() {
        let ep = endpoint(CqHandle(3), CqHandle(4));
        let attr = ep.qp_init_attr(30);
        assert_eq!(attr.send_cq, CqHandle(3));
        assert_eq!(attr.recv_cq, CqHandle(4));
        assert_eq!(attr.max_recv_wr, 1000);
        assert_eq!(attr.max_send_sge, 1);
        assert_eq!(attr.max_inline_data, 256);
    }

    #[test]
    fn test_drain_send_queue() {
        let fabric = SimFabric::new();
        let dev = fabric.device("d1");
        let cq = dev.create_cq(64).unwrap();
        let ep = endpoint(cq, cq);
        for i in 0..5 {
            dev.push_send_completion(
                cq,
                WorkCompletion {
                    wr_id: i,
                    status: if i == 2 {
                        WcStatus::WrFlushError
                    } else {
                        WcStatus::Success
                    },
                    opcode: WcOpcode::Send,
                    byte_len: 0,
                },
            )
            .unwrap();
        }
        let drain = DrainSendQueue { batch: 2 };
        assert_eq!(drain.process_send_completions(dev.as_ref(), &ep).unwrap(), 5);
        assert_eq!(drain.process_send_completions(dev.as_ref(), &ep).unwrap(), 0);
    }
}
