//! The device seam between the connection manager and the RDMA stack.
//!
//! `CmDevice` has the shape of the rdma_cm + verbs calls the connection
//! manager issues: channel ids, queue pairs, memory registration, receive
//! posting, completion polling and the asynchronous CM event queue. Every
//! call is non-blocking; `get_cm_event` reports an empty queue as `None`.

use serde::{Deserialize, Serialize};

use rdm_types::{ChannelId, CqHandle, PeerAddress, QpHandle};

use crate::buf::{AccessFlags, MemoryRegion, RdmaBuf};
use crate::error::VerbsResult;
use crate::event::RawCmEvent;
use crate::wr::{ConnParam, QpInitAttr, RecvWorkRequest, WorkCompletion};

/// Link layer type of the port a device is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkLayer {
    /// InfiniBand.
    Infiniband,
    /// RoCE (RDMA over Converged Ethernet).
    Ethernet,
    /// Unknown or unspecified.
    Unspecified,
}

impl std::fmt::Display for LinkLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkLayer::Infiniband => write!(f, "INFINIBAND"),
            LinkLayer::Ethernet => write!(f, "ETHERNET"),
            LinkLayer::Unspecified => write!(f, "UNSPECIFIED"),
        }
    }
}

/// Static limits of a device, queried once when the device is opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceAttr {
    /// Device name (e.g., "mlx5_0").
    pub name: String,
    pub link_layer: LinkLayer,
    /// Maximum outstanding work requests per queue.
    pub max_qp_wr: u32,
    /// Maximum scatter/gather entries per work request.
    pub max_sge: u32,
    /// Maximum inline payload of a send.
    pub max_inline_data: u32,
    /// Largest registrable memory region in bytes.
    pub max_mr_size: u64,
}

impl DeviceAttr {
    /// Limits typical of a ConnectX-class adapter.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            link_layer: LinkLayer::Infiniband,
            max_qp_wr: 16384,
            max_sge: 30,
            max_inline_data: 512,
            max_mr_size: 1 << 40,
        }
    }

    pub fn is_roce(&self) -> bool {
        self.link_layer == LinkLayer::Ethernet
    }
}

/// Operations the connection manager needs from an RDMA device.
///
/// Implementations must be shareable across the threads that drive
/// progress; every call is expected to return promptly.
pub trait CmDevice: Send + Sync {
    /// Static limits of this device.
    fn attr(&self) -> &DeviceAttr;

    /// Create a completion queue able to hold `depth` entries.
    fn create_cq(&self, depth: u32) -> VerbsResult<CqHandle>;

    fn destroy_cq(&self, cq: CqHandle) -> VerbsResult<()>;

    /// Create a new channel id whose events arrive on this device's queue.
    fn create_channel(&self) -> VerbsResult<ChannelId>;

    /// Destroy a channel id. Any queue pair still attached is dropped with it.
    fn destroy_channel(&self, id: ChannelId) -> VerbsResult<()>;

    /// Bind `id` to `addr` and accept connection requests on it.
    fn listen(&self, id: ChannelId, addr: PeerAddress) -> VerbsResult<()>;

    /// Start resolving `dst`; completion is reported as an ADDR_RESOLVED or
    /// ADDR_ERROR event.
    fn resolve_addr(
        &self,
        id: ChannelId,
        src: PeerAddress,
        dst: PeerAddress,
        timeout_ms: u32,
    ) -> VerbsResult<()>;

    /// Start resolving a route; completion is reported as ROUTE_RESOLVED or
    /// ROUTE_ERROR.
    fn resolve_route(&self, id: ChannelId, timeout_ms: u32) -> VerbsResult<()>;

    /// Create a queue pair and attach it to `id`.
    fn create_qp(&self, id: ChannelId, attr: &QpInitAttr) -> VerbsResult<QpHandle>;

    /// Destroy the queue pair attached to `id`.
    fn destroy_qp(&self, id: ChannelId) -> VerbsResult<()>;

    fn connect(&self, id: ChannelId, param: &ConnParam) -> VerbsResult<()>;

    fn accept(&self, id: ChannelId, param: &ConnParam) -> VerbsResult<()>;

    /// Reject the connection request that arrived on `id`, returning
    /// `private_data` to the requester.
    fn reject(&self, id: ChannelId, private_data: &[u8]) -> VerbsResult<()>;

    fn disconnect(&self, id: ChannelId) -> VerbsResult<()>;

    /// Take the next pending CM event; `None` when the queue is empty.
    fn get_cm_event(&self) -> VerbsResult<Option<RawCmEvent>>;

    /// Release an event obtained from `get_cm_event`.
    fn ack_cm_event(&self, event: RawCmEvent) -> VerbsResult<()>;

    fn reg_mr(&self, buf: &mut RdmaBuf, access: AccessFlags) -> VerbsResult<MemoryRegion>;

    fn dereg_mr(&self, mr: MemoryRegion) -> VerbsResult<()>;

    /// Post a chain of receive work requests in one call. The chain is
    /// all-or-nothing.
    fn post_recv(&self, qp: QpHandle, chain: &[RecvWorkRequest]) -> VerbsResult<()>;

    /// Pop up to `max` completions from a send completion queue.
    fn poll_send_cq(&self, cq: CqHandle, max: usize) -> VerbsResult<Vec<WorkCompletion>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_layer_display() {
        assert_eq!(format!("{}", LinkLayer::Infiniband), "INFINIBAND");
        assert_eq!(format!("{}", LinkLayer::Ethernet), "ETHERNET");
        assert_eq!(format!("{}", LinkLayer::Unspecified), "UNSPECIFIED");
    }

    #[test]
    fn test_device_attr_defaults() {
        let attr = DeviceAttr::new("mlx5_0");
        assert_eq!(attr.name, "mlx5_0");
        assert!(!attr.is_roce());
        assert!(attr.max_qp_wr >= 1000);
        assert!(attr.max_inline_data >= 256);
    }

    #[test]
    fn test_device_attr_serde() {
        let attr = DeviceAttr {
            link_layer: LinkLayer::Ethernet,
            ..DeviceAttr::new("rxe0")
        };
        let json = serde_json::to_string(&attr).unwrap();
        let parsed: DeviceAttr = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, attr);
        assert!(parsed.is_roce());
    }
}
