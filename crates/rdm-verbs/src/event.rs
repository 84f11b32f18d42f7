use bytes::Bytes;
use serde::{Deserialize, Serialize};

use rdm_types::ChannelId;

/// Reject reason reported for a consumer-initiated reject (IB CM).
pub const REJECT_CONSUMER_DEFINED: i32 = 28;

/// Kinds of asynchronous connection-management events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CmEventKind {
    AddrResolved,
    AddrError,
    RouteResolved,
    RouteError,
    ConnectRequest,
    ConnectResponse,
    ConnectError,
    Unreachable,
    Rejected,
    Established,
    Disconnected,
    DeviceRemoval,
    MulticastJoin,
    MulticastError,
    AddrChange,
    TimewaitExit,
}

impl CmEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            CmEventKind::AddrResolved => "RDMA_CM_EVENT_ADDR_RESOLVED",
            CmEventKind::AddrError => "RDMA_CM_EVENT_ADDR_ERROR",
            CmEventKind::RouteResolved => "RDMA_CM_EVENT_ROUTE_RESOLVED",
            CmEventKind::RouteError => "RDMA_CM_EVENT_ROUTE_ERROR",
            CmEventKind::ConnectRequest => "RDMA_CM_EVENT_CONNECT_REQUEST",
            CmEventKind::ConnectResponse => "RDMA_CM_EVENT_CONNECT_RESPONSE",
            CmEventKind::ConnectError => "RDMA_CM_EVENT_CONNECT_ERROR",
            CmEventKind::Unreachable => "RDMA_CM_EVENT_UNREACHABLE",
            CmEventKind::Rejected => "RDMA_CM_EVENT_REJECTED",
            CmEventKind::Established => "RDMA_CM_EVENT_ESTABLISHED",
            CmEventKind::Disconnected => "RDMA_CM_EVENT_DISCONNECTED",
            CmEventKind::DeviceRemoval => "RDMA_CM_EVENT_DEVICE_REMOVAL",
            CmEventKind::MulticastJoin => "RDMA_CM_EVENT_MULTICAST_JOIN",
            CmEventKind::MulticastError => "RDMA_CM_EVENT_MULTICAST_ERROR",
            CmEventKind::AddrChange => "RDMA_CM_EVENT_ADDR_CHANGE",
            CmEventKind::TimewaitExit => "RDMA_CM_EVENT_TIMEWAIT_EXIT",
        }
    }
}

impl std::fmt::Display for CmEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// An event as handed out by the device, still owned by the event channel
/// until it is acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCmEvent {
    pub kind: CmEventKind,
    /// Channel the event is reported on. For CONNECT_REQUEST this is a new
    /// channel created for the inbound request.
    pub id: ChannelId,
    /// Listening channel that produced a CONNECT_REQUEST.
    pub listen_id: Option<ChannelId>,
    /// Event status: a negative errno, a reject reason, or 0.
    pub status: i32,
    pub private_data: Bytes,
}

impl RawCmEvent {
    pub fn new(kind: CmEventKind, id: ChannelId) -> Self {
        Self {
            kind,
            id,
            listen_id: None,
            status: 0,
            private_data: Bytes::new(),
        }
    }

    pub fn with_status(mut self, status: i32) -> Self {
        self.status = status;
        self
    }

    pub fn with_private_data(mut self, data: Bytes) -> Self {
        self.private_data = data;
        self
    }

    pub fn with_listen_id(mut self, listen_id: ChannelId) -> Self {
        self.listen_id = Some(listen_id);
        self
    }

    pub fn private_data(&self) -> &[u8] {
        &self.private_data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_display() {
        assert_eq!(
            CmEventKind::ConnectRequest.to_string(),
            "RDMA_CM_EVENT_CONNECT_REQUEST"
        );
        assert_eq!(
            CmEventKind::TimewaitExit.to_string(),
            "RDMA_CM_EVENT_TIMEWAIT_EXIT"
        );
    }

    #[test]
    fn test_raw_event_builder() {
        let ev = RawCmEvent::new(CmEventKind::Rejected, ChannelId(4))
            .with_status(REJECT_CONSUMER_DEFINED)
            .with_private_data(Bytes::from_static(&[1, 2, 3]))
            .with_listen_id(ChannelId(1));
        assert_eq!(ev.id, ChannelId(4));
        assert_eq!(ev.listen_id, Some(ChannelId(1)));
        assert_eq!(ev.status, 28);
        assert_eq!(ev.private_data(), &[1, 2, 3]);
    }
}
