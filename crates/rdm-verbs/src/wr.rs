//! Work requests, completions and connection parameters.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use rdm_types::CqHandle;

/// One scatter/gather element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sge {
    pub addr: u64,
    pub length: u32,
    pub lkey: u32,
}

/// A receive work request. A slice of these is posted as one chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecvWorkRequest {
    pub wr_id: u64,
    /// Landing buffer; `None` for receives that only consume an immediate.
    pub sge: Option<Sge>,
}

impl RecvWorkRequest {
    pub fn num_sge(&self) -> usize {
        usize::from(self.sge.is_some())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WcStatus {
    Success,
    LocalProtectionError,
    WrFlushError,
    RemoteAccessError,
    GeneralError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WcOpcode {
    Send,
    RdmaWrite,
    RdmaRead,
    Recv,
    RecvRdmaWithImm,
}

/// A completed work request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkCompletion {
    pub wr_id: u64,
    pub status: WcStatus,
    pub opcode: WcOpcode,
    pub byte_len: u32,
}

impl WorkCompletion {
    pub fn is_success(&self) -> bool {
        self.status == WcStatus::Success
    }
}

/// Parameters for creating a reliable-connected queue pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QpInitAttr {
    pub send_cq: CqHandle,
    pub recv_cq: CqHandle,
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_send_sge: u32,
    pub max_recv_sge: u32,
    pub max_inline_data: u32,
}

/// Parameters carried by a connect or accept call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnParam {
    pub private_data: Bytes,
    pub responder_resources: u8,
    pub initiator_depth: u8,
}
