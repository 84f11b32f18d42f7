use rdm_types::{ChannelId, CqHandle, PeerAddress, QpHandle};
use thiserror::Error;

/// Errors reported by a connection-management device.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerbsError {
    /// A device call failed with an OS error number.
    #[error("{op} failed: errno {errno}")]
    Os { op: &'static str, errno: i32 },

    /// Host memory for a buffer could not be allocated.
    #[error("out of memory allocating {size} bytes")]
    OutOfMemory { size: usize },

    /// The channel handle is not known to the device.
    #[error("unknown channel {0}")]
    UnknownChannel(ChannelId),

    /// The queue pair handle is not known to the device.
    #[error("unknown queue pair {0}")]
    UnknownQp(QpHandle),

    /// The completion queue handle is not known to the device.
    #[error("unknown completion queue {0}")]
    UnknownCq(CqHandle),

    /// No memory region is registered under this local key.
    #[error("unknown memory region lkey={0:#x}")]
    UnknownMr(u32),

    /// The channel has no queue pair attached.
    #[error("channel {0} has no queue pair")]
    NoQp(ChannelId),

    /// The channel already has a queue pair attached.
    #[error("channel {0} already has a queue pair")]
    QpExists(ChannelId),

    /// The channel has no connected or pending peer.
    #[error("channel {0} is not connected")]
    NotConnected(ChannelId),

    /// Another channel is already listening on this address.
    #[error("address {0} already in use")]
    AddressInUse(PeerAddress),

    /// A fault armed by a test or simulation hook fired.
    #[error("injected fault in {op}")]
    Injected { op: &'static str },
}

impl VerbsError {
    /// The errno a verbs/rdma_cm library call would have left behind.
    pub fn errno(&self) -> i32 {
        match self {
            VerbsError::Os { errno, .. } => *errno,
            VerbsError::OutOfMemory { .. } => libc::ENOMEM,
            VerbsError::UnknownChannel(_)
            | VerbsError::UnknownQp(_)
            | VerbsError::UnknownCq(_)
            | VerbsError::UnknownMr(_)
            | VerbsError::NoQp(_) => libc::EINVAL,
            VerbsError::QpExists(_) => libc::EEXIST,
            VerbsError::NotConnected(_) => libc::ENOTCONN,
            VerbsError::AddressInUse(_) => libc::EADDRINUSE,
            VerbsError::Injected { .. } => libc::EIO,
        }
    }
}

/// Result alias for device calls.
pub type VerbsResult<T> = Result<T, VerbsError>;
