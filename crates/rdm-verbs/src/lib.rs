//! Device seam for the RDM connection manager.
//!
//! The connection manager never talks to libibverbs/librdmacm directly; it
//! drives a [`CmDevice`], which exposes the channel, queue-pair, memory
//! registration and CM-event calls it needs. [`sim::SimFabric`] provides an
//! in-process implementation used by tests and the demo binary.

pub mod buf;
pub mod device;
pub mod error;
pub mod event;
pub mod sim;
pub mod wr;

pub use buf::{AccessFlags, MemoryRegion, RdmaBuf, RemoteRegion};
pub use device::{CmDevice, DeviceAttr, LinkLayer};
pub use error::{VerbsError, VerbsResult};
pub use event::{CmEventKind, RawCmEvent, REJECT_CONSUMER_DEFINED};
pub use wr::{ConnParam, QpInitAttr, RecvWorkRequest, Sge, WcOpcode, WcStatus, WorkCompletion};
