//! Connection management for RDM messaging over reliable connected channels.
//!
//! A [`CmContext`] owns one device, the peer directory and every endpoint
//! opened on it. Connections are created lazily per `(peer, endpoint)`,
//! roles are arbitrated from the two addresses, and all state changes are
//! driven by [`CmContext::progress`].

pub mod arbiter;
pub mod config;
pub mod connection;
pub mod context;
pub mod directory;
pub mod dispatcher;
pub mod endpoint;
pub mod error;
mod handlers;
pub mod private_data;
pub mod registrar;
pub mod reposter;
pub mod request;
pub mod state_machine;

pub use arbiter::{arbitrate, Role};
pub use config::{CmConfig, DataOpcode, EndpointConfig};
pub use connection::{ChannelHandle, ChannelSlot, Channels, ConnState, Connection};
pub use context::CmContext;
pub use directory::{ConnRef, Directory, PeerRecord};
pub use dispatcher::CmEvent;
pub use endpoint::{CompletionProcessor, DrainSendQueue, Endpoint};
pub use private_data::{PrivateData, RemoteKeys, REJECT_COLLISION_MARKER};
pub use request::{PooledRequest, RequestPool, TransferRequest};
pub use state_machine::{Action, InvalidTransition, Via};
