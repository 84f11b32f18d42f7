//! Transition table of the connection state machine.
//!
//! [`plan`] is pure: it maps the connection's state and role plus the facts
//! of one event onto the [`Action`] the handlers execute. Combinations the
//! protocol never produces come back as [`InvalidTransition`].

use thiserror::Error;

use rdm_types::{status_code_t, CmCode, Status};
use rdm_verbs::CmEventKind;

use crate::arbiter::Role;
use crate::connection::{ChannelSlot, ConnState};
use ConnState::*;
use crate::error::event_error_code;

/// The channel an event arrived on, relative to its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Via {
    /// One of the connection's own channels.
    Slot(ChannelSlot),
    /// The acceptor's outbound probe.
    Probe,
    /// A fresh inbound request on the endpoint's listener.
    Request,
}

/// What the state machine needs to know about an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventFacts {
    pub kind: CmEventKind,
    pub via: Via,
    /// The private data starts with the collision marker.
    pub collision: bool,
    pub status: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Address resolved on an outbound channel: optionally create the queue
    /// pair and register/prepost, then resolve the route.
    SetupOutbound { bind_qp: bool, prepare: bool },
    /// Route resolved: pack private data and connect.
    Connect,
    /// Inbound request lost the collision: reject it with the marker and,
    /// when `start_own`, start our own attempt.
    RejectCollision { start_own: bool },
    /// Inbound request to serve: unpack, register, create the queue pair in
    /// `slot`, prepost, pack the reply and accept.
    Accept { slot: ChannelSlot },
    /// Channel established; `count` is false for the second loopback half.
    Establish { unpack: bool, count: bool },
    /// Duplicate delivery to leave alone.
    Ignore,
    /// Our own attempt was rejected as a collision; drop that channel.
    DropCollision,
    /// The peer refused for real.
    MarkRejected,
    /// Peer disconnected.
    Close { was_established: bool },
    /// Return the endpoint's posted requests to the pool.
    SweepPosted,
    /// Error event: surface `code` without touching the connection.
    Fail(status_code_t),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid transition: {kind} via {via:?} in state {state:?} as {role:?}")]
pub struct InvalidTransition {
    pub state: ConnState,
    pub role: Role,
    pub kind: CmEventKind,
    pub via: Via,
}

impl From<InvalidTransition> for Status {
    fn from(e: InvalidTransition) -> Self {
        Status::with_message(CmCode::CONNECTION_ABORTED, e.to_string())
    }
}

pub fn plan(state: ConnState, role: Role, facts: &EventFacts) -> Result<Action, InvalidTransition> {
    let invalid = InvalidTransition {
        state,
        role,
        kind: facts.kind,
        via: facts.via,
    };
    let primary = Via::Slot(ChannelSlot::Primary);

    let action = match facts.kind {
        CmEventKind::AddrResolved => match (facts.via, role, state) {
            (v, Role::Initiator, Started) if v == primary => Action::SetupOutbound {
                bind_qp: true,
                prepare: true,
            },
            // Loopback registers on the inbound half instead.
            (v, Role::Loopback, Started) if v == primary => Action::SetupOutbound {
                bind_qp: true,
                prepare: false,
            },
            (Via::Probe, Role::Acceptor, Started | Established) => Action::SetupOutbound {
                bind_qp: false,
                prepare: false,
            },
            _ => return Err(invalid),
        },

        CmEventKind::RouteResolved => match (facts.via, role, state) {
            (v, Role::Initiator | Role::Loopback, Started) if v == primary => Action::Connect,
            (Via::Probe, Role::Acceptor, Started | Established) => Action::Connect,
            _ => return Err(invalid),
        },

        CmEventKind::ConnectRequest => match (facts.via, role, state) {
            (Via::Request, Role::Initiator, _) => Action::RejectCollision {
                start_own: state == Allocated,
            },
            (Via::Request, Role::Acceptor, Allocated | Started) => Action::Accept {
                slot: ChannelSlot::Primary,
            },
            (Via::Request, Role::Loopback, Started) => Action::Accept {
                slot: ChannelSlot::Secondary,
            },
            _ => return Err(invalid),
        },

        CmEventKind::Established => match (facts.via, role, state) {
            (Via::Slot(_), Role::Loopback, Started) => Action::Establish {
                unpack: true,
                count: true,
            },
            (Via::Slot(_), Role::Loopback, Established) => Action::Establish {
                unpack: true,
                count: false,
            },
            (v, Role::Initiator, Started) if v == primary => Action::Establish {
                unpack: true,
                count: true,
            },
            (v, Role::Acceptor, Started) if v == primary => Action::Establish {
                unpack: false,
                count: true,
            },
            (v, Role::Acceptor, _) if v == primary => Action::Ignore,
            _ => return Err(invalid),
        },

        CmEventKind::Rejected => {
            let refused_probe = role == Role::Acceptor && facts.is_generic_refusal();
            match facts.via {
                Via::Probe | Via::Slot(ChannelSlot::Primary)
                    if facts.collision || refused_probe =>
                {
                    Action::DropCollision
                }
                Via::Probe | Via::Slot(ChannelSlot::Primary)
                    if matches!(state, Allocated | Started) =>
                {
                    Action::MarkRejected
                }
                _ => return Err(invalid),
            }
        }

        CmEventKind::Disconnected => match facts.via {
            Via::Slot(_) => Action::Close {
                was_established: state == Established,
            },
            _ => return Err(invalid),
        },

        CmEventKind::TimewaitExit => Action::SweepPosted,

        kind => Action::Fail(event_error_code(kind)),
    };
    Ok(action)
}

impl EventFacts {
    /// Some stacks report a consumer reject towards the acceptor side as a
    /// plain refusal without the payload.
    fn is_generic_refusal(&self) -> bool {
        self.status == -libc::ECONNREFUSED
    }
}
