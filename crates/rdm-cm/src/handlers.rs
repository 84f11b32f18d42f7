//! Side effects of the transitions planned by the state machine.
//!
//! Every function here runs with the CM lock held by the caller and the
//! connection locked.

use std::sync::Arc;

use rdm_types::{make_error_msg, ChannelId, CmCode, FirstError, Result, Status, StatusCode};
use rdm_verbs::ConnParam;

use crate::arbiter::Role;
use crate::connection::{ChannelHandle, ChannelSlot, ConnState, Connection};
use crate::context::{Binding, CmContext};
use crate::dispatcher::CmEvent;
use crate::endpoint::Endpoint;
use crate::error::device_error;
use crate::private_data::{self, PrivateData};
use crate::state_machine::{Action, Via};
use crate::{registrar, reposter};

impl CmContext {
    /// Open the connection's first channel and resolve the peer address.
    /// ACCEPTOR connections open a probe instead of a primary channel.
    pub(crate) fn start_connection(&self, ep: &Endpoint, conn: &mut Connection) -> Result<()> {
        if conn.state != ConnState::Allocated {
            return make_error_msg(
                StatusCode::FOUND_BUG,
                format!("start on a {:?} connection", conn.state),
            );
        }
        let id = self
            .device
            .create_channel()
            .map_err(|e| device_error(CmCode::RESOURCE_EXHAUSTED, "create channel", e))?;
        match conn.role {
            Role::Acceptor => conn.probe = Some(id),
            role => {
                if !conn.channels.bind(role, ChannelSlot::Primary, ChannelHandle::new(id)) {
                    self.discard_channel(id);
                    return make_error_msg(StatusCode::FOUND_BUG, "primary channel already bound");
                }
            }
        }
        conn.state = ConnState::Started;
        self.bindings.insert(
            id,
            Binding::Connection {
                endpoint: ep.id(),
                peer: conn.peer,
            },
        );
        self.device
            .resolve_addr(id, conn.local, conn.peer, self.config.resolve_timeout_ms)
            .map_err(|e| device_error(CmCode::ADDRESS_UNAVAILABLE, "resolve address", e))?;
        tracing::info!(
            endpoint = %ep.id(),
            peer = %conn.peer,
            role = ?conn.role,
            channel = %id,
            "connection started"
        );
        Ok(())
    }

    /// `start_connection`, tearing the connection down if it fails.
    pub(crate) fn start_or_cleanup(&self, ep: &Endpoint, conn: &mut Connection) -> Result<()> {
        self.start_connection(ep, conn)
            .map_err(|e| self.abort(ep, conn, Via::Slot(ChannelSlot::Primary), e))
    }

    /// Destroy every hardware object of the connection, release its regions,
    /// return its postponed requests and drop it from the directory.
    ///
    /// Queue pair before channel, primary before secondary. Every step runs;
    /// the first failure is returned.
    pub(crate) fn cleanup_connection(&self, ep: &Endpoint, conn: &mut Connection) -> Result<()> {
        let mut errors = FirstError::new();
        let channels = conn.channel_ids();
        let [primary, secondary] = conn.channels.take_all();
        for handle in [primary, secondary].into_iter().flatten() {
            self.bindings.remove(&handle.id);
            if handle.qp.is_some() {
                errors.record(
                    self.device
                        .destroy_qp(handle.id)
                        .map_err(|e| device_error(CmCode::LOCAL_IO, "destroy queue pair", e)),
                );
            }
            errors.record(
                self.device
                    .destroy_channel(handle.id)
                    .map_err(|e| device_error(CmCode::LOCAL_IO, "destroy channel", e)),
            );
        }
        if let Some(probe) = conn.probe.take() {
            self.bindings.remove(&probe);
            errors.record(
                self.device
                    .destroy_channel(probe)
                    .map_err(|e| device_error(CmCode::LOCAL_IO, "destroy probe", e)),
            );
        }
        errors.record(registrar::release(self.device.as_ref(), &mut conn.regions));

        let returned = conn.postponed.len();
        conn.postponed.clear();
        if conn.state == ConnState::Established {
            ep.connection_closed();
        }
        if conn.state != ConnState::Rejected {
            conn.state = ConnState::Closed;
        }
        self.directory.remove_connection(&conn.peer, conn.endpoint);

        tracing::info!(
            endpoint = %conn.endpoint,
            peer = %conn.peer,
            role = ?conn.role,
            ?channels,
            exp = conn.exp_counter,
            unexp = conn.unexp_counter,
            recv_preposted = conn.recv_preposted,
            sends_outgoing = conn.sends_outgoing(),
            returned,
            "connection cleaned up"
        );
        if !errors.is_ok() {
            tracing::warn!(peer = %conn.peer, failures = errors.failures(), "connection cleanup incomplete");
        }
        errors.finish()
    }

    /// Undo a failed setup step and hand back its error. A failed probe only
    /// costs the probe; anything else tears the connection down.
    pub(crate) fn abort(&self, ep: &Endpoint, conn: &mut Connection, via: Via, err: Status) -> Status {
        tracing::warn!(peer = %conn.peer, ?via, error = %err, "connection setup failed");
        if via == Via::Probe {
            self.drop_probe(conn);
        } else if let Err(e) = self.cleanup_connection(ep, conn) {
            tracing::warn!(peer = %conn.peer, error = %e, "cleanup after failed setup");
        }
        err
    }

    fn drop_probe(&self, conn: &mut Connection) {
        if let Some(probe) = conn.probe.take() {
            self.bindings.remove(&probe);
            if let Err(e) = self.device.destroy_channel(probe) {
                tracing::warn!(channel = %probe, error = %e, "destroy probe failed");
            }
        }
    }

    /// Destroy a channel no connection owns any more, logging failures.
    pub(crate) fn discard_channel(&self, id: ChannelId) {
        if let Err(e) = self.device.destroy_channel(id) {
            tracing::warn!(channel = %id, error = %e, "destroy channel failed");
        }
    }

    /// Reject an inbound request and destroy its channel.
    pub(crate) fn reject_request(&self, id: ChannelId, data: &[u8]) {
        if let Err(e) = self.device.reject(id, data) {
            tracing::warn!(channel = %id, error = %e, "reject failed");
        }
        self.discard_channel(id);
    }

    fn conn_param(&self, private_data: bytes::Bytes) -> ConnParam {
        ConnParam {
            private_data,
            responder_resources: self.config.responder_resources,
            initiator_depth: self.config.initiator_depth,
        }
    }

    /// Execute `action` for `event`, which arrived on the connection through
    /// `via`.
    pub(crate) fn apply(
        &self,
        ep: &Arc<Endpoint>,
        conn: &mut Connection,
        via: Via,
        action: Action,
        event: &CmEvent,
    ) -> Result<()> {
        match action {
            Action::SetupOutbound { bind_qp, prepare } => self
                .setup_outbound(ep, conn, via, event, bind_qp, prepare)
                .map_err(|e| self.abort(ep, conn, via, e)),
            Action::Connect => self
                .send_connect(conn, via, event)
                .map_err(|e| self.abort(ep, conn, via, e)),
            Action::RejectCollision { start_own } => {
                self.reject_request(event.id, &private_data::collision_marker());
                tracing::debug!(peer = %conn.peer, channel = %event.id, "inbound request rejected as collision");
                if start_own {
                    self.start_or_cleanup(ep, conn)?;
                }
                Ok(())
            }
            Action::Accept { slot } => self.accept_request(ep, conn, slot, event),
            Action::Establish { unpack, count } => self
                .establish(ep, conn, event, unpack, count)
                .map_err(|e| self.abort(ep, conn, via, e)),
            Action::Ignore => {
                tracing::debug!(peer = %conn.peer, kind = %event.kind, state = ?conn.state, "duplicate event ignored");
                Ok(())
            }
            Action::DropCollision => {
                self.drop_collision(conn, via, event);
                Ok(())
            }
            Action::MarkRejected => {
                if via == Via::Probe {
                    self.drop_probe(conn);
                }
                conn.state = ConnState::Rejected;
                tracing::warn!(
                    peer = %conn.peer,
                    role = ?conn.role,
                    status = event.status,
                    "connection rejected by peer"
                );
                make_error_msg(
                    CmCode::CONNECTION_REFUSED,
                    format!("{} rejected the connection (status {})", conn.peer, event.status),
                )
            }
            Action::Close { was_established } => {
                self.close(ep, conn, was_established);
                Ok(())
            }
            Action::SweepPosted => {
                let swept = ep.sweep_posted();
                tracing::debug!(endpoint = %ep.id(), swept, "posted requests swept");
                Ok(())
            }
            Action::Fail(code) => make_error_msg(
                code,
                format!(
                    "{} on {} towards {} (status {})",
                    event.kind, event.id, conn.peer, event.status
                ),
            ),
        }
    }

    fn setup_outbound(
        &self,
        ep: &Endpoint,
        conn: &mut Connection,
        via: Via,
        event: &CmEvent,
        bind_qp: bool,
        prepare: bool,
    ) -> Result<()> {
        if bind_qp {
            let Via::Slot(slot) = via else {
                return make_error_msg(StatusCode::FOUND_BUG, "queue pair for a probe");
            };
            let attr = ep.qp_init_attr(self.device.attr().max_sge);
            let qp = self
                .device
                .create_qp(event.id, &attr)
                .map_err(|e| device_error(CmCode::RESOURCE_EXHAUSTED, "create queue pair", e))?;
            match conn.channels.get_mut(slot) {
                Some(handle) => handle.qp = Some(qp),
                None => return make_error_msg(StatusCode::FOUND_BUG, "queue pair without a slot"),
            }
        }
        if prepare {
            let config = ep.config();
            registrar::prepare(self.device.as_ref(), config, &mut conn.regions)?;
            reposter::repost(self.device.as_ref(), conn, config, config.rq_depth)?;
        }
        self.device
            .resolve_route(event.id, self.config.resolve_timeout_ms)
            .map_err(|e| device_error(CmCode::HOST_UNREACHABLE, "resolve route", e))?;
        tracing::debug!(peer = %conn.peer, channel = %event.id, "address resolved");
        Ok(())
    }

    fn send_connect(&self, conn: &Connection, via: Via, event: &CmEvent) -> Result<()> {
        // A probe only announces who is asking.
        let data = match via {
            Via::Probe => PrivateData {
                address: conn.local,
                keys: None,
            }
            .encode()?,
            _ => private_data::pack(conn)?,
        };
        self.device
            .connect(event.id, &self.conn_param(data))
            .map_err(|e| device_error(CmCode::CONNECTION_REFUSED, "connect", e))?;
        tracing::debug!(peer = %conn.peer, channel = %event.id, ?via, "connect sent");
        Ok(())
    }

    fn accept_request(
        &self,
        ep: &Endpoint,
        conn: &mut Connection,
        slot: ChannelSlot,
        event: &CmEvent,
    ) -> Result<()> {
        let request = event.id;
        let taken = match slot {
            ChannelSlot::Primary => conn.channels.primary().is_some(),
            ChannelSlot::Secondary => conn.channels.secondary().is_some(),
        };
        if taken {
            self.reject_request(request, &[]);
            return make_error_msg(
                CmCode::CONNECTION_ABORTED,
                format!("duplicate request from {} on {}", conn.peer, request),
            );
        }

        let was_allocated = conn.state == ConnState::Allocated;
        if let Err(e) = self.accept_steps(ep, conn, slot, event) {
            if conn.channels.slot_of(request).is_none() {
                self.reject_request(request, &[]);
            }
            return Err(self.abort(ep, conn, Via::Slot(slot), e));
        }
        if was_allocated {
            conn.state = ConnState::Started;
        }
        tracing::info!(
            endpoint = %ep.id(),
            peer = %conn.peer,
            role = ?conn.role,
            channel = %request,
            "connection request accepted"
        );
        Ok(())
    }

    fn accept_steps(
        &self,
        ep: &Endpoint,
        conn: &mut Connection,
        slot: ChannelSlot,
        event: &CmEvent,
    ) -> Result<()> {
        let config = ep.config();
        // Before the queue pair exists.
        private_data::unpack(event.private_data(), conn)?;
        registrar::prepare(self.device.as_ref(), config, &mut conn.regions)?;

        let attr = ep.qp_init_attr(self.device.attr().max_sge);
        let qp = self
            .device
            .create_qp(event.id, &attr)
            .map_err(|e| device_error(CmCode::RESOURCE_EXHAUSTED, "create queue pair", e))?;
        let handle = ChannelHandle {
            id: event.id,
            qp: Some(qp),
        };
        if !conn.channels.bind(conn.role, slot, handle) {
            if let Err(e) = self.device.destroy_qp(event.id) {
                tracing::warn!(channel = %event.id, error = %e, "destroy unbound queue pair failed");
            }
            return make_error_msg(StatusCode::FOUND_BUG, format!("slot {:?} not bindable", slot));
        }
        self.bindings.insert(
            event.id,
            Binding::Connection {
                endpoint: ep.id(),
                peer: conn.peer,
            },
        );

        reposter::repost(self.device.as_ref(), conn, config, config.rq_depth)?;
        let reply = private_data::pack(conn)?;
        self.device
            .accept(event.id, &self.conn_param(reply))
            .map_err(|e| device_error(CmCode::CONNECTION_ABORTED, "accept", e))
    }

    fn establish(
        &self,
        ep: &Endpoint,
        conn: &mut Connection,
        event: &CmEvent,
        unpack: bool,
        count: bool,
    ) -> Result<()> {
        if unpack {
            private_data::unpack(event.private_data(), conn)?;
        }
        if !count {
            tracing::debug!(peer = %conn.peer, channel = %event.id, "second loopback half established");
            return Ok(());
        }
        conn.state = ConnState::Established;
        let active = ep.connection_established();
        let released = ep.post_all(conn.postponed.drain(..));
        tracing::info!(
            endpoint = %ep.id(),
            peer = %conn.peer,
            role = ?conn.role,
            active,
            released,
            "connection established"
        );
        Ok(())
    }

    fn drop_collision(&self, conn: &mut Connection, via: Via, event: &CmEvent) {
        match via {
            Via::Probe => self.drop_probe(conn),
            _ => {
                if let Some(handle) = conn.channels.detach(event.id) {
                    self.bindings.remove(&handle.id);
                    if handle.qp.is_some() {
                        if let Err(e) = self.device.destroy_qp(handle.id) {
                            tracing::warn!(channel = %handle.id, error = %e, "destroy queue pair failed");
                        }
                    }
                    self.discard_channel(handle.id);
                }
            }
        }
        tracing::debug!(peer = %conn.peer, channel = %event.id, ?via, "collision attempt dropped");
    }

    fn close(&self, ep: &Endpoint, conn: &mut Connection, was_established: bool) {
        if conn.state == ConnState::Closed {
            tracing::debug!(peer = %conn.peer, "already closed");
            return;
        }
        let active = if was_established {
            ep.connection_closed()
        } else {
            ep.active_connections()
        };
        conn.state = ConnState::Closed;
        tracing::info!(endpoint = %ep.id(), peer = %conn.peer, active, "connection closed");
        if let Err(e) = self.completions.process_send_completions(self.device.as_ref(), ep) {
            tracing::warn!(endpoint = %ep.id(), error = %e, "draining send completions failed");
        }
    }
}
