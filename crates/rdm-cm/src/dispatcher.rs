//! Event progress: poll the device's CM event queue and route each event to
//! the connection or listener its channel belongs to.

use std::time::Duration;

use bytes::Bytes;

use rdm_types::{make_error, make_error_msg, ChannelId, CmCode, Result, StatusCode};
use rdm_verbs::{CmEventKind, RawCmEvent};

use crate::context::{Binding, CmContext};
use crate::error::{device_error, event_error_code};
use crate::private_data::{self, PrivateData};
use crate::state_machine::{plan, EventFacts, Via};

/// A CM event copied out of the device's event buffer, so the original can
/// be acknowledged before dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmEvent {
    pub kind: CmEventKind,
    pub id: ChannelId,
    pub listen_id: Option<ChannelId>,
    pub status: i32,
    private_data: Bytes,
}

impl CmEvent {
    pub fn copy_from(raw: &RawCmEvent) -> Self {
        Self {
            kind: raw.kind,
            id: raw.id,
            listen_id: raw.listen_id,
            status: raw.status,
            private_data: Bytes::copy_from_slice(raw.private_data()),
        }
    }

    pub fn private_data(&self) -> &[u8] {
        &self.private_data
    }
}

impl CmContext {
    /// Drain every queued CM event. Returns the number handled.
    ///
    /// When nothing is queued, sleeps for the configured backoff and returns
    /// `Ok(0)`. Stops at the first event whose handling fails; events behind
    /// it stay queued for the next call.
    pub fn progress(&self) -> Result<usize> {
        let mut handled = 0;
        loop {
            let raw = match self.device.get_cm_event() {
                Ok(Some(raw)) => raw,
                Ok(None) => break,
                Err(e) => return Err(device_error(StatusCode::IO_ERROR, "get cm event", e)),
            };
            let _guard = self.cm_lock.lock();
            let event = CmEvent::copy_from(&raw);
            self.device
                .ack_cm_event(raw)
                .map_err(|e| device_error(StatusCode::IO_ERROR, "ack cm event", e))?;
            self.dispatch(&event)?;
            handled += 1;
        }
        if handled == 0 && self.config.progress_backoff_us > 0 {
            std::thread::sleep(Duration::from_micros(self.config.progress_backoff_us));
        }
        Ok(handled)
    }

    /// Handle one event. The CM lock must be held.
    pub(crate) fn dispatch(&self, event: &CmEvent) -> Result<()> {
        tracing::trace!(kind = %event.kind, channel = %event.id, status = event.status, "cm event");
        let result = if event.kind == CmEventKind::ConnectRequest {
            self.on_connect_request(event)
        } else {
            self.on_channel_event(event)
        };
        if let Err(e) = &result {
            tracing::error!(kind = %event.kind, channel = %event.id, error = %e, "cm event handling failed");
        }
        result
    }

    fn on_connect_request(&self, event: &CmEvent) -> Result<()> {
        let listener = event.listen_id.and_then(|id| self.bindings.get(&id).map(|b| *b));
        let Some(Binding::Listener(endpoint)) = listener else {
            self.reject_request(event.id, &[]);
            return make_error_msg(
                CmCode::UNKNOWN_CHANNEL,
                format!("request {} on unknown listener {:?}", event.id, event.listen_id),
            );
        };
        let Some(ep) = self.endpoint(endpoint) else {
            self.reject_request(event.id, &[]);
            return make_error_msg(CmCode::UNKNOWN_CHANNEL, format!("endpoint {} is gone", endpoint));
        };
        if ep.is_closing() {
            tracing::info!(%endpoint, channel = %event.id, "request rejected, endpoint closing");
            // No collision marker: the requester must see a real refusal and
            // stop, not drop its attempt and wait for a connect from us.
            self.reject_request(event.id, &[]);
            return Ok(());
        }

        let peer = match PrivateData::decode(event.private_data()) {
            Ok(decoded) => decoded.address,
            Err(e) => {
                self.reject_request(event.id, &[]);
                return Err(e);
            }
        };
        let (conn_ref, created) = self.lookup_or_create(&ep, peer);
        let mut conn = conn_ref.lock();
        let facts = EventFacts {
            kind: event.kind,
            via: Via::Request,
            collision: false,
            status: event.status,
        };
        match plan(conn.state, conn.role, &facts) {
            Ok(action) => self.apply(&ep, &mut conn, Via::Request, action, event),
            Err(invalid) => {
                self.reject_request(event.id, &[]);
                if created {
                    if let Err(e) = self.cleanup_connection(&ep, &mut conn) {
                        tracing::warn!(%peer, error = %e, "cleanup of unused connection failed");
                    }
                }
                Err(invalid.into())
            }
        }
    }

    fn on_channel_event(&self, event: &CmEvent) -> Result<()> {
        let binding = self.bindings.get(&event.id).map(|b| *b);
        let (endpoint, peer) = match binding {
            Some(Binding::Connection { endpoint, peer }) => (endpoint, peer),
            Some(Binding::Listener(endpoint)) => {
                tracing::warn!(%endpoint, kind = %event.kind, "event on listener");
                return make_error(event_error_code(event.kind));
            }
            None => {
                return make_error_msg(
                    CmCode::UNKNOWN_CHANNEL,
                    format!("{} on unbound channel {}", event.kind, event.id),
                )
            }
        };
        let (Some(ep), Some(conn_ref)) = (self.endpoint(endpoint), self.connection(endpoint, &peer))
        else {
            return make_error_msg(
                CmCode::UNKNOWN_CHANNEL,
                format!("{} for a connection that is gone", event.id),
            );
        };
        let mut conn = conn_ref.lock();
        let via = if conn.probe == Some(event.id) {
            Via::Probe
        } else if let Some(slot) = conn.channels.slot_of(event.id) {
            Via::Slot(slot)
        } else {
            return make_error_msg(
                CmCode::UNKNOWN_CHANNEL,
                format!("{} no longer belongs to the connection to {}", event.id, peer),
            );
        };
        let facts = EventFacts {
            kind: event.kind,
            via,
            collision: private_data::is_collision_marker(event.private_data()),
            status: event.status,
        };
        let action = plan(conn.state, conn.role, &facts)?;
        tracing::trace!(%peer, state = ?conn.state, ?action, "transition");
        self.apply(&ep, &mut conn, via, action, event)
    }
}
