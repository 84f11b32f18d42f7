//! The CM context: device, peer directory, endpoints and the lock that
//! serializes every event-driven state change.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use rdm_types::{
    make_error_msg, ChannelId, CmCode, CqHandle, EndpointId, FirstError, PeerAddress, Result,
    StatusCode,
};
use rdm_verbs::CmDevice;

use crate::arbiter::arbitrate;
use crate::config::{CmConfig, EndpointConfig};
use crate::connection::{ConnState, Connection};
use crate::directory::{ConnRef, Directory};
use crate::endpoint::{CompletionProcessor, DrainSendQueue, Endpoint};
use crate::error::device_error;
use crate::request::{PooledRequest, RequestPool};

/// What a channel id belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Binding {
    Listener(EndpointId),
    Connection {
        endpoint: EndpointId,
        peer: PeerAddress,
    },
}

pub struct CmContext {
    pub(crate) device: Arc<dyn CmDevice>,
    pub(crate) config: CmConfig,
    pub(crate) directory: Directory,
    pub(crate) endpoints: DashMap<EndpointId, Arc<Endpoint>>,
    pub(crate) bindings: DashMap<ChannelId, Binding>,
    /// Held for the whole of one event dispatch and by every public entry
    /// point that mutates connections. Not reentrant.
    pub(crate) cm_lock: Mutex<()>,
    pub(crate) completions: Box<dyn CompletionProcessor>,
    pool: RequestPool,
    next_endpoint: AtomicU64,
    next_token: AtomicU64,
}

impl CmContext {
    pub fn new(device: Arc<dyn CmDevice>, config: CmConfig) -> Result<Self> {
        config.validate()?;
        config.endpoint.check_device(device.attr())?;
        tracing::info!(
            device = %device.attr().name,
            link_layer = %device.attr().link_layer,
            request_pool = config.request_pool_size,
            "CM context created"
        );
        Ok(Self {
            pool: RequestPool::new(config.request_pool_size),
            completions: Box::new(DrainSendQueue {
                batch: config.completion_batch,
            }),
            device,
            config,
            directory: Directory::new(),
            endpoints: DashMap::new(),
            bindings: DashMap::new(),
            cm_lock: Mutex::new(()),
            next_endpoint: AtomicU64::new(0),
            next_token: AtomicU64::new(0),
        })
    }

    /// Replace the hook run on disconnect.
    pub fn with_completion_processor(mut self, processor: impl CompletionProcessor + 'static) -> Self {
        self.completions = Box::new(processor);
        self
    }

    pub fn device(&self) -> &Arc<dyn CmDevice> {
        &self.device
    }

    pub fn config(&self) -> &CmConfig {
        &self.config
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    pub fn request_pool(&self) -> &RequestPool {
        &self.pool
    }

    pub fn endpoint(&self, id: EndpointId) -> Option<Arc<Endpoint>> {
        self.endpoints.get(&id).map(|e| Arc::clone(e.value()))
    }

    pub fn connection(&self, endpoint: EndpointId, peer: &PeerAddress) -> Option<ConnRef> {
        self.directory.connection(peer, endpoint)
    }

    fn live_endpoint(&self, id: EndpointId) -> Result<Arc<Endpoint>> {
        match self.endpoint(id) {
            Some(ep) if ep.is_closing() => make_error_msg(
                CmCode::ENDPOINT_CLOSING,
                format!("endpoint {} is closing", id),
            ),
            Some(ep) => Ok(ep),
            None => make_error_msg(StatusCode::INVALID_ARG, format!("unknown endpoint {}", id)),
        }
    }

    /// Open an endpoint listening on `address`. Without an explicit config the
    /// context default is used.
    pub fn open_endpoint(
        &self,
        address: PeerAddress,
        config: Option<EndpointConfig>,
    ) -> Result<Arc<Endpoint>> {
        let config = config.unwrap_or_else(|| self.config.endpoint.clone());
        config.validate()?;
        config.check_device(self.device.attr())?;

        let _guard = self.cm_lock.lock();
        let send_cq = self
            .device
            .create_cq(config.sq_depth as u32)
            .map_err(|e| device_error(CmCode::RESOURCE_EXHAUSTED, "create send cq", e))?;
        let recv_cq = match self.device.create_cq(config.rq_depth as u32) {
            Ok(cq) => cq,
            Err(e) => {
                self.discard(&[send_cq], None);
                return Err(device_error(CmCode::RESOURCE_EXHAUSTED, "create recv cq", e));
            }
        };
        let listener = match self.device.create_channel() {
            Ok(id) => id,
            Err(e) => {
                self.discard(&[send_cq, recv_cq], None);
                return Err(device_error(CmCode::RESOURCE_EXHAUSTED, "create listener", e));
            }
        };
        if let Err(e) = self.device.listen(listener, address) {
            self.discard(&[send_cq, recv_cq], Some(listener));
            return Err(device_error(
                CmCode::ADDRESS_UNAVAILABLE,
                &format!("listen on {}", address),
                e,
            ));
        }

        let id = EndpointId(self.next_endpoint.fetch_add(1, Ordering::Relaxed) + 1);
        let endpoint = Arc::new(Endpoint::new(id, address, config, listener, send_cq, recv_cq));
        self.endpoints.insert(id, Arc::clone(&endpoint));
        self.bindings.insert(listener, Binding::Listener(id));
        tracing::info!(endpoint = %id, %address, %listener, "endpoint opened");
        Ok(endpoint)
    }

    fn discard(&self, cqs: &[CqHandle], channel: Option<ChannelId>) {
        if let Some(id) = channel {
            if let Err(e) = self.device.destroy_channel(id) {
                tracing::warn!(channel = %id, error = %e, "discarding channel failed");
            }
        }
        for cq in cqs {
            if let Err(e) = self.device.destroy_cq(*cq) {
                tracing::warn!(%cq, error = %e, "discarding cq failed");
            }
        }
    }

    /// Find or create the connection from `endpoint` to `peer`, assigning its
    /// role on creation.
    pub(crate) fn lookup_or_create(&self, endpoint: &Endpoint, peer: PeerAddress) -> (ConnRef, bool) {
        let local = endpoint.address();
        let id = endpoint.id();
        let (conn, created) = self.directory.lookup_or_create(peer, id, |record| {
            let token = self.next_token.fetch_add(1, Ordering::Relaxed) + 1;
            Connection::new(id, local, peer, arbitrate(&local, &peer), token, record)
        });
        if created {
            tracing::debug!(endpoint = %id, %peer, role = ?conn.lock().role(), "role assigned");
        }
        (conn, created)
    }

    /// Start connecting `endpoint` to `peer`. Returns the connection, which
    /// may already be in progress or established.
    pub fn connect(&self, endpoint: EndpointId, peer: PeerAddress) -> Result<ConnRef> {
        let ep = self.live_endpoint(endpoint)?;
        let _guard = self.cm_lock.lock();
        let (conn_ref, _) = self.lookup_or_create(&ep, peer);
        {
            let mut conn = conn_ref.lock();
            Self::check_usable(&conn)?;
            if conn.state == ConnState::Allocated {
                self.start_or_cleanup(&ep, &mut conn)?;
            }
        }
        Ok(conn_ref)
    }

    /// Hand `request` to the connection towards `peer`: straight to the
    /// endpoint's posted queue once established, otherwise parked on the
    /// connection, which is started if needed.
    pub fn submit(
        &self,
        endpoint: EndpointId,
        peer: PeerAddress,
        mut request: PooledRequest,
    ) -> Result<()> {
        let ep = self.live_endpoint(endpoint)?;
        request.dest = Some(peer);

        let _guard = self.cm_lock.lock();
        let (conn_ref, _) = self.lookup_or_create(&ep, peer);
        let mut conn = conn_ref.lock();
        Self::check_usable(&conn)?;
        match conn.state {
            ConnState::Established => ep.post(request),
            ConnState::Allocated => {
                conn.postponed.push_back(request);
                self.start_or_cleanup(&ep, &mut conn)?;
            }
            _ => conn.postponed.push_back(request),
        }
        Ok(())
    }

    fn check_usable(conn: &Connection) -> Result<()> {
        match conn.state {
            ConnState::Rejected => make_error_msg(
                CmCode::CONNECTION_REFUSED,
                format!("connection to {} was rejected", conn.peer),
            ),
            ConnState::Closed => make_error_msg(
                CmCode::CONNECTION_ABORTED,
                format!("connection to {} is closed", conn.peer),
            ),
            _ => Ok(()),
        }
    }

    /// Disconnect an established connection. Both sides observe DISCONNECTED
    /// through `progress`.
    pub fn disconnect(&self, endpoint: EndpointId, peer: PeerAddress) -> Result<()> {
        let Some(conn_ref) = self.connection(endpoint, &peer) else {
            return make_error_msg(
                StatusCode::INVALID_ARG,
                format!("no connection from {} to {}", endpoint, peer),
            );
        };
        let _guard = self.cm_lock.lock();
        let conn = conn_ref.lock();
        let primary = match (conn.state, conn.channels.primary()) {
            (ConnState::Established, Some(h)) => h.id,
            (state, _) => {
                return make_error_msg(
                    StatusCode::INVALID_ARG,
                    format!("connection to {} is {:?}", peer, state),
                )
            }
        };
        self.device
            .disconnect(primary)
            .map_err(|e| device_error(CmCode::CONNECTION_ABORTED, "disconnect", e))?;
        tracing::info!(%endpoint, %peer, channel = %primary, "disconnect issued");
        Ok(())
    }

    /// Close an endpoint: tear down every connection it owns, then its
    /// listener and completion queues. Every step runs; the first failure is
    /// returned.
    pub fn close_endpoint(&self, endpoint: EndpointId) -> Result<()> {
        let Some(ep) = self.endpoint(endpoint) else {
            return make_error_msg(StatusCode::INVALID_ARG, format!("unknown endpoint {}", endpoint));
        };
        ep.set_closing();

        let _guard = self.cm_lock.lock();
        let mut errors = FirstError::new();
        let mut closed = 0usize;
        for record in self.directory.records() {
            if let Some(conn) = record.get(endpoint) {
                errors.record(self.cleanup_connection(&ep, &mut conn.lock()));
                closed += 1;
            }
        }

        self.bindings.remove(&ep.listener());
        errors.record(
            self.device
                .destroy_channel(ep.listener())
                .map_err(|e| device_error(CmCode::LOCAL_IO, "destroy listener", e)),
        );
        for cq in [ep.send_cq(), ep.recv_cq()] {
            errors.record(
                self.device
                    .destroy_cq(cq)
                    .map_err(|e| device_error(CmCode::LOCAL_IO, "destroy cq", e)),
            );
        }
        let swept = ep.sweep_posted();
        self.endpoints.remove(&endpoint);

        if errors.is_ok() {
            tracing::info!(%endpoint, connections = closed, swept, "endpoint closed");
        } else {
            tracing::warn!(%endpoint, connections = closed, failures = errors.failures(), "endpoint closed with errors");
        }
        errors.finish()
    }
}
