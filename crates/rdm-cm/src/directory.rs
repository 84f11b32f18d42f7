//! Peer-address directory.
//!
//! Two lock levels: the directory map (address to record) and one lock per
//! record (endpoint to connection). Creation of a connection holds only the
//! record lock. Removal takes the directory lock and then the record lock;
//! a record emptied that way is marked detached so a concurrent creator that
//! already holds its `Arc` retries against a fresh record.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use rdm_types::{EndpointId, PeerAddress};

use crate::connection::Connection;

pub type ConnRef = Arc<Mutex<Connection>>;

struct RecordInner {
    connections: HashMap<EndpointId, ConnRef>,
    detached: bool,
}

/// Every connection towards one peer address, keyed by local endpoint.
pub struct PeerRecord {
    address: PeerAddress,
    inner: Mutex<RecordInner>,
}

impl PeerRecord {
    fn new(address: PeerAddress) -> Self {
        Self {
            address,
            inner: Mutex::new(RecordInner {
                connections: HashMap::new(),
                detached: false,
            }),
        }
    }

    pub fn address(&self) -> PeerAddress {
        self.address
    }

    pub fn get(&self, endpoint: EndpointId) -> Option<ConnRef> {
        self.inner.lock().connections.get(&endpoint).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn endpoints(&self) -> Vec<EndpointId> {
        self.inner.lock().connections.keys().copied().collect()
    }
}

impl std::fmt::Debug for PeerRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerRecord")
            .field("address", &self.address)
            .field("connections", &self.len())
            .finish()
    }
}

/// Process-wide map from peer address to [`PeerRecord`].
#[derive(Default)]
pub struct Directory {
    records: Mutex<HashMap<PeerAddress, Arc<PeerRecord>>>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, peer: &PeerAddress) -> Option<Arc<PeerRecord>> {
        self.records.lock().get(peer).cloned()
    }

    fn record_or_insert(&self, peer: PeerAddress) -> Arc<PeerRecord> {
        let mut records = self.records.lock();
        Arc::clone(
            records
                .entry(peer)
                .or_insert_with(|| Arc::new(PeerRecord::new(peer))),
        )
    }

    /// Find the connection for `(peer, endpoint)` or create it with `make`.
    /// Returns the connection and whether this call created it.
    ///
    /// `make` runs under the record lock, at most once per pair.
    pub fn lookup_or_create<F>(
        &self,
        peer: PeerAddress,
        endpoint: EndpointId,
        make: F,
    ) -> (ConnRef, bool)
    where
        F: FnOnce(Weak<PeerRecord>) -> Connection,
    {
        let mut make = make;
        loop {
            make = match self.try_lookup_or_create(peer, endpoint, make) {
                Ok(found) => return found,
                Err(retry) => retry,
            };
        }
    }

    /// One attempt; hands `make` back when the record was detached under us.
    fn try_lookup_or_create<F>(
        &self,
        peer: PeerAddress,
        endpoint: EndpointId,
        make: F,
    ) -> Result<(ConnRef, bool), F>
    where
        F: FnOnce(Weak<PeerRecord>) -> Connection,
    {
        let record = self.record_or_insert(peer);
        let mut inner = record.inner.lock();
        if inner.detached {
            return Err(make);
        }
        if let Some(conn) = inner.connections.get(&endpoint) {
            return Ok((Arc::clone(conn), false));
        }
        let conn = Arc::new(Mutex::new(make(Arc::downgrade(&record))));
        inner.connections.insert(endpoint, Arc::clone(&conn));
        tracing::debug!(peer = %peer, %endpoint, "connection allocated");
        Ok((conn, true))
    }

    pub fn connection(&self, peer: &PeerAddress, endpoint: EndpointId) -> Option<ConnRef> {
        self.record(peer)?.get(endpoint)
    }

    /// Remove the connection for `(peer, endpoint)`; an emptied record is
    /// dropped from the directory.
    pub fn remove_connection(&self, peer: &PeerAddress, endpoint: EndpointId) -> Option<ConnRef> {
        let mut records = self.records.lock();
        let record = Arc::clone(records.get(peer)?);
        let mut inner = record.inner.lock();
        let removed = inner.connections.remove(&endpoint);
        if inner.connections.is_empty() {
            inner.detached = true;
            records.remove(peer);
        }
        removed
    }

    /// Every record, in no particular order.
    pub fn records(&self) -> Vec<Arc<PeerRecord>> {
        self.records.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
