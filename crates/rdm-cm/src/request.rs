//! Transfer requests and the fixed-capacity pool they are drawn from.
//!
//! The connection manager never interprets a request; it only parks it on a
//! connection until the channel is ready and hands it to the endpoint's
//! posted queue afterwards. Dropping a [`PooledRequest`] returns its storage
//! to the pool.

use crossbeam::queue::ArrayQueue;
use std::sync::Arc;

use bytes::Bytes;

use rdm_types::{make_error_msg, CmCode, PeerAddress, Result};

/// A message waiting for a channel.
#[derive(Debug, Default, Clone)]
pub struct TransferRequest {
    /// Caller-chosen identifier.
    pub context: u64,
    pub tag: u64,
    pub dest: Option<PeerAddress>,
    pub payload: Bytes,
}

impl TransferRequest {
    fn reset(&mut self) {
        self.context = 0;
        self.tag = 0;
        self.dest = None;
        self.payload = Bytes::new();
    }
}

/// Fixed-capacity pool of transfer requests backed by a crossbeam
/// `ArrayQueue`.
pub struct RequestPool {
    inner: Arc<ArrayQueue<TransferRequest>>,
}

impl RequestPool {
    /// Create a pool pre-filled with `capacity` requests.
    pub fn new(capacity: usize) -> Self {
        let queue = ArrayQueue::new(capacity.max(1));
        while queue.push(TransferRequest::default()).is_ok() {}
        Self {
            inner: Arc::new(queue),
        }
    }

    /// Take a request from the pool; RESOURCE_EXHAUSTED when all are in use.
    pub fn acquire(&self) -> Result<PooledRequest> {
        match self.inner.pop() {
            Some(request) => Ok(PooledRequest {
                value: Some(request),
                pool: Arc::clone(&self.inner),
            }),
            None => make_error_msg(CmCode::RESOURCE_EXHAUSTED, "request pool exhausted"),
        }
    }

    /// Requests currently available.
    pub fn available(&self) -> usize {
        self.inner.len()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }
}

impl Clone for RequestPool {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// RAII handle on a pooled request; returns it to the pool on drop.
pub struct PooledRequest {
    value: Option<TransferRequest>,
    pool: Arc<ArrayQueue<TransferRequest>>,
}

impl std::ops::Deref for PooledRequest {
    type Target = TransferRequest;

    fn deref(&self) -> &TransferRequest {
        // Only `drop` takes the value out.
        match &self.value {
            Some(v) => v,
            None => unreachable!("pooled request accessed after release"),
        }
    }
}

impl std::ops::DerefMut for PooledRequest {
    fn deref_mut(&mut self) -> &mut TransferRequest {
        match &mut self.value {
            Some(v) => v,
            None => unreachable!("pooled request accessed after release"),
        }
    }
}

impl std::fmt::Debug for PooledRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PooledRequest").field(&self.value).finish()
    }
}

impl Drop for PooledRequest {
    fn drop(&mut self) {
        if let Some(mut request) = self.value.take() {
            request.reset();
            let _ = self.pool.push(request);
        }
    }
}
