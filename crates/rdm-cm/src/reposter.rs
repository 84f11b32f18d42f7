use rdm_types::{make_error_msg, CmCode, Result, StatusCode};
use rdm_verbs::{CmDevice, RecvWorkRequest, Sge};

use crate::config::{DataOpcode, EndpointConfig};
use crate::connection::Connection;
use crate::error::device_error;

/// Batches are capped at this many times the buffer count.
const BATCH_BUFFERS: usize = 10;

/// Post `count` receives on the connection's receive queue pair.
///
/// `count` must be a multiple of `buffer_count`. Receives go out in chained
/// batches of at most `10 * buffer_count`, each slot cycling through the
/// receive pool. A failed batch returns RESOURCE_EXHAUSTED; batches posted
/// before it stay counted in `recv_preposted`.
pub fn repost(
    device: &dyn CmDevice,
    conn: &mut Connection,
    config: &EndpointConfig,
    count: usize,
) -> Result<usize> {
    let n_buffs = config.buffer_count;
    assert!(
        n_buffs > 0 && count % n_buffs == 0,
        "repost count {} is not a multiple of buffer count {}",
        count,
        n_buffs
    );
    if count == 0 {
        return Ok(0);
    }

    let Some(qp) = conn.channels.recv_qp() else {
        return make_error_msg(StatusCode::FOUND_BUG, "repost on a connection without a queue pair");
    };
    let recv = match (config.data_opcode, &conn.regions) {
        (DataOpcode::Send, Some(regions)) => Some(*regions.recv.mr()),
        (DataOpcode::Send, None) => {
            return make_error_msg(StatusCode::FOUND_BUG, "repost before receive pool registration")
        }
        (DataOpcode::RdmaWriteWithImm, _) => None,
    };

    let max_batch = n_buffs * BATCH_BUFFERS;
    let mut rest = count;
    let mut chain = Vec::with_capacity(rest.min(max_batch));
    while rest > 0 {
        let batch = rest.min(max_batch);
        chain.clear();
        chain.extend((0..batch).map(|i| RecvWorkRequest {
            wr_id: conn.token,
            sge: recv.map(|mr| Sge {
                addr: mr.slot_addr(i % n_buffs, config.buffer_len),
                length: config.buffer_len as u32,
                lkey: mr.lkey,
            }),
        }));
        if let Err(e) = device.post_recv(qp, &chain) {
            tracing::warn!(
                peer = %conn.peer,
                posted = count - rest,
                requested = count,
                "receive repost failed"
            );
            return Err(device_error(CmCode::RESOURCE_EXHAUSTED, "post receive batch", e));
        }
        conn.recv_preposted += batch;
        rest -= batch;
    }
    tracing::trace!(peer = %conn.peer, %qp, count, "receives posted");
    Ok(count)
}
