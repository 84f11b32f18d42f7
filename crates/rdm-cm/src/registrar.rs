//! Registered buffer pools owned by one connection.
//!
//! A connection owns four regions: the send pool, the receive pool, a single
//! acknowledgment slot and the remote-access pool. They are registered
//! together and released together; `Option<ConnRegions>` is either all four
//! or none.

use rdm_types::{make_error_msg, CmCode, FirstError, Result, Status, StatusCode};
use rdm_verbs::{AccessFlags, CmDevice, MemoryRegion, RdmaBuf};

use crate::config::EndpointConfig;
use crate::error::device_error;

/// Size of the acknowledgment slot.
pub const ACK_SLOT_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Send,
    Recv,
    Ack,
    Rma,
}

impl RegionKind {
    const ORDER: [RegionKind; 4] = [
        RegionKind::Send,
        RegionKind::Recv,
        RegionKind::Ack,
        RegionKind::Rma,
    ];

    fn access(self) -> AccessFlags {
        match self {
            RegionKind::Send => AccessFlags::LOCAL_WRITE,
            RegionKind::Recv | RegionKind::Ack => {
                AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_WRITE
            }
            RegionKind::Rma => {
                AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_WRITE | AccessFlags::REMOTE_READ
            }
        }
    }

    fn len(self, config: &EndpointConfig) -> usize {
        match self {
            RegionKind::Ack => ACK_SLOT_LEN,
            _ => config.pool_len(),
        }
    }
}

/// Host memory plus its registration.
#[derive(Debug)]
pub struct Region {
    kind: RegionKind,
    buf: RdmaBuf,
    mr: MemoryRegion,
}

impl Region {
    pub fn kind(&self) -> RegionKind {
        self.kind
    }

    pub fn mr(&self) -> &MemoryRegion {
        &self.mr
    }

    pub fn buf(&self) -> &RdmaBuf {
        &self.buf
    }
}

/// The four regions of a prepared connection.
#[derive(Debug)]
pub struct ConnRegions {
    pub send: Region,
    pub recv: Region,
    pub ack: Region,
    pub rma: Region,
}

fn register(device: &dyn CmDevice, kind: RegionKind, config: &EndpointConfig) -> Result<Region> {
    let len = kind.len(config);
    let mut buf = match RdmaBuf::try_allocate(len) {
        Ok(buf) => buf,
        Err(e) => {
            return Err(device_error(
                CmCode::RESOURCE_EXHAUSTED,
                &format!("allocate {:?} pool", kind),
                e,
            ))
        }
    };
    let mr = device.reg_mr(&mut buf, kind.access()).map_err(|e| {
        device_error(
            CmCode::RESOURCE_EXHAUSTED,
            &format!("register {:?} pool", kind),
            e,
        )
    })?;
    Ok(Region { kind, buf, mr })
}

fn deregister(device: &dyn CmDevice, region: Region) -> Result<()> {
    device
        .dereg_mr(region.mr)
        .map_err(|e| device_error(CmCode::LOCAL_IO, &format!("deregister {:?} pool", region.kind), e))
}

/// Allocate and register the send, receive, ack and remote-access regions,
/// in that order.
///
/// On failure every region registered by this call is deregistered in
/// reverse order and `regions` stays `None`.
pub fn prepare(
    device: &dyn CmDevice,
    config: &EndpointConfig,
    regions: &mut Option<ConnRegions>,
) -> Result<()> {
    if regions.is_some() {
        return make_error_msg(StatusCode::FOUND_BUG, "connection regions already registered");
    }

    let mut done: Vec<Region> = Vec::with_capacity(RegionKind::ORDER.len());
    for kind in RegionKind::ORDER {
        match register(device, kind, config) {
            Ok(region) => done.push(region),
            Err(e) => {
                tracing::warn!(region = ?kind, error = %e, "region registration failed, rolling back");
                while let Some(region) = done.pop() {
                    if let Err(rollback) = deregister(device, region) {
                        tracing::warn!(error = %rollback, "rollback deregistration failed");
                    }
                }
                return Err(e);
            }
        }
    }

    let [send, recv, ack, rma] = <[Region; 4]>::try_from(done).map_err(|_| {
        Status::with_message(StatusCode::FOUND_BUG, "region count mismatch")
    })?;
    tracing::debug!(
        send_lkey = send.mr.lkey,
        recv_lkey = recv.mr.lkey,
        pool_len = config.pool_len(),
        "connection regions registered"
    );
    *regions = Some(ConnRegions {
        send,
        recv,
        ack,
        rma,
    });
    Ok(())
}

/// Deregister and free whatever is registered. Every region is attempted;
/// the first failure is returned. Calling it on an unprepared connection
/// is a no-op.
pub fn release(device: &dyn CmDevice, regions: &mut Option<ConnRegions>) -> Result<()> {
    let Some(set) = regions.take() else {
        return Ok(());
    };
    let mut errors = FirstError::new();
    for region in [set.rma, set.ack, set.recv, set.send] {
        errors.record(deregister(device, region));
    }
    if !errors.is_ok() {
        tracing::warn!(failures = errors.failures(), "region release incomplete");
    }
    errors.finish()
}
