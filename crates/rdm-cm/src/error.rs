use rdm_types::{status_code_t, CmCode, Status};
use rdm_verbs::{CmEventKind, VerbsError};

/// Wrap a device failure into a status with the given code.
pub(crate) fn device_error(code: status_code_t, what: &str, err: VerbsError) -> Status {
    Status::with_message(code, format!("{}: {} (errno {})", what, err, err.errno()))
}

/// Status code for an event that ends a connection attempt.
pub fn event_error_code(kind: CmEventKind) -> status_code_t {
    match kind {
        CmEventKind::AddrError | CmEventKind::Unreachable => CmCode::ADDRESS_UNAVAILABLE,
        CmEventKind::RouteError => CmCode::HOST_UNREACHABLE,
        CmEventKind::ConnectError => CmCode::CONNECTION_REFUSED,
        _ => CmCode::CONNECTION_ABORTED,
    }
}
