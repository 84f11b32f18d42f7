/// Status code type alias, a plain `u16` on the wire and in logs.
#[allow(non_camel_case_types)]
pub type status_code_t = u16;

/// Common status codes (0-999).
pub mod StatusCode {
    use super::status_code_t;

    pub const OK: status_code_t = 0;
    pub const NOT_IMPLEMENTED: status_code_t = 1;
    pub const INVALID_ARG: status_code_t = 3;
    pub const INVALID_CONFIG: status_code_t = 4;
    pub const QUEUE_EMPTY: status_code_t = 5;
    pub const QUEUE_FULL: status_code_t = 6;
    pub const NOT_ENOUGH_MEMORY: status_code_t = 26;
    pub const INVALID_FORMAT: status_code_t = 33;
    pub const IO_ERROR: status_code_t = 69;
    pub const FAULT_INJECTION: status_code_t = 70;
    pub const CONFIG_PARSE_ERROR: status_code_t = 71;
    pub const OS_ERROR: status_code_t = 72;
    pub const FOUND_BUG: status_code_t = 998;
    pub const UNKNOWN: status_code_t = 999;
}

/// Connection-management status codes (2xxx).
pub mod CmCode {
    use super::status_code_t;

    /// Allocation, memory registration or queue-pair creation failed.
    pub const RESOURCE_EXHAUSTED: status_code_t = 2100;
    /// Route resolution failed.
    pub const HOST_UNREACHABLE: status_code_t = 2101;
    /// The peer rejected the connection for a reason other than a collision.
    pub const CONNECTION_REFUSED: status_code_t = 2102;
    /// Address resolution failed.
    pub const ADDRESS_UNAVAILABLE: status_code_t = 2103;
    /// Unrecognized event or invalid state transition.
    pub const CONNECTION_ABORTED: status_code_t = 2104;
    /// Destroying or deregistering a hardware object failed.
    pub const LOCAL_IO: status_code_t = 2105;
    pub const ENDPOINT_CLOSING: status_code_t = 2106;
    pub const UNKNOWN_CHANNEL: status_code_t = 2107;
}

/// Classification of status code ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i8)]
pub enum StatusCodeType {
    Invalid = -1,
    Common = 0,
    Cm = 2,
}

/// Determine the type/category of a status code.
pub fn type_of(code: status_code_t) -> StatusCodeType {
    match code {
        0..=999 => StatusCodeType::Common,
        2000..=2999 => StatusCodeType::Cm,
        _ => StatusCodeType::Invalid,
    }
}

/// Convert a status code to its human-readable name.
pub fn to_string(code: status_code_t) -> &'static str {
    match code {
        // Common
        StatusCode::OK => "OK",
        StatusCode::NOT_IMPLEMENTED => "NotImplemented",
        StatusCode::INVALID_ARG => "InvalidArg",
        StatusCode::INVALID_CONFIG => "InvalidConfig",
        StatusCode::QUEUE_EMPTY => "QueueEmpty",
        StatusCode::QUEUE_FULL => "QueueFull",
        StatusCode::NOT_ENOUGH_MEMORY => "NotEnoughMemory",
        StatusCode::INVALID_FORMAT => "InvalidFormat",
        StatusCode::IO_ERROR => "IOError",
        StatusCode::FAULT_INJECTION => "FaultInjection",
        StatusCode::CONFIG_PARSE_ERROR => "ConfigParseError",
        StatusCode::OS_ERROR => "OSError",
        StatusCode::FOUND_BUG => "FoundBug",
        StatusCode::UNKNOWN => "Unknown",

        // Connection management
        CmCode::RESOURCE_EXHAUSTED => "CM::ResourceExhausted",
        CmCode::HOST_UNREACHABLE => "CM::HostUnreachable",
        CmCode::CONNECTION_REFUSED => "CM::ConnectionRefused",
        CmCode::ADDRESS_UNAVAILABLE => "CM::AddressUnavailable",
        CmCode::CONNECTION_ABORTED => "CM::ConnectionAborted",
        CmCode::LOCAL_IO => "CM::LocalIO",
        CmCode::ENDPOINT_CLOSING => "CM::EndpointClosing",
        CmCode::UNKNOWN_CHANNEL => "CM::UnknownChannel",

        _ => "Unknown",
    }
}
