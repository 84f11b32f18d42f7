//! Connection-manager configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use rdm_types::{make_error_msg, Result, StatusCode};
use rdm_verbs::DeviceAttr;

use crate::registrar::ACK_SLOT_LEN;

/// Opcode the data path uses for message payloads. It decides whether
/// receive work requests carry a landing buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataOpcode {
    /// Two-sided send; receives land in the receive pool.
    Send,
    /// One-sided write with immediate; receives only consume the immediate.
    RdmaWriteWithImm,
}

/// Per-endpoint buffer sizing and queue depths.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Size of one send/receive buffer slot in bytes.
    #[serde(default = "default_buffer_len")]
    pub buffer_len: usize,

    /// Number of slots in each buffer pool.
    #[serde(default = "default_buffer_count")]
    pub buffer_count: usize,

    /// Receive queue depth; also the number of receives preposted on setup.
    #[serde(default = "default_rq_depth")]
    pub rq_depth: usize,

    /// Send queue depth.
    #[serde(default = "default_sq_depth")]
    pub sq_depth: usize,

    /// Largest payload sent inline.
    #[serde(default = "default_max_inline")]
    pub max_inline: u32,

    #[serde(default = "default_data_opcode")]
    pub data_opcode: DataOpcode,
}

fn default_buffer_len() -> usize {
    4096
}
fn default_buffer_count() -> usize {
    8
}
fn default_rq_depth() -> usize {
    1000
}
fn default_sq_depth() -> usize {
    1000
}
fn default_max_inline() -> u32 {
    256
}
fn default_data_opcode() -> DataOpcode {
    DataOpcode::Send
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            buffer_len: default_buffer_len(),
            buffer_count: default_buffer_count(),
            rq_depth: default_rq_depth(),
            sq_depth: default_sq_depth(),
            max_inline: default_max_inline(),
            data_opcode: default_data_opcode(),
        }
    }
}

impl EndpointConfig {
    /// Bytes in one send, receive or remote-access pool.
    pub fn pool_len(&self) -> usize {
        self.buffer_len * self.buffer_count
    }

    pub fn validate(&self) -> Result<()> {
        if self.buffer_len == 0 || self.buffer_count == 0 {
            return make_error_msg(
                StatusCode::INVALID_CONFIG,
                "buffer_len and buffer_count must be non-zero",
            );
        }
        if self.buffer_len.checked_mul(self.buffer_count).is_none() {
            return make_error_msg(StatusCode::INVALID_CONFIG, "buffer pool size overflows");
        }
        if self.rq_depth == 0 || self.rq_depth % self.buffer_count != 0 {
            return make_error_msg(
                StatusCode::INVALID_CONFIG,
                format!(
                    "rq_depth {} must be a non-zero multiple of buffer_count {}",
                    self.rq_depth, self.buffer_count
                ),
            );
        }
        if self.sq_depth == 0 {
            return make_error_msg(StatusCode::INVALID_CONFIG, "sq_depth must be non-zero");
        }
        Ok(())
    }

    /// Check the sizing against the static limits of the device.
    pub fn check_device(&self, attr: &DeviceAttr) -> Result<()> {
        let max_wr = attr.max_qp_wr as usize;
        if self.rq_depth > max_wr || self.sq_depth > max_wr {
            return make_error_msg(
                StatusCode::INVALID_CONFIG,
                format!(
                    "queue depth rq={} sq={} exceeds {} max_qp_wr {}",
                    self.rq_depth, self.sq_depth, attr.name, attr.max_qp_wr
                ),
            );
        }
        if self.max_inline > attr.max_inline_data {
            return make_error_msg(
                StatusCode::INVALID_CONFIG,
                format!(
                    "max_inline {} exceeds {} max_inline_data {}",
                    self.max_inline, attr.name, attr.max_inline_data
                ),
            );
        }
        let largest = self.pool_len().max(ACK_SLOT_LEN) as u64;
        if largest > attr.max_mr_size {
            return make_error_msg(
                StatusCode::INVALID_CONFIG,
                format!(
                    "buffer pool of {} bytes exceeds {} max_mr_size {}",
                    largest, attr.name, attr.max_mr_size
                ),
            );
        }
        Ok(())
    }
}

/// Configuration of one CM context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CmConfig {
    /// Sleep applied by `progress` when no event is pending.
    #[serde(default = "default_progress_backoff_us")]
    pub progress_backoff_us: u64,

    /// Timeout for address and route resolution.
    #[serde(default = "default_resolve_timeout_ms")]
    pub resolve_timeout_ms: u32,

    #[serde(default = "default_responder_resources")]
    pub responder_resources: u8,

    #[serde(default = "default_initiator_depth")]
    pub initiator_depth: u8,

    /// Capacity of the transfer-request pool.
    #[serde(default = "default_request_pool_size")]
    pub request_pool_size: usize,

    /// Completions polled per call when draining a send queue.
    #[serde(default = "default_completion_batch")]
    pub completion_batch: usize,

    /// Default sizing for endpoints opened without an explicit config.
    #[serde(default)]
    pub endpoint: EndpointConfig,
}

fn default_progress_backoff_us() -> u64 {
    100
}
fn default_resolve_timeout_ms() -> u32 {
    30000
}
fn default_responder_resources() -> u8 {
    2
}
fn default_initiator_depth() -> u8 {
    2
}
fn default_request_pool_size() -> usize {
    1024
}
fn default_completion_batch() -> usize {
    32
}

impl Default for CmConfig {
    fn default() -> Self {
        Self {
            progress_backoff_us: default_progress_backoff_us(),
            resolve_timeout_ms: default_resolve_timeout_ms(),
            responder_resources: default_responder_resources(),
            initiator_depth: default_initiator_depth(),
            request_pool_size: default_request_pool_size(),
            completion_batch: default_completion_batch(),
            endpoint: EndpointConfig::default(),
        }
    }
}

impl CmConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: CmConfig = match toml::from_str(content) {
            Ok(c) => c,
            Err(e) => return make_error_msg(StatusCode::CONFIG_PARSE_ERROR, e.to_string()),
        };
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                return make_error_msg(
                    StatusCode::CONFIG_PARSE_ERROR,
                    format!("read {}: {}", path.display(), e),
                )
            }
        };
        let config = Self::from_toml_str(&content)?;
        tracing::info!(path = %path.display(), "CM config loaded");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.request_pool_size == 0 {
            return make_error_msg(StatusCode::INVALID_CONFIG, "request_pool_size must be non-zero");
        }
        if self.completion_batch == 0 {
            return make_error_msg(StatusCode::INVALID_CONFIG, "completion_batch must be non-zero");
        }
        self.endpoint.validate()
    }
}
