//! Numeric limits applied to every connection.
//!
//! A [`Limits`] value is copied into each [`HttpConn`](crate::HttpConn) when it is
//! accepted, so a running connection never observes a configuration reload half way
//! through a request. All fields have defaults and the struct deserializes from a
//! partial document, which lets embedders override only the values they care about.

use std::time::Duration;

use serde::Deserialize;

/// Per-connection limits.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Limits {
    /// Largest chunk emitted by the chunk filter.
    pub chunk_size: usize,
    /// Largest request header block, request line included.
    pub header_size: usize,
    /// Largest number of request header lines.
    pub header_count: usize,
    /// Longest request target.
    pub uri_size: usize,
    /// Largest request body.
    pub receive_body_size: u64,
    /// Largest response entity.
    pub transmission_body_size: u64,
    /// Default `max` of every queue.
    pub stage_buffer_size: usize,
    /// Requests served on one connection before it is closed.
    pub keep_alive_count: i32,
    pub inactivity_timeout_ms: u64,
    pub request_timeout_ms: u64,
    /// Answer `TRACE` requests instead of rejecting them.
    pub enable_trace_method: bool,
    /// Read size used when pulling bytes off the transport.
    pub buffer_size: usize,
    /// Most slices gathered into one vectored write.
    pub max_iovec: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            chunk_size: 8 * 1024,
            header_size: 8 * 1024,
            header_count: 64,
            uri_size: 4 * 1024,
            receive_body_size: 128 * 1024 * 1024,
            transmission_body_size: i32::MAX as u64,
            stage_buffer_size: 32 * 1024,
            keep_alive_count: 100,
            inactivity_timeout_ms: 60_000,
            request_timeout_ms: 600_000,
            enable_trace_method: false,
            buffer_size: 8 * 1024,
            max_iovec: 24,
        }
    }
}

impl Limits {
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_millis(self.inactivity_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Low water mark derived from a queue maximum.
    pub(crate) fn low_water(max: usize) -> usize {
        max / 100 * 5
    }
}
