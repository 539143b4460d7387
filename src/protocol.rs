//! Governor Wire Protocol
//!
//! Workers hold one persistent TCP connection to the governor. Each message
//! is a single JSON object terminated by a newline. Requests carry a
//! connection-local `request_id`; acquire responses are correlated by it, so
//! grants may arrive out of order while per-connection byte ordering is
//! preserved by the single reader/writer pair on each side.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::GovernorError;
use crate::quota::AccessMode;

/// A request from a worker to the governor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    /// Reserve capacity for one operation: `reqs` against the direction's
    /// request-count category and `bytes` against its byte-volume category.
    Acquire {
        mode: AccessMode,
        reqs: u64,
        bytes: u64,
        request_id: u64,
    },
    /// Return the capacity of a previously granted acquire.
    Release { mode: AccessMode, request_id: u64 },
    /// Ask for a capacity/usage snapshot.
    Status { request_id: u64 },
}

/// A response from the governor to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Response {
    /// The acquire identified by `request_id` now holds its reservation.
    Granted { request_id: u64 },
    /// The request was rejected; no lease was created.
    Error { request_id: u64, message: String },
    /// Snapshot reply for a status request.
    Status {
        request_id: u64,
        status: GovernorStatus,
    },
}

/// Capacity, outstanding usage, and queue depth snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GovernorStatus {
    pub read_reqs: CategoryStatus,
    pub read_data: CategoryStatus,
    pub write_reqs: CategoryStatus,
    pub write_data: CategoryStatus,
    /// Requests waiting on the read category pair
    pub read_queued: usize,
    /// Requests waiting on the write category pair
    pub write_queued: usize,
}

/// One category's capacity and outstanding usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryStatus {
    pub capacity: u64,
    pub in_use: u64,
}

/// Serialize a message and write it as one newline-terminated JSON line.
pub async fn send_message<W, T>(writer: &mut W, message: &T) -> Result<(), GovernorError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_string(message)
        .map_err(|e| GovernorError::Protocol(format!("Failed to encode message: {e}")))?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one newline-terminated JSON message. Returns `Ok(None)` on clean EOF.
pub async fn recv_message<R, T>(
    reader: &mut R,
    line_buffer: &mut String,
) -> Result<Option<T>, GovernorError>
where
    R: AsyncBufReadExt + Unpin,
    T: DeserializeOwned,
{
    line_buffer.clear();
    let bytes_read = reader.read_line(line_buffer).await?;
    if bytes_read == 0 {
        return Ok(None);
    }
    let message = serde_json::from_str(line_buffer.trim_end())
        .map_err(|e| GovernorError::Protocol(format!("Malformed message: {e}")))?;
    Ok(Some(message))
}
