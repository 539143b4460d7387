//! Quota accounting and admission control.
//!
//! This module is the heart of the governor:
//!
//! - [`table`] holds the pure per-category capacity/usage bookkeeping
//! - [`admission`] is the single serialization point that evaluates
//!   acquire/release requests against the table and maintains the FIFO
//!   wait queues
//!
//! All quota state is owned by one admission task; every other component
//! talks to it through an [`AdmissionHandle`](admission::AdmissionHandle).

pub mod admission;
pub mod table;

pub use admission::{AdmissionHandle, ConnId};
pub use table::QuotaTable;

use serde::{Deserialize, Serialize};

/// One of the four independent quota counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// Concurrent read operations.
    ReadRequests,
    /// Read bytes in flight.
    ReadBytes,
    /// Concurrent write operations.
    WriteRequests,
    /// Write bytes in flight.
    WriteBytes,
}

impl Category {
    /// All categories, in table order.
    pub const ALL: [Category; 4] = [
        Category::ReadRequests,
        Category::ReadBytes,
        Category::WriteRequests,
        Category::WriteBytes,
    ];

    /// Human-readable name, matching the config field names.
    pub fn name(self) -> &'static str {
        match self {
            Category::ReadRequests => "read_reqs",
            Category::ReadBytes => "read_data",
            Category::WriteRequests => "write_reqs",
            Category::WriteBytes => "write_data",
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Category::ReadRequests => 0,
            Category::ReadBytes => 1,
            Category::WriteRequests => 2,
            Category::WriteBytes => 3,
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Direction of one I/O operation, naming a category pair.
///
/// Every acquire reserves both members of the pair atomically: the
/// request-count category and the byte-volume category for that direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    Read,
    Write,
}

impl AccessMode {
    /// Both directions, in queue-promotion order.
    pub const ALL: [AccessMode; 2] = [AccessMode::Read, AccessMode::Write];

    /// The concurrent-operation category for this direction.
    pub fn request_category(self) -> Category {
        match self {
            AccessMode::Read => Category::ReadRequests,
            AccessMode::Write => Category::WriteRequests,
        }
    }

    /// The bytes-in-flight category for this direction.
    pub fn data_category(self) -> Category {
        match self {
            AccessMode::Read => Category::ReadBytes,
            AccessMode::Write => Category::WriteBytes,
        }
    }
}

impl std::fmt::Display for AccessMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccessMode::Read => f.write_str("read"),
            AccessMode::Write => f.write_str("write"),
        }
    }
}
