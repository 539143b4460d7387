//! iogov: Distributed I/O Resource Governor
//!
//! A standalone service that many parallel worker processes contact before
//! reading or writing a shared backend store, so a massively parallel job
//! does not overwhelm that backend. One authoritative governor process
//! arbitrates four quota categories (read/write operation counts and
//! bytes in flight); workers acquire capacity before each I/O call and
//! release it after, falling open if the governor is unreachable.

pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod quota;
pub mod server;

pub use client::{ClientSettings, GovernorClient, Lease};
pub use config::GovernorConfig;
pub use error::GovernorError;
pub use quota::{AccessMode, Category};
pub use server::Server;
