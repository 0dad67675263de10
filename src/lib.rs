//! Client-side data synchronization core for the study platform.
//!
//! Reads flow through a [`query::QueryExecutor`] backed by a bounded TTL
//! store, writes through a [`query::MutationExecutor`], and a
//! [`session::SessionMonitor`] keeps the local notion of "signed in" honest.
//! [`context::SyncContext`] wires them around one transport.

pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod infra;
pub mod query;
pub mod session;
pub mod transport;

pub use context::{BackgroundTasks, SyncConfig, SyncContext};
pub use error::SyncError;
