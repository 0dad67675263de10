//! Session validity.
//!
//! [`SessionMonitor`] reconciles the locally assumed authentication state with
//! the identity endpoint and publishes [`crate::cache::EventKind::SessionExpired`]
//! when the server stops accepting a session the client believed valid.

mod monitor;
mod state;

pub use monitor::SessionMonitor;
pub use state::{SessionConfig, SessionState, Validity};
