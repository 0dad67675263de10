//! Client cache layer.
//!
//! - **Bounded TTL store**: query results keyed by caller-built strings, with
//!   lazy expiry and oldest-first capacity eviction.
//! - **Events**: invalidation, eviction, clear and session-expiry signals for
//!   UI collaborators.
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! ttl_seconds = 300
//! max_entries = 100
//! sweep_interval_seconds = 60
//! ```

mod config;
mod events;
mod keys;
mod lock;
mod store;

pub use config::{CacheConfig, ResponseCacheConfig};
pub use events::{CacheEvent, Epoch, EventKind, EventQueue};
pub use keys::{hash_value, query_key, request_signature};
pub use store::{CacheEntry, TtlStore};

pub(crate) use lock::{mutex_lock, rw_read, rw_write};
