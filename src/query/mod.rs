//! Query and mutation pipeline.
//!
//! Reads go through [`QueryExecutor`], which serves fresh entries from the
//! store, deduplicates concurrent fetches per key and retries transient
//! failures. Writes go through [`MutationExecutor`], which never touches the
//! cache except to invalidate the keys a write names.

mod descriptor;
mod executor;
mod mutation;
mod payload;
mod retry;

pub use descriptor::{
    EnabledPredicate, Fetcher, QueryDefaults, QueryDescriptor, UnauthorizedPolicy,
};
pub use executor::{QueryData, QueryExecutor, QueryOutcome, QueryState, QueryStore};
pub use mutation::{MutationExecutor, MutationRequest};
pub use payload::Payload;
pub use retry::RetryPolicy;
