//! Persisted certificate trust decisions
//!
//! A [`TrustRule`] records that the user accepted a set of certificate
//! problems for one certificate on one host, until an expiry instant.
//! Stores are read on every lookup and written through immediately.

pub mod rule;
pub mod store;

pub use rule::{TrustRule, FOREVER_YEARS, SESSION_ONLY_MINUTES};
pub use store::{JsonRuleStore, MemoryRuleStore, StoreError, TrustRuleStore};
