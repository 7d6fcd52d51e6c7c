//! Redis backing store.
//!
//! Implements [`crate::store::Store`] on top of a sorted set, per-job hashes
//! and per-topic lists, using the key namespace in [`keys`].

pub mod connector;
pub mod keys;
pub mod store;

pub use connector::{RedisConnector, RedisPool};
pub use store::RedisStore;
