//! Infrastructure layer: stores, Redis, pooling, config, client and promoter.

pub mod client;
pub mod clock;
pub mod config;
pub mod pool;
pub mod promoter;
pub mod store;

/// Redis adapters (pooled connections, key namespace, store).
#[cfg(feature = "redis")]
pub mod redis;


pub use client::{QueueClient, QueueError, QueueResult};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ClientConfig, ConfigError, PromoterConfig};
pub use promoter::{Promoter, PromoterHandle, PromoterStats, SpawnError};
pub use store::{InMemoryStore, Store, StoreError, TxOutcome, TxStep};
