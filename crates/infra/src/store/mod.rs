//! Store boundary for the scheduling index, job records and delivery queues.
//!
//! The queue client and the promoter reach the three structures only through
//! the [`Store`] capability, so the backing store can be Redis in production
//! and [`InMemoryStore`] in tests.

pub mod in_memory;
pub mod r#trait;

pub use in_memory::InMemoryStore;
pub use r#trait::{
    Promotion, PromotionReport, Store, StoreError, StoreResult, StoredRecord, TxOutcome, TxStep,
};
