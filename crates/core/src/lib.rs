//! `delayer-core`: domain building blocks of the delayed job queue.
//!
//! This crate contains **pure domain** primitives (no store or transport
//! concerns): the [`Message`] exchanged by producers and consumers, its
//! validity rules, and the [`Delay`] arithmetic that turns a push into a
//! ready-at instant and a payload lifetime.

pub mod delay;
pub mod error;
pub mod message;

pub use delay::{Delay, MAX_RECORD_TTL_SECS};
pub use error::{DomainError, DomainResult};
pub use message::Message;
