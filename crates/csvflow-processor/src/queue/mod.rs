//! Redeliverable work queue with a dead-letter channel
//!
//! Deliveries are at-least-once. Each claim increments the message's attempt count;
//! a claimed message that is neither acknowledged nor retried before its visibility
//! timeout expires is delivered again.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::error::QueueError;

pub mod memory;
pub mod postgres;

pub use memory::MemoryWorkQueue;
pub use postgres::PgWorkQueue;

/// A claimed message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub id: i64,
    /// 1-based delivery count, including this one
    pub attempt: u32,
    pub payload: Vec<u8>,
    pub enqueued_at: DateTime<Utc>,
}

/// A payload parked in the dead-letter channel, unmodified
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub message_id: i64,
    pub payload: Vec<u8>,
    pub attempts: u32,
    pub reason: String,
    pub enqueued_at: DateTime<Utc>,
    pub dead_lettered_at: DateTime<Utc>,
}

#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Enqueue a payload, returning its message id.
    async fn publish(&self, payload: &[u8]) -> Result<i64, QueueError>;

    /// Claim the next visible message, hiding it for `visibility`.
    async fn receive(&self, visibility: Duration) -> Result<Option<Delivery>, QueueError>;

    /// Remove a successfully handled message.
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Release the message for redelivery after `delay`.
    async fn retry(&self, delivery: &Delivery, delay: Duration) -> Result<(), QueueError>;

    /// Move the message to the dead-letter channel. A message is dead-lettered at
    /// most once.
    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), QueueError>;
}
