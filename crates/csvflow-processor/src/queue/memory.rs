//! In-process work queue

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::warn;

use super::{DeadLetter, Delivery, WorkQueue};
use crate::config::DEFAULT_MAX_DELIVERY_ATTEMPTS;
use crate::error::QueueError;

#[derive(Debug)]
struct Message {
    payload: Vec<u8>,
    attempts: u32,
    visible_at: Instant,
    enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct State {
    next_id: i64,
    messages: BTreeMap<i64, Message>,
    dead_letters: Vec<DeadLetter>,
}

impl State {
    /// The message, if `delivery` still holds its current lease.
    fn leased(&mut self, delivery: &Delivery) -> Result<&mut Message, QueueError> {
        self.messages
            .get_mut(&delivery.id)
            .filter(|m| m.attempts == delivery.attempt)
            .ok_or(QueueError::NotInFlight(delivery.id))
    }

    fn expire(&mut self, id: i64) {
        let Some(message) = self.messages.remove(&id) else {
            return;
        };
        warn!(
            message_id = id,
            attempts = message.attempts,
            "Lease expired on final attempt, dead-lettering message"
        );
        self.dead_letters.push(DeadLetter {
            message_id: id,
            reason: format!("lease expired after {} attempts", message.attempts),
            payload: message.payload,
            attempts: message.attempts,
            enqueued_at: message.enqueued_at,
            dead_lettered_at: Utc::now(),
        });
    }
}

/// Work queue held in memory. Visibility uses `tokio::time`, so paused-clock
/// tests can advance through backoff delays.
///
/// A message whose lease lapses after `max_attempts` claims is dead-lettered on
/// the next receive instead of being handed out again.
#[derive(Debug)]
pub struct MemoryWorkQueue {
    state: Mutex<State>,
    max_attempts: u32,
}

impl Default for MemoryWorkQueue {
    fn default() -> Self {
        Self::with_max_attempts(DEFAULT_MAX_DELIVERY_ATTEMPTS)
    }
}

impl MemoryWorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            state: Mutex::new(State::default()),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Messages not yet acknowledged or dead-lettered.
    pub async fn len(&self) -> usize {
        self.state.lock().await.messages.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().await.dead_letters.clone()
    }
}

#[async_trait]
impl WorkQueue for MemoryWorkQueue {
    async fn publish(&self, payload: &[u8]) -> Result<i64, QueueError> {
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let id = state.next_id;
        state.messages.insert(
            id,
            Message {
                payload: payload.to_vec(),
                attempts: 0,
                visible_at: Instant::now(),
                enqueued_at: Utc::now(),
            },
        );
        Ok(id)
    }

    async fn receive(&self, visibility: Duration) -> Result<Option<Delivery>, QueueError> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        loop {
            let Some((&id, message)) = state
                .messages
                .iter_mut()
                .find(|(_, m)| m.visible_at <= now)
            else {
                return Ok(None);
            };

            if message.attempts >= self.max_attempts {
                state.expire(id);
                continue;
            }

            message.attempts += 1;
            message.visible_at = now + visibility;
            return Ok(Some(Delivery {
                id,
                attempt: message.attempts,
                payload: message.payload.clone(),
                enqueued_at: message.enqueued_at,
            }));
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state.leased(delivery)?;
        state.messages.remove(&delivery.id);
        Ok(())
    }

    async fn retry(&self, delivery: &Delivery, delay: Duration) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state.leased(delivery)?.visible_at = Instant::now() + delay;
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state.leased(delivery)?;
        let Some(message) = state.messages.remove(&delivery.id) else {
            return Err(QueueError::NotInFlight(delivery.id));
        };
        state.dead_letters.push(DeadLetter {
            message_id: delivery.id,
            payload: message.payload,
            attempts: message.attempts,
            reason: reason.to_string(),
            enqueued_at: message.enqueued_at,
            dead_lettered_at: Utc::now(),
        });
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const VISIBILITY: Duration = Duration::from_secs(30);

    #[tokio::test(start_paused = true)]
    async fn test_unacked_message_is_redelivered_after_visibility_timeout() {
        let queue = MemoryWorkQueue::new();
        queue.publish(b"hello").await.unwrap();

        let first = queue.receive(VISIBILITY).await.unwrap().unwrap();
        assert_eq!(first.attempt, 1);
        assert!(queue.receive(VISIBILITY).await.unwrap().is_none());

        tokio::time::advance(VISIBILITY).await;
        let second = queue.receive(VISIBILITY).await.unwrap().unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.attempt, 2);

        // The expired lease can no longer settle the message
        assert!(matches!(queue.ack(&first).await, Err(QueueError::NotInFlight(_))));
        queue.ack(&second).await.unwrap();
        assert!(queue.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_delays_redelivery() {
        let queue = MemoryWorkQueue::new();
        queue.publish(b"x").await.unwrap();
        let delivery = queue.receive(VISIBILITY).await.unwrap().unwrap();
        queue.retry(&delivery, Duration::from_secs(5)).await.unwrap();

        assert!(queue.receive(VISIBILITY).await.unwrap().is_none());
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(queue.receive(VISIBILITY).await.unwrap().unwrap().attempt, 2);
    }

    #[tokio::test]
    async fn test_dead_letter_keeps_payload_once() {
        let queue = MemoryWorkQueue::new();
        queue.publish(b"{\"name\":\"a.csv\"}").await.unwrap();
        let delivery = queue.receive(VISIBILITY).await.unwrap().unwrap();

        queue.dead_letter(&delivery, "format: bad").await.unwrap();
        assert!(queue.dead_letter(&delivery, "again").await.is_err());

        let dead = queue.dead_letters().await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].payload, b"{\"name\":\"a.csv\"}");
        assert_eq!(dead[0].attempts, 1);
        assert!(queue.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsettled_message_is_dead_lettered_after_max_attempts() {
        let queue = MemoryWorkQueue::with_max_attempts(3);
        queue.publish(b"poison").await.unwrap();
        queue.publish(b"healthy").await.unwrap();

        // Every claim of the first message lapses without a settle
        for attempt in 1..=3 {
            let delivery = queue.receive(VISIBILITY).await.unwrap().unwrap();
            assert_eq!(delivery.payload, b"poison");
            assert_eq!(delivery.attempt, attempt);
            tokio::time::advance(VISIBILITY).await;
        }

        let next = queue.receive(VISIBILITY).await.unwrap().unwrap();
        assert_eq!(next.payload, b"healthy");
        assert_eq!(next.attempt, 1);
        queue.ack(&next).await.unwrap();
        assert!(queue.receive(VISIBILITY).await.unwrap().is_none());
        assert!(queue.is_empty().await);

        let dead = queue.dead_letters().await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].payload, b"poison");
        assert_eq!(dead[0].attempts, 3);
        assert_eq!(dead[0].reason, "lease expired after 3 attempts");
    }
}
