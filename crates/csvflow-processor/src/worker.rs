//! Queue consumer
//!
//! Each loop claims one delivery at a time, hands the payload to the
//! [`DeliveryCoordinator`] and settles the message according to the disposition.

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::WorkerSettings;
use crate::engine::{AttemptReport, DeliveryCoordinator, Disposition};
use crate::error::QueueError;
use crate::queue::{Delivery, WorkQueue};

/// What a single poll did
#[derive(Debug)]
pub enum PollOutcome {
    /// Nothing was visible
    Idle,
    Handled(Box<AttemptReport>),
}

#[derive(Clone)]
pub struct Worker {
    queue: Arc<dyn WorkQueue>,
    coordinator: Arc<DeliveryCoordinator>,
    settings: WorkerSettings,
}

impl Worker {
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        coordinator: Arc<DeliveryCoordinator>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            queue,
            coordinator,
            settings,
        }
    }

    /// Claim and handle at most one delivery.
    pub async fn run_once(&self) -> Result<PollOutcome, QueueError> {
        let Some(delivery) = self.queue.receive(self.settings.visibility_timeout).await? else {
            return Ok(PollOutcome::Idle);
        };

        debug!(message_id = delivery.id, attempt = delivery.attempt, "Claimed delivery");
        let report = self
            .coordinator
            .handle_delivery(&delivery.payload, delivery.attempt)
            .await;
        self.settle(&delivery, &report.disposition).await;

        Ok(PollOutcome::Handled(Box::new(report)))
    }

    /// Poll until the queue has nothing visible, returning the reports handled.
    pub async fn drain(&self) -> Result<Vec<AttemptReport>, QueueError> {
        let mut reports = Vec::new();
        while let PollOutcome::Handled(report) = self.run_once().await? {
            reports.push(*report);
        }
        Ok(reports)
    }

    /// Run `concurrency` consumer loops until `shutdown` flips to true. In-flight
    /// deliveries finish before the loops exit.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        let mut loops = JoinSet::new();
        for index in 0..self.settings.concurrency.max(1) {
            let worker = self.clone();
            let shutdown = shutdown.clone();
            loops.spawn(async move { worker.consume(index, shutdown).await });
        }

        info!(concurrency = self.settings.concurrency, "Worker started");
        while let Some(joined) = loops.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Consumer loop panicked");
            }
        }
        info!("Worker stopped");
    }

    async fn consume(&self, index: usize, mut shutdown: watch::Receiver<bool>) {
        debug!(consumer = index, "Consumer loop started");
        loop {
            let stopping = *shutdown.borrow();
            if stopping {
                break;
            }

            let pause = match self.run_once().await {
                Ok(PollOutcome::Handled(_)) => continue,
                Ok(PollOutcome::Idle) => self.settings.poll_interval,
                Err(e) => {
                    error!(consumer = index, error = %e, "Failed to poll queue");
                    self.settings.poll_interval * 5
                },
            };

            tokio::select! {
                _ = tokio::time::sleep(pause) => {},
                _ = shutdown.changed() => {},
            }
        }
        debug!(consumer = index, "Consumer loop stopped");
    }

    async fn settle(&self, delivery: &Delivery, disposition: &Disposition) {
        let result = match disposition {
            Disposition::Ack => self.queue.ack(delivery).await,
            Disposition::Retry { delay } => self.queue.retry(delivery, *delay).await,
            Disposition::DeadLetter { reason } => {
                let result = self.queue.dead_letter(delivery, reason).await;
                if result.is_ok() {
                    warn!(
                        message_id = delivery.id,
                        attempts = delivery.attempt,
                        reason = %reason,
                        "Delivery dead-lettered"
                    );
                }
                result
            },
        };

        match result {
            Ok(()) => {},
            // The lease expired and another consumer owns the message now
            Err(QueueError::NotInFlight(id)) => {
                warn!(message_id = id, "Delivery lease lost before it was settled")
            },
            Err(e) => {
                warn!(message_id = delivery.id, error = %e, "Failed to settle delivery; it will be redelivered")
            },
        }
    }
}
