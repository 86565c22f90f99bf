//! Consumer loop: pulls deliveries from the audit and dead-letter queues,
//! hands them to the router, and applies the acknowledgment contract.
//!
//! * router `Ok` -> archive the message;
//! * router `Err` on the audit queue -> leave it for redelivery after the
//!   visibility timeout, or move it to the dead-letter queue once it has
//!   been delivered `max_deliveries` times;
//! * router `Err` on the dead-letter queue -> leave it for redelivery.

use crate::db::Db;
use crate::db::queue::{Delivery, READY_CHANNEL};
use crate::error::Result;
use crate::router::MessageRouter;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{Instrument, error, info, info_span, warn};

/// Configuration for the consumer loop.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub audit_queue: String,
    pub dead_letter_queue: String,
    /// Visibility timeout (seconds) for pgmq reads. Must exceed a full audit.
    pub visibility_timeout: i32,
    /// Poll interval fallback when no NOTIFY arrives.
    pub poll_interval: Duration,
    /// Deliveries of one message before it is dead-lettered.
    pub max_deliveries: i32,
    /// Deliveries processed in parallel.
    pub max_concurrent: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            audit_queue: "page_audits".to_string(),
            dead_letter_queue: "page_audits_dlq".to_string(),
            visibility_timeout: 300,
            poll_interval: Duration::from_secs(5),
            max_deliveries: 3,
            max_concurrent: 4,
        }
    }
}

/// What to do with a delivery once the router has handled it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// Archive the message.
    Ack,
    /// Leave it; it reappears after the visibility timeout.
    Retry,
    /// Move it to the dead-letter queue and archive the original.
    DeadLetter,
}

impl WorkerConfig {
    /// Apply the acknowledgment contract to one handled delivery.
    ///
    /// Dead letters are never dead-lettered again; a failing one is retried
    /// until it succeeds.
    pub fn settle<T>(&self, queue: &str, read_ct: i32, outcome: &Result<T>) -> Settlement {
        match outcome {
            Ok(_) => Settlement::Ack,
            Err(_) if queue == self.dead_letter_queue => Settlement::Retry,
            Err(_) if read_ct >= self.max_deliveries => Settlement::DeadLetter,
            Err(_) => Settlement::Retry,
        }
    }
}

/// The consumer loop. Cheap to clone; clones share shutdown and capacity.
#[derive(Clone)]
pub struct Worker {
    db: Arc<Db>,
    router: Arc<MessageRouter>,
    config: WorkerConfig,
    shutdown: Arc<Notify>,
    in_flight: Arc<AtomicUsize>,
}

/// Decrements the in-flight count when a delivery task ends, panics included.
struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Worker {
    pub fn new(db: Arc<Db>, router: Arc<MessageRouter>, config: WorkerConfig) -> Self {
        Self {
            db,
            router,
            config,
            shutdown: Arc::new(Notify::new()),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Signal the loop to stop taking new deliveries.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Run until shutdown, then wait for in-flight deliveries.
    pub async fn run(&self) -> Result<()> {
        let mut listener = sqlx::postgres::PgListener::connect_with(self.db.pool()).await?;
        listener.listen(READY_CHANNEL).await?;

        info!(
            audit_queue = %self.config.audit_queue,
            dead_letter_queue = %self.config.dead_letter_queue,
            max_concurrent = self.config.max_concurrent,
            "worker started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("worker shutting down");
                    break;
                }
                notif = listener.recv() => {
                    match notif {
                        Ok(n) => info!(queue = n.payload(), "notified of new messages"),
                        Err(e) => warn!("PgListener error: {e}, falling back to poll"),
                    }
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }

            if let Err(e) = self.dispatch_available().await {
                error!("dispatch error: {e}");
            }
        }

        self.wait_for_in_flight().await;
        Ok(())
    }

    /// Receive and spawn deliveries until the queues are empty or capacity
    /// is exhausted. Dead letters go first; they are cheap and settle jobs.
    pub async fn dispatch_available(&self) -> Result<usize> {
        let mut dispatched = 0;
        for queue in [&self.config.dead_letter_queue, &self.config.audit_queue] {
            while self.in_flight() < self.config.max_concurrent {
                let Some(delivery) = self
                    .db
                    .receive(queue, self.config.visibility_timeout)
                    .await?
                else {
                    break;
                };
                self.spawn_delivery(delivery);
                dispatched += 1;
            }
        }
        Ok(dispatched)
    }

    fn spawn_delivery(&self, delivery: Delivery) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = InFlight(Arc::clone(&self.in_flight));
        let worker = self.clone();
        let span = info_span!(
            "delivery",
            queue = %delivery.queue,
            msg_id = delivery.msg_id,
            read_ct = delivery.read_ct,
        );
        tokio::spawn(
            async move {
                let _guard = guard;
                if let Err(e) = worker.process(&delivery).await {
                    error!("failed to settle delivery: {e}");
                }
            }
            .instrument(span),
        );
    }

    /// Handle one delivery and settle it with the queue.
    pub async fn process(&self, delivery: &Delivery) -> Result<()> {
        let outcome = match delivery.notification() {
            Ok(notification) => self.router.handle(&notification).await,
            Err(e) => Err(e),
        };

        match self.config.settle(&delivery.queue, delivery.read_ct, &outcome) {
            Settlement::Ack => {
                self.db.ack(delivery).await?;
                if let Ok(disposition) = outcome {
                    info!(disposition = disposition.as_str(), "delivery acknowledged");
                }
            }
            Settlement::DeadLetter => {
                let error = outcome.err().map(|e| e.to_string()).unwrap_or_default();
                let dlq_msg_id = self
                    .db
                    .dead_letter(delivery, &self.config.dead_letter_queue, &error)
                    .await?;
                warn!(%error, dlq_msg_id, "delivery attempts exhausted, dead-lettered");
            }
            Settlement::Retry => {
                let error = outcome.err().map(|e| e.to_string()).unwrap_or_default();
                warn!(
                    %error,
                    remaining = (self.config.max_deliveries - delivery.read_ct).max(0),
                    "delivery failed, leaving for redelivery"
                );
            }
        }
        Ok(())
    }

    async fn wait_for_in_flight(&self) {
        let deadline = tokio::time::Instant::now()
            + Duration::from_secs(self.config.visibility_timeout.max(1) as u64);
        while self.in_flight() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let left = self.in_flight();
        if left > 0 {
            warn!(left, "stopped with deliveries in flight; they will be redelivered");
        }
    }
}
