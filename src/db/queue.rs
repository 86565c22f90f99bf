//! Pub/sub transport on pgmq.
//!
//! Each topic is a pgmq queue. A delivery stays invisible for the read's
//! visibility timeout; if it is not acknowledged in time pgmq hands it out
//! again with a higher `read_ct`, which is what gives the worker
//! at-least-once semantics.

use crate::error::Result;
use crate::model::Notification;
use crate::telemetry::metrics;
use opentelemetry::KeyValue;

/// Channel used to wake idle workers after a publish.
pub const READY_CHANNEL: &str = "audit_ready";

/// A message read from a topic queue.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub queue: String,
    pub msg_id: i64,
    /// How many times this message has been handed out, this one included.
    pub read_ct: i32,
    pub enqueued_at: chrono::DateTime<chrono::Utc>,
    /// Raw envelope as stored in the queue.
    pub payload: serde_json::Value,
}

impl Delivery {
    /// Decode the envelope.
    pub fn notification(&self) -> Result<Notification> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

fn record_queue_op(queue: &str, operation: &'static str) {
    metrics::queue_operations().add(
        1,
        &[
            KeyValue::new("queue", queue.to_string()),
            KeyValue::new("operation", operation),
        ],
    );
}

impl super::Db {
    /// Create a topic queue (idempotent).
    pub async fn create_queue(&self, queue: &str) -> Result<()> {
        sqlx::query("SELECT pgmq.create($1)")
            .bind(queue)
            .execute(self.pool())
            .await?;
        record_queue_op(queue, "create");
        Ok(())
    }

    /// Publish a notification and wake listeners. Returns the pgmq message id.
    pub async fn publish(&self, queue: &str, notification: &Notification) -> Result<i64> {
        let payload = serde_json::to_value(notification)?;
        let mut tx = self.pool().begin().await?;
        let row: (i64,) = sqlx::query_as("SELECT pgmq.send($1, $2, 0)")
            .bind(queue)
            .bind(&payload)
            .fetch_one(&mut *tx)
            .await?;
        // NOTIFY only fires on commit
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(READY_CHANNEL)
            .bind(queue)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        record_queue_op(queue, "publish");
        Ok(row.0)
    }

    /// Receive the next delivery, hiding it for `vt_seconds`.
    /// Returns None if the queue is empty.
    pub async fn receive(&self, queue: &str, vt_seconds: i32) -> Result<Option<Delivery>> {
        let row = sqlx::query_as::<
            _,
            (
                i64,
                i32,
                chrono::DateTime<chrono::Utc>,
                serde_json::Value,
            ),
        >("SELECT msg_id, read_ct, enqueued_at, message FROM pgmq.read($1, $2, 1)")
        .bind(queue)
        .bind(vt_seconds)
        .fetch_optional(self.pool())
        .await?;

        let delivery = row.map(|(msg_id, read_ct, enqueued_at, payload)| Delivery {
            queue: queue.to_string(),
            msg_id,
            read_ct,
            enqueued_at,
            payload,
        });
        record_queue_op(
            queue,
            if delivery.is_some() {
                "receive"
            } else {
                "receive_empty"
            },
        );
        Ok(delivery)
    }

    /// Acknowledge a delivery. The message moves to the archive table.
    pub async fn ack(&self, delivery: &Delivery) -> Result<()> {
        sqlx::query("SELECT pgmq.archive($1, $2)")
            .bind(&delivery.queue)
            .bind(delivery.msg_id)
            .execute(self.pool())
            .await?;
        record_queue_op(&delivery.queue, "ack");
        Ok(())
    }

    /// Move a delivery that exhausted its attempts to the dead-letter topic.
    ///
    /// Publishing the dead letter and archiving the original commit together,
    /// so a crash in between cannot lose the message or duplicate it.
    pub async fn dead_letter(
        &self,
        delivery: &Delivery,
        dead_letter_queue: &str,
        error_message: &str,
    ) -> Result<i64> {
        let notification = Notification::dead_letter(
            dead_letter_queue,
            delivery.payload.to_string(),
            error_message,
        );
        let payload = serde_json::to_value(&notification)?;

        let mut tx = self.pool().begin().await?;
        let row: (i64,) = sqlx::query_as("SELECT pgmq.send($1, $2, 0)")
            .bind(dead_letter_queue)
            .bind(&payload)
            .fetch_one(&mut *tx)
            .await?;
        sqlx::query("SELECT pgmq.archive($1, $2)")
            .bind(&delivery.queue)
            .bind(delivery.msg_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(READY_CHANNEL)
            .bind(dead_letter_queue)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        record_queue_op(&delivery.queue, "dead_letter");
        Ok(row.0)
    }
}
