//! Message router: the idempotent processing protocol.
//!
//! One call to [`MessageRouter::handle`] processes one notification. `Ok`
//! means "acknowledge", `Err` means "redeliver". Deliveries of the same
//! message may be handled concurrently by different workers; the only
//! coordination between them is the run ledger.
//!
//! The primary path checks the ledger twice around the audit. The first,
//! eventually-consistent read is a cheap short-circuit for plain
//! redeliveries. The second read is strongly consistent and decides whether
//! this delivery's results are kept. Two deliveries can still both pass it;
//! the conditional ledger insert then picks exactly one, and only the winner
//! increments the job counter. An audit may run more than once for the same
//! run id, but it is recorded and counted at most once.

use std::sync::Arc;
use std::time::Instant;

use opentelemetry::KeyValue;
use tracing::{Instrument, Span, debug, info, warn};

use crate::artifacts::{ArtifactStore, upload_reports};
use crate::audit::{AuditEngine, merge_options};
use crate::error::{Error, Result};
use crate::model::{
    AuditRequest, DeadLetter, Disposition, Notification, Run, SkipReason, Stage, URL_ATTR,
};
use crate::store::{Consistency, InsertOutcome, RunStore, record_run};
use crate::telemetry::audit::{record_job, record_stage_transition, start_notification_span};
use crate::telemetry::metrics;

/// Router settings.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Notifications from this topic take the dead-letter path.
    pub dead_letter_topic: String,
    /// Test-only: fail right before the audit step.
    pub simulate_fault_before_audit: bool,
}

/// Routes notifications and drives the stores and the audit engine.
#[derive(Clone)]
pub struct MessageRouter {
    store: Arc<dyn RunStore>,
    artifacts: Arc<dyn ArtifactStore>,
    auditor: Arc<dyn AuditEngine>,
    config: RouterConfig,
}

impl MessageRouter {
    pub fn new(
        store: Arc<dyn RunStore>,
        artifacts: Arc<dyn ArtifactStore>,
        auditor: Arc<dyn AuditEngine>,
        config: RouterConfig,
    ) -> Self {
        Self {
            store,
            artifacts,
            auditor,
            config,
        }
    }

    pub fn is_dead_letter(&self, notification: &Notification) -> bool {
        notification.topic_arn == self.config.dead_letter_topic
    }

    /// Handle one notification.
    pub async fn handle(&self, notification: &Notification) -> Result<Disposition> {
        let path = if self.is_dead_letter(notification) {
            "dead_letter"
        } else {
            "primary"
        };
        let span = start_notification_span(path, &notification.message_id);

        let result = async {
            if path == "dead_letter" {
                self.handle_dead_letter(notification).await
            } else {
                self.handle_primary(notification, &span).await
            }
        }
        .instrument(span.clone())
        .await;

        match &result {
            Ok(disposition) => {
                metrics::notifications_processed().add(
                    1,
                    &[
                        KeyValue::new("path", path),
                        KeyValue::new("disposition", disposition.as_str()),
                    ],
                );
            }
            Err(e) => {
                span.in_scope(|| warn!(error = %e, "notification failed, will be redelivered"));
                metrics::notifications_failed().add(1, &[KeyValue::new("path", path)]);
            }
        }
        result
    }

    async fn handle_dead_letter(&self, notification: &Notification) -> Result<Disposition> {
        let dead_letter = DeadLetter::from_notification(notification);
        let Some((original, job_id)) = dead_letter.original_job() else {
            warn!(
                decoded = dead_letter.original.is_some(),
                "dead letter without a usable original job id, dropping"
            );
            return Ok(Disposition::Dropped);
        };
        record_job(&Span::current(), &job_id.0);
        info!(
            original_message_id = %original.message_id,
            error = dead_letter.error_message.as_deref().unwrap_or(""),
            "processing dead letter"
        );

        let run = Run::dead_lettered(
            original.run_id(),
            job_id,
            original.attribute(URL_ATTR).map(str::to_string),
            dead_letter.run_error(),
        );
        match record_run(self.store.as_ref(), &run).await? {
            InsertOutcome::Inserted => info!(run_id = %run.run_id, "dead-lettered run recorded"),
            InsertOutcome::AlreadyExists => {
                info!(run_id = %run.run_id, "run already recorded, dead letter ignored")
            }
        }
        Ok(Disposition::DeadLettered)
    }

    async fn handle_primary(&self, notification: &Notification, span: &Span) -> Result<Disposition> {
        let mut stage = StageTracker::new(span);

        let request = AuditRequest::from_notification(notification)?;
        record_job(span, &request.job_id.0);
        let AuditRequest {
            job_id,
            run_id,
            url,
            options,
        } = request;

        if self.store.get(&run_id, Consistency::Eventual).await?.is_some() {
            info!(%run_id, "run already recorded, skipping duplicate delivery");
            stage.advance(Stage::Skipped)?;
            return Ok(Disposition::Skipped(SkipReason::AlreadyRecorded));
        }
        stage.advance(Stage::DedupChecked1)?;

        if self.config.simulate_fault_before_audit {
            return Err(Error::InjectedFault);
        }

        stage.advance(Stage::AuditRunning)?;
        let started = Instant::now();
        let audit = self.auditor.run(&url, &merge_options(&options)).await;
        metrics::audit_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new(
                "result",
                if audit.is_ok() { "ok" } else { "error" },
            )],
        );
        let session = audit?;

        let recorded = match self.store.get(&run_id, Consistency::Strong).await {
            Ok(found) => found.is_some(),
            Err(e) => {
                session.release().await;
                return Err(e);
            }
        };
        if recorded {
            info!(%run_id, "run recorded by a concurrent delivery, discarding audit");
            stage.advance(Stage::Skipped)?;
            session.release().await;
            return Ok(Disposition::Skipped(SkipReason::LostRace));
        }
        stage.advance(Stage::DedupChecked2)?;

        // A missing report can be regenerated later; an unrecorded run cannot.
        if let Err(e) =
            upload_reports(self.artifacts.as_ref(), &job_id, &run_id, &session.reports).await
        {
            warn!(%run_id, error = %e, "failed to upload reports, recording run anyway");
        }
        stage.advance(Stage::Persisted)?;

        let run = Run::succeeded(run_id, job_id, url);
        let outcome = record_run(self.store.as_ref(), &run).await;
        session.release().await;

        match outcome? {
            InsertOutcome::Inserted => {
                stage.advance(Stage::Recorded)?;
                info!(run_id = %run.run_id, "run recorded");
                Ok(Disposition::Recorded)
            }
            InsertOutcome::AlreadyExists => {
                stage.advance(Stage::Skipped)?;
                info!(run_id = %run.run_id, "lost the insert race, run not counted");
                Ok(Disposition::Skipped(SkipReason::LostRace))
            }
        }
    }
}

/// Validates and records primary-path stage transitions.
struct StageTracker<'a> {
    span: &'a Span,
    current: Stage,
}

impl<'a> StageTracker<'a> {
    fn new(span: &'a Span) -> Self {
        span.record("audit.stage", tracing::field::display(Stage::Received));
        Self {
            span,
            current: Stage::Received,
        }
    }

    fn advance(&mut self, to: Stage) -> Result<()> {
        if !self.current.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                from: self.current.to_string(),
                to: to.to_string(),
            });
        }
        record_stage_transition(self.span, self.current, to);
        debug!(from = %self.current, to = %to, terminal = to.is_terminal(), "stage advanced");
        self.current = to;
        Ok(())
    }
}
