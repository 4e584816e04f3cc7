use crate::{BatchEngine, EngineError};
use chrono::{DateTime, Duration, Utc};
use riskbatch_core::{BatchId, SecurityContext};
use riskbatch_storage::QueueItem;
use serde::Serialize;
use tracing::{error, info, warn};

pub const FIRST_RETRY_DELAY_MINUTES: i64 = 1;
pub const MAX_RETRY_DELAY_MINUTES: i64 = 60;

/// Delay before the next attempt once `previous_attempts` have failed:
/// `min(60, 2^previous_attempts)` minutes.
pub fn backoff_delay(previous_attempts: u32) -> Duration {
    let minutes = 2_i64
        .checked_pow(previous_attempts)
        .map_or(MAX_RETRY_DELAY_MINUTES, |minutes| {
            minutes.min(MAX_RETRY_DELAY_MINUTES)
        });
    Duration::minutes(minutes)
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub items_due: usize,
    pub emitted: usize,
    pub already_issued: usize,
    pub failed: usize,
}

impl BatchEngine {
    /// Records a failed emission. The first failure waits one minute; every
    /// later one bumps the attempt count and backs off further.
    pub fn enqueue_emission_retry(
        &self,
        ctx: &SecurityContext,
        batch_id: BatchId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<QueueItem, EngineError> {
        let uow = self.store.begin(ctx)?;
        if uow.batch(batch_id)?.is_none() {
            return Err(EngineError::NotFound {
                entity: "batch",
                id: batch_id.get(),
            });
        }

        match uow.queue_item(batch_id)? {
            None => {
                let next = now + Duration::minutes(FIRST_RETRY_DELAY_MINUTES);
                uow.insert_queue_item(batch_id, error, next, now)?;
            }
            Some(existing) => {
                let next = now + backoff_delay(existing.attempt_count);
                uow.bump_queue_item(batch_id, existing.attempt_count + 1, error, next, now)?;
            }
        }

        let item = uow.queue_item(batch_id)?.ok_or(EngineError::NotFound {
            entity: "emission queue item",
            id: batch_id.get(),
        })?;
        uow.commit()?;

        info!(
            event = "emission_enqueued",
            batch_id = %batch_id,
            attempt = item.attempt_count,
            next_eligible_at = %item.next_eligible_at,
            error
        );
        Ok(item)
    }

    /// Re-runs emission for up to `max_items` due queue items, oldest due
    /// first. Successes leave the queue; failures are enqueued again.
    ///
    /// A failure on one item never ends the pass. `max_items == 0` is a
    /// pass over nothing.
    pub fn drain_emission_queue(
        &self,
        ctx: &SecurityContext,
        max_items: u32,
        now: DateTime<Utc>,
    ) -> Result<DrainReport, EngineError> {
        self.ensure_elevated(ctx, "draining the emission queue")?;
        let mut report = DrainReport::default();
        if max_items == 0 {
            return Ok(report);
        }

        let due = {
            let uow = self.store.begin_read(ctx)?;
            let due = uow.due_queue_items(now, max_items)?;
            uow.commit()?;
            due
        };
        report.items_due = due.len();

        for item in due {
            match self.emit_report_for_batch(ctx, item.batch_id, now) {
                Ok(outcome) => {
                    if let Err(err) = self.remove_queue_item(ctx, item.batch_id) {
                        // The next pass finds the report and resolves the item.
                        warn!(
                            event = "queue_item_removal_failed",
                            batch_id = %item.batch_id,
                            error = %err
                        );
                    }
                    if outcome.newly_issued {
                        report.emitted += 1;
                    } else {
                        report.already_issued += 1;
                    }
                    info!(
                        event = "queued_emission_resolved",
                        batch_id = %item.batch_id,
                        report_id = %outcome.report_id,
                        attempts = item.attempt_count,
                        newly_issued = outcome.newly_issued
                    );
                }
                Err(err) => {
                    warn!(
                        event = "queued_emission_failed",
                        batch_id = %item.batch_id,
                        attempt = item.attempt_count,
                        retryable = err.is_retryable(),
                        error = %err
                    );
                    report.failed += 1;
                    if let Err(requeue) =
                        self.enqueue_emission_retry(ctx, item.batch_id, &err.to_string(), now)
                    {
                        error!(
                            event = "queued_emission_requeue_failed",
                            batch_id = %item.batch_id,
                            attempt = item.attempt_count,
                            error = %requeue
                        );
                    }
                }
            }
        }

        Ok(report)
    }

    pub fn pending_emissions(&self, ctx: &SecurityContext) -> Result<Vec<QueueItem>, EngineError> {
        self.ensure_elevated(ctx, "listing the emission queue")?;
        let uow = self.store.begin_read(ctx)?;
        let items = uow.queue_items()?;
        uow.commit()?;
        Ok(items)
    }

    fn remove_queue_item(&self, ctx: &SecurityContext, batch_id: BatchId) -> Result<(), EngineError> {
        let uow = self.store.begin(ctx)?;
        uow.delete_queue_item(batch_id)?;
        uow.commit()?;
        Ok(())
    }
}
