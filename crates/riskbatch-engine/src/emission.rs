use crate::{BatchEngine, EngineError, ErrorKind};
use chrono::{DateTime, Utc};
use riskbatch_core::report::{ReportData, ReportMetadata};
use riskbatch_core::scoring::summarize_group;
use riskbatch_core::{BatchId, BatchStatus, ReportId, ReportStatus, SecurityContext};
use riskbatch_storage::{BatchRow, NewReport, ReportRow, UnitOfWork};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmissionOutcome {
    pub batch_id: BatchId,
    pub report_id: ReportId,
    /// `false` when the batch already had its report.
    pub newly_issued: bool,
    pub content_hash: String,
}

/// What happened to a finalized batch right after reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EmissionTrigger {
    Emitted(EmissionOutcome),
    Enqueued {
        attempt_count: u32,
        next_eligible_at: DateTime<Utc>,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryOutcome {
    pub report_id: ReportId,
    pub status: ReportStatus,
    pub newly_delivered: bool,
}

impl BatchEngine {
    /// Issues the batch's report, or returns the one it already has.
    ///
    /// The report data is read in a read transaction and the artifacts are
    /// written with no database lock held. The row is then issued in a short
    /// write transaction that checks again for a report issued in the
    /// meantime. A failure at any point leaves no issued report behind.
    pub fn emit_report_for_batch(
        &self,
        ctx: &SecurityContext,
        batch_id: BatchId,
        now: DateTime<Utc>,
    ) -> Result<EmissionOutcome, EngineError> {
        let uow = self.store.begin_read(ctx)?;
        let batch = load_batch(&uow, batch_id)?;
        if let Some(existing) = sealed_report(&uow, batch_id)? {
            uow.commit()?;
            debug!(event = "report_already_issued", batch_id = %batch_id, report_id = %existing.id);
            return Ok(existing_outcome(existing));
        }
        ensure_completed(&batch)?;
        let data = self.assemble_report_data(&uow, &batch, ctx, now)?;
        uow.commit()?;

        let report = self.write_artifacts(ctx, &data, now)?;

        let uow = self.store.begin(ctx)?;
        let batch = load_batch(&uow, batch_id)?;
        let report_id = match uow.active_report_for_batch(batch_id)? {
            Some(existing) if existing.status.is_sealed() => {
                uow.commit()?;
                debug!(event = "report_issued_concurrently", batch_id = %batch_id, report_id = %existing.id);
                return Ok(existing_outcome(existing));
            }
            Some(draft) => {
                ensure_completed(&batch)?;
                if !uow.issue_drafted_report(draft.id, &report)? {
                    return Err(EngineError::ReportNotIssued {
                        report_id: draft.id,
                    });
                }
                draft.id
            }
            None => {
                ensure_completed(&batch)?;
                uow.insert_issued_report(&report)?
            }
        };
        uow.commit()?;

        info!(
            event = "report_issued",
            batch_id = %batch_id,
            report_id = %report_id,
            content_hash = %report.content_hash,
            issued_by = ctx.actor_cpf(),
            groups = data.groups.len()
        );
        Ok(EmissionOutcome {
            batch_id,
            report_id,
            newly_issued: true,
            content_hash: report.content_hash,
        })
    }

    /// Emits the report of a finalized batch, falling back to the retry
    /// queue when emission fails or immediate emission is switched off.
    /// Immutability violations are never absorbed into the queue.
    pub fn dispatch_emission(
        &self,
        ctx: &SecurityContext,
        batch_id: BatchId,
        now: DateTime<Utc>,
    ) -> Result<EmissionTrigger, EngineError> {
        if self.config.skip_immediate_emission {
            if let Some(existing) = self.issued_report(ctx, batch_id)? {
                return Ok(EmissionTrigger::Emitted(existing_outcome(existing)));
            }
            let item =
                self.enqueue_emission_retry(ctx, batch_id, "immediate emission disabled", now)?;
            return Ok(EmissionTrigger::Enqueued {
                attempt_count: item.attempt_count,
                next_eligible_at: item.next_eligible_at,
                reason: item.last_error.unwrap_or_default(),
            });
        }

        match self.emit_report_for_batch(ctx, batch_id, now) {
            Ok(outcome) => Ok(EmissionTrigger::Emitted(outcome)),
            Err(err) if err.kind() == ErrorKind::Immutability => Err(err),
            Err(err) => {
                let reason = err.to_string();
                warn!(
                    event = "report_emission_deferred",
                    batch_id = %batch_id,
                    retryable = err.is_retryable(),
                    error = %reason
                );
                let item = self.enqueue_emission_retry(ctx, batch_id, &reason, now)?;
                Ok(EmissionTrigger::Enqueued {
                    attempt_count: item.attempt_count,
                    next_eligible_at: item.next_eligible_at,
                    reason,
                })
            }
        }
    }

    /// Issued to delivered. Delivering an already delivered report is a no-op.
    pub fn mark_report_delivered(
        &self,
        ctx: &SecurityContext,
        report_id: ReportId,
        now: DateTime<Utc>,
    ) -> Result<DeliveryOutcome, EngineError> {
        let uow = self.store.begin(ctx)?;
        let report = uow.report(report_id)?.ok_or(EngineError::NotFound {
            entity: "report",
            id: report_id.get(),
        })?;

        match report.status {
            ReportStatus::Delivered => {
                uow.commit()?;
                debug!(event = "report_already_delivered", report_id = %report_id);
                Ok(DeliveryOutcome {
                    report_id,
                    status: ReportStatus::Delivered,
                    newly_delivered: false,
                })
            }
            ReportStatus::Drafted => Err(EngineError::ReportNotIssued { report_id }),
            ReportStatus::Issued => {
                if !uow.mark_report_delivered(report_id, now)? {
                    return Err(EngineError::ReportNotIssued { report_id });
                }
                uow.commit()?;
                info!(event = "report_delivered", report_id = %report_id, batch_id = %report.batch_id);
                Ok(DeliveryOutcome {
                    report_id,
                    status: ReportStatus::Delivered,
                    newly_delivered: true,
                })
            }
        }
    }

    fn issued_report(
        &self,
        ctx: &SecurityContext,
        batch_id: BatchId,
    ) -> Result<Option<ReportRow>, EngineError> {
        let uow = self.store.begin_read(ctx)?;
        let report = sealed_report(&uow, batch_id)?;
        uow.commit()?;
        Ok(report)
    }

    /// Renders the document and writes it with its metadata. Returns the
    /// row that issues them.
    fn write_artifacts(
        &self,
        ctx: &SecurityContext,
        data: &ReportData,
        now: DateTime<Utc>,
    ) -> Result<NewReport, EngineError> {
        let batch_id = data.batch_id;
        let emission_err = |reason: String| EngineError::Emission { batch_id, reason };

        let document = self
            .renderer
            .render(data)
            .map_err(|err| emission_err(err.to_string()))?;
        let content_hash = document.content_hash();
        let stem = format!("batch-{batch_id}/report-{}", &content_hash[..16]);

        let document_location = self
            .sink
            .put(&format!("{stem}.{}", document.extension), &document.bytes)
            .map_err(|err| emission_err(err.to_string()))?;
        let metadata = ReportMetadata::new(data, &document, &document_location);
        let metadata_json = metadata.to_canonical_json()?;
        let metadata_location = self
            .sink
            .put(&format!("{stem}.json"), metadata_json.as_bytes())
            .map_err(|err| emission_err(err.to_string()))?;

        Ok(NewReport {
            batch_id,
            content_hash,
            document_location,
            metadata_location,
            issued_by: ctx.actor_cpf().to_string(),
            issued_at: now,
        })
    }

    fn assemble_report_data(
        &self,
        uow: &UnitOfWork,
        batch: &BatchRow,
        ctx: &SecurityContext,
        now: DateTime<Utc>,
    ) -> Result<ReportData, EngineError> {
        let tenant = uow.tenant(batch.tenant_id)?.ok_or(EngineError::NotFound {
            entity: "tenant",
            id: batch.tenant_id.get(),
        })?;
        let tally = uow.assessment_tally(batch.id)?;

        let mut by_group: BTreeMap<u32, Vec<f64>> = BTreeMap::new();
        for score in uow.completed_scores_for_batch(batch.id)? {
            by_group.entry(score.group).or_default().push(score.score);
        }

        let mut groups = Vec::new();
        for definition in self.config.catalog.groups() {
            if let Some(stats) = by_group
                .remove(&definition.number)
                .and_then(|scores| summarize_group(definition, &scores))
            {
                groups.push(stats);
            }
        }
        if !by_group.is_empty() {
            debug!(
                event = "report_groups_outside_catalog",
                batch_id = %batch.id,
                groups = ?by_group.keys().collect::<Vec<_>>()
            );
        }

        Ok(ReportData {
            tenant_id: tenant.id,
            tenant_name: tenant.name,
            batch_id: batch.id,
            batch_title: batch.title.clone(),
            batch_index: batch.batch_index,
            assessments_total: tally.total,
            assessments_completed: tally.completed,
            assessments_deactivated: tally.deactivated,
            groups,
            issued_by: ctx.actor_cpf().to_string(),
            generated_at: now,
        })
    }
}

fn load_batch(uow: &UnitOfWork, batch_id: BatchId) -> Result<BatchRow, EngineError> {
    uow.batch(batch_id)?.ok_or(EngineError::NotFound {
        entity: "batch",
        id: batch_id.get(),
    })
}

fn ensure_completed(batch: &BatchRow) -> Result<(), EngineError> {
    if batch.status != BatchStatus::Completed {
        return Err(EngineError::BatchNotCompleted {
            batch_id: batch.id,
            status: batch.status,
        });
    }
    Ok(())
}

/// The live report, when it is issued or delivered. A draft does not count.
fn sealed_report(uow: &UnitOfWork, batch_id: BatchId) -> Result<Option<ReportRow>, EngineError> {
    Ok(uow
        .active_report_for_batch(batch_id)?
        .filter(|report| report.status.is_sealed()))
}

fn existing_outcome(report: ReportRow) -> EmissionOutcome {
    EmissionOutcome {
        batch_id: report.batch_id,
        report_id: report.id,
        newly_issued: false,
        content_hash: report.content_hash,
    }
}
