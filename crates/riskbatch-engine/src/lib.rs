pub mod completion;
pub mod config;
pub mod emission;
pub mod reconcile;
pub mod retry_queue;

pub use completion::CompletionOutcome;
pub use config::EngineConfig;
pub use emission::{DeliveryOutcome, EmissionOutcome, EmissionTrigger};
pub use reconcile::ReconcileOutcome;
pub use retry_queue::{backoff_delay, DrainReport};

use riskbatch_core::artifacts::{ArtifactSink, FsArtifactSink};
use riskbatch_core::report::{PlainTextRenderer, ReportRenderer};
use riskbatch_core::{
    AssessmentId, BatchId, BatchStatus, ContractError, EmployeeId, ReportId, SecurityContext,
};
use riskbatch_storage::{LedgerStore, StorageError};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("contract error: {0}")]
    Contract(#[from] ContractError),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },
    #[error("batch {batch_id} is {status}; reports are only emitted for completed batches")]
    BatchNotCompleted {
        batch_id: BatchId,
        status: BatchStatus,
    },
    #[error("assessment {assessment_id} does not belong to employee {employee_id}")]
    EmployeeMismatch {
        assessment_id: AssessmentId,
        employee_id: EmployeeId,
    },
    #[error("report {report_id} is not issued")]
    ReportNotIssued { report_id: ReportId },
    #[error("immutability violation: {0}")]
    Immutable(String),
    #[error("emission failed for batch {batch_id}: {reason}")]
    Emission { batch_id: BatchId, reason: String },
    #[error("{operation} requires an elevated context")]
    ElevationRequired { operation: &'static str },
    #[error("invalid configuration: {0}")]
    Config(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Concurrency,
    Immutability,
    Emission,
    Storage,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Storage(err) => match err {
                StorageError::Immutability(_) => ErrorKind::Immutability,
                err if err.is_transient() => ErrorKind::Concurrency,
                StorageError::NotVisible { .. }
                | StorageError::ContextUnresolved { .. }
                | StorageError::Forbidden { .. }
                | StorageError::InvalidState { .. } => ErrorKind::Validation,
                _ => ErrorKind::Storage,
            },
            EngineError::Contract(err) => match err {
                ContractError::Render(_) | ContractError::ArtifactWrite { .. } => {
                    ErrorKind::Emission
                }
                _ => ErrorKind::Validation,
            },
            EngineError::Immutable(_) => ErrorKind::Immutability,
            EngineError::Emission { .. } => ErrorKind::Emission,
            EngineError::NotFound { .. }
            | EngineError::BatchNotCompleted { .. }
            | EngineError::EmployeeMismatch { .. }
            | EngineError::ReportNotIssued { .. }
            | EngineError::ElevationRequired { .. }
            | EngineError::Config(_) => ErrorKind::Validation,
        }
    }

    /// Whether running the same operation again may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Concurrency | ErrorKind::Emission | ErrorKind::Storage
        )
    }
}

/// Entry points of the reconciliation and emission core.
///
/// Every operation takes the caller's [`SecurityContext`] and the instant it
/// runs at, and opens its own units of work on the store. Clones share the
/// store, renderer and artifact sink.
#[derive(Clone)]
pub struct BatchEngine {
    store: LedgerStore,
    config: EngineConfig,
    renderer: Arc<dyn ReportRenderer + Send + Sync>,
    sink: Arc<dyn ArtifactSink + Send + Sync>,
}

impl BatchEngine {
    /// Plain-text reports written below `config.artifact_dir`.
    pub fn new(store: LedgerStore, config: EngineConfig) -> Self {
        let sink = FsArtifactSink::new(config.artifact_dir.clone());
        Self {
            store,
            config,
            renderer: Arc::new(PlainTextRenderer),
            sink: Arc::new(sink),
        }
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn ReportRenderer + Send + Sync>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn ArtifactSink + Send + Sync>) -> Self {
        self.sink = sink;
        self
    }

    pub fn store(&self) -> &LedgerStore {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn ensure_elevated(
        &self,
        ctx: &SecurityContext,
        operation: &'static str,
    ) -> Result<(), EngineError> {
        if ctx.is_elevated() {
            Ok(())
        } else {
            Err(EngineError::ElevationRequired { operation })
        }
    }
}

impl std::fmt::Debug for BatchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchEngine")
            .field("store", &self.store)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
