#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use riskbatch_core::artifacts::{ArtifactSink, FsArtifactSink};
use riskbatch_core::{
    ActorRole, AssessmentId, BatchId, ContractError, EmployeeId, SecurityContext, TenantId,
};
use riskbatch_engine::{BatchEngine, EngineConfig};
use riskbatch_storage::{LedgerStore, NewBatch, StoreConfig, UnitOfWork};
use std::time::Duration as StdDuration;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

pub const MANAGER_CPF: &str = "11144477735";
pub const REQUIRED_ANSWERS: u32 = 4;

pub fn ts(offset_secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0)
        .single()
        .expect("valid timestamp")
        + Duration::seconds(offset_secs)
}

pub fn system() -> SecurityContext {
    SecurityContext::system("integration-tests")
}

/// Artifact sink whose writes can be switched to fail.
pub struct ToggleSink {
    inner: FsArtifactSink,
    failing: AtomicBool,
}

impl ToggleSink {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl ArtifactSink for ToggleSink {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<String, ContractError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ContractError::ArtifactWrite {
                key: key.to_string(),
                reason: "artifact volume offline".to_string(),
            });
        }
        self.inner.put(key, bytes)
    }
}

pub struct Harness {
    pub dir: TempDir,
    pub store: LedgerStore,
    pub engine: BatchEngine,
    pub sink: Arc<ToggleSink>,
    pub tenant: TenantId,
}

pub struct SeededBatch {
    pub batch: BatchId,
    pub assessments: Vec<(AssessmentId, EmployeeId)>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(adjust: impl FnOnce(&mut EngineConfig)) -> Self {
        Self::with_store_config(StoreConfig::default(), adjust)
    }

    /// Short lock and busy timeouts, for tests that hold a lock on purpose.
    pub fn impatient() -> Self {
        Self::impatient_with(|_| {})
    }

    pub fn impatient_with(adjust: impl FnOnce(&mut EngineConfig)) -> Self {
        Self::with_store_config(
            StoreConfig {
                busy_timeout: StdDuration::from_millis(100),
                lock_timeout: StdDuration::from_millis(200),
            },
            adjust,
        )
    }

    pub fn with_store_config(
        store_config: StoreConfig,
        adjust: impl FnOnce(&mut EngineConfig),
    ) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let store = LedgerStore::open_with_config(dir.path().join("ledger.db"), store_config)
            .expect("open store");

        let mut config = EngineConfig {
            required_answers: REQUIRED_ANSWERS,
            artifact_dir: dir.path().join("artifacts"),
            ..EngineConfig::default()
        };
        adjust(&mut config);

        let sink = Arc::new(ToggleSink {
            inner: FsArtifactSink::new(config.artifact_dir.clone()),
            failing: AtomicBool::new(false),
        });
        let engine = BatchEngine::new(store.clone(), config).with_sink(sink.clone());

        let uow = store.begin(&system()).expect("begin");
        let tenant = uow.insert_tenant("Clinica Horizonte", ts(0)).expect("tenant");
        uow.insert_actor(MANAGER_CPF, ActorRole::Manager, Some(tenant), ts(0))
            .expect("manager");
        uow.commit().expect("commit");

        Self {
            dir,
            store,
            engine,
            sink,
            tenant,
        }
    }

    pub fn manager(&self) -> SecurityContext {
        SecurityContext::new(MANAGER_CPF, ActorRole::Manager, Some(self.tenant))
    }

    pub fn uow(&self) -> UnitOfWork {
        self.store.begin(&system()).expect("begin")
    }

    /// A batch released by the manager with `released` released assessments
    /// and `drafts` draft ones.
    pub fn seed_batch(&self, title: &str, released: usize, drafts: usize) -> SeededBatch {
        let uow = self.uow();
        let batch = uow
            .insert_batch(
                &NewBatch {
                    tenant_id: self.tenant,
                    title: title.to_string(),
                    batch_index: Some(1),
                    released_by_cpf: Some(MANAGER_CPF.to_string()),
                },
                ts(0),
            )
            .expect("batch");

        let mut assessments = Vec::new();
        for index in 0..released + drafts {
            let employee = uow
                .insert_employee(
                    self.tenant,
                    &format!("{title}-{index:03}"),
                    &format!("Employee {index}"),
                )
                .expect("employee");
            let assessment = uow
                .insert_assessment(batch, employee, index < released, ts(1))
                .expect("assessment");
            assessments.push((assessment, employee));
        }
        uow.commit().expect("commit");

        SeededBatch { batch, assessments }
    }

    /// Records `count` distinct answers spread over groups 1 and 2.
    pub fn answer(&self, assessment: AssessmentId, count: u32, value: f64) {
        let uow = self.uow();
        for item in 0..count {
            let group = 1 + item % 2;
            uow.record_answer(assessment, group, &format!("Q{item}"), value, ts(10))
                .expect("answer");
        }
        uow.commit().expect("commit");
    }

    pub fn deactivate(&self, assessment: AssessmentId) {
        let uow = self.uow();
        assert!(uow.deactivate_assessment(assessment, ts(20)).expect("deactivate"));
        uow.commit().expect("commit");
    }

    /// Answers and concludes one assessment through the engine.
    pub fn complete(&self, assessment: AssessmentId, employee: EmployeeId, at: DateTime<Utc>) {
        self.answer(assessment, REQUIRED_ANSWERS, 50.0);
        self.engine
            .conclude_assessment_if_complete(&self.manager(), assessment, employee, at)
            .expect("conclude");
    }
}
