pub mod artifacts;
pub mod best_effort;
pub mod context;
pub mod report;
pub mod scoring;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub use best_effort::{best_effort, BestEffort};
pub use context::{ActorRole, SecurityContext};

#[derive(Debug, Error)]
pub enum ContractError {
    #[error("serialization failed: {0}")]
    Serialization(String),
    #[error("unknown {kind}: {value}")]
    UnknownVariant { kind: &'static str, value: String },
    #[error("answer value out of range for group {group} item {item}: {value}")]
    AnswerOutOfRange { group: u32, item: String, value: f64 },
    #[error("render failed: {0}")]
    Render(String),
    #[error("artifact write failed for {key}: {reason}")]
    ArtifactWrite { key: String, reason: String },
}

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl $name {
            pub fn get(self) -> i64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(TenantId);
id_newtype!(EmployeeId);
id_newtype!(BatchId);
id_newtype!(AssessmentId);
id_newtype!(ReportId);

impl BatchId {
    /// Key under which reconciliations of this batch are serialized.
    pub fn advisory_key(self) -> i64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AssessmentStatus {
    Started,
    InProgress,
    Completed,
    Deactivated,
}

impl AssessmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssessmentStatus::Started => "started",
            AssessmentStatus::InProgress => "in_progress",
            AssessmentStatus::Completed => "completed",
            AssessmentStatus::Deactivated => "deactivated",
        }
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(self, AssessmentStatus::Started | AssessmentStatus::InProgress)
    }
}

impl fmt::Display for AssessmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssessmentStatus {
    type Err = ContractError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim() {
            "started" => Ok(AssessmentStatus::Started),
            "in_progress" => Ok(AssessmentStatus::InProgress),
            "completed" => Ok(AssessmentStatus::Completed),
            "deactivated" => Ok(AssessmentStatus::Deactivated),
            other => Err(ContractError::UnknownVariant {
                kind: "assessment status",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Active,
    Completed,
    Cancelled,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Active => "active",
            BatchStatus::Completed => "completed",
            BatchStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = ContractError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim() {
            "active" => Ok(BatchStatus::Active),
            "completed" => Ok(BatchStatus::Completed),
            "cancelled" => Ok(BatchStatus::Cancelled),
            other => Err(ContractError::UnknownVariant {
                kind: "batch status",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Drafted,
    Issued,
    Delivered,
}

impl ReportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportStatus::Drafted => "drafted",
            ReportStatus::Issued => "issued",
            ReportStatus::Delivered => "delivered",
        }
    }

    /// Issued and delivered reports are frozen.
    pub fn is_sealed(&self) -> bool {
        matches!(self, ReportStatus::Issued | ReportStatus::Delivered)
    }
}

impl fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReportStatus {
    type Err = ContractError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim() {
            "drafted" => Ok(ReportStatus::Drafted),
            "issued" => Ok(ReportStatus::Issued),
            "delivered" => Ok(ReportStatus::Delivered),
            other => Err(ContractError::UnknownVariant {
                kind: "report status",
                value: other.to_string(),
            }),
        }
    }
}

/// Per-batch counts the reconciler derives a status from.
///
/// `released` only counts assessments that left draft state. `deactivated`
/// counts every deactivated assessment of the batch, draft or not, while
/// `released_deactivated` restricts that to released ones.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssessmentTally {
    pub total: u32,
    pub released: u32,
    pub completed: u32,
    pub deactivated: u32,
    pub released_deactivated: u32,
    pub in_flight: u32,
}

/// Derives a batch status from its tally. First matching rule wins; zero
/// released assessments fall through to `Active`.
pub fn derive_batch_status(tally: &AssessmentTally) -> BatchStatus {
    if tally.total > 0 && tally.deactivated == tally.total {
        return BatchStatus::Cancelled;
    }
    if tally.released > 0 && tally.released_deactivated == tally.released && tally.completed == 0
    {
        return BatchStatus::Cancelled;
    }
    if tally.released > 0
        && tally.completed > 0
        && tally.completed + tally.released_deactivated == tally.released
    {
        return BatchStatus::Completed;
    }
    BatchStatus::Active
}
