use std::fmt::Display;
use tracing::warn;

/// Outcome of a side-channel operation whose failure must not abort the
/// surrounding unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use = "inspect or deliberately discard the outcome"]
pub enum BestEffort<T> {
    Done(T),
    Failed(String),
}

impl<T> BestEffort<T> {
    pub fn is_done(&self) -> bool {
        matches!(self, BestEffort::Done(_))
    }

    pub fn ok(self) -> Option<T> {
        match self {
            BestEffort::Done(value) => Some(value),
            BestEffort::Failed(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&str> {
        match self {
            BestEffort::Done(_) => None,
            BestEffort::Failed(message) => Some(message),
        }
    }

    /// Explicitly drops the outcome. Failures were already logged.
    pub fn ignore(self) {}
}

/// Runs `op`, logging and capturing any error instead of returning it.
pub fn best_effort<T, E, F>(label: &str, op: F) -> BestEffort<T>
where
    E: Display,
    F: FnOnce() -> Result<T, E>,
{
    match op() {
        Ok(value) => BestEffort::Done(value),
        Err(err) => {
            let message = err.to_string();
            warn!(event = "best_effort_failed", op = label, error = %message);
            BestEffort::Failed(message)
        }
    }
}
