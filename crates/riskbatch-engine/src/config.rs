use crate::EngineError;
use riskbatch_core::scoring::GroupCatalog;
use std::path::PathBuf;

pub const DEFAULT_REQUIRED_ANSWERS: u32 = 37;
pub const DEFAULT_DRAIN_BATCH_SIZE: u32 = 10;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Distinct (group, item) answers that make an assessment complete.
    pub required_answers: u32,
    /// Finalized batches go to the emission queue instead of emitting inline.
    pub skip_immediate_emission: bool,
    pub artifact_dir: PathBuf,
    pub drain_batch_size: u32,
    pub catalog: GroupCatalog,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            required_answers: DEFAULT_REQUIRED_ANSWERS,
            skip_immediate_emission: false,
            artifact_dir: PathBuf::from("reports"),
            drain_batch_size: DEFAULT_DRAIN_BATCH_SIZE,
            catalog: GroupCatalog::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, EngineError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`EngineConfig::from_env`] with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, EngineError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup("RISKBATCH_REQUIRED_ANSWERS") {
            config.required_answers = parse_positive("RISKBATCH_REQUIRED_ANSWERS", &value)?;
        }
        if let Some(value) = lookup("RISKBATCH_SKIP_IMMEDIATE_EMISSION") {
            config.skip_immediate_emission = is_truthy(&value);
        }
        if let Some(value) = lookup("RISKBATCH_ARTIFACT_DIR") {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                config.artifact_dir = PathBuf::from(trimmed);
            }
        }
        if let Some(value) = lookup("RISKBATCH_DRAIN_BATCH_SIZE") {
            config.drain_batch_size = parse_positive("RISKBATCH_DRAIN_BATCH_SIZE", &value)?;
        }

        Ok(config)
    }
}

pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_positive(key: &str, value: &str) -> Result<u32, EngineError> {
    match value.trim().parse::<u32>() {
        Ok(parsed) if parsed > 0 => Ok(parsed),
        _ => Err(EngineError::Config(format!(
            "{key} must be a positive integer, got {value:?}"
        ))),
    }
}
