use crate::ContractError;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Durable storage for rendered report artifacts.
pub trait ArtifactSink {
    /// Stores `bytes` under `key` and returns the location it can be read from.
    fn put(&self, key: &str, bytes: &[u8]) -> Result<String, ContractError>;
}

/// Writes artifacts below a root directory. Each write lands in a temp file
/// first and is renamed into place, so readers never see a partial artifact.
#[derive(Debug, Clone)]
pub struct FsArtifactSink {
    root: PathBuf,
}

impl FsArtifactSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, ContractError> {
        let relative = Path::new(key);
        let escapes = relative.is_absolute()
            || relative
                .components()
                .any(|component| matches!(component, std::path::Component::ParentDir));
        if key.trim().is_empty() || escapes {
            return Err(ContractError::ArtifactWrite {
                key: key.to_string(),
                reason: "artifact key must be a relative path inside the sink".to_string(),
            });
        }
        Ok(self.root.join(relative))
    }
}

impl ArtifactSink for FsArtifactSink {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<String, ContractError> {
        let target = self.resolve(key)?;
        let write_err = |err: std::io::Error| ContractError::ArtifactWrite {
            key: key.to_string(),
            reason: err.to_string(),
        };

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(write_err)?;
        }
        let staging = target.with_extension(format!(
            "{}.partial",
            target
                .extension()
                .and_then(|ext| ext.to_str())
                .unwrap_or("bin")
        ));
        {
            let mut file = fs::File::create(&staging).map_err(write_err)?;
            file.write_all(bytes).map_err(write_err)?;
            file.sync_all().map_err(write_err)?;
        }
        fs::rename(&staging, &target).map_err(write_err)?;

        Ok(target.to_string_lossy().into_owned())
    }
}
