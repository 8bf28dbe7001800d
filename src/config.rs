use crate::credential::DecodeStrategy;
use crate::error::{ResignError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which implementation produces the per-file detached signatures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// In-process CMS via `cryptographic-message-syntax`.
    #[default]
    Native,
    /// `openssl cms -sign`.
    Openssl,
}

impl std::str::FromStr for BackendKind {
    type Err = ResignError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "native" => Ok(BackendKind::Native),
            "openssl" => Ok(BackendKind::Openssl),
            other => Err(ResignError::Config(format!("unknown backend: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub tool_timeout_secs: u64,
    pub openssl_path: Option<PathBuf>,
    pub strategies: Vec<DecodeStrategy>,
    pub backend: BackendKind,
    pub min_size_ratio: f64,
    pub compression_level: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            tool_timeout_secs: 60,
            openssl_path: None,
            strategies: DecodeStrategy::DEFAULT_ORDER.to_vec(),
            backend: BackendKind::Native,
            min_size_ratio: 0.5,
            compression_level: 6,
        }
    }
}

impl PipelineConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|e| ResignError::Config(format!("{}: {}", path.display(), e)))?;
        let config: PipelineConfig = serde_json::from_str(&contents)
            .map_err(|e| ResignError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tool_timeout_secs == 0 {
            return Err(ResignError::Config("tool_timeout_secs must be positive".to_string()));
        }
        if self.strategies.is_empty() {
            return Err(ResignError::Config("at least one decode strategy is required".to_string()));
        }
        if !(0.0..=1.0).contains(&self.min_size_ratio) {
            return Err(ResignError::Config(format!(
                "min_size_ratio must be within 0..=1, got {}",
                self.min_size_ratio
            )));
        }
        if self.compression_level > 9 {
            return Err(ResignError::Config(format!(
                "compression_level must be 0-9, got {}",
                self.compression_level
            )));
        }
        Ok(())
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }
}
