//! Pipeline configuration
//!
//! Loaded from JSON; every field has a default so an empty object is a
//! valid configuration.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::{PipelineError, PipelineResult};
use crate::observability::{Logger, Severity};

/// Where stage computation runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionEnvironment {
    /// Raw partition results are assembled here, in the client
    #[default]
    Client,
    /// Partial results were already computed next to the data
    Compute,
}

/// Pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Page size hint passed to fetches and used for GROUP BY emit pages (default: 100)
    #[serde(default = "default_max_item_count")]
    pub max_item_count: usize,

    /// Stage variant selection (default: client)
    #[serde(default)]
    pub execution_environment: ExecutionEnvironment,

    /// Consecutive split/merge signals tolerated for one range (default: 8)
    #[serde(default = "default_max_topology_retries")]
    pub max_topology_retries: u32,

    /// Reject longer continuation tokens before parsing (default: unlimited)
    #[serde(default)]
    pub max_continuation_token_bytes: Option<usize>,

    /// Minimum severity written by the logger (default: WARN)
    #[serde(default = "default_log_min_severity")]
    pub log_min_severity: Severity,
}

fn default_max_item_count() -> usize {
    100
}

fn default_max_topology_retries() -> u32 {
    8
}

fn default_log_min_severity() -> Severity {
    Severity::Warn
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_item_count: default_max_item_count(),
            execution_environment: ExecutionEnvironment::default(),
            max_topology_retries: default_max_topology_retries(),
            max_continuation_token_bytes: None,
            log_min_severity: default_log_min_severity(),
        }
    }
}

impl PipelineConfig {
    /// Default config with the given page size hint
    pub fn with_max_item_count(max_item_count: usize) -> Self {
        Self {
            max_item_count,
            ..Default::default()
        }
    }

    /// Same config targeting another execution environment
    pub fn in_environment(mut self, environment: ExecutionEnvironment) -> Self {
        self.execution_environment = environment;
        self
    }

    /// Parse and validate a JSON document
    pub fn from_json_str(json: &str) -> PipelineResult<Self> {
        let config: PipelineConfig = serde_json::from_str(json)
            .map_err(|e| PipelineError::InvalidArgument(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON config file
    pub fn load(path: &Path) -> PipelineResult<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            PipelineError::InvalidArgument(format!(
                "cannot read config {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_json_str(&content)
    }

    pub fn validate(&self) -> PipelineResult<()> {
        if self.max_item_count == 0 {
            return Err(PipelineError::InvalidArgument(
                "max_item_count must be greater than 0".to_string(),
            ));
        }
        if self.max_topology_retries == 0 {
            return Err(PipelineError::InvalidArgument(
                "max_topology_retries must be greater than 0".to_string(),
            ));
        }
        if self.max_continuation_token_bytes == Some(0) {
            return Err(PipelineError::InvalidArgument(
                "max_continuation_token_bytes must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Make `log_min_severity` the process-wide logging threshold
    pub fn apply_logging(&self) {
        Logger::set_min_severity(self.log_min_severity);
    }
}
