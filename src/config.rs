//! Pipeline configuration.
//!
//! Settings load from `stagecraft.toml` under the isolation root, with
//! serde-supplied defaults for anything omitted. The configuration is an
//! explicit struct threaded through orchestrator construction — there is no
//! ambient global state.
//!
//! # Configuration File Format
//!
//! ```toml
//! [retry]
//! max_retries = 3
//! backoff_base_ms = 250
//!
//! [worker]
//! command = "claude"
//! args = ["--output-format", "stream-json"]
//!
//! [isolation]
//! lifetime = "session"
//!
//! [limits]
//! lock_timeout_ms = 5000
//!
//! [thresholds.development]
//! coverage = { min = 80.0 }
//! critical_defects = { eq = 0.0 }
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::gate::ThresholdSpec;
use crate::isolation::ScopeLifetime;
use crate::stage::Stage;

/// Configuration filename under the isolation root.
pub const CONFIG_FILE: &str = "stagecraft.toml";

/// Retry policy for transient worker failures.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Worker invocations per stage attempt before the run aborts
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// First backoff delay; doubles per subsequent retry
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    250
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
        }
    }
}

/// How to launch the external stage worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_worker_command")]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

fn default_worker_command() -> String {
    "claude".to_string()
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            command: default_worker_command(),
            args: Vec::new(),
        }
    }
}

/// Default scope lifetime for new runs.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct IsolationConfig {
    #[serde(default)]
    pub lifetime: ScopeLifetime,
}

/// Operational limits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// How long a writer waits for the state lock before failing
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

fn default_lock_timeout_ms() -> u64 {
    5_000
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

/// The full pipeline configuration document.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub isolation: IsolationConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Per-stage, per-metric gate thresholds
    #[serde(default)]
    pub thresholds: BTreeMap<Stage, BTreeMap<String, ThresholdSpec>>,
}

impl PipelineConfig {
    /// The configuration scaffolded by `stagecraft init`: the default knobs
    /// plus coverage/critical-defect gates on the code-producing stages.
    pub fn starter() -> Self {
        let mut thresholds = BTreeMap::new();
        for stage in [Stage::Development, Stage::Qa] {
            let mut per_metric = BTreeMap::new();
            per_metric.insert("coverage".to_string(), ThresholdSpec::min(80.0));
            per_metric.insert("critical_defects".to_string(), ThresholdSpec::eq(0.0));
            thresholds.insert(stage, per_metric);
        }
        Self {
            thresholds,
            ..Default::default()
        }
    }

    /// Load from `<root>/stagecraft.toml`, falling back to defaults when the
    /// file does not exist.
    pub fn load_or_default(root: &Path) -> Result<Self> {
        let path = root.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: PipelineConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Write the document to `<root>/stagecraft.toml`.
    pub fn save(&self, root: &Path) -> Result<()> {
        let path = root.join(CONFIG_FILE);
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Sanity warnings for `stagecraft validate`. An empty result means the
    /// configuration is usable.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.retry.max_retries == 0 {
            warnings.push("retry.max_retries is 0; any worker failure aborts the run".to_string());
        }
        if self.worker.command.trim().is_empty() {
            warnings.push("worker.command is empty".to_string());
        }
        for (stage, per_metric) in &self.thresholds {
            for (metric, spec) in per_metric {
                if spec.min.is_none() && spec.max.is_none() && spec.eq.is_none() {
                    warnings.push(format!(
                        "threshold {}/{} declares no bounds and can never block",
                        stage, metric
                    ));
                }
                if let (Some(min), Some(max)) = (spec.min, spec.max)
                    && min > max
                {
                    warnings.push(format!(
                        "threshold {}/{} has min {} above max {}",
                        stage, metric, min, max
                    ));
                }
            }
        }
        warnings
    }
}
