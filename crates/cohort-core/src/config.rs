use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use jsonschema::{validator_for, Validator};
use once_cell::sync::Lazy;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::canary::CanaryOptions;
use crate::shared::SharedTaskOptions;
use crate::util::{env_string, env_u64};

const DEFAULT_STATE_DIR: &str = "state";
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_LIVENESS_WINDOW_SECS: u64 = 600;
const DEFAULT_ROUND_INTERVAL_MS: u64 = 5_000;

#[derive(Debug, Default, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// Directory holding the shared SQLite database (override: COHORT_STATE_DIR)
    #[serde(default)]
    pub dir: Option<String>,
    /// How long a writer waits on a locked database (override: COHORT_SQLITE_BUSY_MS)
    #[serde(default)]
    pub busy_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct OccurrenceConfig {
    /// Identity of this process (override: COHORT_OCCURRENCE_ID; defaults to hostname)
    #[serde(default)]
    pub id: Option<String>,
    /// Static membership list. When absent, membership is derived from recent store activity.
    #[serde(default)]
    pub members: Option<Vec<String>>,
    /// Trailing window used by liveness-based membership
    #[serde(default)]
    pub liveness_window_secs: Option<u64>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct CoordinationConfig {
    #[serde(default)]
    pub round_interval_ms: Option<u64>,
    /// ACTIVE work older than this is considered stuck
    #[serde(default)]
    pub resume_stuck_after_secs: Option<u64>,
    /// Upper bound for waiting on another occurrence's shared task
    #[serde(default)]
    pub shared_task_wait_secs: Option<u64>,
    #[serde(default)]
    pub shared_task_poll_ms: Option<u64>,
    /// Look-back window when asking whether a ritual already ran
    #[serde(default)]
    pub ritual_window_hours: Option<u64>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct CanaryConfig {
    /// Share of the non-explorer occurrences placed in the early_adopter wave (0-100)
    #[serde(default)]
    pub early_adopter_percent: Option<u32>,
    /// Pause after releasing a wave before health polling starts
    #[serde(default)]
    pub grace_secs: Option<u64>,
    /// Per-wave limit for the health predicate to turn true
    #[serde(default)]
    pub health_timeout_secs: Option<u64>,
    #[serde(default)]
    pub health_poll_ms: Option<u64>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub occurrence: OccurrenceConfig,
    #[serde(default)]
    pub coordination: CoordinationConfig,
    #[serde(default)]
    pub canary: CanaryConfig,
}

static CONFIG_SCHEMA: Lazy<Validator> = Lazy::new(|| {
    let schema = schemars::schema_for!(Config);
    let schema_value = serde_json::to_value(&schema).expect("schema value");
    validator_for(&schema_value).expect("valid schema")
});

/// Returns the JSON schema describing the configuration structure.
///
/// # Panics
///
/// Panics if schema generation fails; this indicates a programming error.
pub fn config_schema_json() -> serde_json::Value {
    let schema = schemars::schema_for!(Config);
    serde_json::to_value(&schema).expect("schema json")
}

pub fn write_schema_file(path: &str) -> std::io::Result<()> {
    let schema_json = config_schema_json();
    std::fs::write(path, serde_json::to_string_pretty(&schema_json)?)
}

/// Parse and validate a TOML document against the generated schema.
pub fn parse_config(content: &str) -> Result<Config> {
    let raw: toml::Value = toml::from_str(content)?;
    let json_value = serde_json::to_value(&raw)?;
    let validation_errors: Vec<_> = CONFIG_SCHEMA
        .iter_errors(&json_value)
        .map(|e| e.to_string())
        .collect();
    if !validation_errors.is_empty() {
        return Err(anyhow::anyhow!(validation_errors.join(", ")));
    }
    let cfg: Config = toml::from_str(content)?;
    cfg.check()?;
    Ok(cfg)
}

pub fn load_config(path: &str) -> Result<Config> {
    let content = std::fs::read_to_string(path)?;
    parse_config(&content)
}

impl Config {
    /// Environment wins over the file for the handful of per-process settings.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(id) = env_string("COHORT_OCCURRENCE_ID") {
            self.occurrence.id = Some(id);
        }
        if let Some(dir) = env_string("COHORT_STATE_DIR") {
            self.store.dir = Some(dir);
        }
        if let Some(ms) = env_u64("COHORT_SQLITE_BUSY_MS") {
            self.store.busy_timeout_ms = Some(ms);
        }
        self
    }

    fn check(&self) -> Result<()> {
        if let Some(pct) = self.canary.early_adopter_percent {
            anyhow::ensure!(pct <= 100, "canary.early_adopter_percent must be 0-100, got {pct}");
        }
        for (name, value) in [
            ("canary.health_poll_ms", self.canary.health_poll_ms),
            ("coordination.shared_task_poll_ms", self.coordination.shared_task_poll_ms),
            ("coordination.round_interval_ms", self.coordination.round_interval_ms),
        ] {
            anyhow::ensure!(value != Some(0), "{name} must be at least 1");
        }
        if let Some(members) = &self.occurrence.members {
            anyhow::ensure!(
                members.iter().all(|m| !m.trim().is_empty()),
                "occurrence.members must not contain blank ids"
            );
        }
        Ok(())
    }

    pub fn state_dir(&self) -> PathBuf {
        PathBuf::from(self.store.dir.as_deref().unwrap_or(DEFAULT_STATE_DIR))
    }

    pub fn kernel_options(&self) -> cohort_kernel::KernelOptions {
        cohort_kernel::KernelOptions::from_env().with_busy_timeout(Duration::from_millis(
            self.store.busy_timeout_ms.unwrap_or(DEFAULT_BUSY_TIMEOUT_MS),
        ))
    }

    /// Configured occurrence id, else the host name.
    pub fn occurrence_id(&self) -> Option<String> {
        self.occurrence
            .id
            .clone()
            .or_else(|| env_string("HOSTNAME"))
            .or_else(|| env_string("COMPUTERNAME"))
    }

    pub fn liveness_window(&self) -> Duration {
        Duration::from_secs(
            self.occurrence
                .liveness_window_secs
                .unwrap_or(DEFAULT_LIVENESS_WINDOW_SECS),
        )
    }

    pub fn round_interval(&self) -> Duration {
        Duration::from_millis(
            self.coordination
                .round_interval_ms
                .unwrap_or(DEFAULT_ROUND_INTERVAL_MS)
                .max(1),
        )
    }

    pub fn shared_task_options(&self) -> SharedTaskOptions {
        let d = SharedTaskOptions::default();
        let c = &self.coordination;
        SharedTaskOptions {
            resume_stuck_after: c
                .resume_stuck_after_secs
                .map(Duration::from_secs)
                .unwrap_or(d.resume_stuck_after),
            wait_timeout: c
                .shared_task_wait_secs
                .map(Duration::from_secs)
                .unwrap_or(d.wait_timeout),
            poll_interval: c
                .shared_task_poll_ms
                .map(|ms| Duration::from_millis(ms.max(1)))
                .unwrap_or(d.poll_interval),
            ritual_window: c
                .ritual_window_hours
                .map(|h| Duration::from_secs(h.saturating_mul(3600)))
                .unwrap_or(d.ritual_window),
        }
    }

    pub fn canary_options(&self) -> CanaryOptions {
        let d = CanaryOptions::default();
        let c = &self.canary;
        CanaryOptions {
            early_adopter_percent: c.early_adopter_percent.unwrap_or(d.early_adopter_percent),
            grace: c.grace_secs.map(Duration::from_secs).unwrap_or(d.grace),
            health_timeout: c
                .health_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(d.health_timeout),
            health_poll: c
                .health_poll_ms
                .map(|ms| Duration::from_millis(ms.max(1)))
                .unwrap_or(d.health_poll),
        }
    }
}
