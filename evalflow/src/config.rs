//! Engine configuration.
//!
//! Configuration is layered: built-in defaults, then a JSON document, then
//! `EVALFLOW_*` environment variables.

use crate::errors::{ConfigError, RegistryValidationError};
use crate::pipeline::{PolicyOverride, RetryExecutor, StageRegistry};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Prefix shared by every environment variable the engine reads.
pub const ENV_PREFIX: &str = "EVALFLOW_";

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Override layered onto every stage's policy, below `stages`.
    #[serde(default)]
    pub policy: PolicyOverride,
    /// Upper bound of the random jitter added to each backoff, in ms.
    #[serde(default = "default_max_jitter_ms")]
    pub max_jitter_ms: u64,
    /// Worker pool settings.
    #[serde(default)]
    pub worker: WorkerConfig,
    /// Logging settings.
    #[serde(default)]
    pub log: LogConfig,
    /// Per-stage policy overrides, keyed by stage name.
    #[serde(default)]
    pub stages: HashMap<String, PolicyOverride>,
}

fn default_max_jitter_ms() -> u64 {
    crate::pipeline::DEFAULT_MAX_JITTER_MS
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            policy: PolicyOverride::default(),
            max_jitter_ms: default_max_jitter_ms(),
            worker: WorkerConfig::default(),
            log: LogConfig::default(),
            stages: HashMap::new(),
        }
    }
}

impl EngineConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a JSON document; missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] if the text is not valid for the schema.
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Reads and parses a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    /// Loads defaults overlaid with the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable holds an unparsable value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env_overrides(|key| std::env::var(key).ok())
    }

    /// Overlays environment variables resolved through `lookup`.
    ///
    /// Recognized keys (all prefixed with `EVALFLOW_`): `MAX_ATTEMPTS`,
    /// `BASE_DELAY_MS` and `TIMEOUT_MS` set the all-stage policy override;
    /// `MAX_JITTER_MS`, `WORKER_CONCURRENCY`, `WORKER_CHANNEL_CAPACITY`,
    /// `QUEUE_NAME`, `LOG_FILTER` and `LOG_JSON` set the matching fields.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for unparsable values.
    pub fn with_env_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let env = EnvReader { lookup: &lookup };

        if let Some(value) = env.parse("MAX_ATTEMPTS")? {
            self.policy.max_attempts = Some(value);
        }
        if let Some(value) = env.parse("BASE_DELAY_MS")? {
            self.policy.base_delay_ms = Some(value);
        }
        if let Some(value) = env.parse("TIMEOUT_MS")? {
            self.policy.timeout_ms = Some(value);
        }
        if let Some(value) = env.parse("MAX_JITTER_MS")? {
            self.max_jitter_ms = value;
        }
        if let Some(value) = env.parse("WORKER_CONCURRENCY")? {
            self.worker.concurrency = value;
        }
        if let Some(value) = env.parse("WORKER_CHANNEL_CAPACITY")? {
            self.worker.channel_capacity = value;
        }
        if let Some(value) = env.raw("QUEUE_NAME") {
            self.worker.queue_name = value;
        }
        if let Some(value) = env.raw("LOG_FILTER") {
            self.log.filter = value;
        }
        if let Some(value) = env.parse("LOG_JSON")? {
            self.log.json = value;
        }
        Ok(self)
    }

    /// Returns the override for a stage: `policy`, then the stage's entry.
    #[must_use]
    pub fn override_for(&self, stage: &str) -> PolicyOverride {
        self.stages
            .get(stage)
            .map_or(self.policy, |over| self.policy.then(*over))
    }

    /// Applies the all-stage and per-stage overrides to a registry.
    ///
    /// # Errors
    ///
    /// Returns an error if an override names an unknown stage or yields an
    /// invalid policy.
    pub fn apply_overrides(
        &self,
        registry: &StageRegistry,
    ) -> Result<StageRegistry, RegistryValidationError> {
        let mut overrides: HashMap<String, PolicyOverride> = registry
            .names()
            .into_iter()
            .map(|name| (name.to_string(), self.policy))
            .collect();
        for name in self.stages.keys() {
            overrides.insert(name.clone(), self.override_for(name));
        }
        registry.with_overrides(&overrides)
    }

    /// Returns the maximum backoff jitter.
    #[must_use]
    pub fn max_jitter(&self) -> Duration {
        Duration::from_millis(self.max_jitter_ms)
    }

    /// Builds the retry executor described by this configuration.
    #[must_use]
    pub fn executor(&self) -> RetryExecutor {
        RetryExecutor::new(self.max_jitter())
    }
}

/// Worker pool settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Maximum runs executing at once.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Name of the queue the worker consumes.
    #[serde(default = "default_queue_name")]
    pub queue_name: String,
    /// Capacity of the in-process request channel.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_concurrency() -> usize {
    2
}

fn default_queue_name() -> String {
    "evaluation".to_string()
}

fn default_channel_capacity() -> usize {
    64
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            queue_name: default_queue_name(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// `EnvFilter` directives, e.g. `info,evalflow=debug`.
    #[serde(default = "default_log_filter")]
    pub filter: String,
    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
    /// Include span events (enter/close) in the output.
    #[serde(default)]
    pub span_events: bool,
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            json: false,
            span_events: false,
        }
    }
}

struct EnvReader<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<'_, F> {
    fn raw(&self, suffix: &str) -> Option<String> {
        (self.lookup)(&format!("{ENV_PREFIX}{suffix}")).filter(|v| !v.trim().is_empty())
    }

    fn parse<T: FromStr>(&self, suffix: &str) -> Result<Option<T>, ConfigError> {
        let Some(value) = self.raw(suffix) else {
            return Ok(None);
        };
        value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: format!("{ENV_PREFIX}{suffix}"),
                value,
            })
    }
}
