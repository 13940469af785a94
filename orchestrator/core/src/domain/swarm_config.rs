// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Swarm Supervisor Configuration
//
// Construction-time settings for one orchestrator instance:
// - swarm identity and bundle location
// - the initial desired agent/connector set
// - crash backoff and shutdown grace tuning
// - reconcile cadence and inter-agent call depth
// - worker runner commands and logging

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::domain::backoff::CrashBackoffPolicy;
use crate::domain::desired_state::DesiredState;
use crate::domain::spawner::WorkerSpec;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwarmConfig {
    /// Swarm name, attached to every log line and passed to workers
    pub swarm_name: String,

    /// Directory of the resource bundle the workers load
    pub bundle_dir: PathBuf,

    /// Agents that should always have a running `default` instance
    #[serde(default)]
    pub desired_agents: Vec<String>,

    /// Connectors that should always be running
    #[serde(default)]
    pub desired_connectors: Vec<String>,

    /// Consecutive crashes tolerated before crash-loop backoff kicks in
    #[serde(default = "default_crash_threshold")]
    pub crash_threshold: u32,

    /// First backoff delay once the threshold is exceeded
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Upper bound for the doubling backoff delay
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Time a worker gets to acknowledge shutdown before SIGKILL
    #[serde(default = "default_grace_period_ms")]
    pub default_grace_period_ms: u64,

    /// Period of the background reconcile loop
    #[serde(default = "default_reconcile_interval_ms")]
    pub reconcile_interval_ms: u64,

    /// Longest allowed chain of nested cross-agent requests
    #[serde(default = "default_max_call_depth")]
    pub max_call_depth: usize,

    /// Commands used to launch worker processes
    #[serde(default)]
    pub runner: RunnerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerConfig {
    /// Program and leading arguments for agent workers
    #[serde(default = "default_agent_command")]
    pub agent_command: Vec<String>,

    /// Program and leading arguments for connector workers
    #[serde(default = "default_connector_command")]
    pub connector_command: Vec<String>,

    /// Extra environment passed to every worker
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            agent_command: default_agent_command(),
            connector_command: default_connector_command(),
            env: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (e.g., "info", "debug", "trace")
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format ("json" or "text")
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SwarmConfigError {
    #[error("swarmName cannot be empty")]
    EmptySwarmName,
    #[error("initialBackoffMs must be greater than zero")]
    ZeroInitialBackoff,
    #[error("maxBackoffMs ({max}) must not be smaller than initialBackoffMs ({initial})")]
    MaxBackoffBelowInitial { initial: u64, max: u64 },
    #[error("reconcileIntervalMs must be greater than zero")]
    ZeroReconcileInterval,
    #[error("maxCallDepth must be at least 1")]
    ZeroCallDepth,
    #[error("{kind} name cannot be empty")]
    EmptyName { kind: &'static str },
    #[error("{kind} '{name}' is declared more than once")]
    DuplicateName { kind: &'static str, name: String },
    #[error("runner.{field} must name a program")]
    EmptyRunnerCommand { field: &'static str },
    #[error("Invalid log format '{0}'. Expected 'json' or 'text'")]
    InvalidLogFormat(String),
}

impl SwarmConfig {
    pub fn new(swarm_name: impl Into<String>, bundle_dir: impl Into<PathBuf>) -> Self {
        Self {
            swarm_name: swarm_name.into(),
            bundle_dir: bundle_dir.into(),
            desired_agents: Vec::new(),
            desired_connectors: Vec::new(),
            crash_threshold: default_crash_threshold(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            default_grace_period_ms: default_grace_period_ms(),
            reconcile_interval_ms: default_reconcile_interval_ms(),
            max_call_depth: default_max_call_depth(),
            runner: RunnerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read swarm config at {:?}: {}", path, e))?;
        Self::from_yaml_str(&content)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(val) = lookup("AEGIS_SWARM_RECONCILE_INTERVAL_MS") {
            match val.parse() {
                Ok(ms) => {
                    tracing::info!("Environment override: AEGIS_SWARM_RECONCILE_INTERVAL_MS={}", ms);
                    self.reconcile_interval_ms = ms;
                }
                Err(_) => tracing::warn!(
                    "Invalid value for AEGIS_SWARM_RECONCILE_INTERVAL_MS: '{}'. Ignoring.",
                    val
                ),
            }
        }

        if let Some(val) = lookup("AEGIS_SWARM_CRASH_THRESHOLD") {
            match val.parse() {
                Ok(threshold) => {
                    tracing::info!("Environment override: AEGIS_SWARM_CRASH_THRESHOLD={}", threshold);
                    self.crash_threshold = threshold;
                }
                Err(_) => tracing::warn!(
                    "Invalid value for AEGIS_SWARM_CRASH_THRESHOLD: '{}'. Ignoring.",
                    val
                ),
            }
        }

        if let Some(val) = lookup("AEGIS_SWARM_LOG_LEVEL") {
            self.logging.level = val;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), SwarmConfigError> {
        if self.swarm_name.trim().is_empty() {
            return Err(SwarmConfigError::EmptySwarmName);
        }
        if self.initial_backoff_ms == 0 {
            return Err(SwarmConfigError::ZeroInitialBackoff);
        }
        if self.max_backoff_ms < self.initial_backoff_ms {
            return Err(SwarmConfigError::MaxBackoffBelowInitial {
                initial: self.initial_backoff_ms,
                max: self.max_backoff_ms,
            });
        }
        if self.reconcile_interval_ms == 0 {
            return Err(SwarmConfigError::ZeroReconcileInterval);
        }
        if self.max_call_depth == 0 {
            return Err(SwarmConfigError::ZeroCallDepth);
        }

        check_names("agent", &self.desired_agents)?;
        check_names("connector", &self.desired_connectors)?;

        if self.runner.agent_command.is_empty() {
            return Err(SwarmConfigError::EmptyRunnerCommand { field: "agentCommand" });
        }
        if self.runner.connector_command.is_empty() {
            return Err(SwarmConfigError::EmptyRunnerCommand { field: "connectorCommand" });
        }

        match self.logging.format.as_str() {
            "json" | "text" => Ok(()),
            other => Err(SwarmConfigError::InvalidLogFormat(other.to_string())),
        }
    }

    pub fn backoff_policy(&self) -> CrashBackoffPolicy {
        CrashBackoffPolicy::new(self.crash_threshold, self.initial_backoff_ms, self.max_backoff_ms)
    }

    pub fn desired_state(&self) -> DesiredState {
        DesiredState::from_names(
            self.desired_agents.iter().cloned(),
            self.desired_connectors.iter().cloned(),
        )
    }

    pub fn worker_spec(&self) -> WorkerSpec {
        WorkerSpec {
            swarm_name: self.swarm_name.clone(),
            bundle_dir: self.bundle_dir.clone(),
            env: self.runner.env.clone(),
        }
    }

    pub fn default_grace_period(&self) -> Duration {
        Duration::from_millis(self.default_grace_period_ms)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }
}

fn check_names(kind: &'static str, names: &[String]) -> Result<(), SwarmConfigError> {
    let mut seen = HashSet::new();
    for name in names {
        if name.trim().is_empty() {
            return Err(SwarmConfigError::EmptyName { kind });
        }
        if !seen.insert(name.as_str()) {
            return Err(SwarmConfigError::DuplicateName {
                kind,
                name: name.clone(),
            });
        }
    }
    Ok(())
}

// Default value functions
fn default_crash_threshold() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    300_000
}

fn default_grace_period_ms() -> u64 {
    30_000
}

fn default_reconcile_interval_ms() -> u64 {
    5000
}

fn default_max_call_depth() -> usize {
    8
}

fn default_agent_command() -> Vec<String> {
    vec!["aegis-agent-runner".to_string()]
}

fn default_connector_command() -> Vec<String> {
    vec!["aegis-connector-runner".to_string()]
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}
