//! Configuration type definitions for the relay core
//!
//! Every knob has a serde default so a minimal YAML file (or none at all) yields a
//! working configuration. Time values are stored in seconds or milliseconds as plain
//! integers and exposed as `Duration` through accessor methods.

use crate::errors::RelayError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RelayConfig {
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub sessions: SessionConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub devices: DeviceConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_worker_command")]
    pub command: String,
    #[serde(default = "default_worker_args")]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default = "default_stall_threshold_secs")]
    pub stall_threshold_secs: u64,
    /// Exit codes that mean "stopped by a resource or turn limit".
    #[serde(default = "default_soft_stop_exit_codes")]
    pub soft_stop_exit_codes: Vec<i32>,
    /// Unix signals that mean the same thing when they terminate the worker.
    #[serde(default = "default_soft_stop_signals")]
    pub soft_stop_signals: Vec<i32>,
    /// `result` subtypes reported by the worker that count as a soft stop.
    #[serde(default = "default_soft_stop_subtypes")]
    pub soft_stop_subtypes: Vec<String>,
    #[serde(default = "default_soft_stop_message")]
    pub soft_stop_message: String,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    #[serde(default = "default_session_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,
    /// Forward tool-use and permission events as progress notifications.
    #[serde(default = "default_true")]
    pub progress_notifications: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_dedup_window_secs")]
    pub dedup_window_secs: u64,
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default = "default_liveness_window_secs")]
    pub liveness_window_secs: u64,
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    #[serde(default = "default_device_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    #[serde(default = "default_dedup_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_dedup_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
    #[serde(default = "default_preview_chars")]
    pub preview_chars: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_step_ms")]
    pub backoff_step_ms: u64,
    #[serde(default = "default_fan_out_concurrency")]
    pub fan_out_concurrency: usize,
    #[serde(default = "default_progress_ttl_secs")]
    pub progress_ttl_secs: u64,
    #[serde(default = "default_result_ttl_secs")]
    pub result_ttl_secs: u64,
    #[serde(default = "default_body_ttl_secs")]
    pub body_ttl_secs: u64,
    #[serde(default)]
    pub expo: ExpoConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpoConfig {
    #[serde(default = "default_expo_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub access_token_env: Option<String>,
    #[serde(default = "default_expo_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    #[serde(default = "default_continue_prompt")]
    pub continue_prompt: String,
    #[serde(default = "default_approve_prompt")]
    pub approve_prompt: String,
    #[serde(default = "default_repeated_failure_threshold")]
    pub repeated_failure_threshold: u32,
    /// Extra regex patterns treated as destructive-action confirmations.
    #[serde(default)]
    pub destructive_patterns: Vec<String>,
    #[serde(default)]
    pub rules: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            command: default_worker_command(),
            args: default_worker_args(),
            env: HashMap::new(),
            stall_threshold_secs: default_stall_threshold_secs(),
            soft_stop_exit_codes: default_soft_stop_exit_codes(),
            soft_stop_signals: default_soft_stop_signals(),
            soft_stop_subtypes: default_soft_stop_subtypes(),
            soft_stop_message: default_soft_stop_message(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout_secs(),
            buffer_capacity: default_buffer_capacity(),
            sweep_interval_secs: default_session_sweep_interval_secs(),
            health_interval_secs: default_health_interval_secs(),
            progress_notifications: true,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            dedup_window_secs: default_dedup_window_secs(),
            max_pending: default_max_pending(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            liveness_window_secs: default_liveness_window_secs(),
            retention_secs: default_retention_secs(),
            sweep_interval_secs: default_device_sweep_interval_secs(),
        }
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            window_secs: default_dedup_window_secs(),
            sweep_interval_secs: default_dedup_sweep_interval_secs(),
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: default_max_payload_bytes(),
            preview_chars: default_preview_chars(),
            max_attempts: default_max_attempts(),
            backoff_step_ms: default_backoff_step_ms(),
            fan_out_concurrency: default_fan_out_concurrency(),
            progress_ttl_secs: default_progress_ttl_secs(),
            result_ttl_secs: default_result_ttl_secs(),
            body_ttl_secs: default_body_ttl_secs(),
            expo: ExpoConfig::default(),
        }
    }
}

impl Default for ExpoConfig {
    fn default() -> Self {
        Self {
            endpoint: default_expo_endpoint(),
            access_token: None,
            access_token_env: None,
            timeout_secs: default_expo_timeout_secs(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_iterations: default_max_iterations(),
            confidence_threshold: default_confidence_threshold(),
            history_window: default_history_window(),
            continue_prompt: default_continue_prompt(),
            approve_prompt: default_approve_prompt(),
            repeated_failure_threshold: default_repeated_failure_threshold(),
            destructive_patterns: Vec::new(),
            rules: Vec::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl WorkerConfig {
    pub fn stall_threshold(&self) -> Duration {
        Duration::from_secs(self.stall_threshold_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl SessionConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }
}

impl QueueConfig {
    pub fn dedup_window(&self) -> Duration {
        Duration::from_secs(self.dedup_window_secs)
    }
}

impl DeviceConfig {
    pub fn liveness_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.liveness_window_secs as i64)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.retention_secs as i64)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl DedupConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl DeliveryConfig {
    pub fn backoff_step(&self) -> Duration {
        Duration::from_millis(self.backoff_step_ms)
    }

    pub fn body_ttl(&self) -> Duration {
        Duration::from_secs(self.body_ttl_secs)
    }
}

impl RelayConfig {
    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.worker.command.trim().is_empty() {
            return Err(RelayError::ConfigError(
                "worker.command must not be empty".to_string(),
            ));
        }
        if self.worker.stall_threshold_secs == 0 {
            return Err(RelayError::ConfigError(
                "worker.stall_threshold_secs must be greater than zero".to_string(),
            ));
        }
        if self.sessions.buffer_capacity == 0 {
            return Err(RelayError::ConfigError(
                "sessions.buffer_capacity must be greater than zero".to_string(),
            ));
        }
        if self.devices.retention_secs < self.devices.liveness_window_secs {
            return Err(RelayError::ConfigError(format!(
                "devices.retention_secs ({}) must be at least devices.liveness_window_secs ({})",
                self.devices.retention_secs, self.devices.liveness_window_secs
            )));
        }
        // The smallest pointer-only notification is roughly 120 bytes once serialized.
        if self.delivery.max_payload_bytes < 256 {
            return Err(RelayError::ConfigError(
                "delivery.max_payload_bytes must be at least 256".to_string(),
            ));
        }
        if self.delivery.max_attempts == 0 {
            return Err(RelayError::ConfigError(
                "delivery.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.delivery.fan_out_concurrency == 0 {
            return Err(RelayError::ConfigError(
                "delivery.fan_out_concurrency must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.agent.confidence_threshold) {
            return Err(RelayError::ConfigError(format!(
                "agent.confidence_threshold must be within 0.0..=1.0, got {}",
                self.agent.confidence_threshold
            )));
        }
        if self.agent.history_window == 0 {
            return Err(RelayError::ConfigError(
                "agent.history_window must be greater than zero".to_string(),
            ));
        }
        for pattern in &self.agent.destructive_patterns {
            regex::Regex::new(pattern).map_err(|e| {
                RelayError::ConfigError(format!(
                    "Invalid agent.destructive_patterns entry '{}': {}",
                    pattern, e
                ))
            })?;
        }
        Ok(())
    }
}

fn default_worker_command() -> String {
    "claude".to_string()
}

fn default_worker_args() -> Vec<String> {
    vec![
        "--print".to_string(),
        "--input-format".to_string(),
        "stream-json".to_string(),
        "--output-format".to_string(),
        "stream-json".to_string(),
        "--verbose".to_string(),
    ]
}

fn default_stall_threshold_secs() -> u64 {
    300
}

fn default_soft_stop_exit_codes() -> Vec<i32> {
    Vec::new()
}

fn default_soft_stop_signals() -> Vec<i32> {
    // SIGXCPU, SIGXFSZ
    vec![24, 25]
}

fn default_soft_stop_subtypes() -> Vec<String> {
    vec!["error_max_turns".to_string()]
}

fn default_soft_stop_message() -> String {
    "The assistant paused after reaching its turn limit. Send another message to continue."
        .to_string()
}

fn default_shutdown_grace_secs() -> u64 {
    5
}

fn default_idle_timeout_secs() -> u64 {
    30 * 60
}

fn default_buffer_capacity() -> usize {
    50
}

fn default_session_sweep_interval_secs() -> u64 {
    60
}

fn default_health_interval_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_dedup_window_secs() -> u64 {
    30
}

fn default_max_pending() -> usize {
    100
}

fn default_liveness_window_secs() -> u64 {
    10 * 60
}

fn default_retention_secs() -> u64 {
    30 * 24 * 60 * 60
}

fn default_device_sweep_interval_secs() -> u64 {
    60 * 60
}

fn default_dedup_sweep_interval_secs() -> u64 {
    60
}

fn default_max_payload_bytes() -> usize {
    4096
}

fn default_preview_chars() -> usize {
    180
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_step_ms() -> u64 {
    500
}

fn default_fan_out_concurrency() -> usize {
    8
}

fn default_progress_ttl_secs() -> u64 {
    60
}

fn default_result_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_body_ttl_secs() -> u64 {
    60 * 60
}

fn default_expo_endpoint() -> String {
    "https://exp.host/--/api/v2/push/send".to_string()
}

fn default_expo_timeout_secs() -> u64 {
    10
}

fn default_max_iterations() -> u32 {
    10
}

fn default_confidence_threshold() -> f64 {
    0.7
}

fn default_history_window() -> usize {
    20
}

fn default_continue_prompt() -> String {
    "Continue with the next step.".to_string()
}

fn default_approve_prompt() -> String {
    "Yes, go ahead.".to_string()
}

fn default_repeated_failure_threshold() -> u32 {
    3
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Where a worker should run; resolved per session.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub session_id: String,
    pub working_directory: PathBuf,
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

impl WorkerSpec {
    pub fn from_config(config: &WorkerConfig, session_id: &str, working_directory: PathBuf) -> Self {
        Self {
            session_id: session_id.to_string(),
            working_directory,
            command: config.command.clone(),
            args: config.args.clone(),
            env: config.env.clone(),
        }
    }
}
