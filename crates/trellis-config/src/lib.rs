//! # Trellis Config
//!
//! Single-file configuration for the Trellis engine.
//! One `trellis.yaml` configures engine limits, retry defaults, the code
//! sandbox, the idempotency cache, observability and sandbox tools.

mod loader;

pub use loader::{load_config, parse_config, validate_config, ConfigError};

use serde::Deserialize;
use std::path::PathBuf;

/// Top-level configuration schema for Trellis.
#[derive(Debug, Clone, Deserialize)]
pub struct TrellisConfig {
    /// Config schema version.
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub app: AppConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
    /// Sandbox tools available to plans
    #[serde(default)]
    pub tools: Vec<ToolSpec>,
}

fn default_version() -> u32 {
    1
}

impl Default for TrellisConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            app: AppConfig::default(),
            engine: EngineConfig::default(),
            retry: RetryConfig::default(),
            sandbox: SandboxConfig::default(),
            cache: CacheConfig::default(),
            observability: ObservabilityConfig::default(),
            tools: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_app_name")]
    pub name: String,
    #[serde(default = "default_env")]
    pub environment: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            environment: default_env(),
        }
    }
}

fn default_app_name() -> String {
    "trellis".to_string()
}

fn default_env() -> String {
    "development".to_string()
}

/// Plan-wide resource limits. Absent bounds mean unbounded.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default)]
    pub max_total_cost: Option<f64>,
    #[serde(default = "default_max_duration_s")]
    pub max_duration_s: f64,
    #[serde(default = "default_max_failure_rate")]
    pub max_failure_rate: f64,
    #[serde(default)]
    pub max_calls: Option<u64>,
    #[serde(default = "default_min_sample")]
    pub min_sample: u64,
    /// Timeout for function steps without their own `timeout_s`
    #[serde(default)]
    pub default_timeout_s: Option<f64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            max_total_cost: None,
            max_duration_s: default_max_duration_s(),
            max_failure_rate: default_max_failure_rate(),
            max_calls: None,
            min_sample: default_min_sample(),
            default_timeout_s: None,
        }
    }
}

fn default_max_concurrent() -> usize {
    4
}

fn default_max_duration_s() -> f64 {
    300.0
}

fn default_max_failure_rate() -> f64 {
    1.0
}

fn default_min_sample() -> u64 {
    5
}

/// Retry defaults applied to steps without a retry policy
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// When false, steps without a policy fail on the first error
    #[serde(default)]
    pub apply_by_default: bool,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            apply_by_default: false,
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: true,
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    5_000
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct SandboxConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_python")]
    pub python: String,
    /// `none` or `bubblewrap`
    #[serde(default = "default_isolation")]
    pub isolation: String,
    #[serde(default)]
    pub bwrap_path: Option<PathBuf>,
    #[serde(default)]
    pub allow_network: bool,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    #[serde(default = "default_memory_limit_mb")]
    pub default_memory_limit_mb: u64,
    #[serde(default = "default_sandbox_timeout_s")]
    pub default_timeout_s: f64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            python: default_python(),
            isolation: default_isolation(),
            bwrap_path: None,
            allow_network: false,
            max_output_bytes: default_max_output_bytes(),
            default_memory_limit_mb: default_memory_limit_mb(),
            default_timeout_s: default_sandbox_timeout_s(),
        }
    }
}

fn default_python() -> String {
    "python3".to_string()
}

fn default_isolation() -> String {
    "none".to_string()
}

fn default_max_output_bytes() -> usize {
    64 * 1024
}

fn default_memory_limit_mb() -> u64 {
    256
}

fn default_sandbox_timeout_s() -> f64 {
    10.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// `in_memory`, `redis` or `none`
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default)]
    pub connection_url: Option<String>,
    /// Optional key prefix/namespace used by backend implementations.
    #[serde(default)]
    pub key_prefix: Option<String>,
    #[serde(default = "default_ttl_s")]
    pub ttl_s: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            connection_url: None,
            key_prefix: None,
            ttl_s: default_ttl_s(),
        }
    }
}

fn default_backend() -> String {
    "in_memory".to_string()
}

fn default_ttl_s() -> u64 {
    3_600
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub traces_enabled: bool,
    #[serde(default)]
    pub log_file: Option<String>,
    /// `tracing`, `memory` or `none`
    #[serde(default = "default_monitor")]
    pub monitor: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            traces_enabled: false,
            log_file: None,
            monitor: default_monitor(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_monitor() -> String {
    "tracing".to_string()
}

/// A sandbox tool declared in config. Exactly one of `code` and
/// `code_file` must be set; `code_file` is relative to the config file.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub code_file: Option<PathBuf>,
    #[serde(default)]
    pub memory_limit_mb: Option<u64>,
    #[serde(default)]
    pub timeout_s: Option<f64>,
}
