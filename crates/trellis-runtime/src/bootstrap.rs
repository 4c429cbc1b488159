//! Bootstrap helpers for starting Trellis from a single YAML config.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use trellis_config::{
    load_config, CacheConfig, ConfigError, EngineConfig, ObservabilityConfig, RetryConfig,
    SandboxConfig, ToolSpec, TrellisConfig,
};
use trellis_core::executor::PlanExecutor;
use trellis_core::limiter::ResourceLimits;
use trellis_core::monitor::{MonitoringSink, NoopMonitor};
use trellis_core::normalizer::ValidationError;
use trellis_core::registry::{CancellationToken, InMemoryToolRegistry, SandboxTool, ToolRegistry};
use trellis_core::retry::RetryPolicy;
use trellis_core::sandbox::CodeSandbox;
use trellis_core::store::{IdempotencyCache, StoreError};
use trellis_core::types::{Plan, PlanResult};
use trellis_sandbox::{IsolationMode, IsolationPolicy, ProcessSandbox, ProcessSandboxConfig};
use trellis_stores::{InMemoryCacheBackend, InMemoryEventLog, RedisCacheBackend, TracingMonitor};

use crate::builtin::register_builtin_tools;
use crate::logging::init_tracing;

const DEFAULT_KEY_PREFIX: &str = "trellis";

/// Runtime bootstrap errors.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("unsupported cache backend: {0}")]
    UnsupportedCacheBackend(String),
    #[error("unsupported monitor: {0}")]
    UnsupportedMonitor(String),
    #[error("unsupported sandbox isolation: {0}")]
    UnsupportedIsolation(String),
    #[error("tool '{tool}' code_file {path}: {source}")]
    ToolCode {
        tool: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("tool '{0}' needs the sandbox but sandbox.enabled is false")]
    SandboxDisabled(String),
}

/// Running engine bundle created from unified config.
pub struct EngineApp {
    pub executor: PlanExecutor,
    pub registry: Arc<InMemoryToolRegistry>,
    pub cache: Arc<IdempotencyCache>,
    pub monitor: Arc<dyn MonitoringSink>,
    /// Present when `observability.monitor` is `memory`
    pub event_log: Option<Arc<InMemoryEventLog>>,
    pub sandbox: Option<Arc<ProcessSandbox>>,
    pub config: TrellisConfig,
}

impl EngineApp {
    /// Create an engine from a single `trellis.yaml`, initializing tracing.
    pub fn from_config_path(path: impl AsRef<Path>) -> Result<Self, BootstrapError> {
        let path = path.as_ref();
        let config = load_config(path)?;
        init_tracing(&config.observability);
        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        tracing::info!(config = %path.display(), app = %config.app.name, "bootstrapping engine");
        Self::from_config(config, &base_dir)
    }

    /// Create an engine from parsed config; `code_file` paths resolve
    /// against `base_dir`.
    pub fn from_config(config: TrellisConfig, base_dir: &Path) -> Result<Self, BootstrapError> {
        let mut registry = InMemoryToolRegistry::new();
        register_builtin_tools(&mut registry);
        for spec in &config.tools {
            if !config.sandbox.enabled {
                return Err(BootstrapError::SandboxDisabled(spec.name.clone()));
            }
            registry.register_sandbox(sandbox_tool_from_spec(spec, &config.sandbox, base_dir)?);
        }
        let registry = Arc::new(registry);

        let cache = Arc::new(build_cache(&config.cache)?);
        let (monitor, event_log) = build_monitor(&config.observability)?;
        let sandbox = if config.sandbox.enabled {
            Some(Arc::new(build_sandbox(&config.sandbox)?))
        } else {
            None
        };

        let mut executor = PlanExecutor::new(registry.clone() as Arc<dyn ToolRegistry>)
            .with_cache(cache.clone())
            .with_cache_ttl(Duration::from_secs(config.cache.ttl_s))
            .with_monitor(monitor.clone())
            .with_limits(limits_from_config(&config.engine));
        if let Some(sandbox) = &sandbox {
            executor = executor.with_sandbox(sandbox.clone() as Arc<dyn CodeSandbox>);
        }
        if let Some(policy) = retry_from_config(&config.retry) {
            executor = executor.with_default_retry_policy(policy);
        }
        if let Some(timeout) = config
            .engine
            .default_timeout_s
            .and_then(|s| Duration::try_from_secs_f64(s).ok())
        {
            executor = executor.with_default_timeout(timeout);
        }

        tracing::info!(
            tools = registry.len(),
            cache_backend = %config.cache.backend,
            sandbox_enabled = config.sandbox.enabled,
            max_concurrent = config.engine.max_concurrent,
            "engine ready"
        );

        Ok(Self {
            executor,
            registry,
            cache,
            monitor,
            event_log,
            sandbox,
            config,
        })
    }

    pub async fn run_plan(&self, plan: &Plan) -> Result<PlanResult, ValidationError> {
        self.executor.execute(plan).await
    }

    pub async fn run_plan_with_cancellation(
        &self,
        plan: &Plan,
        cancel: CancellationToken,
    ) -> Result<PlanResult, ValidationError> {
        self.executor.execute_with_cancellation(plan, cancel).await
    }

    /// Whether the configured interpreter can run code units
    pub async fn sandbox_ready(&self) -> bool {
        match &self.sandbox {
            Some(sandbox) => sandbox.health_check().await,
            None => false,
        }
    }
}

pub fn limits_from_config(engine: &EngineConfig) -> ResourceLimits {
    let mut limits = ResourceLimits::default()
        .with_max_concurrent(engine.max_concurrent)
        .with_max_duration_s(engine.max_duration_s)
        .with_max_failure_rate(engine.max_failure_rate, engine.min_sample);
    if let Some(cost) = engine.max_total_cost {
        limits = limits.with_max_total_cost(cost);
    }
    if let Some(calls) = engine.max_calls {
        limits = limits.with_max_calls(calls);
    }
    limits
}

/// Default policy for steps without one, if enabled
pub fn retry_from_config(retry: &RetryConfig) -> Option<RetryPolicy> {
    if !retry.apply_by_default {
        return None;
    }
    let policy = RetryPolicy::default()
        .with_max_attempts(retry.max_attempts)
        .with_delays(retry.base_delay_ms, retry.max_delay_ms);
    Some(if retry.jitter {
        policy
    } else {
        policy.without_jitter()
    })
}

fn sandbox_tool_from_spec(
    spec: &ToolSpec,
    sandbox: &SandboxConfig,
    base_dir: &Path,
) -> Result<SandboxTool, BootstrapError> {
    let code = match (&spec.code, &spec.code_file) {
        (Some(code), _) => code.clone(),
        (None, Some(file)) => {
            let path = if file.is_absolute() {
                file.clone()
            } else {
                base_dir.join(file)
            };
            std::fs::read_to_string(&path).map_err(|source| BootstrapError::ToolCode {
                tool: spec.name.clone(),
                path: path.clone(),
                source,
            })?
        }
        // rejected by config validation
        (None, None) => String::new(),
    };
    Ok(SandboxTool::new(spec.name.clone(), code).with_limits(
        spec.memory_limit_mb.unwrap_or(sandbox.default_memory_limit_mb),
        spec.timeout_s.unwrap_or(sandbox.default_timeout_s),
    ))
}

fn build_cache(config: &CacheConfig) -> Result<IdempotencyCache, BootstrapError> {
    match config.backend.as_str() {
        "none" => Ok(IdempotencyCache::without_backend()),
        "in_memory" => Ok(IdempotencyCache::new(Arc::new(InMemoryCacheBackend::new()))),
        "redis" => {
            let url = config.connection_url.as_deref().unwrap_or_default();
            let prefix = config
                .key_prefix
                .clone()
                .unwrap_or_else(|| DEFAULT_KEY_PREFIX.to_string());
            let backend = RedisCacheBackend::new(url, prefix)?;
            Ok(IdempotencyCache::new(Arc::new(backend)))
        }
        other => Err(BootstrapError::UnsupportedCacheBackend(other.to_string())),
    }
}

fn build_monitor(
    config: &ObservabilityConfig,
) -> Result<(Arc<dyn MonitoringSink>, Option<Arc<InMemoryEventLog>>), BootstrapError> {
    match config.monitor.as_str() {
        "tracing" => Ok((Arc::new(TracingMonitor), None)),
        "none" => Ok((Arc::new(NoopMonitor), None)),
        "memory" => {
            let log = Arc::new(InMemoryEventLog::default());
            Ok((log.clone(), Some(log)))
        }
        other => Err(BootstrapError::UnsupportedMonitor(other.to_string())),
    }
}

fn build_sandbox(config: &SandboxConfig) -> Result<ProcessSandbox, BootstrapError> {
    let mode = IsolationMode::parse(&config.isolation)
        .ok_or_else(|| BootstrapError::UnsupportedIsolation(config.isolation.clone()))?;
    Ok(ProcessSandbox::new(ProcessSandboxConfig {
        python: config.python.clone(),
        isolation: IsolationPolicy {
            mode,
            allow_network: config.allow_network,
            bwrap_path: config.bwrap_path.clone(),
        },
        max_output_bytes: config.max_output_bytes,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use trellis_config::parse_config;
    use trellis_core::registry::ToolHandle;
    use trellis_core::types::{PlanStatus, Step};

    #[test]
    fn test_limits_from_config() {
        let engine = EngineConfig {
            max_total_cost: Some(10.0),
            max_calls: Some(7),
            ..EngineConfig::default()
        };
        let limits = limits_from_config(&engine);
        assert_eq!(limits.max_concurrent, 4);
        assert_eq!(limits.max_total_cost, 10.0);
        assert_eq!(limits.max_calls, 7);
    }

    #[test]
    fn test_retry_default_only_when_enabled() {
        assert!(retry_from_config(&RetryConfig::default()).is_none());
        let retry = RetryConfig {
            apply_by_default: true,
            jitter: false,
            ..RetryConfig::default()
        };
        let policy = retry_from_config(&retry).expect("policy");
        assert_eq!(policy.max_attempts, 3);
        assert!(!policy.jitter);
    }

    #[test]
    fn test_from_config_registers_builtin_and_declared_tools() {
        let dir = tempfile::tempdir().expect("temp dir");
        std::fs::write(dir.path().join("triple.py"), "result = input['x'] * 3").expect("write");
        let config = parse_config(
            r#"
observability:
  monitor: memory
tools:
  - name: double
    code: "result = input['x'] * 2"
    memory_limit_mb: 64
  - name: triple
    code_file: triple.py
"#,
        )
        .expect("config");

        let app = EngineApp::from_config(config, dir.path()).expect("app");
        assert!(app.event_log.is_some());
        match app.registry.resolve_tool("triple") {
            ToolHandle::Sandbox(tool) => {
                assert_eq!(tool.code, "result = input['x'] * 3");
                assert_eq!(tool.timeout_s, 10.0);
            }
            other => panic!("unexpected handle {:?}", other),
        }
        match app.registry.resolve_tool("double") {
            ToolHandle::Sandbox(tool) => assert_eq!(tool.memory_limit_mb, 64),
            other => panic!("unexpected handle {:?}", other),
        }
        assert!(matches!(
            app.registry.resolve_tool("echo"),
            ToolHandle::Function(_)
        ));
    }

    #[test]
    fn test_missing_code_file_is_reported() {
        let dir = tempfile::tempdir().expect("temp dir");
        let config = parse_config("tools:\n  - name: ghost\n    code_file: ghost.py\n").expect("config");
        assert!(matches!(
            EngineApp::from_config(config, dir.path()),
            Err(BootstrapError::ToolCode { .. })
        ));
    }

    #[test]
    fn test_builtin_plan_runs_end_to_end() {
        tokio_test::block_on(async {
            let config = parse_config("observability:\n  monitor: memory\n").expect("config");
            let app = EngineApp::from_config(config, Path::new(".")).expect("app");
            let plan = Plan::new(
                "e2e",
                vec![
                    Step::new("nums", "echo").with_input(json!({"values": [1, 2, 3]})),
                    Step::new("total", "sum")
                        .with_depends_on(["nums"])
                        .with_input(json!({"values": [4, 5]})),
                    Step::new("label", "concat")
                        .with_depends_on(["total"])
                        .with_input(json!({"parts": ["total", "step:total"], "separator": "="})),
                ],
            );
            let result = app.run_plan(&plan).await.expect("valid plan");
            assert_eq!(result.status, PlanStatus::Succeeded);
            assert_eq!(
                result.context.get("label"),
                Some(&json!({"result": "total={\"sum\":9}"}))
            );
            let log = app.event_log.as_ref().expect("event log");
            assert!(!log.is_empty());
        });
    }

    #[test]
    fn test_disabled_sandbox_rejects_declared_tools() {
        let config = parse_config(
            "sandbox:\n  enabled: false\ntools:\n  - name: t\n    code: 'result = 1'\n",
        )
        .expect("config");
        assert!(matches!(
            EngineApp::from_config(config, Path::new(".")),
            Err(BootstrapError::SandboxDisabled(_))
        ));
    }
}
