//! Configuration loading and validation.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use thiserror::Error;

use crate::TrellisConfig;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Load full Trellis configuration from YAML file.
pub fn load_config(path: &Path) -> Result<TrellisConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config(&content)
}

/// Parse and validate configuration from YAML text.
pub fn parse_config(content: &str) -> Result<TrellisConfig, ConfigError> {
    let config: TrellisConfig = if content.trim().is_empty() {
        TrellisConfig::default()
    } else {
        serde_yaml::from_str(content)?
    };
    validate_config(&config)?;
    Ok(config)
}

pub fn validate_config(config: &TrellisConfig) -> Result<(), ConfigError> {
    if config.version == 0 {
        return Err(ConfigError::Invalid(
            "version must be greater than 0".to_string(),
        ));
    }

    if config.app.name.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "app.name must not be empty".to_string(),
        ));
    }

    validate_engine(config)?;
    validate_retry(config)?;
    validate_sandbox(config)?;
    validate_cache(config)?;
    validate_tools(config)?;
    Ok(())
}

fn positive_finite(value: f64) -> bool {
    value.is_finite() && value > 0.0
}

fn validate_engine(config: &TrellisConfig) -> Result<(), ConfigError> {
    let engine = &config.engine;
    if engine.max_concurrent == 0 {
        return Err(ConfigError::Invalid(
            "engine.max_concurrent must be > 0".to_string(),
        ));
    }
    if !(engine.max_duration_s > 0.0) {
        return Err(ConfigError::Invalid(
            "engine.max_duration_s must be > 0".to_string(),
        ));
    }
    if !(0.0..=1.0).contains(&engine.max_failure_rate) {
        return Err(ConfigError::Invalid(
            "engine.max_failure_rate must be within [0, 1]".to_string(),
        ));
    }
    if let Some(cost) = engine.max_total_cost {
        if !(cost >= 0.0) {
            return Err(ConfigError::Invalid(
                "engine.max_total_cost must be >= 0".to_string(),
            ));
        }
    }
    if let Some(timeout) = engine.default_timeout_s {
        if !positive_finite(timeout) {
            return Err(ConfigError::Invalid(
                "engine.default_timeout_s must be > 0".to_string(),
            ));
        }
    }
    Ok(())
}

fn validate_retry(config: &TrellisConfig) -> Result<(), ConfigError> {
    if config.retry.max_attempts == 0 {
        return Err(ConfigError::Invalid(
            "retry.max_attempts must be > 0".to_string(),
        ));
    }
    Ok(())
}

fn validate_sandbox(config: &TrellisConfig) -> Result<(), ConfigError> {
    let sandbox = &config.sandbox;
    if sandbox.python.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "sandbox.python must not be empty".to_string(),
        ));
    }
    if !matches!(
        sandbox.isolation.trim().to_ascii_lowercase().as_str(),
        "none" | "off" | "process" | "bubblewrap" | "bwrap" | "linux_bwrap"
    ) {
        return Err(ConfigError::Invalid(format!(
            "sandbox.isolation '{}' is not supported (expected none or bubblewrap)",
            sandbox.isolation
        )));
    }
    if sandbox.default_memory_limit_mb == 0 {
        return Err(ConfigError::Invalid(
            "sandbox.default_memory_limit_mb must be > 0".to_string(),
        ));
    }
    if !positive_finite(sandbox.default_timeout_s) {
        return Err(ConfigError::Invalid(
            "sandbox.default_timeout_s must be > 0".to_string(),
        ));
    }
    Ok(())
}

fn validate_cache(config: &TrellisConfig) -> Result<(), ConfigError> {
    let cache = &config.cache;
    match cache.backend.as_str() {
        "in_memory" | "none" => {}
        "redis" => {
            let url = cache.connection_url.as_deref().unwrap_or("");
            if url.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "cache.connection_url is required for the redis backend".to_string(),
                ));
            }
        }
        other => {
            return Err(ConfigError::Invalid(format!(
                "cache.backend '{}' is not supported",
                other
            )))
        }
    }
    if cache.ttl_s == 0 {
        return Err(ConfigError::Invalid("cache.ttl_s must be > 0".to_string()));
    }
    Ok(())
}

fn validate_tools(config: &TrellisConfig) -> Result<(), ConfigError> {
    let mut names = HashSet::new();
    for tool in &config.tools {
        if tool.name.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "tools[].name must not be empty".to_string(),
            ));
        }
        if !names.insert(tool.name.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "tool '{}' is declared more than once",
                tool.name
            )));
        }
        if tool.code.is_some() == tool.code_file.is_some() {
            return Err(ConfigError::Invalid(format!(
                "tool '{}' must set exactly one of code and code_file",
                tool.name
            )));
        }
        if tool.memory_limit_mb == Some(0) {
            return Err(ConfigError::Invalid(format!(
                "tool '{}' memory_limit_mb must be > 0",
                tool.name
            )));
        }
        if let Some(timeout) = tool.timeout_s {
            if !positive_finite(timeout) {
                return Err(ConfigError::Invalid(format!(
                    "tool '{}' timeout_s must be > 0",
                    tool.name
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_validate_config_accepts_defaults() {
        let config = TrellisConfig::default();
        assert!(validate_config(&config).is_ok());
        assert_eq!(config.engine.max_concurrent, 4);
        assert_eq!(config.cache.backend, "in_memory");
    }

    #[test]
    fn test_empty_document_is_default_config() {
        let config = parse_config("").expect("config");
        assert_eq!(config.version, 1);
        assert!(config.tools.is_empty());
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(
            file,
            r#"
version: 1
app:
  name: nightly-etl
engine:
  max_concurrent: 8
  max_total_cost: 25.0
retry:
  apply_by_default: true
  max_attempts: 5
cache:
  backend: redis
  connection_url: redis://127.0.0.1:6379/
  key_prefix: etl
tools:
  - name: double
    code: "result = input['x'] * 2"
    timeout_s: 2.5
"#
        )
        .expect("write");

        let config = load_config(file.path()).expect("config");
        assert_eq!(config.app.name, "nightly-etl");
        assert_eq!(config.app.environment, "development");
        assert_eq!(config.engine.max_concurrent, 8);
        assert_eq!(config.engine.max_total_cost, Some(25.0));
        assert!(config.retry.apply_by_default);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.cache.key_prefix.as_deref(), Some("etl"));
        assert_eq!(config.tools.len(), 1);
        assert_eq!(config.tools[0].timeout_s, Some(2.5));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().expect("temp dir");
        assert!(matches!(
            load_config(&dir.path().join("missing.yaml")),
            Err(ConfigError::Io(_))
        ));
    }

    #[test]
    fn test_malformed_yaml_is_parse_error() {
        assert!(matches!(
            parse_config("engine: [unclosed"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_rejects_invalid_values() {
        for yaml in [
            "engine:\n  max_concurrent: 0\n",
            "engine:\n  max_failure_rate: 1.5\n",
            "retry:\n  max_attempts: 0\n",
            "sandbox:\n  isolation: seatbelt\n",
            "cache:\n  backend: redis\n",
            "cache:\n  backend: memcached\n",
            "tools:\n  - name: t\n",
            "tools:\n  - name: t\n    code: 'result = 1'\n  - name: t\n    code: 'result = 2'\n",
        ] {
            assert!(
                matches!(parse_config(yaml), Err(ConfigError::Invalid(_))),
                "expected invalid: {}",
                yaml
            );
        }
    }
}
