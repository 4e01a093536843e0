use super::types::*;
use crate::config::{expand_env_vars, expand_tilde, ENV_VAR_PATTERN};
use crate::meter::registers::MAX_RECORDS_PER_WINDOW;
use regex::Regex;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("validation failed:\n{}", .0.join("\n"))]
    ValidationList(Vec<String>),

    #[error("validation failed: {0}")]
    Validation(String),
}

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let yaml_string = std::fs::read_to_string(path).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to read config file '{}': {}", path.display(), e),
        ))
    })?;

    parse_config(&yaml_string)
}

/// Load `path` when given, otherwise fall back to the built-in defaults.
pub fn load_or_default(path: Option<&Path>) -> Result<Config, ConfigError> {
    match path {
        Some(path) => {
            tracing::debug!(path = %path.display(), "Loading configuration");
            load_config(path)
        }
        None => {
            tracing::debug!("No config file found, using defaults");
            let mut config = Config::default();
            expand_paths(&mut config);
            Ok(config)
        }
    }
}

/// Parse and validate a YAML document. An empty document yields the defaults.
pub fn parse_config(yaml: &str) -> Result<Config, ConfigError> {
    let yaml = expand_env_vars(yaml);
    check_unexpanded_vars(&yaml)?;

    let mut config: Config = if yaml.trim().is_empty() {
        Config::default()
    } else {
        serde_yaml::from_str(&yaml)?
    };

    expand_paths(&mut config);
    validate_config(&config)?;
    Ok(config)
}

fn check_unexpanded_vars(yaml_string: &str) -> Result<(), ConfigError> {
    let re = Regex::new(ENV_VAR_PATTERN).map_err(|e| ConfigError::Validation(e.to_string()))?;
    let mut unexpanded: Vec<String> = re
        .captures_iter(yaml_string)
        .filter_map(|cap| cap.get(1).map(|m| m.as_str().to_string()))
        .collect();

    if unexpanded.is_empty() {
        return Ok(());
    }

    unexpanded.sort();
    unexpanded.dedup();

    Err(ConfigError::Validation(format!(
        "environment variable(s) not set: {}. Export them or replace the $env{{...}} references in the config file",
        unexpanded.join(", ")
    )))
}

fn expand_paths(config: &mut Config) {
    config.storage.path = expand_tilde(&config.storage.path);
    config.output.directory = expand_tilde(&config.output.directory);
}

pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    if config.transport.port == 0 {
        errors.push("transport.port must be non-zero".to_string());
    }
    if config.transport.timeout.is_zero() {
        errors.push("transport.timeout must be greater than zero".to_string());
    }

    if config.retry.max_attempts == 0 {
        errors.push("retry.max_attempts must be at least 1".to_string());
    }
    if config.retry.initial_backoff > config.retry.max_backoff {
        errors.push(format!(
            "retry.initial_backoff ({:?}) exceeds retry.max_backoff ({:?})",
            config.retry.initial_backoff, config.retry.max_backoff
        ));
    }

    let per_page = config.paging.records_per_page;
    if per_page == 0 || per_page > MAX_RECORDS_PER_WINDOW {
        errors.push(format!(
            "paging.records_per_page must be between 1 and {}, got {}",
            MAX_RECORDS_PER_WINDOW, per_page
        ));
    }
    if config.paging.ready_poll_interval.is_zero() {
        errors.push("paging.ready_poll_interval must be greater than zero".to_string());
    }
    if config.paging.ready_poll_interval > config.paging.ready_timeout {
        errors.push("paging.ready_poll_interval must not exceed paging.ready_timeout".to_string());
    }

    if config.storage.path.as_os_str().is_empty() {
        errors.push("storage.path must not be empty".to_string());
    }

    if config.fleet.max_concurrent == 0 {
        errors.push("fleet.max_concurrent must be at least 1".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationList(errors))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collect::SearchStrategy;
    use std::time::Duration;

    #[test]
    fn test_empty_document_is_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.transport.port, 502);
        assert_eq!(config.paging.records_per_page, 8);
        assert_eq!(config.sync.allowed_drift_seconds, 60);
        assert_eq!(config.retry.max_attempts, 3);
        assert!(!config.output.include_index);
    }

    #[test]
    fn test_partial_sections_fill_defaults() {
        let config = parse_config(
            r#"
transport:
  timeout: 10s
paging:
  records_per_page: 4
  search: sequential
retry:
  initial_backoff: 250ms
"#,
        )
        .unwrap();

        assert_eq!(config.transport.timeout, Duration::from_secs(10));
        assert_eq!(config.transport.port, 502);
        assert_eq!(config.paging.records_per_page, 4);
        assert_eq!(config.paging.search, SearchStrategy::Sequential);
        assert_eq!(config.retry.initial_backoff, Duration::from_millis(250));
        assert_eq!(config.retry.max_backoff, Duration::from_secs(10));
    }

    #[test]
    fn test_validation_collects_every_problem() {
        let err = parse_config(
            r#"
retry:
  max_attempts: 0
paging:
  records_per_page: 12
fleet:
  max_concurrent: 0
"#,
        )
        .unwrap_err();

        match err {
            ConfigError::ValidationList(errors) => {
                assert_eq!(errors.len(), 3);
                assert!(errors.iter().any(|e| e.contains("records_per_page")));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unset_env_var_is_reported() {
        let err = parse_config("storage:\n  path: $env{ACUVIM_TEST_SURELY_UNSET}/db.duckdb\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(msg) if msg.contains("ACUVIM_TEST_SURELY_UNSET")));
    }

    #[test]
    fn test_env_var_expanded_in_paths() {
        std::env::set_var("ACUVIM_TEST_DATA_DIR", "/srv/meters");
        let config = parse_config("output:\n  directory: $env{ACUVIM_TEST_DATA_DIR}/tsv\n").unwrap();
        assert_eq!(config.output.directory, Path::new("/srv/meters/tsv"));
        std::env::remove_var("ACUVIM_TEST_DATA_DIR");
    }

    #[test]
    fn test_bad_yaml() {
        assert!(matches!(
            parse_config("transport: [unclosed"),
            Err(ConfigError::YamlParse(_))
        ));
    }
}
