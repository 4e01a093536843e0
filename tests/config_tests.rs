use acuvim_collect::collect::SearchStrategy;
use acuvim_collect::config::{generate::generate_starter_config, load_config, load_or_default, ConfigError};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

#[test]
fn test_generated_config_is_valid() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.yml");

    fs::write(&config_path, generate_starter_config()).unwrap();

    let config = load_config(&config_path).expect("Generated config should be valid");

    assert_eq!(config.transport.port, 502);
    assert_eq!(config.transport.timeout, Duration::from_secs(3));
    assert_eq!(config.retry.max_attempts, 3);
    assert_eq!(config.paging.records_per_page, 8);
    assert_eq!(config.paging.search, SearchStrategy::Binary);
    assert_eq!(config.sync.allowed_drift_seconds, 60);
    assert_eq!(config.storage.checkpoint_interval, Duration::from_secs(30));
    assert_eq!(config.fleet.max_concurrent, 4);
}

#[test]
fn test_site_config() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.yml");

    let config_yaml = r#"
transport:
  port: 5020
  timeout: 1500ms
retry:
  max_attempts: 5
  initial_backoff: 1s
  max_backoff: 30s
paging:
  records_per_page: 4
  search: sequential
sync:
  allowed_drift_seconds: 30
  required: true
storage:
  path: /var/lib/acuvim/collector.duckdb
output:
  directory: /srv/energy
  include_index: true
"#;
    fs::write(&config_path, config_yaml).unwrap();

    let config = load_config(&config_path).unwrap();
    assert_eq!(config.transport.port, 5020);
    assert_eq!(config.transport.timeout, Duration::from_millis(1500));
    assert_eq!(config.retry.max_attempts, 5);
    assert_eq!(config.paging.search, SearchStrategy::Sequential);
    assert!(config.sync.required);
    assert!(config.output.include_index);

    let settings = config.collector_settings(false);
    assert_eq!(settings.records_per_page, 4);
    assert_eq!(settings.retry.max_backoff, Duration::from_secs(30));
    assert!(!settings.reset_pointer);

    assert_eq!(
        config.output_path("AC42", None),
        Path::new("/srv/energy/AC42.tsv")
    );
    assert_eq!(
        config.output_path("AC42", Some(Path::new("/mnt/site-b"))),
        Path::new("/mnt/site-b/AC42.tsv")
    );
}

#[test]
fn test_invalid_page_size() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.yml");

    fs::write(&config_path, "paging:\n  records_per_page: 0\n").unwrap();

    let result = load_config(&config_path);
    assert!(result.is_err());
    let err_msg = result.unwrap_err().to_string();
    assert!(err_msg.contains("records_per_page"));
}

#[test]
fn test_initial_backoff_above_max_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.yml");

    fs::write(
        &config_path,
        "retry:\n  initial_backoff: 20s\n  max_backoff: 5s\n",
    )
    .unwrap();

    assert!(matches!(
        load_config(&config_path),
        Err(ConfigError::ValidationList(_))
    ));
}

#[test]
fn test_unknown_duration_format_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.yml");

    fs::write(&config_path, "transport:\n  timeout: soon\n").unwrap();

    assert!(matches!(load_config(&config_path), Err(ConfigError::YamlParse(_))));
}

#[test]
fn test_missing_file_is_io_error() {
    let temp_dir = TempDir::new().unwrap();
    let result = load_config(&temp_dir.path().join("absent.yml"));
    assert!(matches!(result, Err(ConfigError::Io(_))));
}

#[test]
fn test_defaults_without_file() {
    let config = load_or_default(None).unwrap();
    assert_eq!(config.transport.port, 502);
    if dirs::home_dir().is_some() {
        assert!(!config.storage.path.to_string_lossy().starts_with('~'));
    }
}
