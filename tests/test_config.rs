use std::io::Write;

use crewflow::cli::config::{EngineConfig, StorageBackend};
use tempfile::NamedTempFile;

#[test]
fn load_valid_config_all_fields() {
    let yaml = r#"
host: "127.0.0.1"
port: 8080
store_dir: "custom/runs"
backend: cloud
max_body: 2097152
"#;

    let mut f = NamedTempFile::new().unwrap();
    f.write_all(yaml.as_bytes()).unwrap();

    let cfg = EngineConfig::load(Some(f.path())).unwrap();

    assert_eq!(cfg.host.as_deref(), Some("127.0.0.1"));
    assert_eq!(cfg.port, Some(8080));
    assert_eq!(cfg.store_dir.as_deref(), Some("custom/runs"));
    assert_eq!(cfg.backend, Some(StorageBackend::Cloud));
    assert_eq!(cfg.max_body, Some(2097152));
}

#[test]
fn load_partial_config() {
    let yaml = "port: 9090\n";

    let mut f = NamedTempFile::new().unwrap();
    f.write_all(yaml.as_bytes()).unwrap();

    let cfg = EngineConfig::load(Some(f.path())).unwrap();

    assert_eq!(cfg.port, Some(9090));
    assert!(cfg.host.is_none());
    assert!(cfg.store_dir.is_none());
    assert!(cfg.backend.is_none());
    assert!(cfg.max_body.is_none());
}

#[test]
fn missing_explicit_path_returns_error() {
    let result = EngineConfig::load(Some(std::path::Path::new("/nonexistent/workflow-engine.yaml")));
    assert!(result.is_err());
    assert!(
        result
            .unwrap_err()
            .to_string()
            .contains("Config file not found")
    );
}

#[test]
fn default_config_has_no_fields_set() {
    let cfg = EngineConfig::default();
    assert!(cfg.host.is_none());
    assert!(cfg.port.is_none());
    assert!(cfg.store_dir.is_none());
    assert!(cfg.backend.is_none());
    assert!(cfg.max_body.is_none());
}

#[test]
fn invalid_yaml_returns_error() {
    let yaml = "port: [this is not valid yaml for a u16";

    let mut f = NamedTempFile::new().unwrap();
    f.write_all(yaml.as_bytes()).unwrap();

    let result = EngineConfig::load(Some(f.path()));
    assert!(result.is_err());
    assert!(
        result
            .unwrap_err()
            .to_string()
            .contains("Failed to parse config file")
    );
}

#[test]
fn unknown_backend_value_is_rejected() {
    let yaml = "backend: blob-store\n";

    let mut f = NamedTempFile::new().unwrap();
    f.write_all(yaml.as_bytes()).unwrap();

    let result = EngineConfig::load(Some(f.path()));
    assert!(result.is_err());
}

#[test]
fn storage_backend_parses_from_str() {
    assert_eq!("local".parse::<StorageBackend>().unwrap(), StorageBackend::Local);
    assert_eq!("cloud".parse::<StorageBackend>().unwrap(), StorageBackend::Cloud);
    assert!("blob".parse::<StorageBackend>().is_err());
}
