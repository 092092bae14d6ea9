use std::io::Write;

use pmdb_engine::{InspectorConfig, DEFAULT_MAX_UNWIND_DEPTH, DEFAULT_STORAGE_TRUNCATE_LIMIT};
use tracing::info;

#[test]
fn test_default_config() {
    pmdb_common::logging::ensure_test_logging(None);
    info!("Running test");
    let config = InspectorConfig::default();

    assert_eq!(config.storage_truncate_limit, Some(DEFAULT_STORAGE_TRUNCATE_LIMIT));
    assert_eq!(config.max_unwind_depth, DEFAULT_MAX_UNWIND_DEPTH);
    assert!(config.dump_storage_in_repr);
    assert!(config.include_child_logs);
}

#[test]
fn test_config_builders() {
    pmdb_common::logging::ensure_test_logging(None);
    info!("Running test");
    let config = InspectorConfig::default()
        .with_storage_truncate_limit(None)
        .with_max_unwind_depth(4)
        .with_dump_storage_in_repr(false)
        .with_include_child_logs(false);

    assert_eq!(config.storage_truncate_limit, None);
    assert_eq!(config.max_unwind_depth, 4);
    assert!(!config.dump_storage_in_repr);
    assert!(!config.include_child_logs);
}

#[test]
fn test_config_from_toml_file() {
    pmdb_common::logging::ensure_test_logging(None);
    info!("Running test");
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "storage_truncate_limit = 64").unwrap();
    writeln!(file, "include_child_logs = false").unwrap();

    let config = InspectorConfig::from_toml_file(file.path()).unwrap();
    assert_eq!(config.storage_truncate_limit, Some(64));
    assert!(!config.include_child_logs);
    assert_eq!(config.max_unwind_depth, DEFAULT_MAX_UNWIND_DEPTH);
}

#[test]
fn test_config_errors() {
    pmdb_common::logging::ensure_test_logging(None);
    info!("Running test");
    assert!(InspectorConfig::from_toml_str("max_unwind_depth = \"deep\"").is_err());

    let dir = tempfile::tempdir().unwrap();
    let err = InspectorConfig::from_toml_file(dir.path().join("missing.toml")).unwrap_err();
    assert!(err.to_string().contains("failed to read configuration file"));
}
