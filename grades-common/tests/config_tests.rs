//! Configuration resolution tests
//!
//! Tests touching GRADES_CONFIG are marked #[serial] so they never race on
//! the process environment.

use grades_common::config::{resolve_config_path, GradesConfig, CONFIG_ENV_VAR};
use serial_test::serial;
use std::env;
use std::path::{Path, PathBuf};

#[test]
#[serial]
fn test_env_var_used_when_no_cli_argument() {
    env::set_var(CONFIG_ENV_VAR, "/srv/grades/config.toml");
    let resolved = resolve_config_path(None);
    env::remove_var(CONFIG_ENV_VAR);

    assert_eq!(resolved, Some(PathBuf::from("/srv/grades/config.toml")));
}

#[test]
#[serial]
fn test_cli_argument_beats_env_var() {
    env::set_var(CONFIG_ENV_VAR, "/srv/grades/config.toml");
    let resolved = resolve_config_path(Some(Path::new("/opt/override.toml")));
    env::remove_var(CONFIG_ENV_VAR);

    assert_eq!(resolved, Some(PathBuf::from("/opt/override.toml")));
}

#[test]
#[serial]
fn test_missing_file_falls_back_to_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("nope.toml");
    env::remove_var(CONFIG_ENV_VAR);

    let config = GradesConfig::load(Some(&missing)).unwrap();
    assert_eq!(config.logging.level, "info");
    assert!(config.database_path.ends_with("grades.db"));
}

#[test]
#[serial]
fn test_load_from_env_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("grades.toml");
    std::fs::write(
        &path,
        format!(
            "database_path = \"{}\"\n[logging]\nlevel = \"warn\"\n",
            dir.path().join("g.db").display()
        ),
    )
    .unwrap();

    env::set_var(CONFIG_ENV_VAR, &path);
    let config = GradesConfig::load(None);
    env::remove_var(CONFIG_ENV_VAR);

    let config = config.unwrap();
    assert_eq!(config.database_path, dir.path().join("g.db"));
    assert_eq!(config.logging.level, "warn");
}

#[test]
fn test_malformed_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.toml");
    std::fs::write(&path, "report_dir = = 3").unwrap();

    assert!(GradesConfig::load(Some(&path)).is_err());
}
