//! Configuration loading and root folder resolution
//!
//! Only one test in this binary touches `CDM_ROOT_FOLDER`; keep it that way,
//! tests run in parallel threads of one process.

use cdm_common::config::{
    default_root_folder, load_toml_config, resolve_root_folder, TomlConfig, ROOT_FOLDER_ENV,
};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

#[test]
fn tc_cfg_001_root_folder_priority() {
    let mut toml = TomlConfig::default();
    toml.root_folder = Some(PathBuf::from("/from/toml"));

    std::env::set_var(ROOT_FOLDER_ENV, "/from/env");
    assert_eq!(
        resolve_root_folder(Some(Path::new("/from/cli")), &toml),
        PathBuf::from("/from/cli")
    );
    assert_eq!(resolve_root_folder(None, &toml), PathBuf::from("/from/env"));

    // Blank ENV is ignored
    std::env::set_var(ROOT_FOLDER_ENV, "  ");
    assert_eq!(resolve_root_folder(None, &toml), PathBuf::from("/from/toml"));

    std::env::remove_var(ROOT_FOLDER_ENV);
    assert_eq!(
        resolve_root_folder(None, &TomlConfig::default()),
        default_root_folder()
    );
}

#[test]
fn tc_cfg_002_full_file_round_trips_sections() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("cdm-etl.toml");
    std::fs::write(
        &path,
        r#"
root_folder = "/srv/cdm"

[logging]
level = "debug"

[normalization]
auto_approve_threshold = 0.85
review_floor = 0.4

[reasoning]
provider = "http"
endpoint = "http://localhost:9000/resolve"
timeout_ms = 2500
"#,
    )
    .unwrap();

    let config = load_toml_config(&path).unwrap();
    assert_eq!(config.root_folder, Some(PathBuf::from("/srv/cdm")));
    assert_eq!(config.logging.level, "debug");
    assert!((config.normalization.review_floor - 0.4).abs() < f32::EPSILON);
    assert_eq!(config.reasoning.provider, "http");
    assert_eq!(config.reasoning.timeout_ms, 2500);
    assert_eq!(config.predictor.generic_weight, 1);
}

#[test]
fn tc_cfg_003_malformed_file_is_config_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("broken.toml");
    std::fs::write(&path, "[normalization\ntop_k = ").unwrap();

    let err = load_toml_config(&path).unwrap_err();
    assert!(matches!(err, cdm_common::Error::Config(_)));
}
