use asset_sync::load_config::{load_config, CONCURRENCY_ENV, FORCE_ENV};
use serial_test::serial;
use std::env;
use std::fs::write;
use std::path::PathBuf;
use tempfile::NamedTempFile;

const MINIMAL_YAML: &str = r#"
source:
  manifest: ./content/manifest.json
output_dir: ./tmp/out
cache_dir: ./tmp/cache
"#;

fn config_file(yaml: &str) -> NamedTempFile {
    let file = NamedTempFile::new().expect("temp file");
    write(file.path(), yaml).unwrap();
    file
}

fn clear_env() {
    env::remove_var(CONCURRENCY_ENV);
    env::remove_var(FORCE_ENV);
}

/// A minimal file loads with every default filled in.
#[test]
#[serial]
fn test_load_config_minimal_file_gets_defaults() {
    clear_env();
    let file = config_file(MINIMAL_YAML);

    let config = load_config(file.path()).expect("Config should load");

    assert_eq!(config.source.manifest, PathBuf::from("./content/manifest.json"));
    assert_eq!(config.output_dir, PathBuf::from("./tmp/out"));
    assert_eq!(config.variants, vec!["en".to_string()]);
    assert_eq!(config.assets.url_prefix, "/assets/");
    assert_eq!(config.retry.max_attempts, 3);
    assert!(config.concurrency_override.is_none());
    assert!(!config.force);
}

/// Environment overrides are merged on top of the file.
#[test]
#[serial]
fn test_load_config_merges_env_overrides() {
    clear_env();
    env::set_var(CONCURRENCY_ENV, " pages:2, downloads:8 ");
    env::set_var(FORCE_ENV, "yes");
    let file = config_file(MINIMAL_YAML);

    let config = load_config(file.path()).expect("Config should load");
    clear_env();

    assert_eq!(config.concurrency_override.as_deref(), Some("pages:2, downloads:8"));
    assert!(config.force);
}

#[test]
#[serial]
fn test_load_config_rejects_malformed_concurrency_override() {
    clear_env();
    env::set_var(CONCURRENCY_ENV, "pages=2");
    let file = config_file(MINIMAL_YAML);

    let result = load_config(file.path());
    clear_env();

    let err = result.expect_err("malformed override must fail");
    assert!(err.to_string().contains(CONCURRENCY_ENV));
}

#[test]
#[serial]
fn test_load_config_rejects_unknown_class_and_bad_flag() {
    clear_env();
    let file = config_file(MINIMAL_YAML);

    env::set_var(CONCURRENCY_ENV, "gpu:4");
    assert!(load_config(file.path()).is_err());

    env::remove_var(CONCURRENCY_ENV);
    env::set_var(FORCE_ENV, "maybe");
    assert!(load_config(file.path()).is_err());
    clear_env();
}

#[test]
#[serial]
fn test_load_config_rejects_invalid_values() {
    clear_env();
    let file = config_file(&format!("{MINIMAL_YAML}variants: []\n"));
    assert!(load_config(file.path()).is_err());

    let file = config_file(&format!("{MINIMAL_YAML}retry:\n  max_attempts: 0\n"));
    assert!(load_config(file.path()).is_err());

    // "en.gb" and "en_gb" would share one output directory
    let file = config_file(&format!("{MINIMAL_YAML}variants: [en.gb, en_gb]\n"));
    assert!(load_config(file.path()).is_err());
}

#[test]
#[serial]
fn test_load_config_errors_on_invalid_yaml_and_missing_file() {
    clear_env();
    let file = config_file("source: [unterminated");
    assert!(load_config(file.path()).is_err());

    assert!(load_config("/definitely/not/here/config.yaml").is_err());
}
