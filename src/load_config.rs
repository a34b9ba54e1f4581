use crate::config::Config;
use crate::output::variant_dir_name;
use crate::resource::{parse_overrides, OperationClass};
use anyhow::Result;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use tracing::{error, info};

pub const CONCURRENCY_ENV: &str = "ASSET_SYNC_CONCURRENCY";
pub const FORCE_ENV: &str = "ASSET_SYNC_FORCE";

/// Loads the YAML config file and merges the environment overrides.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path_ref = path.as_ref();
    info!(config_path = ?path_ref, "Loading configuration from file");

    let config_content = match fs::read_to_string(path_ref) {
        Ok(content) => {
            info!(config_path = ?path_ref, "Config file read successfully");
            content
        }
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to read config file");
            return Err(anyhow::anyhow!("Failed to read config file {:?}: {}", path_ref, e));
        }
    };

    let mut config: Config = match serde_yaml::from_str(&config_content) {
        Ok(conf) => {
            info!(config_path = ?path_ref, "Parsed config YAML successfully");
            conf
        }
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to parse config YAML");
            return Err(anyhow::anyhow!("Failed to parse config YAML: {e}"));
        }
    };

    if let Ok(spec) = std::env::var(CONCURRENCY_ENV) {
        let spec = spec.trim().to_string();
        if !spec.is_empty() {
            if let Err(e) = parse_overrides(&spec, &OperationClass::defaults()) {
                error!(error = %e, value = %spec, "{CONCURRENCY_ENV} is malformed");
                return Err(anyhow::anyhow!("{CONCURRENCY_ENV} is malformed: {e}"));
            }
            info!(value = %spec, "Concurrency override found in env");
            config.concurrency_override = Some(spec);
        }
    }

    if let Ok(raw) = std::env::var(FORCE_ENV) {
        config.force = match parse_flag(&raw) {
            Some(flag) => flag,
            None => {
                error!(value = %raw, "{FORCE_ENV} must be a boolean");
                anyhow::bail!("{FORCE_ENV} must be one of 1/0/true/false/yes/no, got '{raw}'");
            }
        };
    }

    validate(&config)?;
    config.trace_loaded();
    Ok(config)
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "" | "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn validate(config: &Config) -> Result<()> {
    if config.variants.is_empty() {
        error!("Config must list at least one variant");
        anyhow::bail!("variants must not be empty");
    }
    let mut dirs = HashSet::new();
    for variant in &config.variants {
        if !dirs.insert(variant_dir_name(variant)) {
            error!(variant = %variant, "Variant output directory collides with another variant");
            anyhow::bail!("variant '{variant}' maps to the same output directory as another variant");
        }
    }
    if config.retry.max_attempts == 0 {
        error!("retry.max_attempts must be at least 1");
        anyhow::bail!("retry.max_attempts must be at least 1");
    }
    if config.assets.download_attempts == 0 {
        error!("assets.download_attempts must be at least 1");
        anyhow::bail!("assets.download_attempts must be at least 1");
    }
    if config.assets.allowed_schemes.is_empty() {
        error!("assets.allowed_schemes must not be empty");
        anyhow::bail!("assets.allowed_schemes must not be empty");
    }
    Ok(())
}
