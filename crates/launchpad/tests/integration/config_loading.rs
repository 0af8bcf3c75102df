use std::path::Path;
use std::time::Duration;

use launchpad::config::{Config, ConfigError};

use super::FIXTURES_PATH;

#[test]
fn test_load_valid_config() {
    let path = format!("{FIXTURES_PATH}/configs/valid_full.toml");
    let config = Config::from_file(&path).expect("Failed to load config");

    assert_eq!(
        config.scratch_root(),
        Path::new("/tmp/launchpad-fixture")
    );
    assert_eq!(config.health_url(20001), "http://127.0.0.1:20001/healthz");
    assert_eq!(config.output_keep_chars, 500);
    assert_eq!((config.ports.min, config.ports.max), (20000, 20999));
    assert!(!config.ports.check_available);
    assert_eq!(config.install_timeout(), Duration::from_secs(600));
    assert_eq!(config.build_timeout(), Duration::ZERO);
    assert_eq!(config.install_step_name(), "pnpm install --frozen-lockfile");
    assert_eq!(config.commands.port_env, "APP_PORT");
    assert_eq!(config.readiness.phrases, vec!["ready on"]);
    assert_eq!(config.manifest.scripts.len(), 2);
    assert_eq!(config.manifest.scripts["build"], "tsc -p .");
}

#[test]
fn test_load_minimal_config() {
    let path = format!("{FIXTURES_PATH}/configs/valid_minimal.toml");
    let config = Config::from_file(&path).expect("Failed to load config");

    assert_eq!(config.retention(), Duration::from_secs(60));
    // Everything else falls back to defaults
    assert_eq!(config.install_step_name(), "npm install");
    assert_eq!(config.build_step_name(), "npm run build");
    assert_eq!(config.health_url(3001), "http://localhost:3001/api/health");
    assert!(config.readiness.phrases.contains(&"Listening on port".to_string()));
}

#[test]
fn test_load_invalid_port_range() {
    let path = format!("{FIXTURES_PATH}/configs/invalid_port_range.toml");
    assert!(matches!(
        Config::from_file(&path),
        Err(ConfigError::Invalid(_))
    ));
}

#[test]
fn test_load_invalid_empty_install() {
    let path = format!("{FIXTURES_PATH}/configs/invalid_empty_install.toml");
    assert!(Config::from_file(&path).is_err());
}

#[test]
fn test_load_invalid_health_path() {
    let path = format!("{FIXTURES_PATH}/configs/invalid_health_path.toml");
    assert!(Config::from_file(&path).is_err());
}

#[test]
fn test_load_invalid_no_phrases() {
    let path = format!("{FIXTURES_PATH}/configs/invalid_no_phrases.toml");
    assert!(Config::from_file(&path).is_err());
}

#[test]
fn test_load_missing_file() {
    let result = Config::from_file(format!("{FIXTURES_PATH}/configs/does_not_exist.toml"));
    assert!(matches!(result, Err(ConfigError::ReadFile { .. })));
}

#[test]
fn test_example_config_round_trip() {
    let config = Config::parse_toml(launchpad::EXAMPLE_CONFIG).expect("example config is valid");
    assert_eq!(config.startup_timeout(), Duration::from_secs(30));
    assert_eq!(config.retention(), Duration::from_secs(300));
}
