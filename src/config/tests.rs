use super::*;
use serial_test::serial;
use std::env;

fn cleanup_test_env() {
    env::remove_var("API_KEY");
    env::remove_var("BIND_ADDRESS");
    env::remove_var("ALLOWED_ORIGINS");
    env::remove_var("MAX_PHASE_RETRIES");
}

#[test]
#[serial]
fn rejects_short_api_key() {
    cleanup_test_env();
    env::set_var("API_KEY", "too-short");

    let result = Config::load();
    assert!(result.is_err());

    cleanup_test_env();
}

#[test]
#[serial]
fn auth_disabled_without_api_key() {
    cleanup_test_env();

    let config = Config::load().unwrap();
    assert!(!config.api.enable_auth);
    assert!(config.api.api_key.is_none());

    cleanup_test_env();
}

#[test]
#[serial]
fn auth_enabled_with_valid_api_key() {
    cleanup_test_env();
    env::set_var(
        "API_KEY",
        "secure-api-key-1234567890123456789012345678901234567890",
    );

    let config = Config::load().unwrap();
    assert!(config.api.enable_auth);
    assert_eq!(
        config.api.api_key,
        Some("secure-api-key-1234567890123456789012345678901234567890".to_string())
    );

    cleanup_test_env();
}

#[test]
#[serial]
fn default_values_match_spec_table() {
    cleanup_test_env();

    let config = Config::load().unwrap();
    assert_eq!(config.api.bind_address, constants::DEFAULT_BIND_ADDRESS);
    assert_eq!(
        config.tdd.max_phase_retries,
        constants::MAX_PHASE_RETRIES
    );
    assert_eq!(
        config.coordination.circuit_breaker_threshold,
        constants::CIRCUIT_BREAKER_THRESHOLD
    );
    assert!(config.api.allowed_origins.is_empty());

    cleanup_test_env();
}

#[test]
#[serial]
fn parses_allowed_origins_csv() {
    cleanup_test_env();
    env::set_var(
        "ALLOWED_ORIGINS",
        "https://example.com,https://app.example.com",
    );

    let config = Config::load().unwrap();
    assert_eq!(config.api.allowed_origins.len(), 2);
    assert!(config
        .api
        .allowed_origins
        .contains(&"https://example.com".to_string()));

    cleanup_test_env();
}

#[test]
#[serial]
fn overrides_numeric_default_from_env() {
    cleanup_test_env();
    env::set_var("MAX_PHASE_RETRIES", "7");

    let config = Config::load().unwrap();
    assert_eq!(config.tdd.max_phase_retries, 7);

    cleanup_test_env();
}
