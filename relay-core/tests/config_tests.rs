//! Tests for config
//! Extracted from config.rs

use std::collections::HashMap;
use std::time::Duration;

use relay_core::config::env_vars;
use relay_core::{RelayConfig, RelayError};

fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<String, String> = vars
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |name| vars.get(name).cloned()
}

#[test]
fn test_defaults() {
    let config = RelayConfig::default();
    assert_eq!(config.pre_key_low_water, 10);
    assert_eq!(config.pre_key_high_water, 100);
    assert!(!config.last_resort_key);
    assert_eq!(config.idle_debounce, Duration::from_millis(1000));
    assert_eq!(config.provisioning_scheme, "tsdevice");
    assert!(config.validate().is_ok());
}

#[test]
fn test_builder() {
    let config = RelayConfig::builder()
        .server_url("http://localhost:8080")
        .credentials("alice.1", "pw")
        .pre_key_water_marks(5, 50)
        .last_resort_key(true)
        .idle_debounce(Duration::from_millis(10))
        .user_agent("test-agent")
        .provisioning_scheme("relaydevice")
        .build()
        .unwrap();
    assert_eq!(config.credentials().unwrap(), ("alice.1", "pw"));
    assert_eq!(config.pre_key_low_water, 5);
    assert_eq!(config.pre_key_high_water, 50);
    assert!(config.last_resort_key);
    assert_eq!(config.user_agent, "test-agent");
    assert_eq!(config.provisioning_scheme, "relaydevice");
}

#[test]
fn test_builder_rejects_bad_url() {
    let err = RelayConfig::builder().server_url("ftp://relay").build().unwrap_err();
    assert!(matches!(err, RelayError::Validation(_)));
    assert!(RelayConfig::builder().server_url("not a url").build().is_err());
}

#[test]
fn test_builder_rejects_empty_pool() {
    let err = RelayConfig::builder()
        .pre_key_water_marks(0, 0)
        .build()
        .unwrap_err();
    assert!(matches!(err, RelayError::Validation(_)));
}

#[test]
fn test_message_socket_url_carries_credentials() {
    let config = RelayConfig::builder()
        .server_url("https://relay.test/")
        .credentials("+1555.2", "p&w")
        .build()
        .unwrap();
    let url = config.message_socket_url().unwrap();
    assert!(url.starts_with("wss://relay.test/v1/websocket/?"));
    assert!(url.contains("login=%2B1555.2"));
    assert!(url.contains("password=p%26w"));
}

#[test]
fn test_message_socket_needs_credentials() {
    let config = RelayConfig::default();
    assert!(matches!(
        config.message_socket_url(),
        Err(RelayError::InvalidState(_))
    ));
    assert!(config.message_socket_options().is_err());
}

#[test]
fn test_provisioning_socket_is_unauthenticated() {
    let config = RelayConfig::builder()
        .server_url("http://localhost:8080")
        .build()
        .unwrap();
    assert_eq!(
        config.provisioning_socket_url(),
        "ws://localhost:8080/v1/websocket/provisioning/"
    );
    let options = config.provisioning_socket_options();
    let keepalive = options.keepalive.unwrap();
    assert_eq!(keepalive.path, config.provisioning_keepalive_path);
}

#[test]
fn test_from_lookup() {
    let config = RelayConfig::from_lookup(lookup(&[
        (env_vars::SERVER_URL, "https://other.test"),
        (env_vars::USERNAME, "bob.1"),
        (env_vars::PASSWORD, "pw"),
        (env_vars::LAST_RESORT_KEY, "yes"),
    ]))
    .unwrap();
    assert_eq!(config.server_url, "https://other.test");
    assert_eq!(config.credentials().unwrap(), ("bob.1", "pw"));
    assert!(config.last_resort_key);
}

#[test]
fn test_from_lookup_rejects_bad_flag() {
    let err = RelayConfig::from_lookup(lookup(&[(env_vars::LAST_RESORT_KEY, "maybe")]))
        .unwrap_err();
    assert!(err.to_string().contains(env_vars::LAST_RESORT_KEY));
}

#[test]
fn test_from_lookup_empty_uses_defaults() {
    let config = RelayConfig::from_lookup(|_| None).unwrap();
    assert_eq!(config.server_url, RelayConfig::default().server_url);
    assert!(config.username.is_none());
}
