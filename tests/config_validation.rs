//! Integration tests for configuration validation

#![allow(clippy::expect_used, clippy::unwrap_used)]

use frame_session::config::{
    ClientConfig, HubConfig, LoggingConfig, NetworkConfig, ServerConfig, TransportKind,
};
use std::time::Duration;
use tracing::Level;

#[test]
fn test_default_config_validates() {
    let config = NetworkConfig::default();
    let errors = config.validate();
    assert!(
        errors.is_empty(),
        "Default config should be valid, but got errors: {:?}",
        errors
    );
}

#[test]
fn test_invalid_server_address() {
    let mut config = NetworkConfig::default();
    config.server.address = "invalid_address".to_string();

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Invalid server address")));
}

#[test]
fn test_empty_server_address() {
    let mut config = NetworkConfig::default();
    config.server.address = String::new();

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("cannot be empty")));
}

#[test]
fn test_short_handshake_timeout() {
    let mut config = NetworkConfig::default();
    config.server.handshake_timeout = Duration::from_millis(50);

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Handshake timeout too short")));
}

#[test]
fn test_half_configured_tls() {
    let mut config = NetworkConfig::default();
    config.server.cert_path = Some("cert.pem".to_string());

    assert!(!config.server.tls_enabled());
    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("must be set together")));

    config.server.key_path = Some("key.pem".to_string());
    assert!(config.server.tls_enabled());
    assert!(config.validate().is_empty());
}

#[test]
fn test_hub_timeouts() {
    let mut config = NetworkConfig::default();
    config.hub.read_timeout = Duration::from_millis(1);
    config.hub.write_timeout = Duration::from_millis(1);
    config.hub.shutdown_timeout = Duration::from_secs(400);

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Read timeout too short")));
    assert!(errors.iter().any(|e| e.contains("Write timeout too short")));
    assert!(errors.iter().any(|e| e.contains("Shutdown timeout too long")));
}

#[test]
fn test_exit_poll_interval_bounds() {
    let mut hub = HubConfig {
        exit_poll_interval: Duration::ZERO,
        ..HubConfig::default()
    };
    assert!(hub
        .validate()
        .iter()
        .any(|e| e.contains("must be greater than 0")));

    hub.exit_poll_interval = hub.shutdown_timeout + Duration::from_millis(1);
    assert!(hub
        .validate()
        .iter()
        .any(|e| e.contains("cannot exceed the shutdown timeout")));
}

#[test]
fn test_client_capacity_bounds() {
    let mut config = NetworkConfig::default();
    config.client.capacity = 0;
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("capacity must be greater than 0")));

    config.client.capacity = 70_000;
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("capacity too large")));

    config.client.capacity = 65_535;
    assert!(config.validate().is_empty());
}

#[test]
fn test_client_timeouts() {
    let mut config = NetworkConfig::default();
    config.client.connection_timeout = Duration::from_millis(50);
    config.client.response_timeout = Duration::from_millis(1);
    config.client.reconnect_delay = Duration::from_secs(120);

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Connection timeout too short")));
    assert!(errors
        .iter()
        .any(|e| e.contains("Response timeout too short")));
    assert!(errors
        .iter()
        .any(|e| e.contains("Reconnect delay too long")));
}

#[test]
fn test_client_defaults_match_reconnect_policy() {
    let config = ClientConfig::default();
    assert_eq!(config.capacity, 1);
    assert_eq!(config.max_reconnect_attempts, 3);
    assert_eq!(config.reconnect_delay, Duration::from_millis(5));
    assert_eq!(config.transport, TransportKind::WebSocket);
}

#[test]
fn test_empty_app_name() {
    let mut config = NetworkConfig::default();
    config.logging.app_name = String::new();

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Application name cannot be empty")));
}

#[test]
fn test_long_app_name() {
    let mut config = NetworkConfig::default();
    config.logging.app_name = "a".repeat(100);

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Application name too long")));
}

#[test]
fn test_log_to_file_without_path() {
    let mut config = NetworkConfig::default();
    config.logging.log_to_file = true;
    config.logging.log_file_path = None;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("log_file_path must be specified")));
}

#[test]
fn test_validate_strict_with_valid_config() {
    let config = NetworkConfig::default();
    assert!(config.validate_strict().is_ok());
}

#[test]
fn test_validate_strict_with_invalid_config() {
    let mut config = NetworkConfig::default();
    config.server.address = String::new();

    let error = config.validate_strict().unwrap_err();
    assert!(error.to_string().contains("Configuration validation failed"));
}

#[test]
fn test_multiple_validation_errors() {
    let mut config = NetworkConfig::default();

    config.server.address = String::new();
    config.hub.read_timeout = Duration::ZERO;
    config.client.capacity = 0;
    config.logging.app_name = String::new();

    let errors = config.validate();
    assert!(
        errors.len() >= 4,
        "Expected at least 4 errors, got {}: {:?}",
        errors.len(),
        errors
    );
}

#[test]
fn test_from_toml_with_partial_sections() {
    let config = NetworkConfig::from_toml(
        r#"
        [server]
        address = "0.0.0.0:8443"
        transport = "tcp"
        handshake_timeout = 2500

        [client]
        capacity = 16
        transport = "tcp"
        connection_timeout = 1000
        response_timeout = 250
        max_reconnect_attempts = 5
        reconnect_delay = 20
        "#,
    )
    .unwrap();

    assert_eq!(config.server.address, "0.0.0.0:8443");
    assert_eq!(config.server.transport, TransportKind::Tcp);
    assert_eq!(config.server.handshake_timeout, Duration::from_millis(2500));
    assert!(config.server.cert_path.is_none());
    assert_eq!(config.client.capacity, 16);
    assert_eq!(config.client.response_timeout, Duration::from_millis(250));
    assert_eq!(config.client.reconnect_delay, Duration::from_millis(20));
    assert_eq!(config.hub.read_timeout, HubConfig::default().read_timeout);
    assert!(config.validate().is_empty());
}

#[test]
fn test_from_toml_rejects_garbage() {
    let result = NetworkConfig::from_toml("[server\naddress = ");
    assert!(matches!(
        result,
        Err(frame_session::ProtocolError::ConfigError(_))
    ));
}

#[test]
fn test_save_and_reload() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("frame-session.toml");

    let config = NetworkConfig {
        hub: HubConfig {
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(10),
            exit_poll_interval: Duration::from_millis(25),
            forwarded_by_client_ip: false,
        },
        server: ServerConfig {
            address: "0.0.0.0:8443".to_string(),
            transport: TransportKind::WebSocket,
            handshake_timeout: Duration::from_secs(3),
            cert_path: Some("/etc/frame-session/cert.pem".to_string()),
            key_path: Some("/etc/frame-session/key.pem".to_string()),
        },
        client: ClientConfig {
            capacity: 8,
            ..ClientConfig::default()
        },
        logging: LoggingConfig {
            app_name: "edge-gateway".to_string(),
            log_level: Level::DEBUG,
            json_format: true,
            ..LoggingConfig::default()
        },
    };

    config.save_to_file(&path).unwrap();
    let loaded = NetworkConfig::from_file(&path).unwrap();

    assert_eq!(loaded.hub.exit_poll_interval, Duration::from_millis(25));
    assert!(!loaded.hub.forwarded_by_client_ip);
    assert_eq!(loaded.server.address, "0.0.0.0:8443");
    assert!(loaded.server.tls_enabled());
    assert_eq!(loaded.client.capacity, 8);
    assert_eq!(loaded.logging.log_level, Level::DEBUG);
    assert!(loaded.logging.json_format);
}

#[test]
fn test_example_config_parses() {
    let example = NetworkConfig::example_config();
    let parsed = NetworkConfig::from_toml(&example).unwrap();
    assert!(parsed.validate().is_empty());
}

#[test]
fn test_default_with_overrides() {
    let config = NetworkConfig::default_with_overrides(|c| {
        c.client.capacity = 4;
        c.server.transport = TransportKind::Tcp;
    });
    assert_eq!(config.client.capacity, 4);
    assert_eq!(config.server.transport, TransportKind::Tcp);
}
