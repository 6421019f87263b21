//! Config module tests

use super::*;
use std::io::Write;

#[test]
fn test_substitute_env_vars_simple() {
    std::env::set_var("MQGATE_TEST_VAR_SIMPLE", "hello");
    let result = substitute_env_vars("value = \"${MQGATE_TEST_VAR_SIMPLE}\"");
    assert_eq!(result, "value = \"hello\"");
    std::env::remove_var("MQGATE_TEST_VAR_SIMPLE");
}

#[test]
fn test_substitute_env_vars_with_default() {
    // Unset var should use default
    std::env::remove_var("MQGATE_TEST_VAR_UNSET");
    let result = substitute_env_vars("value = \"${MQGATE_TEST_VAR_UNSET:-fallback}\"");
    assert_eq!(result, "value = \"fallback\"");

    // Set var should use env value
    std::env::set_var("MQGATE_TEST_VAR_SET", "env_value");
    let result = substitute_env_vars("value = \"${MQGATE_TEST_VAR_SET:-fallback}\"");
    assert_eq!(result, "value = \"env_value\"");
    std::env::remove_var("MQGATE_TEST_VAR_SET");
}

#[test]
fn test_substitute_env_vars_missing_no_default() {
    std::env::remove_var("MQGATE_TEST_VAR_MISSING");
    let result = substitute_env_vars("value = \"${MQGATE_TEST_VAR_MISSING}\"");
    assert_eq!(result, "value = \"\"");
}

#[test]
fn test_load_config_with_env_substitution() {
    std::env::set_var("MQGATE_TEST_BIND_HOST", "127.0.0.1");
    std::env::set_var("MQGATE_TEST_BIND_PORT", "1885");

    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
[server]
bind = "${{MQGATE_TEST_BIND_HOST}}:${{MQGATE_TEST_BIND_PORT}}"
workers = ${{MQGATE_TEST_WORKERS:-4}}
connect_timeout = "10s"

[metrics]
report_interval = "1m"
top_topics = 3
"#
    )
    .unwrap();

    let config = Config::load(file.path()).unwrap();
    assert_eq!(config.server.bind.to_string(), "127.0.0.1:1885");
    assert_eq!(config.server.workers, 4);
    assert_eq!(config.server.connect_timeout, Duration::from_secs(10));
    assert_eq!(config.metrics.report_interval, Some(Duration::from_secs(60)));
    assert_eq!(config.metrics.top_topics, 3);

    std::env::remove_var("MQGATE_TEST_BIND_HOST");
    std::env::remove_var("MQGATE_TEST_BIND_PORT");
}

#[test]
fn test_load_missing_file_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::load(dir.path().join("absent.toml")).unwrap();
    assert_eq!(config.server.bind.port(), 1883);
    assert_eq!(config.limits.max_payload_size, DEFAULT_MAX_PAYLOAD_SIZE);
}

#[test]
fn test_default_config() {
    let config = Config::default();
    assert_eq!(config.log.level, "info");
    assert_eq!(config.server.bind.port(), 1883);
    assert_eq!(config.server.traffic_class, 0x68);
    assert_eq!(config.server.connect_timeout, Duration::from_secs(30));
    assert_eq!(config.limits.max_payload_size, 256 * 1024);
    assert_eq!(config.limits.max_topic_length, 65535);
    assert!(!config.metrics.enabled);
    assert_eq!(config.metrics.report_interval, None);
    assert_eq!(config.metrics.top_topics, 10);
    assert!(config.validate().is_ok());
}

#[test]
fn test_parse_partial_config() {
    let config = Config::parse(
        r#"
[log]
level = "debug"

[limits]
max_payload_size = 1024

[metrics]
enabled = true
bind = "127.0.0.1:9191"
"#,
    )
    .unwrap();

    assert_eq!(config.log.level, "debug");
    assert_eq!(config.limits.max_payload_size, 1024);
    assert_eq!(config.limits.max_topic_length, 65535);
    assert!(config.metrics.enabled);
    assert_eq!(config.metrics.bind.port(), 9191);
    assert_eq!(config.server.bind.port(), 1883);
}

#[test]
fn test_validation_rejects_bad_limits() {
    let err = Config::parse("[limits]\nmax_payload_size = 0\n").unwrap_err();
    assert!(matches!(err, ConfigError::Validation(_)));

    let err = Config::parse("[limits]\nmax_payload_size = 300000000\n").unwrap_err();
    assert!(matches!(err, ConfigError::Validation(_)));

    let err = Config::parse("[limits]\nmax_topic_length = 70000\n").unwrap_err();
    assert!(matches!(err, ConfigError::Validation(_)));

    let err = Config::parse("[server]\ntraffic_class = 256\n").unwrap_err();
    assert!(matches!(err, ConfigError::Validation(_)));

    let err = Config::parse("[log]\nlevel = \"loud\"\n").unwrap_err();
    assert!(matches!(err, ConfigError::Validation(_)));
}

#[test]
fn test_parse_error() {
    let err = Config::parse("[server\nbind = 1").unwrap_err();
    assert!(matches!(err, ConfigError::Parse(_)));
}

#[test]
fn test_broker_config_conversion() {
    let mut config = Config::parse(
        r#"
[server]
bind = "127.0.0.1:2883"
workers = 2
traffic_class = 0
shutdown_timeout = "250ms"
"#,
    )
    .unwrap();
    config.metrics.report_interval = Some(Duration::from_secs(30));

    let broker = config.broker_config();
    assert_eq!(broker.bind_addr.to_string(), "127.0.0.1:2883");
    assert_eq!(broker.num_workers, 2);
    assert_eq!(broker.transport.traffic_class, None);
    assert!(broker.transport.tcp_nodelay);
    assert_eq!(broker.shutdown_timeout, Duration::from_millis(250));
    assert_eq!(broker.report_interval, Some(Duration::from_secs(30)));
    assert_eq!(broker.report_top_topics, 10);
}

#[test]
fn test_zero_workers_uses_cpu_count() {
    let broker = Config::default().broker_config();
    assert!(broker.num_workers >= 1);
    assert_eq!(broker.transport.traffic_class, Some(0x68));
}
