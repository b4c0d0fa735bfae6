/// Integration tests for importer config loading.
///
/// Covers the YAML and TOML file sources, the environment source, defaults
/// and required field validation.
use importer::config::{
    ConfigError, DEFAULT_RETENTION_DAYS, MAX_RETENTION_DAYS, load_config_from_lookup,
    load_config_from_path, load_config_from_str, load_config_from_yaml_str,
};
use std::collections::HashMap;
use std::io::Write;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const FULL_TOML: &str = r#"
dbhost = "postgres.svc"
dbport = 5432
dbuser = "k8see"
dbpassword = "s3cret"
dbname = "events"
loglevel = "info"
redis_host = "redis.svc"
redis_port = "6380"
redis_password = "p@ss/word"
redis_stream = "k8sevents"
data_retention_in_days = 14
"#;

const FULL_YAML: &str = r#"
dbhost: postgres.svc
dbport: "5432"
dbuser: k8see
dbpassword: s3cret
dbname: events
loglevel: warn
redis_host: redis.svc
redis_port: "6379"
redis_password: ""
redis_stream: k8sevents
"#;

fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect();
    move |key| map.get(key).cloned()
}

fn minimal_env() -> Vec<(&'static str, &'static str)> {
    vec![
        ("DBHOST", "localhost"),
        ("DBPORT", "5432"),
        ("DBUSER", "postgres"),
        ("DBPASSWORD", "postgres"),
        ("DBNAME", "k8see"),
        ("REDIS_HOST", "localhost"),
        ("REDIS_PORT", "6379"),
        ("REDIS_STREAM", "k8sevents"),
    ]
}

// ---------------------------------------------------------------------------
// TOML source
// ---------------------------------------------------------------------------

#[test]
fn full_config_file_loads() {
    let mut f = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("create temp file");
    write!(f, "{}", FULL_TOML).expect("write config");

    let cfg = load_config_from_path(f.path()).expect("should load");
    assert_eq!(cfg.database.host, "postgres.svc");
    assert_eq!(cfg.database.port, 5432);
    assert_eq!(cfg.database.name, "events");
    assert_eq!(cfg.redis.port, 6380);
    assert_eq!(cfg.redis.password.as_deref(), Some("p@ss/word"));
    assert_eq!(cfg.redis.url(), "redis://:p%40ss%2Fword@redis.svc:6380/");
    assert_eq!(cfg.retention_days, 14);
    assert_eq!(cfg.tracing_directive(), "info");
}

#[test]
fn missing_file_is_io_error() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let err = load_config_from_path(&dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, ConfigError::Io(_)), "got {err:?}");
}

#[test]
fn malformed_toml_is_parse_error() {
    let err = load_config_from_str("dbhost = ").unwrap_err();
    assert!(matches!(err, ConfigError::Parse(_)), "got {err:?}");
}

#[test]
fn missing_redis_stream_fails() {
    let toml = FULL_TOML.replace("redis_stream = \"k8sevents\"\n", "");
    let err = load_config_from_str(&toml).unwrap_err();
    match err {
        ConfigError::MissingField(field) => assert_eq!(field, "redis_stream"),
        other => panic!("expected MissingField, got {other:?}"),
    }
}

#[test]
fn out_of_range_port_is_invalid() {
    let toml = FULL_TOML.replace("dbport = 5432", "dbport = 70000");
    let err = load_config_from_str(&toml).unwrap_err();
    assert!(matches!(err, ConfigError::InvalidValue(_)), "got {err:?}");
    assert!(err.to_string().contains("dbport"));
}

#[test]
fn retention_falls_back_to_default() {
    for value in ["0", "-3", "\"soon\""] {
        let toml = FULL_TOML.replace(
            "data_retention_in_days = 14",
            &format!("data_retention_in_days = {value}"),
        );
        let cfg = load_config_from_str(&toml).expect("should load");
        assert_eq!(cfg.retention_days, DEFAULT_RETENTION_DAYS, "value {value}");
    }
}

#[test]
fn retention_above_the_cap_falls_back_to_default() {
    let over_cap = (MAX_RETENTION_DAYS + 1).to_string();
    let over_i32 = (i64::from(i32::MAX) + 1).to_string();
    for value in [over_cap.as_str(), over_i32.as_str(), "4294967296"] {
        let toml = FULL_TOML.replace(
            "data_retention_in_days = 14",
            &format!("data_retention_in_days = {value}"),
        );
        let cfg = load_config_from_str(&toml).expect("should load");
        assert_eq!(cfg.retention_days, DEFAULT_RETENTION_DAYS, "value {value}");
    }

    let toml = FULL_TOML.replace(
        "data_retention_in_days = 14",
        &format!("data_retention_in_days = {MAX_RETENTION_DAYS}"),
    );
    let cfg = load_config_from_str(&toml).expect("should load");
    assert_eq!(cfg.retention_days, MAX_RETENTION_DAYS);
}

// ---------------------------------------------------------------------------
// YAML source
// ---------------------------------------------------------------------------

/// Test: the YAML layout with quoted ports loads, and the empty redis
/// password means no password.
#[test]
fn yaml_config_file_loads() {
    let mut f = tempfile::Builder::new()
        .suffix(".yaml")
        .tempfile()
        .expect("create temp file");
    write!(f, "{}", FULL_YAML).expect("write config");

    let cfg = load_config_from_path(f.path()).expect("should load");
    assert_eq!(cfg.database.host, "postgres.svc");
    assert_eq!(cfg.database.port, 5432);
    assert_eq!(cfg.database.password, "s3cret");
    assert_eq!(cfg.redis.port, 6379);
    assert_eq!(cfg.redis.password, None);
    assert_eq!(cfg.redis.stream, "k8sevents");
    assert_eq!(cfg.retention_days, DEFAULT_RETENTION_DAYS);
    assert_eq!(cfg.tracing_directive(), "warn");
}

#[test]
fn yaml_accepts_integer_ports_and_retention() {
    let yaml = FULL_YAML.replace("dbport: \"5432\"", "dbport: 5433")
        + "data_retention_in_days: 7\n";
    let cfg = load_config_from_yaml_str(&yaml).expect("should load");
    assert_eq!(cfg.database.port, 5433);
    assert_eq!(cfg.retention_days, 7);
}

#[test]
fn yaml_missing_field_and_syntax_errors() {
    let yaml = FULL_YAML.replace("dbname: events\n", "");
    match load_config_from_yaml_str(&yaml).unwrap_err() {
        ConfigError::MissingField(field) => assert_eq!(field, "dbname"),
        other => panic!("expected MissingField, got {other:?}"),
    }
    let err = load_config_from_yaml_str("dbhost: [unclosed").unwrap_err();
    assert!(matches!(err, ConfigError::Parse(_)), "got {err:?}");
}

// ---------------------------------------------------------------------------
// Environment source
// ---------------------------------------------------------------------------

#[test]
fn minimal_environment_uses_defaults() {
    let cfg = load_config_from_lookup(env(&minimal_env())).expect("should load");
    assert_eq!(cfg.retention_days, 30);
    assert_eq!(cfg.redis.password, None);
    assert_eq!(cfg.redis.url(), "redis://localhost:6379/");
    assert_eq!(cfg.log_level, None);
    assert_eq!(cfg.tracing_directive(), "debug");
}

#[test]
fn environment_overrides_optional_values() {
    let mut vars = minimal_env();
    vars.extend([
        ("REDIS_PASSWORD", "hunter2"),
        ("LOGLEVEL", "warn"),
        ("DATA_RETENTION_IN_DAYS", "7"),
    ]);
    let cfg = load_config_from_lookup(env(&vars)).expect("should load");
    assert_eq!(cfg.redis.password.as_deref(), Some("hunter2"));
    assert_eq!(cfg.tracing_directive(), "warn");
    assert_eq!(cfg.retention_days, 7);
}

#[test]
fn empty_required_variable_counts_as_missing() {
    let mut vars = minimal_env();
    vars.retain(|(k, _)| *k != "DBPASSWORD");
    vars.push(("DBPASSWORD", ""));
    let err = load_config_from_lookup(env(&vars)).unwrap_err();
    match err {
        ConfigError::MissingField(field) => assert_eq!(field, "dbpassword"),
        other => panic!("expected MissingField, got {other:?}"),
    }
}

#[test]
fn non_numeric_port_variable_is_invalid() {
    let mut vars = minimal_env();
    vars.retain(|(k, _)| *k != "REDIS_PORT");
    vars.push(("REDIS_PORT", "redis"));
    let err = load_config_from_lookup(env(&vars)).unwrap_err();
    assert!(matches!(err, ConfigError::InvalidValue(_)), "got {err:?}");
}

#[test]
fn unknown_log_level_means_debug() {
    let mut vars = minimal_env();
    vars.push(("LOGLEVEL", "trace"));
    let cfg = load_config_from_lookup(env(&vars)).expect("should load");
    assert_eq!(cfg.tracing_directive(), "debug");
}
