//! Configuration loading: TOML files plus `BUNDLEMQ_*` overrides.
//!
//! Environment variables are process-global, so every test touching them is
//! `#[serial]`.

use std::env;
use std::io::Write;

use bundlemq::cluster::{BrokerConfig, PersistenceConfig};
use bundlemq::Error;
use serial_test::serial;
use tempfile::NamedTempFile;

const ENV_VARS: &[&str] = &[
    "BUNDLEMQ_NAME",
    "BUNDLEMQ_HOST",
    "BUNDLEMQ_PORT",
    "BUNDLEMQ_HEALTH_PORT",
    "BUNDLEMQ_ALLOW_RENAME",
    "BUNDLEMQ_COORDINATION_ENDPOINTS",
    "BUNDLEMQ_DATA_PATH",
    "BUNDLEMQ_MAX_REDO",
    "BUNDLEMQ_OPERATION_TIMEOUT_MS",
    "BUNDLEMQ_HEARTBEAT_INTERVAL_MS",
    "BUNDLEMQ_FAILURE_THRESHOLD",
    "BUNDLEMQ_BUNDLE_COUNT",
];

/// Run `f` with exactly `vars` set, restoring the previous environment.
fn with_env<F: FnOnce()>(vars: &[(&str, &str)], f: F) {
    let saved: Vec<(&str, Option<String>)> =
        ENV_VARS.iter().map(|k| (*k, env::var(k).ok())).collect();
    for key in ENV_VARS {
        env::remove_var(key);
    }
    for (key, value) in vars {
        env::set_var(key, value);
    }

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f));

    for (key, value) in saved {
        match value {
            Some(v) => env::set_var(key, v),
            None => env::remove_var(key),
        }
    }
    if let Err(panic) = result {
        std::panic::resume_unwind(panic);
    }
}

fn config_file(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
#[serial]
fn test_load_file_without_overrides() {
    let file = config_file(
        r#"
name = "broker-7"
port = 7107

[heartbeat]
interval_ms = 250
failure_threshold = 5
"#,
    );
    with_env(&[], || {
        let config = BrokerConfig::load(file.path()).unwrap();
        assert_eq!(config.name, "broker-7");
        assert_eq!(config.url(), "127.0.0.1:7107");
        assert_eq!(config.heartbeat.interval_ms, 250);
        assert_eq!(config.heartbeat.failure_threshold, 5);
        assert_eq!(config.persistence, PersistenceConfig::Memory);
    });
}

#[test]
#[serial]
fn test_env_overrides_file() {
    let file = config_file("name = \"from-file\"\nport = 7100\n");
    with_env(
        &[
            ("BUNDLEMQ_NAME", "from-env"),
            ("BUNDLEMQ_PORT", "7200"),
            ("BUNDLEMQ_HEALTH_PORT", "0"),
            ("BUNDLEMQ_ALLOW_RENAME", "false"),
            ("BUNDLEMQ_COORDINATION_ENDPOINTS", "zk1:2181, zk2:2181,"),
            ("BUNDLEMQ_MAX_REDO", "7"),
            ("BUNDLEMQ_BUNDLE_COUNT", "64"),
        ],
        || {
            let config = BrokerConfig::load(file.path()).unwrap();
            assert_eq!(config.name, "from-env");
            assert_eq!(config.port, 7200);
            assert_eq!(config.health_port, 0);
            assert!(!config.allow_rename);
            assert_eq!(config.coordination.endpoints, vec!["zk1:2181", "zk2:2181"]);
            assert_eq!(config.redo.max_redo, 7);
            assert_eq!(config.bundles.count, 64);
        },
    );
}

#[test]
#[serial]
fn test_data_path_switches_to_local_persistence() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().to_string_lossy().to_string();
    let file = config_file("");
    with_env(&[("BUNDLEMQ_DATA_PATH", &path)], || {
        let config = BrokerConfig::load(file.path()).unwrap();
        assert_eq!(config.persistence, PersistenceConfig::Local { path: path.clone() });
    });
}

#[test]
#[serial]
fn test_unparsable_env_value_is_config_error() {
    let file = config_file("");
    with_env(&[("BUNDLEMQ_PORT", "not-a-port")], || {
        let err = BrokerConfig::load(file.path()).unwrap_err();
        assert!(matches!(&err, Error::Config(msg) if msg.contains("BUNDLEMQ_PORT")), "{err:?}");
    });
}

#[test]
#[serial]
fn test_invalid_values_fail_validation() {
    let file = config_file("name = \"\"\n[heartbeat]\nfailure_threshold = 0\n");
    with_env(&[], || {
        let err = BrokerConfig::load(file.path()).unwrap_err();
        match err {
            Error::Config(msg) => {
                assert!(msg.contains("name must not be empty"), "{msg}");
                assert!(msg.contains("failure_threshold"), "{msg}");
            }
            other => panic!("expected config error, got {other:?}"),
        }
    });
}

#[test]
#[serial]
fn test_missing_file_is_config_error() {
    with_env(&[], || {
        let err = BrokerConfig::load("/nonexistent/bundlemq.toml").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    });
}

#[test]
fn test_malformed_toml_is_rejected() {
    assert!(BrokerConfig::from_toml_str("port = \"seventy\"").is_err());
}
