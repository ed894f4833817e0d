//! Configuration loading, defaults and validation error messages.

use assert_fs::prelude::*;
use keeper_core::{ConfigError, Configuration, RestartPolicy, UnitName};
use nix::unistd::{Gid, Uid};
use predicates::prelude::*;
use rstest::rstest;
use std::time::Duration;

const COMPLETE: &str = r#"
log_level: debug
socket: /tmp/keeper-test.sock
probe:
  interval_ms: 250
  deadline_ms: 1500
stop_grace_ms: 2000
restart:
  window_s: 30
  base_delay_ms: 500
  max_delay_ms: 8000
units:
  - name: db
    executable: /usr/bin/postgres
    arguments: ["-D", "/var/lib/pg"]
    restart_policy: always
    uid: 999
    gid: 998
  - name: web
    executable: /usr/bin/web
    dependencies: [db]
    restart_policy: disabled_temporarily
    enabled: false
    liveness_probe:
      executable: /usr/bin/curl
      arguments: ["-sf", "http://127.0.0.1:8080/health"]
      interval_s: 10
      timeout_s: 3
"#;

const MANDATORY_ONLY: &str = r#"
units:
  - name: foo
    executable: ls
"#;

#[test]
fn complete_file_loads_every_field() {
    let config = Configuration::from_yaml_str(COMPLETE).expect("parse");

    assert_eq!(config.log_level, "debug");
    assert_eq!(
        config.socket.as_deref(),
        Some(std::path::Path::new("/tmp/keeper-test.sock"))
    );
    assert_eq!(config.probe.interval(), Duration::from_millis(250));
    assert_eq!(config.probe.deadline(), Duration::from_millis(1500));
    assert_eq!(config.stop_grace(), Duration::from_secs(2));
    assert_eq!(config.restart.window(), Duration::from_secs(30));
    assert_eq!(config.restart.base_delay(), Duration::from_millis(500));
    assert_eq!(config.restart.max_delay(), Duration::from_secs(8));

    let units = config.units();
    assert_eq!(units.len(), 2);
    assert_eq!(units[0].name, UnitName::from("db"));
    assert_eq!(units[0].arguments, vec!["-D", "/var/lib/pg"]);
    assert_eq!((units[0].uid, units[0].gid), (999, 998));
    assert_eq!(units[1].dependencies, vec![UnitName::from("db")]);
    assert_eq!(units[1].restart_policy, RestartPolicy::DisabledTemporarily);
    assert!(!units[1].enabled);

    let probe = units[1].liveness_probe.as_ref().expect("liveness probe");
    assert_eq!(probe.timeout(), Duration::from_secs(3));
    assert_eq!(probe.interval(), Duration::from_secs(10));
}

#[test]
fn optional_keys_fall_back_to_defaults() {
    let config = Configuration::from_yaml_str(MANDATORY_ONLY).expect("parse");

    assert_eq!(config.log_level, "info");
    assert!(config.socket.is_none());
    assert_eq!(config.probe.interval(), Duration::from_secs(1));
    assert_eq!(config.stop_grace(), Duration::from_secs(5));

    let unit = &config.units()[0];
    assert!(unit.enabled, "units are enabled unless stated otherwise");
    assert_eq!(unit.restart_policy, RestartPolicy::Always);
    assert_eq!(unit.uid, Uid::current().as_raw());
    assert_eq!(unit.gid, Gid::current().as_raw());
    assert!(unit.liveness_probe.is_none());
}

#[test]
fn missing_executable_is_a_parse_error() {
    let err = Configuration::from_yaml_str("units:\n  - name: foo\n").unwrap_err();
    assert!(matches!(err, ConfigError::Yaml(_)), "got: {err}");
}

#[test]
fn from_file_reports_path_on_parse_error() {
    let dir = assert_fs::TempDir::new().expect("tempdir");
    let file = dir.child("keeper.yaml");
    file.write_str("units: [ { name: broken").expect("write");

    let err = Configuration::from_file(file.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Parse { .. }), "got: {err}");
    assert!(predicate::str::contains("keeper.yaml").eval(&err.to_string()));
}

#[test]
fn from_file_missing_file_is_io_error() {
    let dir = assert_fs::TempDir::new().expect("tempdir");
    let err = Configuration::from_file(dir.path().join("absent.yaml")).unwrap_err();
    assert!(matches!(err, ConfigError::Io { .. }), "got: {err}");
}

#[test]
fn from_file_loads_valid_file() {
    let dir = assert_fs::TempDir::new().expect("tempdir");
    let file = dir.child("keeper.yaml");
    file.write_str(COMPLETE).expect("write");

    let config = Configuration::from_file(file.path()).expect("load");
    let order: Vec<String> = config.start_order().into_iter().map(|n| n.0).collect();
    assert_eq!(order, vec!["db", "web"]);
}

#[rstest]
#[case::duplicate(
    "units:\n  - {name: a, executable: x}\n  - {name: a, executable: y}\n",
    "unit 'a' is defined more than once"
)]
#[case::unknown_dependency(
    "units:\n  - {name: a, executable: x, dependencies: [ghost]}\n",
    "unit 'a' depends on unknown unit 'ghost'"
)]
#[case::cycle(
    "units:\n  - {name: a, executable: x, dependencies: [b]}\n  - {name: b, executable: y, dependencies: [a]}\n",
    "dependency cycle: a -> b -> a"
)]
#[case::unknown_user(
    "units:\n  - {name: a, executable: x, user: no-such-user-keeper-test}\n",
    "unit 'a' runs as unknown user 'no-such-user-keeper-test'"
)]
fn invalid_configurations_are_rejected(#[case] yaml: &str, #[case] message: &str) {
    let err = Configuration::from_yaml_str(yaml).unwrap_err();
    assert_eq!(err.to_string(), message);
}
