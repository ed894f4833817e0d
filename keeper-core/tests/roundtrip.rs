//! Wire roundtrip tests for unit records.
//!
//! Records travel as JSON between daemon and clients; every field must come
//! back exactly, argument order included.

use chrono::{TimeZone, Utc};
use keeper_core::types::{
    ProbeState, ResolvedUnit, RestartPolicy, Unit, UnitDefinition, UnitName, UnitState,
};
use rstest::rstest;
use std::path::PathBuf;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn definition() -> UnitDefinition {
    UnitDefinition {
        name: UnitName::from("web"),
        executable: PathBuf::from("/usr/bin/web"),
        arguments: vec!["--port".into(), "8080".into(), "--verbose".into()],
        dependencies: vec![UnitName::from("db")],
        restart_policy: RestartPolicy::Always,
        uid: 1000,
        gid: 100,
        enabled: true,
        liveness_probe: None,
    }
}

fn stopped_unit() -> Unit {
    Unit::stopped(&definition())
}

fn healthy_unit() -> Unit {
    Unit {
        process_probe_state: ProbeState::Alive,
        liveness_probe_state: ProbeState::Alive,
        pid: Some(4242),
        uptime_s: 360,
        state: UnitState::RunningAndHealthy,
        started_at: Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()),
        restart_count: 2,
        ..stopped_unit()
    }
}

fn degraded_unit() -> Unit {
    Unit {
        name: UnitName::from("сервис-ワーカー"),
        arguments: vec![],
        restart_policy: RestartPolicy::DisabledTemporarily,
        enabled: false,
        process_probe_state: ProbeState::Alive,
        liveness_probe_state: ProbeState::Dead,
        pid: Some(1),
        uptime_s: u64::MAX,
        state: UnitState::RunningButDegraded,
        last_error: Some("exit status: 1 <\"quoted\">".to_string()),
        ..stopped_unit()
    }
}

// ---------------------------------------------------------------------------
// Roundtrips
// ---------------------------------------------------------------------------

#[rstest]
#[case("stopped", stopped_unit())]
#[case("healthy", healthy_unit())]
#[case("degraded_unicode", degraded_unit())]
fn unit_roundtrip(#[case] label: &str, #[case] unit: Unit) {
    let json = serde_json::to_string(&unit)
        .unwrap_or_else(|e| panic!("[{label}] serialize failed: {e}"));
    let back: Unit = serde_json::from_str(&json)
        .unwrap_or_else(|e| panic!("[{label}] deserialize failed: {e}"));
    assert_eq!(unit, back, "[{label}] record changed across the wire");
    assert_eq!(unit.arguments, back.arguments, "[{label}] argument order");
}

#[test]
fn stopped_unit_omits_pid() {
    let json = serde_json::to_value(stopped_unit()).expect("serialize");
    assert!(json.get("pid").is_none(), "absent pid must not be serialized");
    assert_eq!(json["state"], "stopped");
    assert_eq!(json["restart_policy"], "always");
}

#[test]
fn resolved_unit_embeds_dependencies_one_level_deep() {
    let db = Unit {
        name: UnitName::from("db"),
        dependencies: vec![UnitName::from("web")],
        ..stopped_unit()
    };
    let resolved = ResolvedUnit {
        unit: stopped_unit(),
        dependencies: vec![db],
    };

    let json = serde_json::to_value(&resolved).expect("serialize");
    // Nested dependency lists stay names, even for a web <-> db loop.
    assert_eq!(json["dependencies"][0]["dependencies"][0], "web");

    let back: ResolvedUnit = serde_json::from_value(json).expect("deserialize");
    assert_eq!(back, resolved);
}

#[rstest]
#[case(UnitState::Starting)]
#[case(UnitState::Running)]
#[case(UnitState::RunningAndHealthy)]
#[case(UnitState::RunningButDegraded)]
#[case(UnitState::Stopping)]
#[case(UnitState::Stopped)]
fn unit_state_roundtrip(#[case] state: UnitState) {
    let json = serde_json::to_string(&state).expect("serialize");
    let back: UnitState = serde_json::from_str(&json).expect("deserialize");
    assert_eq!(state, back);
}
