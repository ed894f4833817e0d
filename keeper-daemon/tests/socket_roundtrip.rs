//! Full daemon over a real Unix socket, with fake processes behind it.

mod common;

use common::{name, unit, FakeLauncher, FakeLiveness};
use keeper_core::{Configuration, ProbeState, RestartPolicy, UnitState};
use keeper_daemon::{
    get_units, list_units, ping, request_shutdown, run_with, start_unit, stop_unit, DaemonError,
    FailureKind,
};
use tempfile::TempDir;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn daemon_serves_clients_and_stops_units_on_shutdown() {
    let dir = TempDir::new().expect("tempdir");
    let socket = dir.path().join("keeper.sock");
    let config = Configuration::with_units(vec![
        unit("db", &[], RestartPolicy::Always),
        unit("web", &["db"], RestartPolicy::Always),
    ])
    .expect("config");

    let launcher = FakeLauncher::new();
    let daemon = tokio::spawn(run_with(
        config,
        Some(socket.clone()),
        launcher.clone(),
        FakeLiveness::new(ProbeState::Alive),
    ));

    let client_socket = socket.clone();
    let (pong, listed, ghost, stopped, resolved) = tokio::task::spawn_blocking(move || {
        let pong = ping(&client_socket, "hello")?;
        let listed = list_units(&client_socket)?;
        let ghost = start_unit(&client_socket, &name("ghost")).unwrap_err();
        let stopped = stop_unit(&client_socket, &name("web"))?;
        let resolved = get_units(&client_socket)?;
        request_shutdown(&client_socket)?;
        Ok::<_, DaemonError>((pong, listed, ghost, stopped, resolved))
    })
    .await
    .expect("client thread")
    .expect("client calls");

    daemon.await.expect("daemon task").expect("daemon run");

    assert_eq!(pong.message, "hello");

    let names: Vec<&str> = listed.iter().map(|u| u.name.as_str()).collect();
    assert_eq!(names, vec!["db", "web"]);
    assert!(listed.iter().all(|u| u.state.is_running() && u.pid.is_some()));

    match ghost {
        DaemonError::Rpc { kind, message } => {
            assert_eq!(kind, FailureKind::NotFound);
            assert_eq!(message, "unit 'ghost' not found");
        }
        other => panic!("expected not_found, got {other}"),
    }

    assert_eq!(stopped.state, UnitState::Stopped);
    let web = resolved
        .iter()
        .find(|r| r.unit.name.as_str() == "web")
        .expect("web");
    assert_eq!(web.unit.state, UnitState::Stopped);
    assert!(web.dependencies[0].state.is_running());

    // Shutdown stopped what was still running and removed the socket.
    assert_eq!(launcher.latest("/bin/db").terminations(), 1);
    assert_eq!(launcher.latest("/bin/web").terminations(), 1);
    assert!(!socket.exists());
}

#[test]
fn clients_report_a_missing_daemon() {
    let dir = TempDir::new().expect("tempdir");
    let err = list_units(&dir.path().join("keeper.sock")).unwrap_err();
    assert!(matches!(err, DaemonError::DaemonNotRunning { .. }), "got: {err}");
}
