use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use keeper_core::Configuration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;

use crate::dispatch::Dispatcher;
use crate::error::{io_err, DaemonError};
use crate::launcher::{CommandLauncher, Launcher};
use crate::paths::resolve_socket;
use crate::probe::{CommandLivenessCheck, LivenessCheck, Prober};
use crate::protocol::{RpcMethod, RpcResponse};
use crate::supervisor::Supervisor;

/// Start the daemon runtime and block the current thread until it exits.
pub fn start_blocking(
    config: Configuration,
    socket: Option<PathBuf>,
    json_logs: bool,
) -> Result<(), DaemonError> {
    init_tracing(&config.log_level, json_logs);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(config, socket))
}

/// Run the daemon with real processes and command liveness probes.
pub async fn run(config: Configuration, socket: Option<PathBuf>) -> Result<(), DaemonError> {
    run_with(
        config,
        socket,
        Arc::new(CommandLauncher),
        Arc::new(CommandLivenessCheck),
    )
    .await
}

/// Run the daemon until a shutdown request or signal arrives.
///
/// An explicit `socket` wins over the configured one, which wins over
/// `~/.keeper/keeper.sock`. Enabled units are started in dependency order
/// once the socket is bound and stopped in reverse order on the way out.
pub async fn run_with(
    config: Configuration,
    socket: Option<PathBuf>,
    launcher: Arc<dyn Launcher>,
    liveness: Arc<dyn LivenessCheck>,
) -> Result<(), DaemonError> {
    let socket = resolve_socket(socket.as_deref().or(config.socket.as_deref()))?;
    let listener = bind_socket(&socket)?;
    tracing::info!(
        socket = %socket.display(),
        units = config.units().len(),
        "keeper daemon listening",
    );

    let supervisor = Supervisor::from_configuration(&config, launcher)?;
    let order = config.start_order();
    supervisor.start_all(&order).await;

    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&supervisor), shutdown.clone()));
        let socket = socket.clone();
        let shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            let result = socket_server_task(listener, socket, dispatcher, shutdown_rx).await;
            let _ = shutdown.send(());
            result
        })
    };

    let probe_handle = {
        let shutdown = shutdown_tx.clone();
        let prober = Prober::new(Arc::clone(&supervisor), liveness, &config.probe);
        let shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            let result = prober.run(shutdown_rx).await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        let shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            let result = watch_signals(shutdown_rx).await;
            let _ = shutdown.send(());
            result
        })
    };

    let (socket_result, probe_result, signal_result) =
        tokio::join!(socket_handle, probe_handle, signal_handle);

    tracing::info!("stopping units");
    supervisor.stop_all(&order).await;

    handle_join("socket_server", socket_result)?;
    handle_join("prober", probe_result)?;
    handle_join("signal_handler", signal_result)?;
    tracing::info!("keeper daemon stopped");
    Ok(())
}

/// Resolves on SIGTERM, ctrl-c, or a shutdown raised elsewhere.
async fn watch_signals(mut stopping: broadcast::Receiver<()>) -> Result<(), DaemonError> {
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| DaemonError::Protocol(format!("cannot install SIGTERM handler: {e}")))?;
    let source = tokio::select! {
        _ = stopping.recv() => return Ok(()),
        _ = sigterm.recv() => "SIGTERM",
        interrupted = tokio::signal::ctrl_c() => {
            interrupted.map_err(|e| DaemonError::Protocol(format!("cannot install ctrl-c handler: {e}")))?;
            "ctrl-c"
        }
    };
    tracing::info!(signal = source, "signal received, shutting down");
    Ok(())
}

fn bind_socket(socket: &Path) -> Result<UnixListener, DaemonError> {
    if let Some(parent) = socket.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
    }
    prepare_socket_for_bind(socket)?;
    let listener = UnixListener::bind(socket).map_err(|e| io_err(socket, e))?;
    set_socket_permissions(socket)?;
    Ok(listener)
}

async fn socket_server_task(
    listener: UnixListener,
    socket: PathBuf,
    dispatcher: Arc<Dispatcher>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let dispatcher = Arc::clone(&dispatcher);
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(stream, dispatcher).await {
                        tracing::warn!(error = %err, "client connection failed");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

async fn handle_socket_client(
    stream: UnixStream,
    dispatcher: Arc<Dispatcher>,
) -> Result<(), DaemonError> {
    let (read_half, mut write_half) = stream.into_split();
    let mut requests = BufReader::new(read_half).lines();

    while let Some(line) = requests
        .next_line()
        .await
        .map_err(|e| io_err("keeper socket", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let response = dispatcher.handle_line(&line).await;
        write_response(&mut write_half, &response).await?;
        if response.ok && response.method == Some(RpcMethod::Shutdown) {
            break;
        }
    }

    Ok(())
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    if StdUnixStream::connect(socket).is_ok() {
        return Err(DaemonError::Protocol(format!(
            "socket {} is already in use by a running daemon",
            socket.display()
        )));
    }
    tracing::warn!(socket = %socket.display(), "replacing stale socket");

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &RpcResponse,
) -> Result<(), DaemonError> {
    let mut frame = serde_json::to_vec(response)?;
    frame.push(b'\n');
    writer
        .write_all(&frame)
        .await
        .map_err(|e| io_err("keeper socket", e))?;
    writer.flush().await.map_err(|e| io_err("keeper socket", e))
}

fn handle_join(
    task: &str,
    joined: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    joined.map_err(|e| DaemonError::Protocol(format!("{task} task panicked or was cancelled: {e}")))?
}

/// `RUST_LOG` wins over the configured level.
pub fn init_tracing(default_level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    if json {
        let _ = fmt().json().with_env_filter(filter).with_target(false).try_init();
    } else {
        let _ = fmt().with_env_filter(filter).with_target(false).try_init();
    }
}

fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn stale_socket_file_is_removed() {
        let dir = TempDir::new().expect("tempdir");
        let socket = dir.path().join("keeper.sock");
        fs::write(&socket, b"").expect("stale file");

        prepare_socket_for_bind(&socket).expect("prepare");
        assert!(!socket.exists());
    }

    #[tokio::test]
    async fn live_socket_is_not_stolen() {
        let dir = TempDir::new().expect("tempdir");
        let socket = dir.path().join("keeper.sock");
        let _listener = bind_socket(&socket).expect("bind");

        let err = bind_socket(&socket).unwrap_err();
        assert!(err.to_string().contains("already in use"), "got: {err}");
    }

    #[tokio::test]
    async fn socket_is_private_to_its_owner() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().expect("tempdir");
        let socket = dir.path().join("nested").join("keeper.sock");
        let _listener = bind_socket(&socket).expect("bind");

        let mode = fs::metadata(&socket).expect("metadata").permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn join_failures_name_the_task() {
        let err = handle_join("prober", Ok(Err(DaemonError::Protocol("boom".into())))).unwrap_err();
        assert_eq!(err.to_string(), "daemon protocol error: boom");
    }
}
