use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;

use branchsync_core::Config;
use branchsync_sync::{Git2Vcs, Vcs};

use crate::coordinator::SyncCoordinator;
use crate::error::{io_err, DaemonError};
use crate::paths::{branchsync_root, socket_path};
use crate::protocol::{DaemonRequest, DaemonResponse};

/// Start the daemon runtime and block the current thread until it exits.
pub fn start_blocking(config: Config, home: &Path, log_json: bool) -> Result<(), DaemonError> {
    init_tracing(log_json);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(config, home.to_path_buf()))
}

/// Build the coordinator for `config` with the git backend, connect the
/// configured store and serve until stopped.
pub async fn run(config: Config, home: PathBuf) -> Result<(), DaemonError> {
    let coordinator = Arc::new(SyncCoordinator::build(&config, Arc::new(Git2Vcs))?);
    coordinator.connect()?;
    serve(coordinator, home).await
}

/// Start every watcher, serve the control socket and wait for ctrl-c or a
/// `stop` request, then drain the coordinator.
pub async fn serve<V: Vcs>(
    coordinator: Arc<SyncCoordinator<V>>,
    home: PathBuf,
) -> Result<(), DaemonError> {
    ensure_runtime_dirs(&home)?;
    let started_at_unix = unix_seconds_now();
    coordinator.start();

    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let home = home.clone();
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move {
            let result = socket_server_task(
                home,
                coordinator,
                shutdown.clone(),
                shutdown.subscribe(),
                started_at_unix,
            )
            .await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => {
                            tracing::info!("received ctrl-c, shutting down daemon");
                            let _ = shutdown.send(());
                            Ok(())
                        }
                        Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
                    }
                }
            }
        })
    };

    let (socket_result, signal_result) = tokio::join!(socket_handle, signal_handle);

    coordinator.shutdown().await;
    handle_join("socket_server", socket_result)?;
    handle_join("signal_handler", signal_result)?;
    Ok(())
}

async fn socket_server_task<V: Vcs>(
    home: PathBuf,
    coordinator: Arc<SyncCoordinator<V>>,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
    started_at_unix: u64,
) -> Result<(), DaemonError> {
    let socket = socket_path(&home);
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;
    tracing::info!(socket = %socket.display(), "control socket listening");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let home = home.clone();
                let coordinator = Arc::clone(&coordinator);
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(
                        stream,
                        home,
                        coordinator,
                        shutdown_tx,
                        started_at_unix,
                    ).await {
                        tracing::error!(error = %err, "socket client error");
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

async fn handle_socket_client<V: Vcs>(
    stream: UnixStream,
    home: PathBuf,
    coordinator: Arc<SyncCoordinator<V>>,
    shutdown_tx: broadcast::Sender<()>,
    started_at_unix: u64,
) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("daemon socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request: DaemonRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &DaemonResponse::error(format!("invalid request JSON: {err}")),
                )
                .await?;
                continue;
            }
        };

        let stop = request.cmd == "stop";
        let response = if stop {
            let _ = shutdown_tx.send(());
            DaemonResponse::ok(json!({ "stopping": true }))
        } else {
            dispatch_request(&home, &coordinator, &request, started_at_unix)
        };

        write_response(&mut writer, &response).await?;
        if stop {
            break;
        }
    }

    Ok(())
}

/// Answer every command except `stop`, which needs the shutdown channel.
fn dispatch_request<V: Vcs>(
    home: &Path,
    coordinator: &SyncCoordinator<V>,
    request: &DaemonRequest,
    started_at_unix: u64,
) -> DaemonResponse {
    match request.cmd.as_str() {
        "status" => DaemonResponse::ok(build_status_payload(home, coordinator, started_at_unix)),
        "trigger" => {
            let (Some(target), Some(branch)) = (&request.target, &request.branch) else {
                return DaemonResponse::error("trigger requires 'target' and 'branch'");
            };
            match coordinator.force_trigger(target, branch) {
                Ok(scheduled) => DaemonResponse::ok(json!({
                    "target": target,
                    "branch": branch,
                    "scheduled": scheduled,
                })),
                Err(err) => DaemonResponse::error(err.to_string()),
            }
        }
        "locate" => {
            let Some(target) = &request.target else {
                return DaemonResponse::error("locate requires 'target'");
            };
            DaemonResponse::ok(json!({
                "target": target,
                "repo_dir": coordinator
                    .find_repo_dir(target)
                    .map(|dir| dir.display().to_string()),
            }))
        }
        other => DaemonResponse::error(format!("unknown command '{other}'")),
    }
}

fn build_status_payload<V: Vcs>(
    home: &Path,
    coordinator: &SyncCoordinator<V>,
    started_at_unix: u64,
) -> Value {
    let scheduler = coordinator.scheduler();
    json!({
        "running": true,
        "started_at_unix": started_at_unix,
        "socket": socket_path(home).display().to_string(),
        "targets": coordinator.status(),
        "pending_keys": scheduler.pending_keys(),
        "in_flight": scheduler.in_flight(),
    })
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::Protocol(format!(
                "daemon socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale daemon socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

fn ensure_runtime_dirs(home: &Path) -> Result<(), DaemonError> {
    let root = branchsync_root(home);
    if !root.exists() {
        fs::create_dir_all(&root).map_err(|e| io_err(&root, e))?;
    }
    Ok(())
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &DaemonResponse,
) -> Result<(), DaemonError> {
    let payload = serde_json::to_string(response)?;
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))?;
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

fn unix_seconds_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Install the global subscriber: `RUST_LOG` or `info`, optionally as JSON.
pub fn init_tracing(json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt().with_env_filter(filter).with_target(false);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use branchsync_core::TargetConfig;
    use branchsync_sync::testing::FakeVcs;
    use tempfile::TempDir;

    fn config(resource_dir: PathBuf) -> Config {
        Config {
            source: branchsync_core::SourceMode::None,
            store: Default::default(),
            workers: 2,
            deploy_prefix: "deploy-".into(),
            targets: vec![TargetConfig {
                name: "app".into(),
                kind: None,
                git_uri: "ssh://git@example.com/org/app.git".into(),
                git_port: None,
                resource_directory: resource_dir,
                ssh_key_plain: None,
                ssh_key_file: None,
                ssh_key_passphrase: None,
                ssh_host_keys: vec![],
            }],
        }
    }

    fn coordinator(dir: &TempDir) -> SyncCoordinator<FakeVcs> {
        let vcs = FakeVcs::new().with_branch("master", &[("f", "v1")]);
        SyncCoordinator::build(&config(dir.path().join("data")), Arc::new(vcs)).expect("build")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn status_payload_lists_targets() {
        let dir = TempDir::new().expect("tempdir");
        let coordinator = coordinator(&dir);

        let payload = build_status_payload(dir.path(), &coordinator, 1_000_000);

        assert_eq!(payload["running"], json!(true));
        assert_eq!(payload["started_at_unix"], json!(1_000_000u64));
        assert_eq!(payload["pending_keys"], json!(0));
        let targets = payload["targets"].as_array().expect("targets array");
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0]["name"], json!("app"));
        assert_eq!(targets[0]["watch_path"], json!("/dms/git-repo-status/app"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn locate_and_trigger_requests() {
        let dir = TempDir::new().expect("tempdir");
        let coordinator = coordinator(&dir);

        let locate = dispatch_request(
            dir.path(),
            &coordinator,
            &DaemonRequest::new("locate").with_target("app"),
            0,
        );
        assert!(locate.ok);
        assert_eq!(
            locate.data.expect("data")["repo_dir"],
            json!(dir.path().join("data/app").display().to_string())
        );

        let unknown = dispatch_request(
            dir.path(),
            &coordinator,
            &DaemonRequest::new("trigger").with_target("other").with_branch("deploy-prod"),
            0,
        );
        assert_eq!(unknown.data.expect("data")["scheduled"], json!(false));

        let missing_branch = dispatch_request(
            dir.path(),
            &coordinator,
            &DaemonRequest::new("trigger").with_target("app"),
            0,
        );
        assert!(!missing_branch.ok);

        let rejected = dispatch_request(
            dir.path(),
            &coordinator,
            &DaemonRequest::new("trigger").with_target("app").with_branch("feature-x"),
            0,
        );
        assert!(!rejected.ok, "non-deploy branches are rejected");

        let unknown_cmd = dispatch_request(dir.path(), &coordinator, &DaemonRequest::new("sync"), 0);
        assert_eq!(unknown_cmd.error.as_deref(), Some("unknown command 'sync'"));
        coordinator.shutdown().await;
    }

    #[test]
    fn stale_socket_file_is_removed() {
        let dir = TempDir::new().expect("tempdir");
        let socket = dir.path().join("daemon.sock");
        fs::write(&socket, b"").expect("stale file");
        prepare_socket_for_bind(&socket).expect("prepare");
        assert!(!socket.exists());
    }
}
