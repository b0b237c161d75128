use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;

use branchsync_core::{Config, ConfigError, SourceMode, StoreConfig, TargetConfig, TargetName};
use branchsync_daemon::{DaemonError, MemoryStore, NotificationStore, SyncCoordinator};
use branchsync_sync::testing::FakeVcs;
use branchsync_sync::ChangeHandler;

const WATCH: &str = "/dms/git-repo-status/app";
const PROD_NODE: &str = "/dms/git-repo-status/app/deploy-prod";

type Seen = Arc<Mutex<Vec<(String, String, PathBuf)>>>;

fn target(resource_dir: &Path, name: &str, uri: &str) -> TargetConfig {
    TargetConfig {
        name: name.into(),
        kind: Some("git".into()),
        git_uri: uri.into(),
        git_port: None,
        resource_directory: resource_dir.to_path_buf(),
        ssh_key_plain: None,
        ssh_key_file: None,
        ssh_key_passphrase: None,
        ssh_host_keys: vec![],
    }
}

fn config(targets: Vec<TargetConfig>) -> Config {
    Config {
        source: SourceMode::None,
        store: StoreConfig::default(),
        workers: 2,
        deploy_prefix: "deploy-".into(),
        targets,
    }
}

fn remote() -> Arc<FakeVcs> {
    Arc::new(
        FakeVcs::new()
            .with_branch("master", &[("f", "v1")])
            .with_branch("deploy-prod", &[("f", "p1")])
            .with_branch("deploy-staging", &[("f", "s1")])
            .with_branch("feature-x", &[("f", "x1")]),
    )
}

fn recorder(coordinator: &SyncCoordinator<FakeVcs>) -> Seen {
    let seen: Seen = Arc::default();
    let sink = Arc::clone(&seen);
    let handler: Arc<dyn ChangeHandler> =
        Arc::new(move |target: &TargetName, branch: &str, dir: &Path| {
            sink.lock()
                .expect("lock")
                .push((target.to_string(), branch.to_owned(), dir.to_path_buf()));
        });
    assert!(coordinator.add_handler(handler));
    seen
}

async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn calls(seen: &Seen) -> usize {
    seen.lock().expect("lock").len()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn startup_sync_and_one_notification() {
    let dir = TempDir::new().expect("tempdir");
    let data = dir.path().join("data");
    let vcs = remote();
    let store = Arc::new(MemoryStore::new());
    let coordinator = SyncCoordinator::build(
        &config(vec![target(&data, "app", "ssh://git@example.com/org/app.git")]),
        Arc::clone(&vcs),
    )
    .expect("build");
    let seen = recorder(&coordinator);
    coordinator.attach_store(store.clone());
    coordinator.start();

    wait_until("startup branch syncs", || calls(&seen) == 2).await;
    wait_until("watch subscription", || store.subscriber_count(WATCH).0 == 1).await;

    assert_eq!(std::fs::read_to_string(data.join("app/master/f")).expect("read"), "v1");
    assert_eq!(std::fs::read_to_string(data.join("app/prod/f")).expect("read"), "p1");
    assert_eq!(std::fs::read_to_string(data.join("app/staging/f")).expect("read"), "s1");
    assert!(!data.join("app/x").exists(), "feature-x must be ignored");

    store.set_data(PROD_NODE, br#"{"before":"c1","after":"c2"}"#);
    wait_until("notified branch sync", || calls(&seen) == 3).await;
    coordinator.shutdown().await;

    assert_eq!(vcs.pulls_of("deploy-prod"), 2);
    assert_eq!(vcs.pulls_of("deploy-staging"), 1);
    let seen = seen.lock().expect("lock");
    assert_eq!(
        seen[2],
        ("app".to_owned(), "deploy-prod".to_owned(), data.join("app/prod"))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn only_changed_markers_trigger_a_sync() {
    let dir = TempDir::new().expect("tempdir");
    let data = dir.path().join("data");
    let vcs = remote();
    let store = Arc::new(MemoryStore::new());
    store.set_data(PROD_NODE, br#"{"before":"c1","after":"c1"}"#);

    let coordinator = SyncCoordinator::build(
        &config(vec![target(&data, "app", "ssh://git@example.com/org/app.git")]),
        Arc::clone(&vcs),
    )
    .expect("build");
    let seen = recorder(&coordinator);
    coordinator.attach_store(store.clone());
    coordinator.start();

    wait_until("startup branch syncs", || calls(&seen) == 2).await;
    wait_until("leaf subscription", || store.subscriber_count(PROD_NODE).1 == 1).await;

    store.set_data(PROD_NODE, br#"{"before":"C2","after":"c2"}"#);
    store.set_data(PROD_NODE, br#"{"after":"c3"}"#);
    store.set_data(PROD_NODE, b"not json");
    store.set_data(PROD_NODE, br#"{"before":"c3"}"#);
    wait_until("notified branch sync", || calls(&seen) == 3).await;
    coordinator.shutdown().await;

    assert_eq!(vcs.pulls_of("deploy-prod"), 2);
    assert_eq!(calls(&seen), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn force_trigger_without_store() {
    let dir = TempDir::new().expect("tempdir");
    let data = dir.path().join("data");
    let vcs = remote();
    let coordinator = SyncCoordinator::build(
        &config(vec![target(&data, "app", "ssh://git@example.com/org/app.git")]),
        Arc::clone(&vcs),
    )
    .expect("build");
    let seen = recorder(&coordinator);
    coordinator.connect().expect("source none connects nothing");
    coordinator.start();
    wait_until("startup branch syncs", || calls(&seen) == 2).await;

    assert!(!coordinator.force_trigger("unknown", "deploy-prod").expect("ignored"));
    assert!(coordinator.force_trigger("app", "deploy-prod").expect("scheduled"));
    assert!(matches!(
        coordinator.force_trigger("app", "feature-x"),
        Err(DaemonError::Sync(_))
    ));
    wait_until("forced sync", || calls(&seen) == 3).await;
    coordinator.shutdown().await;

    assert_eq!(coordinator.find_repo_dir("app"), Some(data.join("app")));
    assert_eq!(coordinator.find_repo_dir("unknown"), None);
    assert_eq!(vcs.pulls_of("deploy-prod"), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn targets_with_bad_credentials_are_skipped() {
    let dir = TempDir::new().expect("tempdir");
    let mut broken = target(dir.path(), "broken", "ssh://git@example.com/org/lib.git");
    broken.ssh_key_plain = Some("not a key".into());

    let coordinator = SyncCoordinator::build(
        &config(vec![
            target(dir.path(), "app", "ssh://git@example.com/org/app.git"),
            broken,
        ]),
        remote(),
    )
    .expect("build");

    assert_eq!(coordinator.target_names(), vec![TargetName::from("app")]);
    coordinator.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn repository_uri_without_name_is_fatal() {
    let dir = TempDir::new().expect("tempdir");
    let result = SyncCoordinator::build(
        &config(vec![target(dir.path(), "app", "no-slashes-here")]),
        remote(),
    );
    assert!(matches!(
        result,
        Err(DaemonError::Config(ConfigError::RepoUri { .. }))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn watch_root_is_created_in_store() {
    let dir = TempDir::new().expect("tempdir");
    let store = Arc::new(MemoryStore::new());
    let coordinator = SyncCoordinator::build(
        &config(vec![target(dir.path(), "app", "ssh://git@example.com/org/app.git")]),
        remote(),
    )
    .expect("build");
    coordinator.attach_store(store.clone());
    coordinator.start();

    wait_until("watch subscription", || store.subscriber_count(WATCH).0 == 1).await;
    assert!(store.children(WATCH).expect("watch node exists").is_empty());
    coordinator.shutdown().await;
}
