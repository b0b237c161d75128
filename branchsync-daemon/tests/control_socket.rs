use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;

use branchsync_core::{Config, SourceMode, StoreConfig, TargetConfig};
use branchsync_daemon::{
    paths::socket_path, request_locate, request_status, request_stop, request_trigger, serve,
    SyncCoordinator,
};
use branchsync_sync::testing::FakeVcs;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn status_trigger_locate_and_stop_over_socket() {
    let home = TempDir::new().expect("home");
    let data = home.path().join("data");
    let config = Config {
        source: SourceMode::None,
        store: StoreConfig::default(),
        workers: 2,
        deploy_prefix: "deploy-".into(),
        targets: vec![TargetConfig {
            name: "app".into(),
            kind: None,
            git_uri: "ssh://git@example.com/org/app.git".into(),
            git_port: None,
            resource_directory: data.clone(),
            ssh_key_plain: None,
            ssh_key_file: None,
            ssh_key_passphrase: None,
            ssh_host_keys: vec![],
        }],
    };
    let vcs = Arc::new(
        FakeVcs::new()
            .with_branch("master", &[("f", "v1")])
            .with_branch("deploy-prod", &[("f", "p1")]),
    );
    let coordinator = Arc::new(SyncCoordinator::build(&config, vcs).expect("build"));
    let daemon = tokio::spawn(serve(coordinator, home.path().to_path_buf()));

    let home_path = home.path().to_path_buf();
    let (status, trigger, unknown, locate) = tokio::task::spawn_blocking(move || {
        let status = request_status(&home_path).expect("status");
        let trigger = request_trigger(&home_path, "app", "deploy-prod").expect("trigger");
        let unknown = request_trigger(&home_path, "nope", "deploy-prod").expect("unknown");
        let locate = request_locate(&home_path, "app").expect("locate");
        request_stop(&home_path).expect("stop");
        (status, trigger, unknown, locate)
    })
    .await
    .expect("client join");

    daemon.await.expect("daemon join").expect("daemon result");

    assert_eq!(status["running"], json!(true));
    assert_eq!(status["targets"][0]["name"], json!("app"));
    assert_eq!(trigger["scheduled"], json!(true));
    assert_eq!(unknown["scheduled"], json!(false));
    assert_eq!(locate["repo_dir"], json!(data.join("app").display().to_string()));
    assert!(!socket_path(home.path()).exists(), "socket removed on stop");
    assert_eq!(
        std::fs::read_to_string(data.join("app/prod/f")).expect("prod synced"),
        "p1"
    );
}
