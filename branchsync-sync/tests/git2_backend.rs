use std::fs;
use std::path::Path;
use std::sync::Arc;

use git2::{Commit, Oid, Repository, Signature};
use tempfile::TempDir;

use branchsync_core::{Target, TargetConfig, TargetName};
use branchsync_sync::{
    BranchSyncOutcome, Git2Vcs, HandlerRegistry, KeyedScheduler, RepositorySyncEngine,
};

/// Commit a single-file tree onto `refname` (creating the ref if needed).
fn commit_file(repo: &Repository, refname: &str, content: &str) -> Oid {
    let blob = repo.blob(content.as_bytes()).expect("blob");
    let mut builder = repo.treebuilder(None).expect("treebuilder");
    builder.insert("f", blob, 0o100644).expect("insert");
    let tree = repo.find_tree(builder.write().expect("write tree")).expect("tree");
    let parent = repo
        .find_reference(refname)
        .ok()
        .and_then(|r| r.peel_to_commit().ok());
    let parents: Vec<&Commit> = parent.iter().collect();
    let sig = Signature::now("branchsync", "branchsync@example.com").expect("signature");
    repo.commit(Some(refname), &sig, &sig, content, &tree, &parents)
        .expect("commit")
}

fn bare_remote(dir: &Path) -> Repository {
    let repo = Repository::init_bare(dir.join("app.git")).expect("init bare");
    let master = commit_file(&repo, "refs/heads/master", "v1");
    repo.set_head("refs/heads/master").expect("set head");
    repo.reference("refs/heads/deploy-prod", master, true, "branch")
        .expect("deploy-prod");
    repo.reference("refs/heads/feature-x", master, true, "branch")
        .expect("feature-x");
    commit_file(&repo, "refs/heads/deploy-prod", "p1");
    repo
}

fn engine(dir: &Path) -> Arc<RepositorySyncEngine<Git2Vcs>> {
    let config = TargetConfig {
        name: "app".into(),
        kind: Some("git".into()),
        git_uri: dir.join("app.git").display().to_string(),
        git_port: None,
        resource_directory: dir.join("data"),
        ssh_key_plain: None,
        ssh_key_file: None,
        ssh_key_passphrase: None,
        ssh_host_keys: vec![],
    };
    let target = Target::from_config(&config, "deploy-").expect("target");
    Arc::new(RepositorySyncEngine::new(
        Arc::new(target),
        Arc::new(Git2Vcs),
        KeyedScheduler::<TargetName>::new(2).expect("scheduler"),
        HandlerRegistry::default(),
    ))
}

fn read_f(dir: &Path) -> String {
    fs::read_to_string(dir.join("f")).expect("read f")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn clones_master_and_tracks_deploy_branch() {
    let dir = TempDir::new().expect("tempdir");
    bare_remote(dir.path());
    let engine = engine(dir.path());

    let branches = engine.sync_master().expect("sync master");
    assert_eq!(branches, vec!["deploy-prod"]);
    assert_eq!(read_f(&dir.path().join("data/app/master")), "v1");

    let outcome = engine.sync_branch("deploy-prod").expect("sync branch");
    assert_eq!(outcome, BranchSyncOutcome::Synced { resets: 0 });
    let prod = dir.path().join("data/app/prod");
    assert_eq!(read_f(&prod), "p1");

    let checkout = Repository::open(&prod).expect("open prod");
    assert_eq!(checkout.head().expect("head").shorthand(), Some("deploy-prod"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fast_forwards_when_remote_advances() {
    let dir = TempDir::new().expect("tempdir");
    let remote = bare_remote(dir.path());
    let engine = engine(dir.path());
    engine.sync_master().expect("sync master");
    engine.sync_branch("deploy-prod").expect("first sync");

    commit_file(&remote, "refs/heads/deploy-prod", "p2");
    let outcome = engine.sync_branch("deploy-prod").expect("second sync");

    assert_eq!(outcome, BranchSyncOutcome::Synced { resets: 0 });
    assert_eq!(read_f(&dir.path().join("data/app/prod")), "p2");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn diverged_checkout_is_reset_to_remote() {
    let dir = TempDir::new().expect("tempdir");
    let remote = bare_remote(dir.path());
    let engine = engine(dir.path());
    engine.sync_master().expect("sync master");
    engine.sync_branch("deploy-prod").expect("first sync");

    let prod = dir.path().join("data/app/prod");
    let local = Repository::open(&prod).expect("open prod");
    commit_file(&local, "refs/heads/deploy-prod", "local edit");
    commit_file(&remote, "refs/heads/deploy-prod", "p2");

    let outcome = engine.sync_branch("deploy-prod").expect("sync after divergence");

    assert_eq!(outcome, BranchSyncOutcome::Synced { resets: 1 });
    assert_eq!(read_f(&prod), "p2");
}
