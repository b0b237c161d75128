//! Scripted in-memory [`Vcs`] for tests.
//!
//! The remote is a map of branch name to file contents. A fake checkout is a
//! directory holding the working-tree files plus `.fakegit/HEAD` and
//! `.fakegit/branches`, so copying a checkout directory copies its refs too.
//! Only clone, pull and reset write working-tree files; checkout moves refs.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use branchsync_core::types::REMOTE_NAME;

use crate::vcs::{CheckoutRequest, ListMode, TransportConfig, Vcs, VcsError};

const META_DIR: &str = ".fakegit";

type Files = BTreeMap<String, String>;

/// One recorded [`Vcs`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VcsCall {
    Open(PathBuf),
    Clone { dest: PathBuf, branch: String },
    Fetch(PathBuf),
    Pull { dir: PathBuf, branch: String },
    Checkout { dir: PathBuf, branch: String, create: bool },
    Reset { dir: PathBuf, reference: String },
}

/// Handle to an open fake checkout.
#[derive(Debug)]
pub struct FakeRepo {
    dir: PathBuf,
}

impl FakeRepo {
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[derive(Default)]
pub struct FakeVcs {
    remote: Mutex<BTreeMap<String, Files>>,
    pull_failures: Mutex<HashMap<String, VecDeque<VcsError>>>,
    calls: Mutex<Vec<VcsCall>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn io(err: std::io::Error) -> VcsError {
    VcsError::Other(err.to_string())
}

impl FakeVcs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`FakeVcs::set_branch`].
    pub fn with_branch(self, branch: &str, files: &[(&str, &str)]) -> Self {
        self.set_branch(branch, files);
        self
    }

    /// Create or replace a remote branch.
    pub fn set_branch(&self, branch: &str, files: &[(&str, &str)]) {
        let files = files
            .iter()
            .map(|(name, content)| ((*name).to_owned(), (*content).to_owned()))
            .collect();
        lock(&self.remote).insert(branch.to_owned(), files);
    }

    /// Make the next pull of `branch` fail with `err`. Failures queue up.
    pub fn fail_next_pull(&self, branch: &str, err: VcsError) {
        lock(&self.pull_failures)
            .entry(branch.to_owned())
            .or_default()
            .push_back(err);
    }

    pub fn calls(&self) -> Vec<VcsCall> {
        lock(&self.calls).clone()
    }

    pub fn resets(&self) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|c| matches!(c, VcsCall::Reset { .. }))
            .count()
    }

    pub fn pulls_of(&self, branch: &str) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|c| matches!(c, VcsCall::Pull { branch: b, .. } if b == branch))
            .count()
    }

    fn record(&self, call: VcsCall) {
        lock(&self.calls).push(call);
    }

    fn remote_files(&self, branch: &str) -> Result<Files, VcsError> {
        lock(&self.remote)
            .get(branch)
            .cloned()
            .ok_or_else(|| VcsError::NotFound(format!("remote branch '{branch}'")))
    }

    fn write_tree(dir: &Path, files: &Files) -> Result<(), VcsError> {
        for (name, content) in files {
            let path = dir.join(name);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(io)?;
            }
            fs::write(&path, content).map_err(io)?;
        }
        Ok(())
    }

    fn read_head(dir: &Path) -> Result<String, VcsError> {
        fs::read_to_string(dir.join(META_DIR).join("HEAD"))
            .map(|s| s.trim().to_owned())
            .map_err(io)
    }

    fn write_head(dir: &Path, branch: &str) -> Result<(), VcsError> {
        fs::write(dir.join(META_DIR).join("HEAD"), branch).map_err(io)
    }

    fn read_local(dir: &Path) -> Result<Vec<String>, VcsError> {
        let raw = fs::read_to_string(dir.join(META_DIR).join("branches")).map_err(io)?;
        Ok(raw.lines().map(str::to_owned).collect())
    }

    fn write_local(dir: &Path, branches: &[String]) -> Result<(), VcsError> {
        fs::write(dir.join(META_DIR).join("branches"), branches.join("\n")).map_err(io)
    }
}

impl Vcs for FakeVcs {
    type Repo = FakeRepo;

    fn open(&self, path: &Path) -> Result<FakeRepo, VcsError> {
        self.record(VcsCall::Open(path.to_path_buf()));
        if !path.join(META_DIR).join("HEAD").is_file() {
            return Err(VcsError::NotFound(format!(
                "{} is not a checkout",
                path.display()
            )));
        }
        Ok(FakeRepo {
            dir: path.to_path_buf(),
        })
    }

    fn clone_repo(
        &self,
        _transport: &TransportConfig,
        dest: &Path,
        branch: &str,
    ) -> Result<FakeRepo, VcsError> {
        self.record(VcsCall::Clone {
            dest: dest.to_path_buf(),
            branch: branch.to_owned(),
        });
        let files = self.remote_files(branch)?;
        fs::create_dir_all(dest.join(META_DIR)).map_err(io)?;
        Self::write_tree(dest, &files)?;
        Self::write_head(dest, branch)?;
        Self::write_local(dest, &[branch.to_owned()])?;
        Ok(FakeRepo {
            dir: dest.to_path_buf(),
        })
    }

    fn fetch(&self, repo: &mut FakeRepo, _transport: &TransportConfig) -> Result<(), VcsError> {
        self.record(VcsCall::Fetch(repo.dir.clone()));
        Ok(())
    }

    fn pull(
        &self,
        repo: &mut FakeRepo,
        _transport: &TransportConfig,
        remote_branch: Option<&str>,
    ) -> Result<(), VcsError> {
        let branch = match remote_branch {
            Some(branch) => branch.to_owned(),
            None => Self::read_head(&repo.dir)?,
        };
        self.record(VcsCall::Pull {
            dir: repo.dir.clone(),
            branch: branch.clone(),
        });
        let scripted = lock(&self.pull_failures)
            .get_mut(&branch)
            .and_then(VecDeque::pop_front);
        if let Some(err) = scripted {
            return Err(err);
        }
        let files = self.remote_files(&branch)?;
        Self::write_tree(&repo.dir, &files)
    }

    fn list_branches(&self, repo: &FakeRepo, mode: ListMode) -> Result<Vec<String>, VcsError> {
        let mut names: Vec<String> = match mode {
            ListMode::Local => Self::read_local(&repo.dir)?
                .into_iter()
                .map(|b| format!("refs/heads/{b}"))
                .collect(),
            ListMode::Remote => lock(&self.remote)
                .keys()
                .map(|b| format!("refs/remotes/{REMOTE_NAME}/{b}"))
                .collect(),
        };
        names.sort();
        Ok(names)
    }

    fn current_branch(&self, repo: &FakeRepo) -> Result<Option<String>, VcsError> {
        let head = Self::read_head(&repo.dir)?;
        Ok((!head.is_empty()).then_some(head))
    }

    fn checkout(&self, repo: &mut FakeRepo, request: &CheckoutRequest) -> Result<(), VcsError> {
        let mut local = Self::read_local(&repo.dir)?;
        let exists = local.iter().any(|b| *b == request.name);
        self.record(VcsCall::Checkout {
            dir: repo.dir.clone(),
            branch: request.name.clone(),
            create: !exists && request.create_if_absent,
        });
        if !exists {
            if !request.create_if_absent {
                return Err(VcsError::NotFound(format!(
                    "local branch '{}'",
                    request.name
                )));
            }
            local.push(request.name.clone());
            Self::write_local(&repo.dir, &local)?;
        }
        Self::write_head(&repo.dir, &request.name)
    }

    fn reset_hard(&self, repo: &mut FakeRepo, reference: &str) -> Result<(), VcsError> {
        self.record(VcsCall::Reset {
            dir: repo.dir.clone(),
            reference: reference.to_owned(),
        });
        let branch = reference
            .strip_prefix(&format!("{REMOTE_NAME}/"))
            .unwrap_or(reference);
        let files = self.remote_files(branch)?;
        Self::write_tree(&repo.dir, &files)
    }
}
