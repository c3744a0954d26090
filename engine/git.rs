use std::{
    collections::{BTreeSet, HashSet},
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use bstr::ByteSlice;
use tracing::{debug, info, instrument, warn};

use super::{first_resolved, process::GitProcess, FetchRequest, History, HistoryError};
use crate::CommitRef;

/// How the engine reaches the remote when more history is needed.
#[derive(Debug, Clone)]
pub struct GitOptions {
    pub program: PathBuf,
    pub remote: String,
    pub timeout: Duration,
}

impl Default for GitOptions {
    fn default() -> Self {
        Self {
            program: PathBuf::from("git"),
            remote: "origin".to_owned(),
            timeout: Duration::from_secs(120),
        }
    }
}

/// Open the repository containing `path`.
pub fn git(path: impl AsRef<Path>, options: GitOptions) -> Result<GitEngine, HistoryError> {
    GitEngine::open(path, options)
}

pub struct GitEngine {
    repository: git2::Repository,
    shallow_roots: HashSet<git2::Oid>,
    process: GitProcess,
    remote: String,
    fetched_branches: Vec<String>,
}

impl GitEngine {
    pub fn open(path: impl AsRef<Path>, options: GitOptions) -> Result<Self, HistoryError> {
        let repository = git2::Repository::discover(path.as_ref())
            .map_err(|error| command_error("rev-parse", error))?;
        let workdir = repository
            .workdir()
            .unwrap_or_else(|| repository.path())
            .to_owned();
        let shallow_roots = shallow_roots(&repository);
        Ok(Self {
            repository,
            shallow_roots,
            process: GitProcess::new(options.program, workdir, options.timeout),
            remote: options.remote,
            fetched_branches: Vec::new(),
        })
    }

    /// The repository's working directory, if it has one.
    pub fn workdir(&self) -> Option<&Path> {
        self.repository.workdir()
    }

    /// Re-read the repository after an external process changed it.
    fn reload(&mut self) -> Result<(), HistoryError> {
        self.repository = git2::Repository::open(self.repository.path())
            .map_err(|error| command_error("rev-parse", error))?;
        self.shallow_roots = shallow_roots(&self.repository);
        Ok(())
    }

    fn oid(&self, commit: &CommitRef) -> Result<git2::Oid, HistoryError> {
        git2::Oid::from_str(&commit.sha).map_err(|error| command_error("rev-parse", error))
    }

    fn find_commit(&self, commit: &CommitRef) -> Result<git2::Commit<'_>, HistoryError> {
        self.repository
            .find_commit(self.oid(commit)?)
            .map_err(|error| classify("cat-file", error, || format!("commit {}", commit.sha)))
    }

    fn refspec(&self, branch: &str) -> String {
        format!("+refs/heads/{branch}:refs/remotes/{}/{branch}", self.remote)
    }

    fn fetch_args(&self, request: &FetchRequest) -> Option<Vec<String>> {
        let mut args = vec![
            "fetch".to_owned(),
            "--no-tags".to_owned(),
            "--no-recurse-submodules".to_owned(),
        ];
        match request {
            FetchRequest::Branch { name, depth } => {
                if let Some(depth) = depth {
                    args.push(format!("--depth={depth}"));
                }
                args.push(self.remote.clone());
                args.push(self.refspec(name));
            }
            FetchRequest::Deepen { by } => {
                if !self.repository.is_shallow() {
                    return None;
                }
                args.push(format!("--deepen={by}"));
                args.push(self.remote.clone());
                args.extend(self.extra_refspecs());
            }
            FetchRequest::Unshallow => {
                if !self.repository.is_shallow() {
                    return None;
                }
                args.push("--unshallow".to_owned());
                args.push(self.remote.clone());
                args.extend(self.extra_refspecs());
            }
        }
        Some(args)
    }

    /// Configured refspecs plus the branches fetched so far, so that deepening
    /// extends their boundaries too.
    fn extra_refspecs(&self) -> Vec<String> {
        if self.fetched_branches.is_empty() {
            return Vec::new();
        }
        let mut refspecs: Vec<String> = self
            .repository
            .find_remote(&self.remote)
            .ok()
            .map(|remote| {
                remote
                    .fetch_refspecs()
                    .map(|refspecs| refspecs.iter().flatten().map(str::to_owned).collect())
                    .unwrap_or_default()
            })
            .unwrap_or_else(Vec::new);
        refspecs.extend(
            self.fetched_branches
                .iter()
                .map(|branch| self.refspec(branch)),
        );
        refspecs
    }
}

impl History for GitEngine {
    fn resolve_branch(&self, name: &str) -> Result<CommitRef, HistoryError> {
        first_resolved(
            self,
            [
                format!("refs/remotes/{}/{name}", self.remote),
                format!("refs/heads/{name}"),
                name.to_owned(),
            ],
            name,
        )
    }

    #[instrument(skip(self))]
    fn resolve(&self, revision: &str) -> Result<CommitRef, HistoryError> {
        let commit = self
            .repository
            .revparse_single(revision)
            .and_then(|object| object.peel_to_commit())
            .map_err(|error| classify("rev-parse", error, || format!("revision {revision:?}")))?;
        let sha = commit.id().to_string();
        Ok(if sha.starts_with(revision) {
            CommitRef::new(sha)
        } else {
            CommitRef::named(sha, revision)
        })
    }

    #[instrument(skip_all, fields(base = %base, head = %head))]
    fn changed_files(
        &self,
        base: &CommitRef,
        head: &CommitRef,
    ) -> Result<BTreeSet<PathBuf>, HistoryError> {
        let tree = |commit: &CommitRef| {
            self.find_commit(commit)?
                .tree()
                .map_err(|error| classify("diff", error, || format!("tree of {}", commit.sha)))
        };
        let (base_tree, head_tree) = (tree(base)?, tree(head)?);

        let mut options = git2::DiffOptions::new();
        let diff = self
            .repository
            .diff_tree_to_tree(Some(&base_tree), Some(&head_tree), Some(&mut options))
            .map_err(|error| classify("diff", error, || format!("diff {base}..{head}")))?;

        let mut paths = BTreeSet::new();
        for delta in diff.deltas() {
            for file in [delta.old_file(), delta.new_file()] {
                if let Some(path) = file.path_bytes() {
                    paths.insert(PathBuf::from(path.to_str_lossy().into_owned()));
                }
            }
        }
        debug!(count = paths.len(), "changed files");
        Ok(paths)
    }

    fn is_ancestor(
        &self,
        ancestor: &CommitRef,
        descendant: &CommitRef,
    ) -> Result<bool, HistoryError> {
        if ancestor.sha == descendant.sha {
            return Ok(true);
        }
        let (ancestor_oid, descendant_oid) = (self.oid(ancestor)?, self.oid(descendant)?);
        let reachable = self
            .repository
            .graph_descendant_of(descendant_oid, ancestor_oid)
            .map_err(|error| {
                classify("merge-base", error, || {
                    format!("ancestry of {}", descendant.sha)
                })
            })?;
        if !reachable && self.repository.is_shallow() {
            // The path between them may run through commits we do not have.
            return Err(HistoryError::InsufficientHistory(format!(
                "ancestry between {} and {}",
                ancestor.short(),
                descendant.short()
            )));
        }
        Ok(reachable)
    }

    #[instrument(skip_all, fields(a = %a, b = %b))]
    fn merge_base(&self, a: &CommitRef, b: &CommitRef) -> Result<CommitRef, HistoryError> {
        match self.repository.merge_base(self.oid(a)?, self.oid(b)?) {
            Ok(oid) => Ok(CommitRef::new(oid.to_string())),
            Err(error) if error.code() == git2::ErrorCode::NotFound => {
                debug!(%error, "no merge base");
                Err(HistoryError::NoCommonAncestor(a.to_string(), b.to_string()))
            }
            Err(error) => Err(command_error("merge-base", error)),
        }
    }

    fn first_parent(&self, commit: &CommitRef) -> Result<Option<CommitRef>, HistoryError> {
        let found = self.find_commit(commit)?;
        if self.shallow_roots.contains(&found.id()) {
            return Err(HistoryError::InsufficientHistory(format!(
                "parent of {}",
                commit.short()
            )));
        }
        if found.parent_count() == 0 {
            return Ok(None);
        }
        let parent = found
            .parent_id(0)
            .map_err(|error| command_error("rev-parse", error))?;
        let parent = CommitRef::new(parent.to_string());
        // Make sure the parent object is actually here.
        self.find_commit(&parent)?;
        Ok(Some(parent))
    }

    fn tags(&self) -> Result<Vec<CommitRef>, HistoryError> {
        let names = self
            .repository
            .tag_names(None)
            .map_err(|error| command_error("tag", error))?;
        let mut tags = Vec::new();
        for name in names.iter().flatten() {
            let commit = self
                .repository
                .revparse_single(&format!("refs/tags/{name}"))
                .and_then(|object| object.peel_to_commit());
            match commit {
                Ok(commit) => tags.push(CommitRef::named(commit.id().to_string(), name)),
                Err(error) => debug!(tag = name, %error, "skipping tag"),
            }
        }
        Ok(tags)
    }

    fn is_shallow(&self) -> bool {
        self.repository.is_shallow()
    }

    #[instrument(skip(self))]
    fn fetch(&mut self, request: &FetchRequest) -> Result<bool, HistoryError> {
        let Some(args) = self.fetch_args(request) else {
            return Ok(false);
        };
        let output = self.process.run(&args)?;
        if !output.status.success() {
            warn!(reason = output.reason(), "fetch failed");
            return Ok(false);
        }
        if let FetchRequest::Branch { name, .. } = request {
            self.fetched_branches.push(name.clone());
        }
        info!(?request, "fetched more history");
        self.reload()?;
        Ok(true)
    }
}

/// Commits whose parents were cut off by a shallow clone.
fn shallow_roots(repository: &git2::Repository) -> HashSet<git2::Oid> {
    let Ok(contents) = fs::read(repository.path().join("shallow")) else {
        return HashSet::new();
    };
    contents
        .lines()
        .filter_map(|line| line.trim().to_str().ok())
        .filter_map(|line| git2::Oid::from_str(line).ok())
        .collect()
}

/// Missing objects are expected in partial clones; anything else is not.
fn classify(command: &str, error: git2::Error, what: impl FnOnce() -> String) -> HistoryError {
    match error.code() {
        git2::ErrorCode::NotFound => HistoryError::InsufficientHistory(what()),
        _ => command_error(command, error),
    }
}

fn command_error(command: &str, error: git2::Error) -> HistoryError {
    HistoryError::Command {
        command: command.to_owned(),
        message: error.message().to_owned(),
    }
}
