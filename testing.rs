//! Repository fixtures for tests.

use std::{
    fs,
    path::{Path, PathBuf},
    process::Command,
};

use tempfile::TempDir;

/// Author and committer date of every commit made through [`Sandbox::run`].
pub const DATE: &str = "2020-01-01T00:00:00Z";

#[allow(unused_macros)]
macro_rules! git_test {
    ($($name:literal: [$($path:literal => $content:expr),*])* $(staged: [$($spath:literal => $scontent:expr),*])? $(working: [$($wdpath:literal => $wdcontent:expr),*])?) => {{
        let tempdir = ::tempfile::tempdir().unwrap();
        let repo = ::git2::Repository::init(tempdir.path()).unwrap();
        #[allow(unused_variables)]
        let signature = ::git2::Signature::new("Example User", "test@example.com", &::git2::Time::new(0, 0)).unwrap();
        #[allow(unused_variables, unused_mut)]
        let mut index = repo.index().unwrap();
        $({
            $({
                let path = tempdir.path().join($path);
                ::std::fs::create_dir_all(path.parent().unwrap()).unwrap();
                ::std::fs::write(path, $content).unwrap();
            })*

            index
                .add_all(["."].iter(), ::git2::IndexAddOption::DEFAULT, None)
                .unwrap();
            index.write().unwrap();

            let oid = index.write_tree().unwrap();
            let tree = repo.find_tree(oid).unwrap();
            let parents = if let Ok(Ok(parent_commit)) = repo.head().map(|head| head.peel_to_commit()) {
                vec![parent_commit]
            } else {
                vec![]
            };
            repo.commit(
                Some("HEAD"),
                &signature,
                &signature,
                $name,
                &tree,
                &parents.iter().collect::<Vec<_>>(),
            ).unwrap();
        })*
        $($({
            let path = tempdir.path().join($spath);
            ::std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            ::std::fs::write(path, $scontent).unwrap();

            index
                .add_all(["."].iter(), ::git2::IndexAddOption::DEFAULT, None)
                .unwrap();
            index.write().unwrap();
        })*)?
        $($({
            let path = tempdir.path().join($wdpath);
            ::std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            ::std::fs::write(path, $wdcontent).unwrap();
        })*)?
        (tempdir, repo)
}}
}

#[allow(unused_imports)]
pub(crate) use git_test;

/// A scratch repository driven through the `git` CLI.
///
/// Used for history shapes git2 cannot produce: shallow clones over
/// `file://`, cherry-picks and merges with a strategy.
pub struct Sandbox {
    dir: TempDir,
}

impl Default for Sandbox {
    fn default() -> Self {
        Self::new()
    }
}

impl Sandbox {
    /// An empty repository on branch `master` with a fixed identity.
    pub fn new() -> Self {
        let sandbox = Self {
            dir: tempfile::tempdir().unwrap(),
        };
        sandbox.run(&["init", "--quiet"]);
        sandbox.run(&["symbolic-ref", "HEAD", "refs/heads/master"]);
        sandbox.configure();
        sandbox
    }

    fn configure(&self) {
        self.run(&["config", "user.name", "Example User"]);
        self.run(&["config", "user.email", "test@example.com"]);
        self.run(&["config", "commit.gpgsign", "false"]);
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Run git, panicking on failure, and return its trimmed stdout.
    pub fn run(&self, args: &[&str]) -> String {
        self.run_dated(DATE, args)
    }

    /// Like [`Sandbox::run`], with commits stamped at `date`. Commits made
    /// at the same date from the same tree and parent share an id.
    pub fn run_dated(&self, date: &str, args: &[&str]) -> String {
        let output = Command::new("git")
            .args(args)
            .current_dir(self.path())
            .env("GIT_AUTHOR_DATE", date)
            .env("GIT_COMMITTER_DATE", date)
            .env("GIT_CONFIG_NOSYSTEM", "1")
            .env("GIT_TERMINAL_PROMPT", "0")
            .output()
            .unwrap();
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).trim().to_owned()
    }

    pub fn add_file(&self, path: impl AsRef<Path>, content: &str) -> PathBuf {
        let path = self.path().join(path);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
        path
    }

    /// Stage everything and commit.
    pub fn commit(&self, message: &str) -> String {
        self.run(&["add", "--all"]);
        self.run(&["commit", "--quiet", "--allow-empty", "-m", message]);
        self.rev_parse("HEAD")
    }

    pub fn switch_branch(&self, branch: &str) {
        self.run(&["checkout", "--quiet", branch]);
    }

    pub fn rev_parse(&self, revision: &str) -> String {
        self.run(&["rev-parse", revision])
    }

    /// A single-branch clone of `branch` with `depth` commits of history.
    pub fn clone_local_copy(&self, branch: &str, depth: u32) -> Sandbox {
        let clone = Self {
            dir: tempfile::tempdir().unwrap(),
        };
        let url = format!("file://{}", self.path().display());
        let depth = depth.to_string();
        clone.run(&[
            "clone",
            "--quiet",
            "--single-branch",
            "--branch",
            branch,
            "--depth",
            &depth,
            &url,
            ".",
        ]);
        clone.configure();
        clone
    }
}
