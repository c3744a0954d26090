mod git;
mod process;

use std::{collections::BTreeSet, path::PathBuf, time::Duration};

use thiserror::Error;

pub use git::{git, GitEngine, GitOptions};

use crate::CommitRef;

/// Typed failure of a history query.
///
/// `InsufficientHistory` and `NoCommonAncestor` are gaps: the question has an
/// answer, the local clone just cannot give it. Everything else means the
/// environment is broken.
#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("{0} is not available in the local history")]
    InsufficientHistory(String),

    #[error("no common ancestor between {0} and {1}")]
    NoCommonAncestor(String, String),

    #[error("git {command} failed: {message}")]
    Command { command: String, message: String },

    #[error("git {command} timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },
}

impl HistoryError {
    pub fn is_gap(&self) -> bool {
        matches!(
            self,
            HistoryError::InsufficientHistory(_) | HistoryError::NoCommonAncestor(..)
        )
    }
}

/// A request to make more history available locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchRequest {
    /// Fetch a branch from the remote, optionally depth limited.
    Branch { name: String, depth: Option<u32> },
    /// Extend every shallow boundary by `by` commits.
    Deepen { by: u32 },
    /// Fetch the complete history.
    Unshallow,
}

/// Read-only queries against a repository's commit graph.
pub trait History {
    /// Resolve a revision to a commit.
    fn resolve(&self, revision: &str) -> Result<CommitRef, HistoryError>;

    /// Resolve a branch name, preferring local branches over other revisions.
    fn resolve_branch(&self, name: &str) -> Result<CommitRef, HistoryError> {
        first_resolved(self, [format!("refs/heads/{name}"), name.to_owned()], name)
    }

    /// Paths that differ between the trees of `base` and `head`.
    fn changed_files(
        &self,
        base: &CommitRef,
        head: &CommitRef,
    ) -> Result<BTreeSet<PathBuf>, HistoryError>;

    /// Whether `ancestor` is reachable from `descendant`. A commit is its own ancestor.
    fn is_ancestor(&self, ancestor: &CommitRef, descendant: &CommitRef)
        -> Result<bool, HistoryError>;

    fn merge_base(&self, a: &CommitRef, b: &CommitRef) -> Result<CommitRef, HistoryError>;

    /// The first parent of `commit`, or `None` for a root commit.
    fn first_parent(&self, commit: &CommitRef) -> Result<Option<CommitRef>, HistoryError>;

    /// Commits pointed at by tags, named after their tag.
    fn tags(&self) -> Result<Vec<CommitRef>, HistoryError>;

    fn is_shallow(&self) -> bool;

    /// Try to obtain more history. Returns whether anything was fetched.
    fn fetch(&mut self, request: &FetchRequest) -> Result<bool, HistoryError> {
        let _ = request;
        Ok(false)
    }
}

/// The first candidate revision that resolves, named `name`.
///
/// Gaps move on to the next candidate; other failures stop the search.
pub(crate) fn first_resolved<H: History + ?Sized>(
    history: &H,
    candidates: impl IntoIterator<Item = String>,
    name: &str,
) -> Result<CommitRef, HistoryError> {
    let mut gap = None;
    for candidate in candidates {
        match history.resolve(&candidate) {
            Ok(commit) => return Ok(CommitRef::named(commit.sha, name)),
            Err(error) if error.is_gap() => gap = Some(error),
            Err(error) => return Err(error),
        }
    }
    Err(gap.unwrap_or_else(|| HistoryError::InsufficientHistory(format!("branch {name:?}"))))
}
