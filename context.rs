use std::{fmt, str::FromStr};

use crate::Error;

/// What kind of ref triggered the build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefType {
    Branch,
    PullRequest,
    Tag,
}

impl FromStr for RefType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "branch" => Ok(RefType::Branch),
            "pull-request" | "pull_request" => Ok(RefType::PullRequest),
            "tag" => Ok(RefType::Tag),
            other => Err(format!(
                "unknown ref type {other:?}, expected one of: branch, pull-request, tag"
            )),
        }
    }
}

impl fmt::Display for RefType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RefType::Branch => "branch",
            RefType::PullRequest => "pull-request",
            RefType::Tag => "tag",
        })
    }
}

/// Build state the comparison range is derived from.
///
/// Built once at start-up from the CI environment and only ever shared by
/// reference afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoContext {
    pub ref_type: RefType,
    /// Branch being built, or the branch a pull request targets.
    pub target_branch: Option<String>,
    /// Head branch of a pull request.
    pub source_branch: Option<String>,
    pub commit_sha: String,
    pub is_shallow: bool,
    pub fetch_depth: Option<u32>,
}

impl RepoContext {
    pub fn new(
        ref_type: RefType,
        commit_sha: Option<String>,
        target_branch: Option<String>,
        source_branch: Option<String>,
    ) -> Result<Self, Error> {
        let target_branch = non_empty(target_branch);
        if ref_type == RefType::PullRequest && target_branch.is_none() {
            return Err(Error::Context(
                "pull-request builds need the target branch (SEMAPHORE_GIT_BRANCH)".to_owned(),
            ));
        }
        Ok(Self {
            ref_type,
            target_branch,
            source_branch: non_empty(source_branch),
            commit_sha: non_empty(commit_sha).unwrap_or_else(|| "HEAD".to_owned()),
            is_shallow: false,
            fetch_depth: None,
        })
    }

    pub fn with_shallow(mut self, is_shallow: bool) -> Self {
        self.is_shallow = is_shallow;
        self
    }

    pub fn with_fetch_depth(mut self, fetch_depth: Option<u32>) -> Self {
        self.fetch_depth = fetch_depth;
        self
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}
