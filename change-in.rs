mod context;
mod engine;
mod error;
mod evaluator;
mod filter;
mod log;
mod parser;
mod resolver;
mod rewriter;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

use std::fmt;

pub use context::{RefType, RepoContext};
pub use engine::{git, FetchRequest, GitEngine, GitOptions, History, HistoryError};
pub use error::Error;
pub use evaluator::{ChangeInResult, Evaluator, Outcome};
pub use filter::PathFilter;
pub use log::{CompilationLog, LogEntry};
pub use parser::{ChangeInCall, Expression, Options, Segment};
pub use resolver::{Deepening, Resolution, Resolver};
pub use rewriter::Rewriter;

/// A resolved commit, optionally remembering the name it was resolved from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CommitRef {
    pub sha: String,
    pub name: Option<String>,
}

impl CommitRef {
    pub fn new(sha: impl Into<String>) -> Self {
        Self {
            sha: sha.into(),
            name: None,
        }
    }

    pub fn named(sha: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            sha: sha.into(),
            name: Some(name.into()),
        }
    }

    pub fn short(&self) -> &str {
        &self.sha[..self.sha.len().min(7)]
    }
}

impl fmt::Display for CommitRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{name} ({})", self.short()),
            None => f.write_str(self.short()),
        }
    }
}

/// The `(base, head)` pair whose difference decides whether files changed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ComparisonRange {
    pub base: CommitRef,
    pub head: CommitRef,
}

impl fmt::Display for ComparisonRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.base.short(), self.head.short())
    }
}
