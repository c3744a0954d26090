use std::{collections::VecDeque, fmt};

use tracing::{debug, info, instrument};

use crate::{
    engine::{FetchRequest, History, HistoryError},
    CommitRef, ComparisonRange, Error, Options, RefType, RepoContext,
};

/// Where changes are measured from, or why that cannot be known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Range(ComparisonRange),
    Undetermined(String),
}

/// How hard to try to complete a partial clone before giving up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deepening {
    pub enabled: bool,
    /// Commits fetched by the first deepening round; later rounds double it.
    pub step: u32,
    pub max_attempts: u32,
}

impl Default for Deepening {
    fn default() -> Self {
        Self {
            enabled: true,
            step: 50,
            max_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Strategy {
    /// Merge base of a branch and `right` (or the build commit).
    MergeBase { left: String, right: Option<String> },
    FirstParent,
    PreviousTag,
    Explicit {
        base: String,
        head: String,
        merge_base: bool,
    },
}

impl Strategy {
    /// Branches this strategy needs to be present locally.
    fn branches(&self) -> Vec<&str> {
        match self {
            Strategy::MergeBase { left, right } => {
                std::iter::once(left.as_str()).chain(right.as_deref()).collect()
            }
            Strategy::Explicit { base, head, .. } => [base, head]
                .into_iter()
                .map(String::as_str)
                .filter(|revision| looks_like_branch(revision))
                .collect(),
            Strategy::FirstParent | Strategy::PreviousTag => Vec::new(),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::MergeBase { left, right } => write!(
                f,
                "merge base of {left} and {}",
                right.as_deref().unwrap_or("the build commit")
            ),
            Strategy::FirstParent => f.write_str("first parent"),
            Strategy::PreviousTag => f.write_str("previous tag"),
            Strategy::Explicit {
                base,
                head,
                merge_base,
            } => write!(
                f,
                "range {base}{}{head}",
                if *merge_base { "..." } else { ".." }
            ),
        }
    }
}

/// Picks the comparison range for a build.
///
/// Strategies are tried in priority order. A strategy that runs into missing
/// history gets the whole fetch plan before the next one is tried; when all
/// of them fail the result is [`Resolution::Undetermined`].
#[derive(Debug, Clone)]
pub struct Resolver<'a> {
    context: &'a RepoContext,
    deepening: &'a Deepening,
}

impl<'a> Resolver<'a> {
    pub fn new(context: &'a RepoContext, deepening: &'a Deepening) -> Self {
        Self { context, deepening }
    }

    #[instrument(skip_all, fields(ref_type = %self.context.ref_type, sha = %self.context.commit_sha))]
    pub fn resolve<H: History + ?Sized>(
        &self,
        history: &mut H,
        options: &Options,
    ) -> Result<Resolution, Error> {
        let strategies = self.strategies(options);
        let head = history
            .resolve(&self.context.commit_sha)
            .map_err(|error| match error {
                // The build commit has to be checked out; not finding it is
                // a broken checkout, not a shallow one.
                HistoryError::InsufficientHistory(_) | HistoryError::NoCommonAncestor(..) => {
                    HistoryError::Command {
                        command: "rev-parse".to_owned(),
                        message: format!(
                            "build commit {:?} is not in the repository",
                            self.context.commit_sha
                        ),
                    }
                }
                other => other,
            })?;

        let mut plan = self.fetch_plan(history, &strategies);
        let mut gaps = Vec::new();
        for strategy in &strategies {
            loop {
                match self.attempt(history, &head, strategy) {
                    Ok(range) => {
                        info!(%range, %strategy, "resolved comparison range");
                        return Ok(Resolution::Range(range));
                    }
                    Err(error) if error.is_gap() => {
                        debug!(%error, %strategy, "history gap");
                        if fetch_more(history, &mut plan)? {
                            continue;
                        }
                        gaps.push(format!("{strategy}: {error}"));
                        break;
                    }
                    Err(error) => return Err(error.into()),
                }
            }
        }
        Ok(Resolution::Undetermined(gaps.join("; ")))
    }

    fn strategies(&self, options: &Options) -> Vec<Strategy> {
        if let Some(range) = &options.range {
            let (base, head, merge_base) = split_range(range, &self.context.commit_sha);
            return vec![Strategy::Explicit {
                base,
                head,
                merge_base,
            }];
        }

        let context = self.context;
        match context.ref_type {
            RefType::PullRequest => {
                let mut strategies = Vec::new();
                if let Some(target) = &context.target_branch {
                    strategies.push(Strategy::MergeBase {
                        left: target.clone(),
                        right: context.source_branch.clone(),
                    });
                }
                strategies.push(Strategy::FirstParent);
                strategies
            }
            RefType::Branch => match &options.default_branch {
                Some(default) if context.target_branch.as_ref() != Some(default) => vec![
                    Strategy::MergeBase {
                        left: default.clone(),
                        right: None,
                    },
                    Strategy::FirstParent,
                ],
                _ => vec![Strategy::FirstParent],
            },
            RefType::Tag => vec![Strategy::PreviousTag],
        }
    }

    fn fetch_plan<H: History + ?Sized>(
        &self,
        history: &H,
        strategies: &[Strategy],
    ) -> VecDeque<FetchRequest> {
        let mut plan = VecDeque::new();
        if !self.deepening.enabled {
            return plan;
        }

        let shallow = self.context.is_shallow;
        // Deepening by less than the clone depth barely extends the history.
        let step = self
            .context
            .fetch_depth
            .map_or(self.deepening.step, |depth| depth.max(self.deepening.step));
        let depth = shallow.then_some(step);
        for branch in strategies.iter().flat_map(Strategy::branches) {
            let request = FetchRequest::Branch {
                name: branch.to_owned(),
                depth,
            };
            let missing = matches!(history.resolve_branch(branch), Err(ref error) if error.is_gap());
            if missing && !plan.contains(&request) {
                plan.push_back(request);
            }
        }
        if shallow {
            for attempt in 0..self.deepening.max_attempts {
                plan.push_back(FetchRequest::Deepen {
                    by: step.saturating_mul(2u32.saturating_pow(attempt)),
                });
            }
            plan.push_back(FetchRequest::Unshallow);
        }
        debug!(?plan, "fetch plan");
        plan
    }

    fn attempt<H: History + ?Sized>(
        &self,
        history: &H,
        head: &CommitRef,
        strategy: &Strategy,
    ) -> Result<ComparisonRange, HistoryError> {
        match strategy {
            Strategy::MergeBase { left, right } => {
                let left = history.resolve_branch(left)?;
                let right = match right {
                    Some(right) => match history.resolve_branch(right) {
                        Ok(right) => right,
                        // Detached checkouts may not carry the source branch.
                        Err(error) if error.is_gap() => head.clone(),
                        Err(error) => return Err(error),
                    },
                    None => head.clone(),
                };
                let base = history.merge_base(&left, &right)?;
                checked(history, base, head.clone())
            }
            Strategy::FirstParent => match history.first_parent(head)? {
                Some(parent) => checked(history, parent, head.clone()),
                None => Err(HistoryError::InsufficientHistory(format!(
                    "a parent of root commit {}",
                    head.short()
                ))),
            },
            Strategy::PreviousTag => {
                let base = match previous_tag(history, head)? {
                    Some(tag) => tag,
                    None => root(history, head)?,
                };
                checked(history, base, head.clone())
            }
            Strategy::Explicit {
                base,
                head,
                merge_base,
            } => {
                let base = resolve_revision(history, base)?;
                let head = resolve_revision(history, head)?;
                let base = if *merge_base {
                    history.merge_base(&base, &head)?
                } else {
                    base
                };
                checked(history, base, head)
            }
        }
    }
}

fn fetch_more<H: History + ?Sized>(
    history: &mut H,
    plan: &mut VecDeque<FetchRequest>,
) -> Result<bool, Error> {
    while let Some(request) = plan.pop_front() {
        if history.fetch(&request)? {
            return Ok(true);
        }
    }
    Ok(false)
}

/// A range is only usable when its base is an ancestor of its head.
fn checked<H: History + ?Sized>(
    history: &H,
    base: CommitRef,
    head: CommitRef,
) -> Result<ComparisonRange, HistoryError> {
    if !history.is_ancestor(&base, &head)? {
        return Err(HistoryError::NoCommonAncestor(
            base.to_string(),
            head.to_string(),
        ));
    }
    Ok(ComparisonRange { base, head })
}

/// The most recent tagged ancestor of `head`, excluding `head` itself.
fn previous_tag<H: History + ?Sized>(
    history: &H,
    head: &CommitRef,
) -> Result<Option<CommitRef>, HistoryError> {
    let mut best: Option<CommitRef> = None;
    for tag in history.tags()? {
        if tag.sha == head.sha || !history.is_ancestor(&tag, head)? {
            continue;
        }
        best = match best {
            Some(current) if !history.is_ancestor(&current, &tag)? => Some(current),
            _ => Some(tag),
        };
    }
    Ok(best)
}

fn root<H: History + ?Sized>(history: &H, head: &CommitRef) -> Result<CommitRef, HistoryError> {
    let mut current = head.clone();
    while let Some(parent) = history.first_parent(&current)? {
        current = parent;
    }
    Ok(current)
}

fn resolve_revision<H: History + ?Sized>(
    history: &H,
    revision: &str,
) -> Result<CommitRef, HistoryError> {
    match history.resolve(revision) {
        Err(error) if error.is_gap() && looks_like_branch(revision) => {
            history.resolve_branch(revision)
        }
        result => result,
    }
}

fn looks_like_branch(revision: &str) -> bool {
    let is_sha = revision.len() >= 7 && revision.chars().all(|c| c.is_ascii_hexdigit());
    !is_sha
        && !revision.starts_with("HEAD")
        && !revision.contains(['~', '^', '@', ':'])
}

/// Split `<base>...<head>` or `<base>..<head>`. Empty sides fall back to
/// `fallback`, or to `HEAD` when that is empty too. Without dots, both sides
/// fall back.
fn split_range(range: &str, fallback: &str) -> (String, String, bool) {
    let (base, head, merge_base) = match range.split_once("...") {
        Some((base, head)) => (base, head, true),
        None => match range.split_once("..") {
            Some((base, head)) => (base, head, false),
            None => ("", "", true),
        },
    };
    let side = |value: &str| {
        let value = value.trim();
        if !value.is_empty() {
            value.to_owned()
        } else if !fallback.trim().is_empty() {
            fallback.trim().to_owned()
        } else {
            "HEAD".to_owned()
        }
    };
    (side(base), side(head), merge_base)
}
