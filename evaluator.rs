use std::{
    collections::{BTreeSet, HashMap},
    path::PathBuf,
};

use tracing::{debug, warn};

use crate::{
    engine::History, ComparisonRange, Deepening, Error, Options, PathFilter, RefType,
    RepoContext, Resolution, Resolver,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Decided from the repository's history.
    Resolved(bool),
    /// History was unavailable; the safe default was applied.
    Defaulted(bool),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeInResult {
    pub outcome: Outcome,
    pub reason: String,
}

impl ChangeInResult {
    pub fn value(&self) -> bool {
        match self.outcome {
            Outcome::Resolved(value) | Outcome::Defaulted(value) => value,
        }
    }
}

/// Answers `change_in` questions against one repository.
///
/// Comparison ranges are computed once per distinct option set and the
/// changed files once per range.
pub struct Evaluator<'a, H: History + ?Sized> {
    history: &'a mut H,
    context: &'a RepoContext,
    deepening: &'a Deepening,
    ranges: HashMap<(Option<String>, Option<String>), Resolution>,
    changes: HashMap<ComparisonRange, BTreeSet<PathBuf>>,
}

impl<'a, H: History + ?Sized> Evaluator<'a, H> {
    pub fn new(history: &'a mut H, context: &'a RepoContext, deepening: &'a Deepening) -> Self {
        Self {
            history,
            context,
            deepening,
            ranges: HashMap::new(),
            changes: HashMap::new(),
        }
    }

    /// Whether any path matching `filters`, and none of `excludes`, changed.
    pub fn evaluate(
        &mut self,
        filters: &[PathFilter],
        excludes: &[PathFilter],
        options: &Options,
    ) -> Result<ChangeInResult, Error> {
        if let (RefType::Tag, Some(on_tags)) = (self.context.ref_type, options.on_tags) {
            return Ok(ChangeInResult {
                outcome: Outcome::Resolved(on_tags),
                reason: format!("tag build, on_tags is {on_tags}"),
            });
        }

        let key = (options.default_branch.clone(), options.range.clone());
        let resolution = match self.ranges.get(&key) {
            Some(resolution) => resolution.clone(),
            None => {
                let resolution =
                    Resolver::new(self.context, self.deepening).resolve(self.history, options)?;
                self.ranges.insert(key, resolution.clone());
                resolution
            }
        };
        self.evaluate_range(&resolution, filters, excludes)
    }

    /// Match the files changed in `resolution` against the filters.
    pub fn evaluate_range(
        &mut self,
        resolution: &Resolution,
        filters: &[PathFilter],
        excludes: &[PathFilter],
    ) -> Result<ChangeInResult, Error> {
        let range = match resolution {
            Resolution::Range(range) => range,
            Resolution::Undetermined(reason) => return Ok(undetermined(reason)),
        };

        if !self.changes.contains_key(range) {
            let changed = match self.history.changed_files(&range.base, &range.head) {
                Ok(changed) => changed,
                Err(error) if error.is_gap() => {
                    warn!(%range, %error, "could not diff comparison range");
                    return Ok(undetermined(&format!("diff {range}: {error}")));
                }
                Err(error) => return Err(error.into()),
            };
            debug!(%range, files = changed.len(), "changed files");
            self.changes.insert(range.clone(), changed);
        }
        let changed = &self.changes[range];

        let matched = changed.iter().find(|path| {
            filters.iter().any(|filter| filter.matches(path))
                && !excludes.iter().any(|exclude| exclude.matches(path))
        });
        Ok(match matched {
            Some(path) => ChangeInResult {
                outcome: Outcome::Resolved(true),
                reason: format!("{} changed in {range}", path.display()),
            },
            None => ChangeInResult {
                outcome: Outcome::Resolved(false),
                reason: format!(
                    "no matching changes in {range} ({})",
                    files_changed(changed.len())
                ),
            },
        })
    }
}

fn files_changed(count: usize) -> String {
    match count {
        1 => "1 file changed".to_owned(),
        count => format!("{count} files changed"),
    }
}

fn undetermined(reason: &str) -> ChangeInResult {
    ChangeInResult {
        outcome: Outcome::Defaulted(true),
        reason: format!("history unavailable, assuming change ({reason})"),
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::{engine::fake::FakeHistory, CommitRef, HistoryError};

    fn filters(raw: &[&str]) -> Vec<PathFilter> {
        raw.iter()
            .map(|raw| PathFilter::parse(raw, Path::new("")).unwrap())
            .collect()
    }

    /// a - b (lib) - c (liberty) - d (docs)
    fn linear() -> FakeHistory {
        FakeHistory::default()
            .commit("a", &[], &["README"])
            .commit("b", &["a"], &["lib/one.rs"])
            .commit("c", &["b"], &["liberty/file.txt"])
            .commit("d", &["c"], &["docs/index.md", "lib/two.rs"])
    }

    fn branch(sha: &str) -> RepoContext {
        RepoContext::new(RefType::Branch, Some(sha.into()), Some("master".into()), None).unwrap()
    }

    fn range(base: &str, head: &str) -> Resolution {
        Resolution::Range(ComparisonRange {
            base: CommitRef::new(base),
            head: CommitRef::new(head),
        })
    }

    #[test]
    fn test_directory_filter() {
        let mut history = linear();
        let context = branch("c");
        let deepening = Deepening::default();
        let mut evaluator = Evaluator::new(&mut history, &context, &deepening);

        let result = evaluator
            .evaluate(&filters(&["/lib"]), &[], &Options::default())
            .unwrap();
        assert_eq!(
            result,
            ChangeInResult {
                outcome: Outcome::Resolved(false),
                reason: "no matching changes in b..c (1 file changed)".into()
            }
        );

        let result = evaluator
            .evaluate(&filters(&["/liberty"]), &[], &Options::default())
            .unwrap();
        assert_eq!(result.outcome, Outcome::Resolved(true));
        assert_eq!(result.reason, "liberty/file.txt changed in b..c");
    }

    #[test]
    fn test_any_filter_matches() {
        let mut history = linear();
        let context = branch("d");
        let deepening = Deepening::default();
        let mut evaluator = Evaluator::new(&mut history, &context, &deepening);
        let result = evaluator
            .evaluate(&filters(&["/src", "/docs/*.md"]), &[], &Options::default())
            .unwrap();
        assert_eq!(result.reason, "docs/index.md changed in c..d");
    }

    #[test]
    fn test_excludes() {
        let mut history = linear();
        let context = branch("d");
        let deepening = Deepening::default();
        let mut evaluator = Evaluator::new(&mut history, &context, &deepening);

        let result = evaluator
            .evaluate(&filters(&["/"]), &filters(&["/docs"]), &Options::default())
            .unwrap();
        assert_eq!(result.reason, "lib/two.rs changed in c..d");

        let result = evaluator
            .evaluate(&filters(&["/"]), &filters(&["/docs", "/lib"]), &Options::default())
            .unwrap();
        assert_eq!(result.outcome, Outcome::Resolved(false));
        assert_eq!(result.reason, "no matching changes in c..d (2 files changed)");
    }

    #[test]
    fn test_undetermined_defaults_to_true() {
        let mut history = linear();
        let context = branch("a");
        let deepening = Deepening::default();
        let mut evaluator = Evaluator::new(&mut history, &context, &deepening);
        let result = evaluator
            .evaluate(&filters(&["/nothing"]), &[], &Options::default())
            .unwrap();
        assert_eq!(result.outcome, Outcome::Defaulted(true));
        assert!(result.value());
        assert_eq!(
            result.reason,
            "history unavailable, assuming change (first parent: a parent of root commit a is not available in the local history)"
        );
    }

    #[test]
    fn test_diff_gap_defaults_to_true() {
        let mut history = linear().missing(&["a"]);
        let context = branch("d");
        let deepening = Deepening::default();
        let mut evaluator = Evaluator::new(&mut history, &context, &deepening);
        let result = evaluator
            .evaluate_range(&range("c", "d"), &filters(&["/nothing"]), &[])
            .unwrap();
        assert_eq!(result.outcome, Outcome::Defaulted(true));
        assert_eq!(
            result.reason,
            "history unavailable, assuming change (diff c..d: commit a is not available in the local history)"
        );
    }

    #[test]
    fn test_command_errors_are_fatal() {
        let mut history = linear();
        history.broken = true;
        let context = branch("d");
        let deepening = Deepening::default();
        let mut evaluator = Evaluator::new(&mut history, &context, &deepening);
        let error = evaluator
            .evaluate_range(&range("c", "d"), &filters(&["/lib"]), &[])
            .unwrap_err();
        assert!(matches!(error, Error::Git(HistoryError::Command { .. })));
    }

    #[test]
    fn test_on_tags() {
        let mut history = linear();
        let context = RepoContext::new(RefType::Tag, Some("d".into()), None, None).unwrap();
        let deepening = Deepening::default();
        let mut evaluator = Evaluator::new(&mut history, &context, &deepening);
        let options = Options {
            on_tags: Some(false),
            ..Options::default()
        };
        let result = evaluator
            .evaluate(&filters(&["/lib"]), &[], &options)
            .unwrap();
        assert_eq!(
            result,
            ChangeInResult {
                outcome: Outcome::Resolved(false),
                reason: "tag build, on_tags is false".into()
            }
        );

        // Without the option, tag builds compare against the root commit.
        let result = evaluator
            .evaluate(&filters(&["/lib"]), &[], &Options::default())
            .unwrap();
        assert_eq!(result.reason, "lib/one.rs changed in a..d");
    }

    #[test]
    fn test_ranges_are_memoised() {
        let mut history = linear().missing(&["c"]).fetchable(&["c"]);
        let context = branch("d").with_shallow(true);
        let deepening = Deepening::default();
        {
            let mut evaluator = Evaluator::new(&mut history, &context, &deepening);
            for _ in 0..3 {
                let result = evaluator
                    .evaluate(&filters(&["/lib"]), &[], &Options::default())
                    .unwrap();
                assert_eq!(result.outcome, Outcome::Resolved(true));
            }
        }
        assert_eq!(history.fetches.len(), 1);
    }
}
