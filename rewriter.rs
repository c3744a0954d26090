use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use genawaiter::{rc::gen, yield_};
use serde_yaml::Value;
use tracing::info;

use crate::{
    engine::History, ChangeInCall, CompilationLog, Error, Evaluator, Expression, LogEntry,
    PathFilter,
};

const WHEN: &str = "when";

#[derive(Debug, Clone)]
enum Step {
    Key(Value),
    Index(usize),
}

/// A string `when` field and where it sits in the document.
#[derive(Debug, Clone)]
struct WhenSite {
    path: Vec<Step>,
    location: String,
}

/// Replaces `change_in` calls in a pipeline's `when` fields with literals.
pub struct Rewriter<'a, H: History + ?Sized> {
    evaluator: Evaluator<'a, H>,
    /// Directory of the pipeline file, relative to the repository root.
    base: PathBuf,
    resolved: HashMap<String, bool>,
}

impl<'a, H: History + ?Sized> Rewriter<'a, H> {
    pub fn new(evaluator: Evaluator<'a, H>, base: impl Into<PathBuf>) -> Self {
        Self {
            evaluator,
            base: base.into(),
            resolved: HashMap::new(),
        }
    }

    /// Rewrite `document` in place, appending one entry to `log` per distinct
    /// call. On error, `log` keeps the entries resolved so far.
    pub fn rewrite(&mut self, document: &mut Value, log: &mut CompilationLog) -> Result<(), Error> {
        let sites = when_sites(document).collect::<Vec<_>>();
        for site in sites {
            let Some(node) = node_mut(document, &site.path) else {
                continue;
            };
            let Some(source) = node.as_str() else {
                continue;
            };
            let mut expression =
                Expression::parse(source).map_err(|message| Error::MalformedExpression {
                    location: site.location.clone(),
                    message,
                })?;
            if !expression.has_calls() {
                continue;
            }
            expression.substitute(|call| self.resolve(call, &site.location, log))?;
            *node = Value::String(expression.to_string());
        }
        Ok(())
    }

    fn resolve(
        &mut self,
        call: &ChangeInCall,
        location: &str,
        log: &mut CompilationLog,
    ) -> Result<bool, Error> {
        let key = call.key();
        if let Some(&value) = self.resolved.get(&key) {
            return Ok(value);
        }

        let malformed = |message| Error::MalformedExpression {
            location: location.to_owned(),
            message,
        };
        let filters = parse_filters(&call.filters, &self.base).map_err(malformed)?;
        let excludes = parse_filters(&call.options.exclude, &self.base).map_err(malformed)?;
        let result = self
            .evaluator
            .evaluate(&filters, &excludes, &call.options)
            .map_err(|error| error.at(location, &call.describe()))?;

        let value = result.value();
        info!(location, call = %call.source, value, reason = %result.reason);
        log.push(LogEntry {
            location: location.to_owned(),
            path_filter: call.describe(),
            resolved_value: value,
            reason: result.reason,
        });
        self.resolved.insert(key, value);
        Ok(value)
    }
}

fn parse_filters(raw: &[String], base: &Path) -> Result<Vec<PathFilter>, String> {
    raw.iter().map(|raw| PathFilter::parse(raw, base)).collect()
}

/// Every string-valued `when` field, in document order.
fn when_sites(document: &Value) -> impl Iterator<Item = WhenSite> + '_ {
    enum Item<'v> {
        Node(&'v Value, Vec<Step>, String),
        Site(WhenSite),
    }

    gen!({
        let mut stack = vec![Item::Node(document, Vec::new(), String::new())];
        while let Some(item) = stack.pop() {
            let (node, path, location) = match item {
                Item::Site(site) => {
                    yield_!(site);
                    continue;
                }
                Item::Node(node, path, location) => (node, path, location),
            };
            match node {
                Value::Mapping(mapping) => {
                    let entries = mapping.iter().collect::<Vec<_>>();
                    for (key, value) in entries.into_iter().rev() {
                        let Some(name) = key.as_str() else {
                            continue;
                        };
                        let location = if location.is_empty() {
                            name.to_owned()
                        } else {
                            format!("{location}.{name}")
                        };
                        let mut path = path.clone();
                        path.push(Step::Key(key.clone()));
                        if name == WHEN && value.is_string() {
                            stack.push(Item::Site(WhenSite { path, location }));
                        } else {
                            stack.push(Item::Node(value, path, location));
                        }
                    }
                }
                Value::Sequence(items) => {
                    for (index, value) in items.iter().enumerate().rev() {
                        let mut location = format!("{location}[{index}]");
                        if let Some(name) = value.get("name").and_then(Value::as_str) {
                            location = format!("{location}({name})");
                        }
                        let mut path = path.clone();
                        path.push(Step::Index(index));
                        stack.push(Item::Node(value, path, location));
                    }
                }
                _ => {}
            }
        }
    })
    .into_iter()
}

fn node_mut<'v>(document: &'v mut Value, path: &[Step]) -> Option<&'v mut Value> {
    path.iter().try_fold(document, |node, step| match step {
        Step::Key(key) => node.as_mapping_mut()?.get_mut(key),
        Step::Index(index) => node.as_sequence_mut()?.get_mut(*index),
    })
}
