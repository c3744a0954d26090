use std::{
    fmt,
    path::{Component, Path},
};

/// A path or glob from a `change_in` call, anchored at the repository root.
pub struct PathFilter {
    raw: String,
    pathspec: Option<git2::Pathspec>,
}

impl PathFilter {
    /// Parse a filter.
    ///
    /// A leading `/` anchors the filter at the repository root; anything else
    /// is relative to `base`, the pipeline file's directory within the
    /// repository.
    pub fn parse(raw: &str, base: &Path) -> Result<Self, String> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err("empty path filter".to_owned());
        }

        let relative = match trimmed.strip_prefix('/') {
            Some(rooted) => rooted.trim_start_matches('/').to_owned(),
            None => format!("{}/{trimmed}", base.to_string_lossy()),
        };
        let normalized = normalize(&relative)
            .ok_or_else(|| format!("path filter {trimmed:?} points outside the repository"))?;

        let pathspec = if normalized.is_empty() {
            None
        } else {
            Some(
                git2::Pathspec::new([normalized.as_str()])
                    .map_err(|error| format!("invalid path filter {trimmed:?}: {}", error.message()))?,
            )
        };
        Ok(Self {
            raw: trimmed.to_owned(),
            pathspec,
        })
    }

    /// The filter as written.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether `path` (repository relative) falls under this filter.
    pub fn matches(&self, path: &Path) -> bool {
        match &self.pathspec {
            Some(pathspec) => pathspec.matches_path(path, git2::PathspecFlags::DEFAULT),
            None => true,
        }
    }
}

impl fmt::Debug for PathFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PathFilter").field(&self.raw).finish()
    }
}

/// Collapse `.` and `..` segments. `None` if the path climbs above the root.
fn normalize(path: &str) -> Option<String> {
    let mut parts = Vec::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::ParentDir => {
                parts.pop()?;
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    Some(parts.join("/"))
}
