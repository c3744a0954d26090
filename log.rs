use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::Error;

/// One resolved `change_in` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub location: String,
    pub path_filter: String,
    pub resolved_value: bool,
    pub reason: String,
}

/// Entries in the order their calls appear in the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompilationLog {
    entries: Vec<LogEntry>,
}

impl CompilationLog {
    pub fn push(&mut self, entry: LogEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    pub fn write(&self, path: &Path) -> Result<(), Error> {
        let yaml = self.to_yaml().map_err(|source| Error::Serialize {
            path: path.to_owned(),
            source,
        })?;
        fs::write(path, yaml).map_err(|source| Error::Write {
            path: path.to_owned(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;

    #[test]
    fn test_yaml() {
        let mut log = CompilationLog::default();
        assert_eq!(log.to_yaml().unwrap(), "[]\n");

        log.push(LogEntry {
            location: "blocks[0](Lib).run.when".into(),
            path_filter: "/lib".into(),
            resolved_value: false,
            reason: "no matching changes in 1a2b3c4..5d6e7f8 (0 files changed)".into(),
        });
        log.push(LogEntry {
            location: "blocks[1](Docs).run.when".into(),
            path_filter: "/docs, /README.md".into(),
            resolved_value: true,
            reason: "docs/index.md changed in 1a2b3c4..5d6e7f8".into(),
        });
        assert_eq!(log.len(), 2);
        assert_eq!(
            log.to_yaml().unwrap(),
            indoc! {"
                - location: blocks[0](Lib).run.when
                  path_filter: /lib
                  resolved_value: false
                  reason: no matching changes in 1a2b3c4..5d6e7f8 (0 files changed)
                - location: blocks[1](Docs).run.when
                  path_filter: /docs, /README.md
                  resolved_value: true
                  reason: docs/index.md changed in 1a2b3c4..5d6e7f8
            "}
        );
    }

    #[test]
    fn test_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs.yml");
        let mut log = CompilationLog::default();
        log.push(LogEntry {
            location: "blocks[0].run.when".into(),
            path_filter: "/lib".into(),
            resolved_value: true,
            reason: "history unavailable, assuming change".into(),
        });
        log.write(&path).unwrap();

        let read: CompilationLog =
            serde_yaml::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(read, log);

        let error = log.write(&dir.path().join("missing/logs.yml")).unwrap_err();
        assert!(matches!(error, Error::Write { .. }));
    }
}
