use std::{io, path::PathBuf};

use thiserror::Error;

use crate::engine::HistoryError;

/// Errors that abort a compilation.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{location}: change_in({filter}): {source}")]
    Evaluation {
        location: String,
        filter: String,
        source: HistoryError,
    },

    #[error(transparent)]
    Git(#[from] HistoryError),

    #[error("{location}: malformed change_in expression: {message}")]
    MalformedExpression { location: String, message: String },

    #[error("invalid build context: {0}")]
    Context(String),

    #[error("could not read {path:?}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("could not write {path:?}: {source}")]
    Write { path: PathBuf, source: io::Error },

    #[error("could not parse pipeline {path:?}: {source}")]
    Yaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("could not serialize {path:?}: {source}")]
    Serialize {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

impl Error {
    /// Attach the `when` site and filter to an adapter failure.
    pub(crate) fn at(self, location: &str, filter: &str) -> Self {
        match self {
            Error::Git(source) => Error::Evaluation {
                location: location.to_owned(),
                filter: filter.to_owned(),
                source,
            },
            other => other,
        }
    }
}
