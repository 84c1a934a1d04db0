//! Errors that abort a single import definition

use std::path::PathBuf;

use crate::api::BackendError;

#[derive(Debug)]
pub enum ImportError {
    /// The data file could not be read
    Read { path: PathBuf, source: std::io::Error },
    /// The data file is not valid JSON
    Parse { path: PathBuf, source: serde_json::Error },
    /// The records root is not an array
    NotAnArray { path: PathBuf, found: &'static str },
    /// The definition is inconsistent
    InvalidDefinition { collection: String, message: String },
    /// A backend call needed before execution failed
    Backend(BackendError),
}

impl std::fmt::Display for ImportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImportError::Read { path, source } => {
                write!(f, "failed to read {}: {}", path.display(), source)
            }
            ImportError::Parse { path, source } => {
                write!(f, "failed to parse {}: {}", path.display(), source)
            }
            ImportError::NotAnArray { path, found } => write!(
                f,
                "expected an array of records in {}, found {}",
                path.display(),
                found
            ),
            ImportError::InvalidDefinition {
                collection,
                message,
            } => write!(f, "invalid import definition for '{}': {}", collection, message),
            ImportError::Backend(err) => write!(f, "backend error: {}", err),
        }
    }
}

impl std::error::Error for ImportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ImportError::Read { source, .. } => Some(source),
            ImportError::Parse { source, .. } => Some(source),
            ImportError::Backend(err) => Some(err),
            _ => None,
        }
    }
}

impl From<BackendError> for ImportError {
    fn from(err: BackendError) -> Self {
        ImportError::Backend(err)
    }
}
