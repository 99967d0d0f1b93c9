use std::path::PathBuf;

use crate::collection::CollectionError;

/// Errors raised while importing diffraction images.
///
/// Only [`ImportError::IoRead`] (and, with strict headers, [`ImportError::MalformedHeader`])
/// abort an import; the field-level variants are recovered by the record builder and
/// end up as diagnostics on the record.
#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    /// File or directory could not be read, or was shorter than its header declares
    #[error("cannot read {}", path.display())]
    IoRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The SMV preamble does not carry a usable HEADER_BYTES declaration
    #[error("malformed header in {}: {reason}", path.display())]
    MalformedHeader { path: PathBuf, reason: String },

    /// A single header value does not parse as the expected type
    #[error("field {field}: cannot parse {value:?} as {expected}")]
    FieldCoercion {
        field: String,
        value: String,
        expected: &'static str,
    },

    /// The rotation axis override is not three comma-separated floats
    #[error("invalid rotation axis {0:?}: expected three comma-separated numbers")]
    RotationAxisParse(String),

    #[error("invalid file pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("invalid import options: {0}")]
    InvalidOptions(String),

    #[error("import cancelled")]
    Cancelled,

    #[error(transparent)]
    Collection(#[from] CollectionError),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ImportError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ImportError::IoRead {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn malformed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        ImportError::MalformedHeader {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// True for errors that must abort the whole import.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            ImportError::FieldCoercion { .. }
                | ImportError::RotationAxisParse(_)
                | ImportError::MalformedHeader { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_io_message_leaves_cause_to_source() {
        let err = ImportError::io("/data/1.img", std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert_eq!(err.to_string(), "cannot read /data/1.img");
        assert_eq!(err.source().map(|s| s.to_string()).as_deref(), Some("gone"));
        assert!(err.is_fatal());

        let chained = format!("{:#}", anyhow::Error::from(err));
        assert_eq!(chained.matches("gone").count(), 1);
    }
}
