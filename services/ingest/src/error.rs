//! Error taxonomy for ingestion.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors from a single pipeline execution.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("No parseable boot identifier in {}", .0.display())]
    Resolution(PathBuf),

    #[error("Invalid boot identifier: {0:?}")]
    InvalidBootId(String),

    #[error("Device mismatch for boot {boot_id}: record has {recorded}, item claims {claimed}")]
    Consistency {
        boot_id: String,
        recorded: String,
        claimed: String,
    },

    #[error("Corrupt metadata in {}: {reason}", .path.display())]
    CorruptMetadata { path: PathBuf, reason: String },

    #[error("Metadata encoding failed for {}: {source}", .path.display())]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Boot {0} is quarantined")]
    Quarantined(String),

    #[error("Step {step} ran before a {missing} was available")]
    MissingState {
        step: &'static str,
        missing: &'static str,
    },

    #[error("Transfer cancelled")]
    Cancelled,
}

impl IngestError {
    /// Wrap an I/O error with the path it happened on.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Fatal errors signal data corruption or a misrouted chunk. They halt
    /// processing for the affected boot id rather than just the current item.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Consistency { .. } | Self::CorruptMetadata { .. } | Self::Quarantined(_)
        )
    }
}

/// Extension for attaching a path to `io::Result`.
pub(crate) trait IoResultExt<T> {
    fn at(self, path: impl Into<PathBuf>) -> Result<T, IngestError>;
}

impl<T> IoResultExt<T> for io::Result<T> {
    fn at(self, path: impl Into<PathBuf>) -> Result<T, IngestError> {
        self.map_err(|e| IngestError::io(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let mismatch = IngestError::Consistency {
            boot_id: "X".into(),
            recorded: "D1".into(),
            claimed: "D2".into(),
        };
        assert!(mismatch.is_fatal());
        assert!(!IngestError::Resolution(PathBuf::from("a.gz")).is_fatal());
        assert!(!IngestError::io("a.gz", io::Error::other("boom")).is_fatal());
        assert!(!IngestError::Cancelled.is_fatal());
    }

    #[test]
    fn test_io_error_names_path() {
        let err: Result<(), _> =
            Err::<(), _>(io::Error::new(io::ErrorKind::NotFound, "gone")).at("/tmp/chunk.gz");
        let message = err.unwrap_err().to_string();
        assert!(message.contains("/tmp/chunk.gz"));
        assert!(message.contains("gone"));
    }
}
