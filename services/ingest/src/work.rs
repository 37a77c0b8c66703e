//! Work items and per-execution ingestion state.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::target::ArchiveHandle;

/// One staged chunk handed to the pipeline by the work source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    /// Path of the staged, usually gzip-compressed, chunk.
    pub staging_path: PathBuf,

    /// Per-device output directory.
    pub out_dir: PathBuf,

    pub device_id: String,
    pub package_name: String,
    pub version: String,

    /// Upload time as reported by the uploader.
    pub upload_timestamp: i64,
}

/// State accumulated while one work item moves through the pipeline.
///
/// Owned by a single execution. Dropping it closes the archive handle;
/// [`IngestionContext::release`] additionally syncs it.
#[derive(Debug)]
pub struct IngestionContext {
    pub work: WorkItem,

    /// Set by the boot session resolver.
    pub boot_id: Option<String>,

    /// Set by the output target manager.
    pub archive: Option<ArchiveHandle>,

    pub start_timestamp: Option<i64>,
    pub end_timestamp: Option<i64>,

    /// Long-running steps stop early once this fires.
    pub cancel: CancellationToken,
}

impl IngestionContext {
    pub fn new(work: WorkItem, cancel: CancellationToken) -> Self {
        Self {
            work,
            boot_id: None,
            archive: None,
            start_timestamp: None,
            end_timestamp: None,
            cancel,
        }
    }

    /// Flush and close the archive handle, if one was opened.
    pub fn release(&mut self) {
        if let Some(archive) = self.archive.take() {
            let path = archive.path().to_path_buf();
            if let Err(e) = archive.release() {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "Failed to sync archive on release"
                );
            }
        }
    }
}
