//! Ingestion settings.

use crate::merge::DEFAULT_BUFFER_SIZE;

/// Settings shared by every pipeline execution.
#[derive(Debug, Clone)]
pub struct IngestSettings {
    /// Extension of boot session archives (`<bootId>.<ext>`).
    pub archive_ext: String,

    /// Extension of metadata records.
    pub meta_ext: String,

    /// Read/write buffer size for staged content.
    pub buffer_size: usize,

    /// Scan each chunk for start/end timestamps.
    pub scan_timestamps: bool,

    /// Maximum work items processed at once.
    pub max_concurrent: usize,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            archive_ext: "gz".to_string(),
            meta_ext: "yaml".to_string(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            scan_timestamps: true,
            max_concurrent: default_concurrency(),
        }
    }
}

/// One worker per available core, falling back to 4.
pub fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}
