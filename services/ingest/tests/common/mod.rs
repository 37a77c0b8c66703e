//! Shared helpers for ingest integration tests.

#![allow(dead_code)]

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use phonelog_ingest::{IngestSettings, Pipeline, PipelineConfig, WorkItem};
use phonelog_logline::{LogLineParser, TaggedLineParser};

/// Settings used by the integration tests: small buffers, `.meta` records.
pub fn test_settings() -> IngestSettings {
    IngestSettings {
        archive_ext: "gz".to_string(),
        meta_ext: "meta".to_string(),
        buffer_size: 64,
        scan_timestamps: true,
        max_concurrent: 8,
    }
}

pub fn standard_pipeline() -> Pipeline {
    pipeline_with(&test_settings())
}

pub fn pipeline_with(settings: &IngestSettings) -> Pipeline {
    let parser: Arc<dyn LogLineParser> = Arc::new(TaggedLineParser);
    Pipeline::new(PipelineConfig::standard(settings, parser))
}

/// Write `content` gzip-compressed to `staging/<name>`.
pub fn stage_chunk(staging: &Path, name: &str, content: &str) -> PathBuf {
    std::fs::create_dir_all(staging).unwrap();
    let path = staging.join(name);
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(content.as_bytes()).unwrap();
    std::fs::write(&path, encoder.finish().unwrap()).unwrap();
    path
}

pub fn work_item(staging_path: PathBuf, out_dir: &Path, device_id: &str, version: &str) -> WorkItem {
    WorkItem {
        staging_path,
        out_dir: out_dir.to_path_buf(),
        device_id: device_id.to_string(),
        package_name: "edu.buffalo.phonelab".to_string(),
        version: version.to_string(),
        upload_timestamp: 1_461_232_741,
    }
}

/// Decompress a whole (multi-member) archive to a string.
pub fn read_archive(path: &Path) -> String {
    let mut out = String::new();
    MultiGzDecoder::new(File::open(path).unwrap())
        .read_to_string(&mut out)
        .unwrap();
    out
}
