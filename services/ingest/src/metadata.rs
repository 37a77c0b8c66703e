//! Per-boot device metadata records.
//!
//! Every boot id has a YAML document next to its archive describing the
//! ingestion history for that boot session:
//!
//! ```yaml
//! deviceId: D1
//! versions: ["1.0", "1.1"]
//! packageNames: [edu.buffalo.phonelab, edu.buffalo.phonelab]
//! uploadTimestamps: [1461232741, 1461236341]
//! startTimestamps: [0, 0]
//! endTimestamps: [0, 0]
//! ```
//!
//! # Invariants
//!
//! - `deviceId` is fixed when the record is created. An ingestion for the
//!   same boot id from another device is a consistency violation and nothing
//!   is appended.
//! - The five sequences always have equal length; index `i` across them
//!   describes the `i`-th ingestion event.
//!
//! Rewrites go through a temporary file in the same directory which is
//! fsynced and renamed over the old record, so a reader sees either the old
//! or the new document and never a mix of the two.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::error::{IngestError, IoResultExt};
use crate::pipeline::ProcessingStep;
use crate::work::IngestionContext;

/// Path of the metadata record for a boot id.
pub fn metadata_path(out_dir: &Path, boot_id: &str, ext: &str) -> PathBuf {
    out_dir.join(format!("{}.{}", boot_id, ext))
}

/// One completed ingestion, as recorded in the metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestionEvent {
    pub version: String,
    pub package_name: String,
    pub upload_timestamp: i64,
    /// `0` when the chunk carried no timestamps.
    pub start_timestamp: i64,
    pub end_timestamp: i64,
}

impl IngestionEvent {
    /// Build the event for a context that has finished its transfer.
    pub fn from_context(ctx: &IngestionContext) -> Self {
        Self {
            version: ctx.work.version.clone(),
            package_name: ctx.work.package_name.clone(),
            upload_timestamp: ctx.work.upload_timestamp,
            start_timestamp: ctx.start_timestamp.unwrap_or(0),
            end_timestamp: ctx.end_timestamp.unwrap_or(0),
        }
    }
}

/// Ingestion history for one boot id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceMetadataRecord {
    pub device_id: String,
    #[serde(default)]
    pub versions: Vec<String>,
    #[serde(default)]
    pub package_names: Vec<String>,
    #[serde(default)]
    pub upload_timestamps: Vec<i64>,
    #[serde(default)]
    pub start_timestamps: Vec<i64>,
    #[serde(default)]
    pub end_timestamps: Vec<i64>,
}

impl DeviceMetadataRecord {
    /// An empty record owned by `device_id`.
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            ..Self::default()
        }
    }

    /// Number of recorded ingestion events.
    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check that the five sequences line up.
    pub fn check_lengths(&self) -> Result<(), String> {
        let lengths = [
            self.versions.len(),
            self.package_names.len(),
            self.upload_timestamps.len(),
            self.start_timestamps.len(),
            self.end_timestamps.len(),
        ];

        if lengths.iter().all(|&len| len == lengths[0]) {
            Ok(())
        } else {
            Err(format!(
                "sequence lengths differ (versions={}, packageNames={}, uploadTimestamps={}, startTimestamps={}, endTimestamps={})",
                lengths[0], lengths[1], lengths[2], lengths[3], lengths[4]
            ))
        }
    }

    pub fn push_event(&mut self, event: IngestionEvent) {
        self.versions.push(event.version);
        self.package_names.push(event.package_name);
        self.upload_timestamps.push(event.upload_timestamp);
        self.start_timestamps.push(event.start_timestamp);
        self.end_timestamps.push(event.end_timestamp);
    }

    /// The `i`-th event, if recorded.
    pub fn event(&self, i: usize) -> Option<IngestionEvent> {
        Some(IngestionEvent {
            version: self.versions.get(i)?.clone(),
            package_name: self.package_names.get(i)?.clone(),
            upload_timestamp: *self.upload_timestamps.get(i)?,
            start_timestamp: *self.start_timestamps.get(i)?,
            end_timestamp: *self.end_timestamps.get(i)?,
        })
    }
}

/// Load a record. A missing or zero-length file means no record yet.
pub fn load_record(path: &Path) -> Result<Option<DeviceMetadataRecord>, IngestError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) if e.kind() == io::ErrorKind::InvalidData => {
            return Err(IngestError::CorruptMetadata {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
        }
        Err(e) => return Err(IngestError::io(path, e)),
    };

    if contents.trim().is_empty() {
        return Ok(None);
    }

    let record: DeviceMetadataRecord =
        serde_yaml::from_str(&contents).map_err(|e| IngestError::CorruptMetadata {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

    record
        .check_lengths()
        .map_err(|reason| IngestError::CorruptMetadata {
            path: path.to_path_buf(),
            reason,
        })?;

    Ok(Some(record))
}

/// Replace the record at `path` with `record`.
pub fn store_record(path: &Path, record: &DeviceMetadataRecord) -> Result<(), IngestError> {
    let yaml = serde_yaml::to_string(record).map_err(|e| IngestError::Encode {
        path: path.to_path_buf(),
        source: e,
    })?;

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let permissions = record_permissions(path).at(path)?;

    let mut tmp = NamedTempFile::new_in(dir).at(dir)?;
    if let Some(permissions) = permissions {
        tmp.as_file().set_permissions(permissions).at(tmp.path())?;
    }
    tmp.write_all(yaml.as_bytes()).at(tmp.path())?;
    tmp.as_file().sync_all().at(tmp.path())?;
    tmp.persist(path).map_err(|e| IngestError::io(path, e.error))?;

    Ok(())
}

/// Permissions the rewritten record should carry: the existing record's, or
/// the usual mode for a new data file.
///
/// Temporary files are created owner-only, which would otherwise replace the
/// record's mode on every rewrite.
fn record_permissions(path: &Path) -> io::Result<Option<fs::Permissions>> {
    match fs::metadata(path) {
        Ok(meta) => Ok(Some(meta.permissions())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(new_record_permissions()),
        Err(e) => Err(e),
    }
}

#[cfg(unix)]
fn new_record_permissions() -> Option<fs::Permissions> {
    use std::os::unix::fs::PermissionsExt;
    Some(fs::Permissions::from_mode(0o644))
}

#[cfg(not(unix))]
fn new_record_permissions() -> Option<fs::Permissions> {
    None
}

/// Post-processing step that appends the current ingestion to the record.
#[derive(Debug, Clone)]
pub struct MetadataMerger {
    meta_ext: String,
}

impl MetadataMerger {
    pub fn new(meta_ext: impl Into<String>) -> Self {
        Self {
            meta_ext: meta_ext.into(),
        }
    }

    /// Load, verify, append and rewrite the record for `boot_id`.
    ///
    /// Fails with [`IngestError::Consistency`] without touching the file if
    /// the existing record belongs to a different device.
    pub fn merge(
        &self,
        out_dir: &Path,
        boot_id: &str,
        device_id: &str,
        event: IngestionEvent,
    ) -> Result<DeviceMetadataRecord, IngestError> {
        let path = metadata_path(out_dir, boot_id, &self.meta_ext);

        let mut record = match load_record(&path)? {
            Some(existing) => {
                if existing.device_id != device_id {
                    return Err(IngestError::Consistency {
                        boot_id: boot_id.to_string(),
                        recorded: existing.device_id,
                        claimed: device_id.to_string(),
                    });
                }
                existing
            }
            None => {
                info!(boot_id = %boot_id, device_id = %device_id, "Creating metadata record");
                DeviceMetadataRecord::new(device_id)
            }
        };

        record.push_event(event);
        store_record(&path, &record)?;

        debug!(
            boot_id = %boot_id,
            events = record.len(),
            path = %path.display(),
            "Updated metadata record"
        );
        Ok(record)
    }
}

impl ProcessingStep for MetadataMerger {
    fn name(&self) -> &'static str {
        "merge-metadata"
    }

    fn run(&self, ctx: &mut IngestionContext) -> Result<(), IngestError> {
        let boot_id = ctx.boot_id.as_deref().ok_or(IngestError::MissingState {
            step: self.name(),
            missing: "boot id",
        })?;

        self.merge(
            &ctx.work.out_dir,
            boot_id,
            &ctx.work.device_id,
            IngestionEvent::from_context(ctx),
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(version: &str, upload: i64) -> IngestionEvent {
        IngestionEvent {
            version: version.to_string(),
            package_name: "edu.buffalo.phonelab".to_string(),
            upload_timestamp: upload,
            start_timestamp: upload - 10,
            end_timestamp: upload - 1,
        }
    }

    #[test]
    fn test_first_merge_creates_record() {
        let dir = tempfile::tempdir().unwrap();
        let merger = MetadataMerger::new("meta");

        let record = merger.merge(dir.path(), "X", "D1", event("1.0", 100)).unwrap();
        assert_eq!(record.device_id, "D1");
        assert_eq!(record.len(), 1);

        let loaded = load_record(&dir.path().join("X.meta")).unwrap().unwrap();
        assert_eq!(loaded, record);
    }

    #[test]
    fn test_merge_appends_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let merger = MetadataMerger::new("meta");

        merger.merge(dir.path(), "X", "D1", event("1.0", 100)).unwrap();
        merger.merge(dir.path(), "X", "D1", event("1.1", 200)).unwrap();
        let record = merger.merge(dir.path(), "X", "D1", event("1.2", 300)).unwrap();

        assert_eq!(record.versions, vec!["1.0", "1.1", "1.2"]);
        assert_eq!(record.upload_timestamps, vec![100, 200, 300]);
        assert!(record.check_lengths().is_ok());
        assert_eq!(record.event(1), Some(event("1.1", 200)));
        assert_eq!(record.event(3), None);
    }

    #[test]
    fn test_device_mismatch_leaves_record_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let merger = MetadataMerger::new("meta");
        merger.merge(dir.path(), "X", "D1", event("1.0", 100)).unwrap();
        let before = fs::read(dir.path().join("X.meta")).unwrap();

        let err = merger
            .merge(dir.path(), "X", "D2", event("2.0", 200))
            .unwrap_err();
        match err {
            IngestError::Consistency {
                boot_id,
                recorded,
                claimed,
            } => {
                assert_eq!(boot_id, "X");
                assert_eq!(recorded, "D1");
                assert_eq!(claimed, "D2");
            }
            other => panic!("unexpected error: {other}"),
        }

        assert_eq!(fs::read(dir.path().join("X.meta")).unwrap(), before);
    }

    #[test]
    fn test_rewrite_truncates_longer_previous_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("X.meta");

        let mut long = DeviceMetadataRecord::new("D1");
        long.push_event(event(&"9".repeat(512), 1));
        store_record(&path, &long).unwrap();

        let short = DeviceMetadataRecord::new("D1");
        store_record(&path, &short).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        assert!(!contents.contains("999"));
        assert_eq!(load_record(&path).unwrap().unwrap(), short);
    }

    #[test]
    fn test_yaml_uses_camel_case_keys() {
        let mut record = DeviceMetadataRecord::new("D1");
        record.push_event(event("1.0", 100));
        let yaml = serde_yaml::to_string(&record).unwrap();
        for key in [
            "deviceId:",
            "versions:",
            "packageNames:",
            "uploadTimestamps:",
            "startTimestamps:",
            "endTimestamps:",
        ] {
            assert!(yaml.contains(key), "missing {key} in {yaml}");
        }
    }

    #[test]
    fn test_empty_file_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("X.meta");
        fs::write(&path, b"").unwrap();
        assert!(load_record(&path).unwrap().is_none());
    }

    #[test]
    fn test_mismatched_lengths_are_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("X.meta");
        fs::write(
            &path,
            "deviceId: D1\nversions: [\"1.0\", \"1.1\"]\npackageNames: [p]\nuploadTimestamps: [1]\nstartTimestamps: [0]\nendTimestamps: [0]\n",
        )
        .unwrap();

        let err = load_record(&path).unwrap_err();
        assert!(matches!(err, IngestError::CorruptMetadata { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_unparseable_yaml_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("X.meta");
        fs::write(&path, "deviceId: [unterminated").unwrap();
        assert!(matches!(
            load_record(&path),
            Err(IngestError::CorruptMetadata { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_rewrite_keeps_record_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let merger = MetadataMerger::new("meta");
        let path = dir.path().join("X.meta");
        let mode = |path: &Path| fs::metadata(path).unwrap().permissions().mode() & 0o777;

        merger.merge(dir.path(), "X", "D1", event("1.0", 100)).unwrap();
        assert_eq!(mode(&path), 0o644);

        fs::set_permissions(&path, fs::Permissions::from_mode(0o640)).unwrap();
        merger.merge(dir.path(), "X", "D1", event("1.1", 200)).unwrap();
        assert_eq!(mode(&path), 0o640);
        assert_eq!(load_record(&path).unwrap().unwrap().len(), 2);
    }
}
