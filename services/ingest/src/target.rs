//! Output target management for boot session archives.
//!
//! Each boot id owns one append-only gzip archive, `<bootId>.<ext>`, under
//! the device's output directory. New content is always written as a fresh
//! gzip member at the end of the file, so the archive never needs to be
//! recompressed and a failed append can be undone by truncation.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::{debug, info, warn};

use crate::error::{IngestError, IoResultExt};
use crate::pipeline::ProcessingStep;
use crate::work::IngestionContext;

/// Path of the archive for a boot id.
pub fn archive_path(out_dir: &Path, boot_id: &str, ext: &str) -> PathBuf {
    out_dir.join(format!("{}.{}", boot_id, ext))
}

/// An open, appendable boot session archive.
#[derive(Debug)]
pub struct ArchiveHandle {
    path: PathBuf,
    file: File,
    /// Archive length before the member currently being written (or last written).
    member_start: Option<u64>,
}

impl ArchiveHandle {
    /// Open or create the archive in append mode.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, IngestError> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .at(&path)?;

        Ok(Self {
            path,
            file,
            member_start: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current on-disk length.
    pub fn len(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub fn is_empty(&self) -> io::Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Record the current length as the start of a new member.
    ///
    /// Must be called under the boot id's lock, immediately before writing.
    pub fn begin_member(&mut self) -> Result<u64, IngestError> {
        let start = self.len().at(&self.path)?;
        self.member_start = Some(start);
        Ok(start)
    }

    /// A gzip writer appending one member to the archive.
    ///
    /// The member is complete only after `finish()` on the encoder and a flush
    /// of the inner buffer.
    pub fn member_writer(&mut self, buffer_size: usize) -> GzEncoder<BufWriter<&mut File>> {
        GzEncoder::new(
            BufWriter::with_capacity(buffer_size, &mut self.file),
            Compression::default(),
        )
    }

    /// Truncate the archive back to where the last member began.
    ///
    /// Returns `false` if no member was started through this handle.
    pub fn rollback_member(&mut self) -> Result<bool, IngestError> {
        let Some(start) = self.member_start.take() else {
            return Ok(false);
        };

        self.file.set_len(start).at(&self.path)?;
        warn!(
            path = %self.path.display(),
            length = start,
            "Rolled archive back to previous member boundary"
        );
        Ok(true)
    }

    /// Sync and close the archive.
    pub fn release(self) -> io::Result<()> {
        self.file.sync_all()
    }
}

/// Pre-processing step that opens the archive for the resolved boot id.
#[derive(Debug, Clone)]
pub struct OutputTargetManager {
    archive_ext: String,
}

impl OutputTargetManager {
    pub fn new(archive_ext: impl Into<String>) -> Self {
        Self {
            archive_ext: archive_ext.into(),
        }
    }

    /// Ensure `out_dir` exists and open `<bootId>.<ext>` inside it.
    pub fn open(&self, out_dir: &Path, boot_id: &str) -> Result<ArchiveHandle, IngestError> {
        if !out_dir.is_dir() {
            fs::create_dir_all(out_dir).at(out_dir)?;
            info!(dir = %out_dir.display(), "Created output directory");
        }

        let path = archive_path(out_dir, boot_id, &self.archive_ext);
        debug!(boot_id = %boot_id, path = %path.display(), "Opening boot session archive");
        ArchiveHandle::open(path)
    }
}

impl ProcessingStep for OutputTargetManager {
    fn name(&self) -> &'static str {
        "open-output-target"
    }

    fn run(&self, ctx: &mut IngestionContext) -> Result<(), IngestError> {
        let boot_id = ctx.boot_id.as_deref().ok_or(IngestError::MissingState {
            step: self.name(),
            missing: "boot id",
        })?;

        let handle = self.open(&ctx.work.out_dir, boot_id)?;
        ctx.archive = Some(handle);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn append(handle: &mut ArchiveHandle, data: &[u8]) {
        handle.begin_member().unwrap();
        let mut writer = handle.member_writer(16);
        writer.write_all(data).unwrap();
        writer.finish().unwrap().into_inner().unwrap();
    }

    #[test]
    fn test_open_creates_nested_directory() {
        let dir = tempfile::tempdir().unwrap();
        let out_dir = dir.path().join("devices").join("D1");
        let manager = OutputTargetManager::new("gz");

        let handle = manager.open(&out_dir, "X").unwrap();
        assert!(out_dir.is_dir());
        assert_eq!(handle.path(), out_dir.join("X.gz"));
        assert!(handle.is_empty().unwrap());
    }

    #[test]
    fn test_open_fails_when_directory_cannot_be_created() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"not a dir").unwrap();

        let manager = OutputTargetManager::new("gz");
        let err = manager.open(&blocker.join("sub"), "X").unwrap_err();
        assert!(matches!(err, IngestError::Io { .. }));
    }

    #[test]
    fn test_rollback_restores_previous_length() {
        let dir = tempfile::tempdir().unwrap();
        let mut handle = ArchiveHandle::open(dir.path().join("X.gz")).unwrap();

        append(&mut handle, b"kept\n");
        let committed = handle.len().unwrap();
        append(&mut handle, b"discarded\n");
        assert!(handle.len().unwrap() > committed);

        assert!(handle.rollback_member().unwrap());
        assert_eq!(handle.len().unwrap(), committed);
        // Only one rollback per member
        assert!(!handle.rollback_member().unwrap());
    }

    #[test]
    fn test_step_requires_boot_id() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = IngestionContext::new(
            crate::work::WorkItem {
                staging_path: dir.path().join("chunk.gz"),
                out_dir: dir.path().join("out"),
                device_id: "D1".into(),
                package_name: "pkg".into(),
                version: "1.0".into(),
                upload_timestamp: 0,
            },
            tokio_util::sync::CancellationToken::new(),
        );

        let err = OutputTargetManager::new("gz").run(&mut ctx).unwrap_err();
        assert!(matches!(err, IngestError::MissingState { .. }));
        assert!(ctx.archive.is_none());
    }
}
