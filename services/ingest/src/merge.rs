//! Stream merger: appends a staged chunk's decompressed content to its
//! boot session archive.
//!
//! ## Format
//!
//! The archive is a sequence of gzip members (RFC 1952 §2.2). Each transfer
//! writes exactly one new member, so decompressing the whole file with a
//! multi-member decoder yields every transfer's content in arrival order.
//!
//! ## Failure Handling
//!
//! A transfer either completes its member or truncates the archive back to
//! where the member began. Cancellation is checked between buffers and takes
//! the same rollback path, so a cancelled transfer never leaves a partial
//! member behind.

use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use flate2::write::GzEncoder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::{IngestError, IoResultExt};
use crate::staged;
use crate::target::ArchiveHandle;

/// Default transfer buffer size (1 MiB) for both read and write sides.
pub const DEFAULT_BUFFER_SIZE: usize = 1024 * 1024;

/// Copies decompressed staged content into an archive member.
#[derive(Debug, Clone)]
pub struct StreamMerger {
    buffer_size: usize,
}

impl Default for StreamMerger {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE)
    }
}

impl StreamMerger {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
        }
    }

    /// Append the decompressed content of `staging` to `archive` as one member.
    ///
    /// Returns the number of decompressed bytes written.
    pub fn transfer(
        &self,
        staging: &Path,
        archive: &mut ArchiveHandle,
        cancel: &CancellationToken,
    ) -> Result<u64, IngestError> {
        let reader = staged::open(staging, self.buffer_size).at(staging)?;

        archive.begin_member()?;
        let archive_path = archive.path().to_path_buf();
        let writer = archive.member_writer(self.buffer_size);

        match self.copy_member(reader, writer, staging, &archive_path, cancel) {
            Ok(bytes) => {
                debug!(
                    staging = %staging.display(),
                    archive = %archive_path.display(),
                    bytes,
                    "Appended archive member"
                );
                Ok(bytes)
            }
            Err(e) => {
                if let Err(rollback_err) = archive.rollback_member() {
                    error!(
                        archive = %archive_path.display(),
                        error = %rollback_err,
                        "Failed to roll back partial archive member"
                    );
                }
                Err(e)
            }
        }
    }

    fn copy_member(
        &self,
        mut reader: impl Read,
        mut writer: GzEncoder<BufWriter<&mut File>>,
        staging: &Path,
        archive: &Path,
        cancel: &CancellationToken,
    ) -> Result<u64, IngestError> {
        let mut buf = vec![0u8; self.buffer_size];
        let mut total = 0u64;

        loop {
            if cancel.is_cancelled() {
                return Err(IngestError::Cancelled);
            }

            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(IngestError::io(staging, e)),
            };

            writer.write_all(&buf[..n]).at(archive)?;
            total += n as u64;
        }

        let buffered = writer.finish().at(archive)?;
        buffered
            .into_inner()
            .map_err(|e| IngestError::io(archive, e.into_error()))?;

        Ok(total)
    }
}
