//! Boot session resolution.
//!
//! A staged chunk is assumed to come from a single boot session, so the
//! first line the parser accepts decides the boot id for the whole chunk.

use std::io::{self, BufRead, BufReader};
use std::sync::Arc;

use phonelog_logline::{LogLine, LogLineParser};
use tracing::debug;

use crate::error::{IngestError, IoResultExt};
use crate::pipeline::ProcessingStep;
use crate::staged;
use crate::work::IngestionContext;

/// Return the first parseable line in `reader`, or `None` at end of input.
///
/// Lines are split on `\n`; a trailing `\r` is dropped and invalid UTF-8 is
/// replaced rather than treated as an error. A line longer than `max_line`
/// bytes fails with [`io::ErrorKind::InvalidData`].
pub fn resolve_boot_line<R: BufRead>(
    mut reader: R,
    parser: &dyn LogLineParser,
    max_line: usize,
) -> io::Result<Option<LogLine>> {
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if staged::read_line_capped(&mut reader, &mut buf, max_line)? == 0 {
            return Ok(None);
        }

        let line = String::from_utf8_lossy(&buf);
        let line = line.trim_end_matches(['\n', '\r']);
        if let Some(parsed) = parser.parse(line) {
            return Ok(Some(parsed));
        }
    }
}

/// Check that a boot id can be used as a file stem in the output directory.
pub fn validate_boot_id(boot_id: &str) -> Result<(), IngestError> {
    let invalid = boot_id.is_empty()
        || boot_id == "."
        || boot_id == ".."
        || boot_id.contains(['/', '\\', '\0']);

    if invalid {
        Err(IngestError::InvalidBootId(boot_id.to_string()))
    } else {
        Ok(())
    }
}

/// Pre-processing step that sets the context's boot id.
pub struct BootSessionResolver {
    parser: Arc<dyn LogLineParser>,
    buffer_size: usize,
}

impl BootSessionResolver {
    pub fn new(parser: Arc<dyn LogLineParser>, buffer_size: usize) -> Self {
        Self {
            parser,
            buffer_size,
        }
    }
}

impl ProcessingStep for BootSessionResolver {
    fn name(&self) -> &'static str {
        "resolve-boot-session"
    }

    fn run(&self, ctx: &mut IngestionContext) -> Result<(), IngestError> {
        let staging = &ctx.work.staging_path;
        let reader = staged::open(staging, self.buffer_size).at(staging)?;
        let reader = BufReader::with_capacity(self.buffer_size, reader);

        let line = resolve_boot_line(reader, self.parser.as_ref(), self.buffer_size)
            .at(staging)?
            .ok_or_else(|| IngestError::Resolution(staging.clone()))?;

        validate_boot_id(&line.boot_id)?;
        debug!(
            staging = %staging.display(),
            boot_id = %line.boot_id,
            "Resolved boot session"
        );

        if ctx.start_timestamp.is_none() {
            ctx.start_timestamp = line.timestamp;
        }
        ctx.boot_id = Some(line.boot_id);
        Ok(())
    }
}
