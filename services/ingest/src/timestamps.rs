//! Content timestamp scanning.
//!
//! Gzip streams cannot be read backwards, so the first and last event times
//! are both found in a single forward pass over the decompressed chunk.

use std::io::{self, BufRead, BufReader};
use std::sync::Arc;

use phonelog_logline::LogLineParser;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{IngestError, IoResultExt};
use crate::pipeline::ProcessingStep;
use crate::staged;
use crate::work::IngestionContext;

/// First and last event times seen in a chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContentSpan {
    pub start: Option<i64>,
    pub end: Option<i64>,
}

/// Scan every line and record the first and last parseable timestamps.
///
/// Returns `None` if `cancel` fires before the end of input. Lines longer
/// than `max_line` bytes fail with [`io::ErrorKind::InvalidData`].
pub fn scan_span<R: BufRead>(
    mut reader: R,
    parser: &dyn LogLineParser,
    max_line: usize,
    cancel: &CancellationToken,
) -> io::Result<Option<ContentSpan>> {
    let mut span = ContentSpan::default();
    let mut buf = Vec::new();

    loop {
        if cancel.is_cancelled() {
            return Ok(None);
        }

        buf.clear();
        if staged::read_line_capped(&mut reader, &mut buf, max_line)? == 0 {
            return Ok(Some(span));
        }

        let line = String::from_utf8_lossy(&buf);
        let timestamp = parser
            .parse(line.trim_end_matches(['\n', '\r']))
            .and_then(|parsed| parsed.timestamp);

        if let Some(ts) = timestamp {
            if span.start.is_none() {
                span.start = Some(ts);
            }
            span.end = Some(ts);
        }
    }
}

/// Pre-processing step that fills in start/end timestamps.
pub struct ContentTimestampScanner {
    parser: Arc<dyn LogLineParser>,
    buffer_size: usize,
}

impl ContentTimestampScanner {
    pub fn new(parser: Arc<dyn LogLineParser>, buffer_size: usize) -> Self {
        Self {
            parser,
            buffer_size,
        }
    }
}

impl ProcessingStep for ContentTimestampScanner {
    fn name(&self) -> &'static str {
        "scan-content-timestamps"
    }

    fn run(&self, ctx: &mut IngestionContext) -> Result<(), IngestError> {
        let staging = &ctx.work.staging_path;
        let reader = staged::open(staging, self.buffer_size).at(staging)?;
        let span = scan_span(
            BufReader::with_capacity(self.buffer_size, reader),
            self.parser.as_ref(),
            self.buffer_size,
            &ctx.cancel,
        )
        .at(staging)?
        .ok_or(IngestError::Cancelled)?;

        debug!(
            staging = %staging.display(),
            start = ?span.start,
            end = ?span.end,
            "Scanned content timestamps"
        );

        if span.start.is_some() {
            ctx.start_timestamp = span.start;
        }
        if span.end.is_some() {
            ctx.end_timestamp = span.end;
        }
        Ok(())
    }
}
