//! JSON-lines work source.
//!
//! Each non-blank line is one [`WorkItem`]:
//!
//! ```json
//! {"stagingPath":"/staging/c1.gz","outDir":"/data/D1","deviceId":"D1","packageName":"edu.buffalo.phonelab","version":"1.0","uploadTimestamp":1461232741}
//! ```

use std::io::BufRead;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::work::WorkItem;

/// Parse one manifest line. Blank lines and `#` comments yield `None`.
pub fn parse_line(line: &str) -> Option<Result<WorkItem, serde_json::Error>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    Some(serde_json::from_str(line))
}

/// Read a manifest and send each valid item into `tx`.
///
/// Blocks the calling thread; run it with `spawn_blocking`. Malformed lines
/// are logged and skipped. Returns the number of items sent, stopping early
/// if the receiver goes away.
pub fn feed<R: BufRead>(reader: R, tx: mpsc::Sender<WorkItem>) -> std::io::Result<usize> {
    let mut sent = 0;

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        let item = match parse_line(&line) {
            None => continue,
            Some(Ok(item)) => item,
            Some(Err(e)) => {
                warn!(line = index + 1, error = %e, "Skipping malformed work item");
                continue;
            }
        };

        if tx.blocking_send(item).is_err() {
            debug!(sent, "Work queue closed, stopping manifest reader");
            break;
        }
        sent += 1;
    }

    Ok(sent)
}
