//! # phonelog-logline
//!
//! Line-level parsing for device log chunks.
//!
//! The ingestion pipeline never interprets log text itself. It hands each
//! line to a [`LogLineParser`] and only cares whether the line yields a boot
//! identifier (and, optionally, an event time).
//!
//! ## Line Format
//!
//! The bundled [`TaggedLineParser`] recognizes whitespace-delimited tags
//! anywhere on the line:
//!
//! - `boot=<id>` (required): the boot session the line belongs to
//! - `ts=<integer>` (optional): event time in nanoseconds since the epoch
//!
//! Examples:
//! - `boot=8f3e hello` → boot id `8f3e`, no time
//! - `ts=1461232741199000000 boot=8f3e I/ActivityManager: start` → both

/// A log line that carried a boot identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    /// Boot session identifier.
    pub boot_id: String,

    /// Event time in nanoseconds since the epoch, if the line had one.
    pub timestamp: Option<i64>,
}

impl LogLine {
    /// Create a log line without an event time.
    pub fn new(boot_id: impl Into<String>) -> Self {
        Self {
            boot_id: boot_id.into(),
            timestamp: None,
        }
    }

    /// Attach an event time.
    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// Extracts a [`LogLine`] from one line of text.
///
/// Returns `None` when the line is not parseable. Implementations must be
/// cheap to call per line and safe to share across worker threads.
pub trait LogLineParser: Send + Sync {
    fn parse(&self, line: &str) -> Option<LogLine>;
}

impl<F> LogLineParser for F
where
    F: Fn(&str) -> Option<LogLine> + Send + Sync,
{
    fn parse(&self, line: &str) -> Option<LogLine> {
        self(line)
    }
}

/// Default parser for `boot=` / `ts=` tagged lines.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaggedLineParser;

impl TaggedLineParser {
    const BOOT_TAG: &'static str = "boot=";
    const TIME_TAG: &'static str = "ts=";
}

impl LogLineParser for TaggedLineParser {
    fn parse(&self, line: &str) -> Option<LogLine> {
        let mut boot_id = None;
        let mut timestamp = None;

        for token in line.split_whitespace() {
            if let Some(id) = token.strip_prefix(Self::BOOT_TAG) {
                // First boot tag wins
                if boot_id.is_none() && !id.is_empty() {
                    boot_id = Some(id);
                }
            } else if let Some(ts) = token.strip_prefix(Self::TIME_TAG) {
                if timestamp.is_none() {
                    timestamp = ts.parse::<i64>().ok();
                }
            }
        }

        boot_id.map(|id| LogLine {
            boot_id: id.to_string(),
            timestamp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_boot_tag() {
        let line = TaggedLineParser.parse("boot=X hello").unwrap();
        assert_eq!(line, LogLine::new("X"));
    }

    #[test]
    fn test_parses_timestamp_in_any_position() {
        let line = TaggedLineParser
            .parse("ts=1461232741199000000 I/Tag: boot=abc payload")
            .unwrap();
        assert_eq!(line.boot_id, "abc");
        assert_eq!(line.timestamp, Some(1_461_232_741_199_000_000));
    }

    #[test]
    fn test_rejects_lines_without_boot_tag() {
        assert!(TaggedLineParser.parse("").is_none());
        assert!(TaggedLineParser.parse("hello world").is_none());
        assert!(TaggedLineParser.parse("boot= empty id").is_none());
        assert!(TaggedLineParser.parse("reboot=X not a tag").is_none());
    }

    #[test]
    fn test_bad_timestamp_is_ignored() {
        let line = TaggedLineParser.parse("boot=X ts=yesterday").unwrap();
        assert_eq!(line.timestamp, None);
    }

    #[test]
    fn test_closure_parser() {
        let parser = |line: &str| line.strip_prefix("#").map(LogLine::new);
        assert_eq!(parser.parse("#abc"), Some(LogLine::new("abc")));
        assert_eq!(parser.parse("abc"), None);
    }
}
