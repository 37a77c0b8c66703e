//! Quarantine for boot sessions with inconsistent metadata.
//!
//! A device-id mismatch or a corrupt metadata record means the session's
//! history can no longer be trusted. Rather than aborting the process, the
//! session is quarantined: later items for it are refused until an operator
//! reconciles the archive and metadata by hand.
//!
//! Sessions are keyed by output directory and boot id, so the same boot id
//! under another device directory is unaffected.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::error;

/// Why a boot session was quarantined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuarantineEntry {
    pub out_dir: PathBuf,
    pub boot_id: String,
    /// Device id claimed by the item that triggered the quarantine.
    pub device_id: String,
    pub staging_path: PathBuf,
    pub reason: String,
}

impl QuarantineEntry {
    /// Key shared by the session's archive and metadata record.
    pub fn session(&self) -> PathBuf {
        self.out_dir.join(&self.boot_id)
    }
}

/// Shared registry of quarantined boot sessions.
#[derive(Debug, Clone, Default)]
pub struct Quarantine {
    entries: Arc<RwLock<BTreeMap<PathBuf, QuarantineEntry>>>,
}

impl Quarantine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Quarantine a boot session. The first reason recorded is kept.
    pub fn insert(&self, entry: QuarantineEntry) {
        error!(
            out_dir = %entry.out_dir.display(),
            boot_id = %entry.boot_id,
            device_id = %entry.device_id,
            staging = %entry.staging_path.display(),
            reason = %entry.reason,
            "Quarantining boot session; manual reconciliation required"
        );

        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(entry.session())
            .or_insert(entry);
    }

    pub fn contains(&self, session: &Path) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(session)
    }

    /// All quarantined sessions, sorted by path.
    pub fn entries(&self) -> Vec<QuarantineEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(out_dir: &str, boot_id: &str, reason: &str) -> QuarantineEntry {
        QuarantineEntry {
            out_dir: PathBuf::from(out_dir),
            boot_id: boot_id.to_string(),
            device_id: "D2".to_string(),
            staging_path: PathBuf::from("/staging/c.gz"),
            reason: reason.to_string(),
        }
    }

    #[test]
    fn test_first_reason_is_kept() {
        let quarantine = Quarantine::new();
        assert!(quarantine.is_empty());

        quarantine.insert(entry("/data/D1", "X", "device mismatch"));
        quarantine.insert(entry("/data/D1", "X", "later"));

        assert!(quarantine.contains(Path::new("/data/D1/X")));
        assert!(!quarantine.contains(Path::new("/data/D1/Y")));
        let entries = quarantine.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].reason, "device mismatch");
    }

    #[test]
    fn test_sessions_are_keyed_by_directory() {
        let quarantine = Quarantine::new();
        quarantine.insert(entry("/data/D1", "X", "device mismatch"));

        assert!(quarantine.contains(Path::new("/data/D1/X")));
        assert!(!quarantine.contains(Path::new("/data/D2/X")));
    }
}
