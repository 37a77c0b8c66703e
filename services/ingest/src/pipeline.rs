//! Pipeline runner.
//!
//! One execution takes one [`WorkItem`] through three phases:
//!
//! ```text
//! pre-processing  (resolve boot id, open archive, ...)   any failure aborts
//!      │
//! transfer        (append decompressed chunk)            failure aborts
//!      │
//! post-processing (merge metadata, ...)                  failure is logged
//! ```
//!
//! Transfer and post-processing run under the boot session's lock, where a
//! session is the output directory joined with the boot id. The step lists
//! live in an immutable [`PipelineConfig`] shared by every execution.
//!
//! ## Consistency Failures
//!
//! Post-processing failures normally leave the transferred content in place,
//! so the archive may hold an event the metadata does not. A fatal failure
//! (device mismatch, corrupt record) instead rolls back this item's archive
//! member and quarantines the session.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use phonelog_logline::LogLineParser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::IngestSettings;
use crate::error::IngestError;
use crate::locks::BootLocks;
use crate::merge::StreamMerger;
use crate::metadata::MetadataMerger;
use crate::quarantine::{Quarantine, QuarantineEntry};
use crate::resolver::BootSessionResolver;
use crate::target::OutputTargetManager;
use crate::timestamps::ContentTimestampScanner;
use crate::work::{IngestionContext, WorkItem};

/// A pre- or post-processing step.
pub trait ProcessingStep: Send + Sync {
    /// Short name used in logs and outcomes.
    fn name(&self) -> &'static str;

    fn run(&self, ctx: &mut IngestionContext) -> Result<(), IngestError>;
}

/// Where an aborted execution stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    PreProcessing(&'static str),
    Transfer,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PreProcessing(step) => write!(f, "pre-processing ({})", step),
            Self::Transfer => write!(f, "transfer"),
        }
    }
}

/// A post-processing step that failed after the transfer committed.
#[derive(Debug)]
pub struct StepFailure {
    pub step: &'static str,
    pub error: IngestError,
}

/// Result of one pipeline execution.
#[derive(Debug)]
pub enum Outcome {
    /// Content was appended. Post-processing failures, if any, are listed.
    Completed {
        boot_id: String,
        bytes_transferred: u64,
        post_failures: Vec<StepFailure>,
    },

    /// The item was not ingested.
    Aborted { stage: Stage, error: IngestError },

    /// The boot session is (now) quarantined; nothing from this item was kept.
    Quarantined { boot_id: String, error: IngestError },
}

impl Outcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

/// Immutable step configuration.
pub struct PipelineConfig {
    pre: Vec<Arc<dyn ProcessingStep>>,
    merger: StreamMerger,
    post: Vec<Arc<dyn ProcessingStep>>,
}

impl PipelineConfig {
    /// An empty configuration with only the transfer stage.
    pub fn new(merger: StreamMerger) -> Self {
        Self {
            pre: Vec::new(),
            merger,
            post: Vec::new(),
        }
    }

    /// The production step set.
    pub fn standard(settings: &IngestSettings, parser: Arc<dyn LogLineParser>) -> Self {
        let mut config = Self::new(StreamMerger::new(settings.buffer_size)).with_pre_step(
            BootSessionResolver::new(Arc::clone(&parser), settings.buffer_size),
        );

        if settings.scan_timestamps {
            config = config
                .with_pre_step(ContentTimestampScanner::new(parser, settings.buffer_size));
        }

        config
            .with_pre_step(OutputTargetManager::new(settings.archive_ext.clone()))
            .with_post_step(MetadataMerger::new(settings.meta_ext.clone()))
    }

    /// Append a pre-processing step.
    pub fn with_pre_step(mut self, step: impl ProcessingStep + 'static) -> Self {
        self.pre.push(Arc::new(step));
        self
    }

    /// Append a post-processing step.
    pub fn with_post_step(mut self, step: impl ProcessingStep + 'static) -> Self {
        self.post.push(Arc::new(step));
        self
    }

    pub fn pre_steps(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.pre.iter().map(|step| step.name())
    }

    pub fn post_steps(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.post.iter().map(|step| step.name())
    }
}

/// Runs work items through a [`PipelineConfig`].
///
/// Cheap to share: all state is behind `Arc`s.
#[derive(Clone)]
pub struct Pipeline {
    config: Arc<PipelineConfig>,
    locks: BootLocks,
    quarantine: Quarantine,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config: Arc::new(config),
            locks: BootLocks::new(),
            quarantine: Quarantine::new(),
        }
    }

    pub fn quarantine(&self) -> &Quarantine {
        &self.quarantine
    }

    /// Process one work item. Blocks on file I/O.
    pub fn run(&self, item: WorkItem, cancel: &CancellationToken) -> Outcome {
        let mut ctx = IngestionContext::new(item, cancel.clone());
        let outcome = self.execute(&mut ctx, cancel);
        ctx.release();
        outcome
    }

    fn execute(&self, ctx: &mut IngestionContext, cancel: &CancellationToken) -> Outcome {
        for step in &self.config.pre {
            if let Err(e) = step.run(ctx) {
                error!(
                    step = step.name(),
                    staging = %ctx.work.staging_path.display(),
                    error = %e,
                    "Failed to run pre-processing step"
                );
                return Outcome::Aborted {
                    stage: Stage::PreProcessing(step.name()),
                    error: e,
                };
            }
        }

        let Some(boot_id) = ctx.boot_id.clone() else {
            return Outcome::Aborted {
                stage: Stage::Transfer,
                error: IngestError::MissingState {
                    step: "transfer",
                    missing: "boot id",
                },
            };
        };

        let session = ctx.work.out_dir.join(&boot_id);
        self.locks
            .with_lock(&session, || self.execute_locked(ctx, boot_id, &session, cancel))
    }

    fn execute_locked(
        &self,
        ctx: &mut IngestionContext,
        boot_id: String,
        session: &Path,
        cancel: &CancellationToken,
    ) -> Outcome {
        if self.quarantine.contains(session) {
            warn!(
                boot_id = %boot_id,
                staging = %ctx.work.staging_path.display(),
                "Refusing item for quarantined boot session"
            );
            return Outcome::Quarantined {
                error: IngestError::Quarantined(boot_id.clone()),
                boot_id,
            };
        }

        let Some(archive) = ctx.archive.as_mut() else {
            return Outcome::Aborted {
                stage: Stage::Transfer,
                error: IngestError::MissingState {
                    step: "transfer",
                    missing: "output archive",
                },
            };
        };

        let bytes_transferred =
            match self
                .config
                .merger
                .transfer(&ctx.work.staging_path, archive, cancel)
            {
                Ok(bytes) => bytes,
                Err(e) => {
                    error!(
                        boot_id = %boot_id,
                        staging = %ctx.work.staging_path.display(),
                        error = %e,
                        "Failed to copy from staging to archive"
                    );
                    return Outcome::Aborted {
                        stage: Stage::Transfer,
                        error: e,
                    };
                }
            };

        let mut post_failures = Vec::new();
        for step in &self.config.post {
            match step.run(ctx) {
                Ok(()) => {}
                Err(e) if e.is_fatal() => {
                    return self.quarantine_item(ctx, boot_id, e);
                }
                Err(e) => {
                    error!(
                        step = step.name(),
                        boot_id = %boot_id,
                        error = %e,
                        "Post-processing step failed; archive keeps transferred content"
                    );
                    post_failures.push(StepFailure {
                        step: step.name(),
                        error: e,
                    });
                }
            }
        }

        info!(
            boot_id = %boot_id,
            device_id = %ctx.work.device_id,
            bytes = bytes_transferred,
            "Ingested staged chunk"
        );

        Outcome::Completed {
            boot_id,
            bytes_transferred,
            post_failures,
        }
    }

    fn quarantine_item(
        &self,
        ctx: &mut IngestionContext,
        boot_id: String,
        error: IngestError,
    ) -> Outcome {
        if let Some(archive) = ctx.archive.as_mut() {
            if let Err(e) = archive.rollback_member() {
                error!(
                    boot_id = %boot_id,
                    error = %e,
                    "Failed to roll back archive for quarantined item"
                );
            }
        }

        self.quarantine.insert(QuarantineEntry {
            out_dir: ctx.work.out_dir.clone(),
            boot_id: boot_id.clone(),
            device_id: ctx.work.device_id.clone(),
            staging_path: ctx.work.staging_path.clone(),
            reason: error.to_string(),
        });

        Outcome::Quarantined { boot_id, error }
    }
}
