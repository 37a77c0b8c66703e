//! phonelog ingestion library
//!
//! Merges staged, compressed log chunks uploaded by devices into one
//! append-only archive per boot session, and keeps a metadata record of every
//! ingestion for that boot session.
//!
//! ## Architecture
//!
//! ```text
//! work source ─► IngestPool ─► Pipeline::run (one per item, blocking thread)
//!                               ├── pre:  BootSessionResolver
//!                               │         ContentTimestampScanner
//!                               │         OutputTargetManager
//!                               ├── transfer: StreamMerger        ┐ under the
//!                               └── post: MetadataMerger          ┘ session lock
//! ```
//!
//! Output layout, per device directory:
//!
//! - `<bootId>.gz`: concatenated gzip members, one per ingested chunk
//! - `<bootId>.yaml`: [`metadata::DeviceMetadataRecord`]
//!
//! ## Modules
//!
//! - `pipeline`: step configuration and the per-item runner
//! - `resolver`, `timestamps`, `target`, `merge`, `metadata`: the steps
//! - `locks`, `quarantine`: cross-item coordination
//! - `pool`, `source`: concurrent execution and the manifest work source

pub mod config;
pub mod error;
pub mod locks;
pub mod merge;
pub mod metadata;
pub mod pipeline;
pub mod pool;
pub mod quarantine;
pub mod resolver;
pub mod source;
pub mod staged;
pub mod target;
pub mod timestamps;
pub mod work;

// Re-export commonly used types
pub use config::IngestSettings;
pub use error::IngestError;
pub use metadata::{DeviceMetadataRecord, IngestionEvent, MetadataMerger};
pub use pipeline::{Outcome, Pipeline, PipelineConfig, ProcessingStep, Stage};
pub use pool::{IngestPool, PoolReport};
pub use work::{IngestionContext, WorkItem};
