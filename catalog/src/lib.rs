//! Instruction catalog and governance engine
//!
//! Keeps a catalog of versioned instruction documents on disk and derives
//! their governance metadata:
//! - one JSON file per record, written atomically (temp file + rename)
//! - owner, review cadence, priority tier and content hash derived on write
//! - a catalog-wide governance hash for drift detection
//! - per-id FIFO serialization of mutations, lock-free reads
//! - rotating, time-windowed usage buckets
//!
//! The tool-call surface lives in `instrux-service`; this crate has no I/O
//! beyond its instructions and snapshot directories.

#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod classifier;
pub mod config;
pub mod errors;
pub mod integrity;
pub mod kv;
pub mod record;
pub mod serializer;
pub mod snapshot;
pub mod store;
pub mod usage;

pub use classifier::{Classifier, NoopResolver, OwnerResolver, OwnershipMap, sha256_hex};
pub use config::{CatalogConfig, GovernanceConfig, UsageConfig};
pub use errors::{CatalogError, ErrorCategory, ItemError, Result};
pub use integrity::{AuditReport, GovernanceHashCache, HealthReport, governance_hash};
pub use kv::{FsRecordStore, LoadReport, RecordStore};
pub use record::{
    Audience, ChangeLogEntry, Classification, GovernanceProjection, InstructionEntry,
    InstructionRecord, PriorityTier, Requirement, Status, UNOWNED,
};
pub use snapshot::{SnapshotInfo, SnapshotWriter};
pub use store::{
    CatalogStore, CategoryCount, CreateOutcome, ExportReport, GovernanceReport, GroomMode,
    GroomReport, ImportReport, ListFilter, LoadSummary, RemoveReport, UpdateOutcome,
};
pub use usage::{Clock, HotEntry, ManualClock, SystemClock, UsageAggregator, UsageSummary};

/// Engine version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
