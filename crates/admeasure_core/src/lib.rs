//! Shared measurement-campaign domain primitives.
//!
//! This crate owns deterministic behavior: identifier normalization, the
//! object key layout, plan routing and boot scripts, log reconstruction and
//! keyword scanning. It excludes cloud SDK concerns, which live in
//! `admeasure_cloud`.

pub mod boot_script;
pub mod identity;
pub mod keywords;
pub mod logs;
pub mod plan;
pub mod scanner;
pub mod storage_keys;

pub use identity::{normalize, sanitize_hostname, to_local_path, Identifier, StepRef};
pub use keywords::{KeywordConfig, KeywordGroup, LazyScanner};
pub use logs::{grep, merge, merge_files, GrepHit, LogEntry};
pub use plan::{MeasurementPlan, PlanBatch, PlanError, ProviderKind};
pub use scanner::{KeywordScanner, ScanCounts, ScanError, ScanStrategy};
