//! Verification tooling for the tiermem engine.
//!
//! This crate provides:
//! - Workload driver: multi-threaded allocate/free churn across both tiers
//! - Structured logs: JSONL export of engine lifecycle records, plus a validator
//! - Artifact index: SHA-256 manifest tying logs to reports

#![forbid(unsafe_code)]

pub mod error;
pub mod structured_log;
pub mod workload;

pub use error::HarnessError;
pub use structured_log::{ArtifactIndex, LogEmitter, LogEntry};
pub use workload::{ChurnConfig, ChurnReport, run_churn};
