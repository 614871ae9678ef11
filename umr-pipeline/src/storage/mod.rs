//! Durable stores written by a pipeline run
//!
//! - [`ArchiveStore`] - image + metadata pairs per meter
//! - [`ReadingLog`] - append-only JSONL log per meter type
//! - [`AttemptLedger`] - JSONL record of provider attempts

pub mod archive;
pub mod attempts;
pub mod reading_log;

pub use archive::{ArchiveStore, StagedImage};
pub use attempts::AttemptLedger;
pub use reading_log::{LogScan, ReadingLog};
