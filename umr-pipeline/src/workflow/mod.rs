//! Reading pipeline workflow
//!
//! One run turns one captured image into one durably recorded reading:
//!
//! ```text
//! Captured → Transcribed → Validated → Archived → Logged → Sunk → Complete
//!     └──────────┴─────────────┴──────────┴─────────┴──→ Failed(reason)
//! ```
//!
//! - **Captured → Transcribed**: provider chain; no provider → `Failed`, nothing persisted
//! - **Transcribed → Validated**: always succeeds; warnings are carried forward
//! - **Validated → Archived**: archive write failure → `Failed`
//! - **Archived → Logged**: log write failure → `Failed` (archive entry compensated)
//! - **Logged → Sunk → Complete**: sink failures never change the outcome

pub mod orchestrator;
pub mod scheduler;

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub use orchestrator::{
    MeterStats, Orchestrator, PipelineSettings, ReconcileReport, RunReport, SinkOutcome, SinkTicket,
};
pub use scheduler::Scheduler;

/// Pipeline run state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum PipelineState {
    Captured,
    Transcribed,
    Validated,
    Archived,
    Logged,
    Sunk,
    Complete,
    Failed(String),
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Complete | PipelineState::Failed(_))
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::Captured => f.write_str("captured"),
            PipelineState::Transcribed => f.write_str("transcribed"),
            PipelineState::Validated => f.write_str("validated"),
            PipelineState::Archived => f.write_str("archived"),
            PipelineState::Logged => f.write_str("logged"),
            PipelineState::Sunk => f.write_str("sunk"),
            PipelineState::Complete => f.write_str("complete"),
            PipelineState::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Pipeline progress events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PipelineEvent {
    /// Run moved to a new state
    StateChanged {
        run_id: Uuid,
        meter: String,
        /// `None` for the first transition of a run
        from: Option<PipelineState>,
        to: PipelineState,
    },

    /// Run terminated without a persisted reading
    RunFailed {
        run_id: Uuid,
        meter: String,
        /// Machine-readable error code
        code: String,
        message: String,
    },

    /// Best-effort sink write finished (after the run completed)
    SinkFinished {
        run_id: Uuid,
        meter: String,
        outcome: SinkOutcome,
    },
}
