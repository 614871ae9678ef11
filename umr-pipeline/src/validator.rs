//! Reading plausibility checks
//!
//! Compares a new reading against the most recent prior reading of the same
//! meter. Validation never blocks persistence: a failed check becomes a
//! warning annotation on the log entry and archive metadata.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{LogEntry, Reading};

/// Reason a reading looks implausible
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationWarning {
    /// Counter went backwards (misread or meter reset)
    Decreased,
    /// Increase exceeds the configured jump threshold
    LargeJump,
}

impl fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationWarning::Decreased => f.write_str("reading decreased"),
            ValidationWarning::LargeJump => f.write_str("large jump"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationOutcome {
    Ok,
    Warning(ValidationWarning),
}

impl ValidationOutcome {
    pub fn warning(&self) -> Option<ValidationWarning> {
        match self {
            ValidationOutcome::Ok => None,
            ValidationOutcome::Warning(w) => Some(*w),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReadingValidator {
    jump_threshold: f64,
}

impl ReadingValidator {
    pub fn new(jump_threshold: f64) -> Self {
        Self { jump_threshold }
    }

    pub fn jump_threshold(&self) -> f64 {
        self.jump_threshold
    }

    /// Validate against recent history (most recent last)
    ///
    /// Callers pass entries of the same meter only; entries of other meters
    /// or meter types must never be mixed in.
    pub fn validate(&self, new_reading: &Reading, recent: &[LogEntry]) -> ValidationOutcome {
        let Some(previous) = recent.last() else {
            return ValidationOutcome::Ok;
        };

        let delta = new_reading.total_reading() - previous.reading.total_reading();
        if delta < 0.0 {
            ValidationOutcome::Warning(ValidationWarning::Decreased)
        } else if delta > self.jump_threshold {
            ValidationOutcome::Warning(ValidationWarning::LargeJump)
        } else {
            ValidationOutcome::Ok
        }
    }
}
