// ⚠️ Harvest Errors - one variant per failure class
//
// Per-record failures are caught by the fetch loop, logged and counted;
// incomplete records are data-quality noise; I/O failures on the state
// files always surface to the caller.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HarvestError {
    /// Malformed API response or an explicit `code`/`message` error payload
    #[error("Source data error: {0}")]
    SourceData(String),

    /// Free text the geocoder could not place; `cached` when the answer
    /// came from the negative cache rather than a fresh lookup
    #[error("\"{text}\" is not a valid location")]
    InvalidLocation { text: String, cached: bool },

    /// Record missing a required field - skipped, never counted
    #[error("Incomplete record: {0}")]
    IncompleteRecord(String),

    /// Reading or writing a persisted state file failed
    #[error("I/O error on {path}: {message}")]
    Io { path: PathBuf, message: String },

    /// The global error budget was exhausted
    #[error("Too many errors ({count} > {tolerance}); aborting harvest")]
    TooManyErrors { count: usize, tolerance: usize },

    /// The user asked the process to stop
    #[error("Harvest interrupted")]
    Interrupted,
}

impl HarvestError {
    pub fn io(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        HarvestError::Io {
            path: path.into(),
            message: err.to_string(),
        }
    }

    /// Whether this failure consumes the error budget.
    ///
    /// Incomplete records are expected noise, and a location already known
    /// to be invalid was paid for on an earlier lookup. I/O, budget and
    /// interrupt errors end the run on their own.
    pub fn counts_against_budget(&self) -> bool {
        matches!(
            self,
            HarvestError::SourceData(_) | HarvestError::InvalidLocation { cached: false, .. }
        )
    }

    /// Errors that stop the whole run instead of just the current record
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            HarvestError::Io { .. } | HarvestError::TooManyErrors { .. } | HarvestError::Interrupted
        )
    }
}

pub type HarvestResult<T> = std::result::Result<T, HarvestError>;

// ============================================================================
// ERROR BUDGET
// ============================================================================

/// Global error counter shared by every fetch in a run.
#[derive(Debug, Clone)]
pub struct ErrorBudget {
    tolerance: usize,
    errors: usize,
    warnings: usize,
}

impl ErrorBudget {
    pub fn new(tolerance: usize) -> Self {
        ErrorBudget {
            tolerance,
            errors: 0,
            warnings: 0,
        }
    }

    /// Count a per-record failure; fails once the count exceeds the tolerance.
    pub fn charge(&mut self, err: &HarvestError) -> HarvestResult<()> {
        if !err.counts_against_budget() {
            return Ok(());
        }

        self.errors += 1;
        if self.errors > self.tolerance {
            return Err(HarvestError::TooManyErrors {
                count: self.errors,
                tolerance: self.tolerance,
            });
        }
        Ok(())
    }

    pub fn warn(&mut self) {
        self.warnings += 1;
    }

    pub fn errors(&self) -> usize {
        self.errors
    }

    pub fn warnings(&self) -> usize {
        self.warnings
    }
}
