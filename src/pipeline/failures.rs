//! Side channel for items a stage dropped.
//!
//! Stages never propagate failures downstream; the only trace of a dropped
//! item in the main flow is its absence from the report. A `FailureSink`
//! records the `(stage, item, cause)` triple without touching the data flow.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::warn;

/// One dropped or rejected item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageFailure {
    /// Stage that dropped the item.
    pub stage: &'static str,
    /// Display form of the item.
    pub item: String,
    /// Why it was dropped.
    pub cause: String,
}

impl StageFailure {
    pub fn new(stage: &'static str, item: impl Into<String>, cause: impl ToString) -> Self {
        Self {
            stage,
            item: item.into(),
            cause: cause.to_string(),
        }
    }
}

/// Write-only reporting interface shared by all stages of a run.
pub trait FailureSink: Send + Sync {
    fn report(&self, failure: StageFailure);
}

/// Logs failures and keeps nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl FailureSink for LogSink {
    fn report(&self, failure: StageFailure) {
        warn!(
            stage = failure.stage,
            item = %failure.item,
            cause = %failure.cause,
            "Item dropped"
        );
    }
}

/// Logs failures and keeps them for later inspection.
#[derive(Debug, Default)]
pub struct CollectingSink {
    failures: Mutex<Vec<StageFailure>>,
}

impl CollectingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Everything reported so far, in report order.
    pub fn snapshot(&self) -> Vec<StageFailure> {
        self.failures
            .lock()
            .map(|f| f.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    pub fn len(&self) -> usize {
        match self.failures.lock() {
            Ok(failures) => failures.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FailureSink for CollectingSink {
    fn report(&self, failure: StageFailure) {
        LogSink.report(failure.clone());
        match self.failures.lock() {
            Ok(mut failures) => failures.push(failure),
            Err(poisoned) => poisoned.into_inner().push(failure),
        }
    }
}
