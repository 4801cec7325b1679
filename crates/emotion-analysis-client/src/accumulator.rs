use std::collections::BTreeMap;
use std::fmt;

use tracing::debug;

use crate::errors::AccumulatorError;
use crate::model::{Aggregate, PartialResult};

/// Ceiling reported by `max_confidence` before any result arrives.
pub const EMPTY_CONFIDENCE_CEILING: f64 = 1.0;

/// Headroom applied on top of the highest confidence when scaling a chart axis.
const DISPLAY_HEADROOM: f64 = 1.1;

/// Where an error log entry came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The server failed one segment and kept going.
    Segment,
    /// Error listed in the completion payload.
    Server,
    /// The stream was lost for good.
    Transport,
    /// The caller stopped the session.
    Cancelled,
    /// The session could not start.
    Validation,
}

/// One user-visible entry in a session's error log.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ErrorEntry {
    pub kind: ErrorKind,
    pub index: Option<u32>,
    pub total: Option<u32>,
    pub message: String,
}

impl ErrorEntry {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            index: None,
            total: None,
            message: message.into(),
        }
    }

    /// An entry for a failed segment at `index` of `total`.
    pub fn segment(index: u32, total: u32, message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Segment,
            index: Some(index),
            total: Some(total),
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.kind, self.index, self.total) {
            (ErrorKind::Segment, Some(index), Some(total)) => write!(
                f,
                "Error processing clip {index}/{total}: {}",
                self.message
            ),
            _ => f.write_str(&self.message),
        }
    }
}

/// Ordered, deduplicated store of partial results plus running statistics.
///
/// State only grows: results are never removed or reordered relative to each
/// other, the error log is append-only, the aggregate is set at most once and
/// the progress fraction never decreases.
#[derive(Debug, Default, Clone)]
pub struct ResultAccumulator {
    results: BTreeMap<u32, PartialResult>,
    errors: Vec<ErrorEntry>,
    aggregate: Option<Aggregate>,
    finalized: bool,
    progress: f64,
    total: Option<u32>,
}

impl ResultAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a result in sequence order.
    ///
    /// Results that arrive out of order land in their sorted position; a
    /// sequence that is already present is rejected.
    pub fn insert(&mut self, result: PartialResult) -> Result<(), AccumulatorError> {
        let sequence = result.sequence;
        if self.finalized {
            return Err(AccumulatorError::Sealed { sequence });
        }
        if self.results.contains_key(&sequence) {
            debug!(sequence, "dropping duplicate result");
            return Err(AccumulatorError::Duplicate { sequence });
        }
        let total = result.total;
        self.results.insert(sequence, result);
        self.observe_progress(sequence, total);
        Ok(())
    }

    /// Records the latest `(current, total)` position.
    ///
    /// Returns the new fraction when it moved forward.
    pub fn observe_progress(&mut self, current: u32, total: u32) -> Option<f64> {
        if total == 0 {
            return None;
        }
        self.total = Some(total);
        let fraction = (f64::from(current) / f64::from(total)).clamp(0.0, 1.0);
        if fraction > self.progress {
            self.progress = fraction;
            Some(fraction)
        } else {
            None
        }
    }

    /// Appends a failed segment to the error log. Other segments are unaffected.
    pub fn record_error(&mut self, index: u32, total: u32, message: impl Into<String>) -> ErrorEntry {
        self.push_error(ErrorEntry::segment(index, total, message))
    }

    /// Appends an arbitrary entry to the error log.
    pub fn push_error(&mut self, entry: ErrorEntry) -> ErrorEntry {
        self.errors.push(entry.clone());
        entry
    }

    /// Sets the terminal aggregate. Only the first call has any effect.
    pub fn finalize(&mut self, aggregate: Option<Aggregate>) -> Result<(), AccumulatorError> {
        if self.finalized {
            return Err(AccumulatorError::AlreadyFinalized);
        }
        self.finalized = true;
        self.aggregate = aggregate;
        Ok(())
    }

    /// Highest top-category score seen so far, or `EMPTY_CONFIDENCE_CEILING`.
    pub fn max_confidence(&self) -> f64 {
        self.results
            .values()
            .map(|r| r.confidence)
            .reduce(f64::max)
            .unwrap_or(EMPTY_CONFIDENCE_CEILING)
    }

    /// Percent ceiling for a confidence axis: 10% above the highest score,
    /// capped at 100.
    pub fn display_ceiling(&self) -> f64 {
        if self.results.is_empty() {
            return 100.0;
        }
        (self.max_confidence() * 100.0 * DISPLAY_HEADROOM)
            .ceil()
            .min(100.0)
    }

    /// Results in ascending sequence order.
    pub fn results(&self) -> impl Iterator<Item = &PartialResult> {
        self.results.values()
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn latest(&self) -> Option<&PartialResult> {
        self.results.values().next_back()
    }

    pub fn errors(&self) -> &[ErrorEntry] {
        &self.errors
    }

    pub fn aggregate(&self) -> Option<&Aggregate> {
        self.aggregate.as_ref()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Progress fraction in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        self.progress
    }

    /// Last job-wide segment count observed.
    pub fn total(&self) -> Option<u32> {
        self.total
    }
}
