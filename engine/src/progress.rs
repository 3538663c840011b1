//! Progress reporting.
//!
//! Every component reports through the same `(percentage, message)` callback
//! surface. The engine never checks whether a reporter is present: callers
//! without one pass `NullReporter`.
//!
//! Percentages are computed in exactly one place, `scaled`, so that the copy
//! engine, the block imager and the top-level operations all agree on how
//! bytes map to a 0-100 value.

use std::cell::Cell;

/// Receiver for progress updates.
///
/// Called synchronously on the engine's own thread at operation start (0),
/// operation end (100) and at bounded intervals in between. Implementations
/// must return quickly.
pub trait ProgressReporter {
    fn report(&self, percentage: u8, message: &str);
}

/// Reporter that discards every update.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullReporter;

impl ProgressReporter for NullReporter {
    fn report(&self, _percentage: u8, _message: &str) {}
}

impl<F> ProgressReporter for F
where
    F: Fn(u8, &str),
{
    fn report(&self, percentage: u8, message: &str) {
        self(percentage, message)
    }
}

/// Map `processed` of `total` units into the band `[stage_offset, stage_offset + stage_weight]`.
///
/// An empty total counts as complete. The result never exceeds 100.
pub fn scaled(processed: u64, total: u64, stage_offset: u8, stage_weight: u8) -> u8 {
    let offset = stage_offset.min(100) as u128;
    let weight = (stage_weight as u128).min(100 - offset);
    let within = if total == 0 {
        weight
    } else {
        processed.min(total) as u128 * weight / total as u128
    };
    (offset + within) as u8
}

/// A band of the overall percentage assigned to one phase of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stage {
    pub offset: u8,
    pub weight: u8,
}

impl Stage {
    /// The whole 0-100 range.
    pub const WHOLE: Stage = Stage { offset: 0, weight: 100 };

    pub const fn new(offset: u8, weight: u8) -> Self {
        Stage { offset, weight }
    }

    pub fn percent(&self, processed: u64, total: u64) -> u8 {
        scaled(processed, total, self.offset, self.weight)
    }

    pub fn start(&self) -> u8 {
        self.offset.min(100)
    }

    pub fn end(&self) -> u8 {
        scaled(1, 1, self.offset, self.weight)
    }

    /// View `inner` so that a nested operation's 0-100 lands in this band.
    pub fn scope<'a>(&self, inner: &'a dyn ProgressReporter) -> StagedReporter<'a> {
        StagedReporter { inner, stage: *self }
    }
}

/// Maps a full 0-100 range onto one stage of an outer operation.
pub struct StagedReporter<'a> {
    inner: &'a dyn ProgressReporter,
    stage: Stage,
}

impl ProgressReporter for StagedReporter<'_> {
    fn report(&self, percentage: u8, message: &str) {
        self.inner
            .report(self.stage.percent(percentage as u64, 100), message);
    }
}

/// Wraps a reporter so the percentages it sees never decrease.
pub struct MonotonicReporter<'a> {
    inner: &'a dyn ProgressReporter,
    last: Cell<u8>,
}

impl<'a> MonotonicReporter<'a> {
    pub fn new(inner: &'a dyn ProgressReporter) -> Self {
        MonotonicReporter {
            inner,
            last: Cell::new(0),
        }
    }

    /// Highest percentage forwarded so far.
    pub fn last(&self) -> u8 {
        self.last.get()
    }
}

impl ProgressReporter for MonotonicReporter<'_> {
    fn report(&self, percentage: u8, message: &str) {
        let pct = percentage.min(100).max(self.last.get());
        self.last.set(pct);
        self.inner.report(pct, message);
    }
}
