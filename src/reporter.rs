//! Progress and log callbacks for a run.

/// Receives progress and human-facing log lines while a run executes.
///
/// Both methods are called from the orchestrating task, never concurrently.
pub trait ProgressReporter: Send + Sync {
    /// `current` documents of `total` have been handled.
    fn progress(&self, _current: u64, _total: u64) {}

    /// A message worth showing to the operator.
    fn log(&self, _message: &str) {}
}

/// Reporter that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReporter;

impl ProgressReporter for NoopReporter {}
