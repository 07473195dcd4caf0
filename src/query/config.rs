//! Live query tuning knobs.

use std::time::Duration;

/// Timing configuration for live query re-evaluation.
///
/// The defaults coalesce notification bursts (bulk imports, replication)
/// into a single re-run; the exact values are tuning, not contract.
#[derive(Clone, Copy, Debug)]
pub struct LiveQueryConfig {
    /// A change arriving within this window of the previous evaluation
    /// start is considered part of a burst.
    pub coalesce_window: Duration,
    /// Delay applied to a burst change before the next evaluation runs.
    pub burst_delay: Duration,
}

impl Default for LiveQueryConfig {
    fn default() -> Self {
        Self {
            coalesce_window: Duration::from_millis(250),
            burst_delay: Duration::from_millis(500),
        }
    }
}
