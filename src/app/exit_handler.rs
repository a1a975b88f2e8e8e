//! Exit code logic for the bookqueue process.

use crate::ProcessExit;

/// Job counts from one run that decide the exit code.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct RunTally {
    /// Jobs published during the run.
    pub(crate) available: usize,
    /// Jobs that ended in `error`.
    pub(crate) failed: usize,
    /// Jobs that ended in `cancelled`.
    pub(crate) cancelled: usize,
    /// Requests that never made it into the queue.
    pub(crate) rejected: usize,
    /// Pending jobs no worker settled: still queued or active, or cancelled
    /// before dispatch.
    pub(crate) unfinished: usize,
}

impl RunTally {
    /// Everything requested that did not end up published.
    pub(crate) fn unavailable(&self) -> usize {
        self.failed + self.cancelled + self.rejected + self.unfinished
    }

    pub(crate) fn exit_outcome(&self) -> ProcessExit {
        determine_exit_outcome(self.available, self.unavailable())
    }
}

/// Determines the process exit outcome from published and unpublished job counts.
pub(crate) fn determine_exit_outcome(available: usize, unavailable: usize) -> ProcessExit {
    if unavailable == 0 {
        ProcessExit::Success
    } else if available > 0 {
        ProcessExit::Partial
    } else {
        ProcessExit::Failure
    }
}
