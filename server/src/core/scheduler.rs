use std::time::Duration;

use super::registry::Priority;

/// Coalescing and backpressure parameters for one priority class. Lower
/// windows and smaller cutoffs for the foreground class keep the session a
/// user is actively watching snappy; background sessions are allowed to
/// fall further behind before anything is dropped.
#[derive(Debug, Clone, Copy)]
pub struct Thresholds {
    /// Maximum time pending output may sit uncoalesced before a flush.
    pub coalesce_window: Duration,
    /// Pending-byte count that forces an immediate flush regardless of the
    /// coalescing window.
    pub immediate_flush_bytes: usize,
    /// Per-connection queued-byte count past which this flush skips that
    /// connection rather than growing its send buffer without bound.
    pub backpressure_cutoff: usize,
}

pub fn thresholds(priority: Priority) -> Thresholds {
    match priority {
        Priority::Foreground => Thresholds {
            coalesce_window: Duration::from_millis(16),
            immediate_flush_bytes: 32 * 1024,
            backpressure_cutoff: 256 * 1024,
        },
        Priority::Background => Thresholds {
            coalesce_window: Duration::from_millis(200),
            immediate_flush_bytes: 8 * 1024,
            backpressure_cutoff: 128 * 1024,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn background_has_a_longer_window_and_smaller_cutoff() {
        let fg = thresholds(Priority::Foreground);
        let bg = thresholds(Priority::Background);
        assert!(bg.coalesce_window > fg.coalesce_window);
        assert!(bg.immediate_flush_bytes < fg.immediate_flush_bytes);
        assert!(bg.backpressure_cutoff < fg.backpressure_cutoff);
    }
}
