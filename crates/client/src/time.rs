//! Server-time reconciliation.
//!
//! The client tracks a live offset between its own clock and server time.
//! Each snapshot contributes one offset sample; the live offset chases the
//! average of the recent samples one millisecond per tick so jitter never
//! shows as rubber-banding, but snaps outright on the first snapshot or
//! when the average walks outside the hysteresis band (a real clock step,
//! e.g. after a stall).

use tracing::debug;
use wiresync_core::Millis;

/// Offset jumps beyond this snap instead of drifting.
const HYSTERESIS_MS: i64 = 175;

/// Recent offset samples averaged into the smoothing target.
const SAMPLE_WINDOW: usize = 8;

/// Smoothed client-to-server clock offset.
#[derive(Debug)]
pub struct TimeReconciler {
    samples: [i64; SAMPLE_WINDOW],
    count: usize,
    next: usize,
    live_offset: i64,
    initialized: bool,
}

impl TimeReconciler {
    /// A reconciler with no samples; the first snapshot snaps.
    pub fn new() -> Self {
        Self {
            samples: [0; SAMPLE_WINDOW],
            count: 0,
            next: 0,
            live_offset: 0,
            initialized: false,
        }
    }

    /// Record one snapshot's offset sample.
    pub fn record(&mut self, server_time: Millis, client_now: Millis) {
        let offset = server_time - client_now;
        self.samples[self.next] = offset;
        self.next = (self.next + 1) % SAMPLE_WINDOW;
        self.count = (self.count + 1).min(SAMPLE_WINDOW);
        if !self.initialized {
            self.live_offset = offset;
            self.initialized = true;
            debug!(offset, "initial server time offset");
        }
    }

    /// Move the live offset toward the smoothed target, at most one
    /// millisecond per call; snap when the target is far away.
    pub fn tick(&mut self) {
        if self.count == 0 {
            return;
        }
        let sum: i64 = self.samples[..self.count].iter().sum();
        let smoothed = sum / self.count as i64;
        let diff = smoothed - self.live_offset;
        if diff.abs() > HYSTERESIS_MS {
            debug!(from = self.live_offset, to = smoothed, "server time snapped");
            self.live_offset = smoothed;
        } else {
            self.live_offset += diff.signum();
        }
    }

    /// Reconciled server time for a client clock reading.
    pub fn server_time(&self, client_now: Millis) -> Millis {
        client_now + self.live_offset
    }

    /// Current live offset.
    pub fn offset(&self) -> i64 {
        self.live_offset
    }

    /// Forget all history; the next snapshot snaps again.
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for TimeReconciler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_sample_snaps() {
        let mut time = TimeReconciler::new();
        time.record(10_000, 2_000);
        assert_eq!(time.offset(), 8_000);
        assert_eq!(time.server_time(2_500), 10_500);
    }

    #[test]
    fn test_jitter_moves_at_most_one_ms_per_tick() {
        let mut time = TimeReconciler::new();
        time.record(10_000, 2_000);
        // Samples fluctuate inside the hysteresis band.
        for i in 0..20 {
            let jitter = if i % 2 == 0 { 40 } else { -40 };
            time.record(10_000 + i * 50 + jitter, 2_000 + i * 50);
            let before = time.offset();
            time.tick();
            assert!((time.offset() - before).abs() <= 1);
        }
    }

    #[test]
    fn test_large_jump_snaps_immediately() {
        let mut time = TimeReconciler::new();
        for _ in 0..SAMPLE_WINDOW {
            time.record(10_000, 2_000);
        }
        // A one-second clock step pushes the whole window past the band.
        for _ in 0..SAMPLE_WINDOW {
            time.record(11_000, 2_000);
        }
        time.tick();
        assert_eq!(time.offset(), 9_000);
    }

    #[test]
    fn test_reset_forgets_history() {
        let mut time = TimeReconciler::new();
        time.record(10_000, 2_000);
        time.reset();
        time.record(500, 100);
        assert_eq!(time.offset(), 400);
    }
}
