#![warn(missing_docs)]
//! Core primitives shared across the workspace.

pub mod error;
pub mod pipe;
pub mod ring;

use std::time::Instant;

pub use error::{DropError, SessionError};
pub use pipe::{PipeReceiver, PipeSender, Pump};
pub use ring::Ring;

/// Milliseconds on a monotonic or server clock.
pub type Millis = i64;

/// Monotonic millisecond clock anchored at construction.
///
/// All timeouts and retransmission deadlines in the session core are
/// expressed against this clock, never wall time.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    start: Instant,
}

impl Clock {
    /// Create a clock anchored at "now".
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Milliseconds elapsed since the clock was created.
    pub fn now(&self) -> Millis {
        self.start.elapsed().as_millis() as Millis
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_monotonic() {
        let clock = Clock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
        assert!(a >= 0);
    }
}
