/*!
 * Spin-Wait Helper
 *
 * Exponential spin-hint backoff with voluntary yield, used by the handle
 * table and event stream retry loops.
 */

use super::config::SpinConfig;
use std::hint;
use std::thread;

/// Per-attempt spin state
///
/// Create one per acquisition attempt and call [`SpinWait::spin`] after each
/// failed try. Rounds below the configured limit burn `2^round` spin-loop
/// hints; rounds at or past it yield the thread instead.
///
/// # Performance
///
/// - No allocation, no syscalls until the spin limit is crossed
/// - Exponential hinting keeps the cache-line ping-pong short under brief
///   contention
#[derive(Debug)]
pub struct SpinWait {
    config: SpinConfig,
    round: u32,
    yields: u32,
}

impl SpinWait {
    /// Create spin state for one acquisition attempt
    #[inline]
    pub fn new(config: SpinConfig) -> Self {
        Self {
            config,
            round: 0,
            yields: 0,
        }
    }

    /// Back off once after a failed acquisition try
    #[inline]
    pub fn spin(&mut self) {
        if self.round < self.config.spin_limit {
            // Exponential hinting, capped so extreme limits cannot overflow
            for _ in 0..(1u32 << self.round.min(16)) {
                hint::spin_loop();
            }
        } else {
            thread::yield_now();
            self.yields += 1;
        }
        self.round = self.round.saturating_add(1);
    }

    /// Rounds spent so far
    #[inline]
    pub fn rounds(&self) -> u32 {
        self.round
    }

    /// Times the thread was yielded to the scheduler
    #[inline]
    pub fn yields(&self) -> u32 {
        self.yields
    }

    /// Restart the backoff curve (after a successful intermediate step)
    #[inline]
    pub fn reset(&mut self) {
        self.round = 0;
    }
}
