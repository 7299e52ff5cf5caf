/*!
 * Spin Configuration
 *
 * Runtime configuration for the busy-wait backoff curve
 */

use serde::{Deserialize, Serialize};

/// Busy-wait configuration
///
/// Both lock-free structures exclude other threads through a single atomic
/// word and retry with this policy while the word is held. The wait is
/// unbounded by design (critical sections are a few word writes); the limit
/// only shapes where spinning turns into yielding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpinConfig {
    /// Rounds of exponential `spin_loop` hinting before every further round
    /// yields the thread to the scheduler
    pub spin_limit: u32,
}

impl Default for SpinConfig {
    fn default() -> Self {
        Self { spin_limit: 6 }
    }
}

impl SpinConfig {
    /// Configuration for contended tables: give up the CPU immediately
    pub const fn yield_only() -> Self {
        Self { spin_limit: 0 }
    }

    /// Configuration for near-uncontended hot paths: spin longer before
    /// involving the scheduler
    pub const fn low_latency() -> Self {
        Self { spin_limit: 10 }
    }
}
