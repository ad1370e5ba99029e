//! Bounded polling with exponential backoff.
//!
//! Every register poll in the transport (reset completion, FEATURES_OK
//! read-back, config generation) goes through [`poll_until`] so that a host
//! which never answers produces a timeout instead of a hung CPU.

use core::hint::spin_loop;

/// Retry budget for one poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollLimit {
    /// Maximum number of probes, including the first one.
    pub attempts: u32,
    /// Ceiling for the spin-loop hints between two probes.
    pub max_spins: u32,
}

impl PollLimit {
    /// Create a new poll limit.
    pub const fn new(attempts: u32, max_spins: u32) -> Self {
        Self { attempts, max_spins }
    }
}

/// Exponential backoff state.
#[derive(Debug)]
pub struct Backoff {
    spins: u32,
    max_spins: u32,
}

impl Backoff {
    pub fn new(max_spins: u32) -> Self {
        Self { spins: 1, max_spins }
    }

    /// Spin for the current step, then double it (up to the ceiling).
    pub fn snooze(&mut self) {
        for _ in 0..self.spins.min(self.max_spins) {
            spin_loop();
        }
        self.spins = self.spins.saturating_mul(2).min(self.max_spins.max(1));
    }
}

/// Probe until `done` reports true or the budget runs out.
///
/// Returns `Ok(true)` when the condition was met, `Ok(false)` on exhaustion.
/// Errors from the probe abort the poll immediately.
pub fn poll_until<E>(
    limit: PollLimit,
    mut done: impl FnMut() -> Result<bool, E>,
) -> Result<bool, E> {
    let mut backoff = Backoff::new(limit.max_spins);
    for attempt in 0..limit.attempts {
        if done()? {
            return Ok(true);
        }
        if attempt + 1 < limit.attempts {
            backoff.snooze();
        }
    }
    Ok(false)
}
