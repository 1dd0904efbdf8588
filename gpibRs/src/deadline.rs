//! Wall-clock deadlines that are threaded through nested operations.

use std::time::{Duration, Instant};

use crate::GpibError;

/// Horizon used in place of budgets that do not fit into an [`Instant`], about 136 years.
const FAR_FUTURE: Duration = Duration::from_secs(u32::MAX as u64);

/// A wall-clock cutoff for an operation.
///
/// A deadline is computed once when an operation is submitted and then handed down to every
/// blocking step, including all steps of atomic operations. Each step asks for the
/// [`Deadline::remaining`] time, which fails with [`GpibError::Timeout`] once the deadline has
/// passed.
#[derive(Clone, Copy, Debug)]
pub struct Deadline {
    at: Instant,
    budget: Duration,
}

impl Deadline {
    /// Create a deadline that expires `budget` from now.
    ///
    /// Budgets too large to represent, e.g., [`Duration::MAX`], saturate to a deadline that lies
    /// far in the future.
    pub fn after(budget: Duration) -> Self {
        let now = Instant::now();
        let at = now
            .checked_add(budget)
            .or_else(|| now.checked_add(FAR_FUTURE))
            .or_else(|| now.checked_add(Duration::from_secs(u16::MAX as u64)))
            .unwrap_or(now);
        Self { at, budget }
    }

    /// The instant at which the deadline expires.
    pub fn instant(&self) -> Instant {
        self.at
    }

    /// The total budget this deadline was created with.
    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Returns `true` if the deadline has passed.
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.at
    }

    /// Time left until the deadline expires.
    ///
    /// Fails with [`GpibError::Timeout`] if no time is left.
    pub fn remaining(&self) -> Result<Duration, GpibError> {
        let left = self.at.saturating_duration_since(Instant::now());
        if left.is_zero() {
            Err(self.timeout_error())
        } else {
            Ok(left)
        }
    }

    /// Check that the deadline has not passed yet.
    pub fn check(&self) -> Result<(), GpibError> {
        self.remaining().map(|_| ())
    }

    /// A deadline that expires after `window`, or at this deadline, whichever comes first.
    pub(crate) fn shortened(&self, window: Duration) -> Self {
        let candidate = Self::after(window);
        if candidate.at < self.at {
            candidate
        } else {
            *self
        }
    }

    /// The timeout error for this deadline.
    pub(crate) fn timeout_error(&self) -> GpibError {
        GpibError::Timeout(self.budget)
    }
}
