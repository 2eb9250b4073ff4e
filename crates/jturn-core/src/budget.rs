//! Consecutive-failure accounting for control read loops.

/// Counts consecutive read failures against a fixed tolerance.
///
/// `tolerance` failures in a row are survived; the next one trips. A
/// successful read clears the streak.
pub struct ErrorBudget {
    tolerance: u32,
    errors: u32,
}

impl ErrorBudget {
    pub fn new(tolerance: u32) -> Self {
        Self {
            tolerance,
            errors: 0,
        }
    }

    /// Record one failure; `true` once the tolerance is exceeded.
    pub fn record(&mut self) -> bool {
        self.errors += 1;
        self.errors > self.tolerance
    }

    pub fn reset(&mut self) {
        self.errors = 0;
    }

    pub fn errors(&self) -> u32 {
        self.errors
    }
}
