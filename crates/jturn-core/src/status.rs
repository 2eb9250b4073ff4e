//! Service lifecycle status.

use std::sync::atomic::{AtomicU8, Ordering};

/// Monotonic service state: INIT → WORKING → CLOSING → CLOSED.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    Init,
    Working,
    Closing,
    Closed,
}

/// Atomic holder for a [`ServiceStatus`], shared across tasks.
///
/// `begin_close` returns `true` exactly once, which is what makes every
/// `shutdown()` in the system idempotent.
pub struct StatusCell(AtomicU8);

const INIT: u8 = 0;
const WORKING: u8 = 1;
const CLOSING: u8 = 2;
const CLOSED: u8 = 3;

impl StatusCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(INIT))
    }

    pub fn get(&self) -> ServiceStatus {
        match self.0.load(Ordering::SeqCst) {
            INIT => ServiceStatus::Init,
            WORKING => ServiceStatus::Working,
            CLOSING => ServiceStatus::Closing,
            _ => ServiceStatus::Closed,
        }
    }

    pub fn set_working(&self) {
        self.0.store(WORKING, Ordering::SeqCst);
    }

    pub fn is_working(&self) -> bool {
        self.0.load(Ordering::SeqCst) == WORKING
    }

    /// Transition to CLOSING unless shutdown already started.
    pub fn begin_close(&self) -> bool {
        loop {
            let current = self.0.load(Ordering::SeqCst);
            if current == CLOSING || current == CLOSED {
                return false;
            }
            if self
                .0
                .compare_exchange(current, CLOSING, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return true;
            }
        }
    }

    pub fn finish_close(&self) {
        self.0.store(CLOSED, Ordering::SeqCst);
    }
}

impl Default for StatusCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle() {
        let cell = StatusCell::new();
        assert_eq!(cell.get(), ServiceStatus::Init);
        assert!(!cell.is_working());

        cell.set_working();
        assert!(cell.is_working());

        assert!(cell.begin_close());
        assert_eq!(cell.get(), ServiceStatus::Closing);

        cell.finish_close();
        assert_eq!(cell.get(), ServiceStatus::Closed);
    }

    #[test]
    fn test_begin_close_fires_once() {
        let cell = StatusCell::new();
        cell.set_working();
        assert!(cell.begin_close());
        assert!(!cell.begin_close());
        cell.finish_close();
        assert!(!cell.begin_close());
    }
}
