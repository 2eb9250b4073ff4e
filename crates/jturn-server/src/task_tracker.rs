//! Task tracking for per-port background tasks
//!
//! Tracks JoinHandle abort handles for public listener tasks, allowing
//! cleanup when a backend goes away and its proxy port is released.

use std::collections::HashMap;
use std::sync::Mutex;
use tokio::task::JoinHandle;

/// Tracks background listener tasks keyed by proxy port
pub struct TaskTracker {
    tasks: Mutex<HashMap<u16, JoinHandle<()>>>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Register a task for a proxy port
    pub fn register(&self, port: u16, handle: JoinHandle<()>) {
        if let Ok(mut tasks) = self.tasks.lock() {
            // If there was a previous task, abort it first
            if let Some(old_handle) = tasks.remove(&port) {
                old_handle.abort();
            }
            tasks.insert(port, handle);
        }
    }

    /// Unregister and abort the task for a proxy port
    pub fn unregister(&self, port: u16) {
        if let Ok(mut tasks) = self.tasks.lock() {
            if let Some(handle) = tasks.remove(&port) {
                handle.abort();
            }
        }
    }

    /// Abort every tracked task
    pub fn abort_all(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for (_, handle) in tasks.drain() {
                handle.abort();
            }
        }
    }
}

impl Default for TaskTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_and_unregister() {
        let tracker = TaskTracker::new();

        let handle =
            tokio::spawn(async { tokio::time::sleep(std::time::Duration::from_secs(10)).await });

        tracker.register(50001, handle);

        tracker.unregister(50001);

        assert_eq!(tracker.tasks.lock().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_replacing_task() {
        let tracker = TaskTracker::new();

        let handle1 =
            tokio::spawn(async { tokio::time::sleep(std::time::Duration::from_secs(10)).await });
        tracker.register(50001, handle1);

        assert_eq!(tracker.tasks.lock().unwrap().len(), 1);

        // Register second task for the same port (should replace the first)
        let handle2 =
            tokio::spawn(async { tokio::time::sleep(std::time::Duration::from_secs(10)).await });
        tracker.register(50001, handle2);

        assert_eq!(tracker.tasks.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_abort_all() {
        let tracker = TaskTracker::new();

        for port in [50001u16, 50002, 50003] {
            let handle = tokio::spawn(async {
                tokio::time::sleep(std::time::Duration::from_secs(10)).await
            });
            tracker.register(port, handle);
        }

        tracker.abort_all();
        assert_eq!(tracker.tasks.lock().unwrap().len(), 0);
    }
}
