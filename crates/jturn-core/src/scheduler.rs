//! Repeating background tasks (heartbeats, idle reaping).

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Run `task` every `period`, first firing after `initial_delay`.
///
/// The returned handle aborts the schedule; a tick whose task overruns the
/// period is skipped rather than bursted.
pub fn spawn_repeating<F, Fut>(
    initial_delay: Duration,
    period: Duration,
    mut task: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        tokio::time::sleep(initial_delay).await;
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            task().await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_repeats_until_aborted() {
        let hits = Arc::new(AtomicU32::new(0));
        let handle = {
            let hits = Arc::clone(&hits);
            spawn_repeating(Duration::from_millis(0), Duration::from_millis(10), move || {
                let hits = Arc::clone(&hits);
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                }
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.abort();
        let seen = hits.load(Ordering::SeqCst);
        assert!(seen >= 3, "expected several ticks, got {seen}");

        let frozen = hits.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), frozen);
    }
}
