//! Per-agent reconnection timers with exponential backoff.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::ManagerConfig;

/// `min(base * 2^(attempt-1), max)`. Attempt numbers start at 1; 0 is treated as 1.
pub fn calculate_backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    base.saturating_mul(2u32.pow(exponent)).min(max)
}

struct ScheduledTask {
    id: u64,
    attempt: u32,
    scheduled_at: DateTime<Utc>,
    delay: Duration,
    handle: JoinHandle<()>,
}

/// A pending reconnection, as reported to callers.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingReconnect {
    pub attempt: u32,
    pub scheduled_at: DateTime<Utc>,
    pub delay: Duration,
}

/// Timer queue holding at most one outstanding task per agent.
pub struct ReconnectScheduler {
    base: Duration,
    max: Duration,
    jitter_ratio: f64,
    tasks: Arc<Mutex<HashMap<String, ScheduledTask>>>,
    next_id: AtomicU64,
}

impl ReconnectScheduler {
    pub fn new(config: &ManagerConfig) -> Self {
        Self {
            base: config.backoff_base,
            max: config.backoff_max,
            jitter_ratio: config.backoff_jitter_ratio,
            tasks: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Deterministic delay for an attempt, before jitter.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        calculate_backoff_delay(attempt, self.base, self.max)
    }

    fn with_jitter(&self, delay: Duration) -> Duration {
        if self.jitter_ratio <= 0.0 {
            return delay;
        }
        let factor = rand::thread_rng().gen_range(0.0..=self.jitter_ratio);
        delay + delay.mul_f64(factor)
    }

    /// Schedule `callback` after the backoff delay for `attempt`.
    ///
    /// Returns false (and schedules nothing) if the agent already has a task.
    pub async fn schedule<F, Fut>(&self, agent_id: &str, attempt: u32, callback: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let delay = self.with_jitter(self.backoff_delay(attempt));
        self.schedule_after(agent_id, attempt, delay, callback).await
    }

    /// Schedule `callback` after a fixed delay, under the same one-task-per-agent rule.
    pub async fn schedule_after<F, Fut>(
        &self,
        agent_id: &str,
        attempt: u32,
        delay: Duration,
        callback: F,
    ) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock().await;
        if let Some(existing) = tasks.get(agent_id) {
            tracing::debug!(
                agent_id = %agent_id,
                attempt = existing.attempt,
                "Reconnection already scheduled, ignoring"
            );
            return false;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let table = Arc::clone(&self.tasks);
        let agent = agent_id.to_string();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                // Drop our entry before running so the callback may schedule again.
                let mut tasks = table.lock().await;
                match tasks.get(&agent) {
                    Some(task) if task.id == id => {
                        tasks.remove(&agent);
                    }
                    _ => return,
                }
            }
            callback().await;
        });

        tracing::info!(
            agent_id = %agent_id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Scheduled reconnection"
        );

        tasks.insert(
            agent_id.to_string(),
            ScheduledTask {
                id,
                attempt,
                scheduled_at: Utc::now(),
                delay,
                handle,
            },
        );
        true
    }

    /// Cancel the agent's pending task. Returns whether one existed.
    pub async fn cancel(&self, agent_id: &str) -> bool {
        match self.tasks.lock().await.remove(agent_id) {
            Some(task) => {
                task.handle.abort();
                tracing::debug!(agent_id = %agent_id, attempt = task.attempt, "Cancelled reconnection");
                true
            }
            None => false,
        }
    }

    /// Cancel every pending task.
    pub async fn cancel_all(&self) -> usize {
        let mut tasks = self.tasks.lock().await;
        let count = tasks.len();
        for (_, task) in tasks.drain() {
            task.handle.abort();
        }
        count
    }

    pub async fn is_scheduled(&self, agent_id: &str) -> bool {
        self.tasks.lock().await.contains_key(agent_id)
    }

    pub async fn pending(&self, agent_id: &str) -> Option<PendingReconnect> {
        self.tasks
            .lock()
            .await
            .get(agent_id)
            .map(|task| PendingReconnect {
                attempt: task.attempt,
                scheduled_at: task.scheduled_at,
                delay: task.delay,
            })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use super::*;

    fn scheduler() -> ReconnectScheduler {
        ReconnectScheduler::new(&ManagerConfig::default().without_jitter())
    }

    fn backoff_ms(attempt: u32) -> u128 {
        calculate_backoff_delay(
            attempt,
            Duration::from_millis(3_000),
            Duration::from_millis(60_000),
        )
        .as_millis()
    }

    #[test]
    fn test_backoff_values() {
        assert_eq!(backoff_ms(1), 3_000);
        assert_eq!(backoff_ms(2), 6_000);
        assert_eq!(backoff_ms(5), 48_000);
        assert_eq!(backoff_ms(6), 60_000);
        assert_eq!(backoff_ms(10), 60_000);
        assert_eq!(backoff_ms(0), 3_000);
        assert_eq!(backoff_ms(u32::MAX), 60_000);
    }

    #[test]
    fn test_backoff_is_monotonic_and_capped() {
        let mut previous = 0;
        for attempt in 1..=64 {
            let delay = backoff_ms(attempt);
            assert!(delay >= previous);
            assert!(delay <= 60_000);
            previous = delay;
        }
    }

    #[test]
    fn test_jitter_stays_within_ratio() {
        let config = ManagerConfig {
            backoff_jitter_ratio: 0.5,
            ..ManagerConfig::default()
        };
        let scheduler = ReconnectScheduler::new(&config);
        for _ in 0..100 {
            let delay = scheduler.with_jitter(Duration::from_secs(10));
            assert!(delay >= Duration::from_secs(10));
            assert!(delay <= Duration::from_secs(15));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_callback_fires_after_backoff() {
        let scheduler = scheduler();
        let fired = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&fired);
        assert!(
            scheduler
                .schedule("a1", 2, move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .await
        );

        tokio::time::sleep(Duration::from_millis(5_999)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(scheduler.is_scheduled("a1").await);

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!scheduler.is_scheduled("a1").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_schedule_is_noop() {
        let scheduler = scheduler();
        let fired = Arc::new(AtomicU32::new(0));

        let c1 = Arc::clone(&fired);
        let c2 = Arc::clone(&fired);
        assert!(
            scheduler
                .schedule("a1", 1, move || async move {
                    c1.fetch_add(1, Ordering::SeqCst);
                })
                .await
        );
        assert!(
            !scheduler
                .schedule("a1", 1, move || async move {
                    c2.fetch_add(10, Ordering::SeqCst);
                })
                .await
        );

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_callback() {
        let scheduler = scheduler();
        let fired = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&fired);
        scheduler
            .schedule("a1", 1, move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        assert!(scheduler.cancel("a1").await);
        assert!(!scheduler.cancel("a1").await);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_callback_can_reschedule_itself() {
        let scheduler = Arc::new(scheduler());
        let fired = Arc::new(AtomicU32::new(0));

        let inner_scheduler = Arc::clone(&scheduler);
        let counter = Arc::clone(&fired);
        scheduler
            .schedule("a1", 1, move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                let again = Arc::clone(&counter);
                let accepted = inner_scheduler
                    .schedule("a1", 2, move || async move {
                        again.fetch_add(1, Ordering::SeqCst);
                    })
                    .await;
                assert!(accepted);
            })
            .await;

        tokio::time::sleep(Duration::from_millis(3_001)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.pending("a1").await.map(|p| p.attempt), Some(2));

        tokio::time::sleep(Duration::from_millis(6_001)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all() {
        let scheduler = scheduler();
        scheduler.schedule("a1", 1, || async {}).await;
        scheduler.schedule("a2", 1, || async {}).await;
        assert_eq!(scheduler.cancel_all().await, 2);
        assert!(!scheduler.is_scheduled("a1").await);
    }
}
