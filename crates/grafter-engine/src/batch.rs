//! Bounded concurrent execution of store calls.

use std::future::Future;

use futures::stream::{self, StreamExt, TryStreamExt};
use grafter_core::RecordType;

use crate::config::EngineConfig;

/// Drives `tasks` with at most `limit` in flight and returns their results in
/// submission order.
///
/// The first error rejects the group; tasks that have not been polled yet are
/// dropped without running.
pub async fn run_bounded<T, E, F>(tasks: Vec<F>, limit: usize) -> Result<Vec<T>, E>
where
    F: Future<Output = Result<T, E>>,
{
    let mut results: Vec<(usize, T)> = stream::iter(tasks.into_iter().enumerate())
        .map(|(i, task)| async move { task.await.map(|value| (i, value)) })
        .buffer_unordered(limit.max(1))
        .try_collect()
        .await?;
    results.sort_by_key(|(i, _)| *i);
    Ok(results.into_iter().map(|(_, value)| value).collect())
}

/// Concurrency limit for a group of writes touching `types`.
pub fn concurrency_for<'a, I>(types: I, config: &EngineConfig) -> usize
where
    I: IntoIterator<Item = &'a RecordType>,
{
    let ceiling = config.max_concurrency.max(1);
    types
        .into_iter()
        .map(|ty| ty.concurrency)
        .min()
        .unwrap_or(ceiling)
        .clamp(1, ceiling)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn keeps_submission_order() {
        let tasks: Vec<_> = (0..5u64)
            .map(|i| async move {
                tokio::time::sleep(Duration::from_millis(10 * (5 - i))).await;
                Ok::<_, String>(i)
            })
            .collect();
        let out = run_bounded(tasks, 3).await.unwrap();
        assert_eq!(out, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn never_exceeds_the_limit() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let running = running.clone();
                let peak = peak.clone();
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, String>(())
                }
            })
            .collect();
        run_bounded(tasks, 2).await.unwrap();
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn first_error_rejects_the_group() {
        let tasks: Vec<_> = (0..4)
            .map(|i| async move {
                if i == 2 {
                    Err(format!("task {i} failed"))
                } else {
                    Ok(i)
                }
            })
            .collect();
        assert_eq!(run_bounded(tasks, 1).await.unwrap_err(), "task 2 failed");
    }

    #[test]
    fn concurrency_is_the_clamped_minimum() {
        let config = EngineConfig {
            max_concurrency: 3,
            ..EngineConfig::default()
        };
        let a = RecordType::new("A", "a").with_concurrency(8);
        let b = RecordType::new("B", "b").with_concurrency(2);
        assert_eq!(concurrency_for([&a, &b], &config), 2);
        assert_eq!(concurrency_for([&a], &config), 3);
        assert_eq!(concurrency_for(Vec::<&RecordType>::new(), &config), 3);
        let zero = RecordType::new("Z", "z").with_concurrency(0);
        assert_eq!(concurrency_for([&zero], &config), 1);
    }
}
