//! Bounded pool for CPU-bound per-pair work.

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkerError {
    #[error("worker panicked: {0}")]
    Panicked(String),
    #[error("worker cancelled")]
    Cancelled,
}

/// Runs `work` over `items` on the blocking pool with at most
/// `max_concurrency` jobs in flight. Results come back in input order.
pub async fn run_bounded<T, R, F>(
    items: Vec<T>,
    max_concurrency: usize,
    work: F,
) -> Vec<Result<R, WorkerError>>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> R + Send + Sync + 'static,
{
    let semaphore = Arc::new(Semaphore::new(max_concurrency.max(1)));
    let work = Arc::new(work);

    let handles: Vec<_> = items
        .into_iter()
        .map(|item| {
            let semaphore = semaphore.clone();
            let work = work.clone();
            tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| WorkerError::Cancelled)?;
                tokio::task::spawn_blocking(move || work(item))
                    .await
                    .map_err(join_error)
            })
        })
        .collect();

    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        let result = match handle.await {
            Ok(inner) => inner,
            Err(e) => Err(join_error(e)),
        };
        if let Err(e) = &result {
            log::error!("[WORKERS] job failed: {}", e);
        }
        results.push(result);
    }
    results
}

fn join_error(e: tokio::task::JoinError) -> WorkerError {
    if e.is_cancelled() {
        return WorkerError::Cancelled;
    }
    match e.try_into_panic() {
        Ok(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            WorkerError::Panicked(message)
        }
        Err(_) => WorkerError::Cancelled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn preserves_order_and_bounds_parallelism() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (f, p) = (in_flight.clone(), peak.clone());
        let results = run_bounded((0..16).collect(), 3, move |i: u64| {
            let now = f.fetch_add(1, Ordering::SeqCst) + 1;
            p.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(5 + (16 - i) % 4));
            f.fetch_sub(1, Ordering::SeqCst);
            i * 10
        })
        .await;
        let values: Vec<u64> = results.into_iter().map(Result::unwrap).collect();
        assert_eq!(values, (0..16).map(|i| i * 10).collect::<Vec<_>>());
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn panic_is_isolated_to_its_item() {
        let results = run_bounded(vec![1, 2, 3], 2, |i: i32| {
            if i == 2 {
                panic!("bad item");
            }
            i
        })
        .await;
        assert_eq!(results[0], Ok(1));
        assert_eq!(results[1], Err(WorkerError::Panicked("bad item".to_string())));
        assert_eq!(results[2], Ok(3));
    }
}
