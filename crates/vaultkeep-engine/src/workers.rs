//! Bounded blocking worker pool.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::error::BackupError;

/// Run `f` over `items` on the blocking pool, at most `parallelism` at a time.
///
/// Results come back in input order. Items not yet started when `cancel` fires
/// resolve to [`BackupError::Cancelled`]; a panicking worker resolves to an I/O error.
pub(crate) async fn map_blocking<T, R, F>(
    items: Vec<T>,
    parallelism: usize,
    cancel: &CancellationToken,
    f: F,
) -> Vec<Result<R, BackupError>>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> R + Send + Sync + 'static,
{
    let semaphore = Arc::new(Semaphore::new(parallelism.max(1)));
    let f = Arc::new(f);
    let mut handles = Vec::with_capacity(items.len());

    for item in items {
        let sem = Arc::clone(&semaphore);
        let f = Arc::clone(&f);
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            let permit = tokio::select! {
                permit = sem.acquire_owned() => permit.map_err(|_| BackupError::Cancelled)?,
                _ = cancel.cancelled() => return Err(BackupError::Cancelled),
            };
            if cancel.is_cancelled() {
                return Err(BackupError::Cancelled);
            }
            let out = tokio::task::spawn_blocking(move || f(item)).await;
            drop(permit);
            out.map_err(|e| BackupError::Io(std::io::Error::other(e.to_string())))
        }));
    }

    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        results.push(match handle.await {
            Ok(r) => r,
            Err(e) => Err(BackupError::Io(std::io::Error::other(e.to_string()))),
        });
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_results_keep_input_order() {
        let cancel = CancellationToken::new();
        let out = map_blocking((0..32u64).collect(), 4, &cancel, |n| {
            std::thread::sleep(Duration::from_millis(32 - n));
            n * 2
        })
        .await;
        let values: Vec<u64> = out.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(values, (0..32u64).map(|n| n * 2).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_parallelism_is_bounded() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let (a, p) = (Arc::clone(&active), Arc::clone(&peak));
        let out = map_blocking((0..16).collect::<Vec<u32>>(), 3, &cancel, move |_| {
            let now = a.fetch_add(1, Ordering::SeqCst) + 1;
            p.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(10));
            a.fetch_sub(1, Ordering::SeqCst);
        })
        .await;
        assert!(out.iter().all(|r| r.is_ok()));
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let out = map_blocking(vec![1, 2, 3], 2, &cancel, |n: i32| n).await;
        assert_eq!(out.len(), 3);
        assert!(out
            .iter()
            .all(|r| matches!(r, Err(BackupError::Cancelled))));
    }

    #[tokio::test]
    async fn test_panicking_worker_is_reported() {
        let cancel = CancellationToken::new();
        let out = map_blocking(vec![0, 1], 2, &cancel, |n: i32| {
            if n == 1 {
                panic!("boom");
            }
            n
        })
        .await;
        assert_eq!(*out[0].as_ref().unwrap(), 0);
        assert!(matches!(out[1], Err(BackupError::Io(_))));
    }
}
