//! Bounded pool for CPU-bound work (archive extraction and image codecs).

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Runs blocking jobs on Tokio's blocking threads, at most `threads` at once.
///
/// Jobs never run on the async workers, so a large batch of images can't
/// stall unrelated requests. A job that panics is reported as
/// [`ErrorKind::Worker`] to the awaiting caller.
#[derive(Debug, Clone)]
pub struct BlockingPool {
    permits: Arc<Semaphore>,
}
impl BlockingPool {
    pub fn new(threads: usize) -> Self {
        Self { permits: Arc::new(Semaphore::new(threads.max(1))) }
    }

    pub async fn run<T, F>(&self, job: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let permit = Arc::clone(&self.permits).acquire_owned().await.or_raise(|| ErrorKind::Worker)?;
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job()
        })
        .await
        .or_raise(|| ErrorKind::Worker)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_job_result_is_returned() {
        let pool = BlockingPool::new(1);
        assert_eq!(pool.run(|| Ok(21 * 2)).await.unwrap(), 42);
        let err = pool.run(|| -> Result<()> { exn::bail!(ErrorKind::Image) }).await.unwrap_err();
        assert_eq!(*err, ErrorKind::Image);
    }

    #[tokio::test]
    async fn test_panic_becomes_error() {
        let pool = BlockingPool::new(1);
        let err = pool.run(|| -> Result<()> { panic!("decoder exploded") }).await.unwrap_err();
        assert_eq!(*err, ErrorKind::Worker);
        // The permit was released by the unwinding job.
        assert!(pool.run(|| Ok(())).await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrency_is_bounded() {
        let pool = BlockingPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let jobs = (0..6).map(|_| {
            let (running, peak) = (Arc::clone(&running), Arc::clone(&peak));
            pool.run(move || {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(20));
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            })
        });
        for result in futures::future::join_all(jobs).await {
            result.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn test_zero_threads_still_runs() {
        assert_eq!(BlockingPool::new(0).permits.available_permits(), 1);
    }
}
