//! Process-wide limit on concurrent remote submissions.

use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{info, warn};

use crate::error::{PipelineError, PipelineResult};

/// Successful submissions needed to regain one permit.
pub const DEFAULT_REGAIN_AFTER: u32 = 8;

#[derive(Debug)]
struct Capacity {
    current: usize,
    streak: u32,
}

#[derive(Debug)]
pub struct SubmissionThrottle {
    semaphore: Arc<Semaphore>,
    capacity: Mutex<Capacity>,
    ceiling: usize,
    regain_after: u32,
}

impl SubmissionThrottle {
    pub fn new(max_concurrent: usize) -> Self {
        let ceiling = max_concurrent.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(ceiling)),
            capacity: Mutex::new(Capacity {
                current: ceiling,
                streak: 0,
            }),
            ceiling,
            regain_after: DEFAULT_REGAIN_AFTER,
        }
    }

    pub fn with_regain_after(mut self, successes: u32) -> Self {
        self.regain_after = successes.max(1);
        self
    }

    pub async fn acquire(&self) -> PipelineResult<OwnedSemaphorePermit> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PipelineError::Cancelled)
    }

    pub fn record_success(&self, permit: OwnedSemaphorePermit) {
        drop(permit);
        let Ok(mut cap) = self.capacity.lock() else {
            return;
        };
        cap.streak += 1;
        if cap.streak >= self.regain_after && cap.current < self.ceiling {
            cap.current += 1;
            cap.streak = 0;
            self.semaphore.add_permits(1);
            info!(permits = cap.current, "Submission concurrency restored");
        }
    }

    pub fn record_quota(&self, permit: OwnedSemaphorePermit) {
        let Ok(mut cap) = self.capacity.lock() else {
            return;
        };
        cap.streak = 0;
        if cap.current > 1 {
            cap.current -= 1;
            permit.forget();
            warn!(permits = cap.current, "Quota exceeded, reducing submission concurrency");
        } else {
            warn!("Quota exceeded at minimum submission concurrency");
        }
    }

    /// Permits currently in circulation.
    pub fn capacity(&self) -> usize {
        self.capacity.lock().map(|c| c.current).unwrap_or(1)
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_quota_shrinks_but_never_below_one() {
        let throttle = SubmissionThrottle::new(3);
        for expected in [2, 1, 1] {
            let permit = throttle.acquire().await.unwrap();
            throttle.record_quota(permit);
            assert_eq!(throttle.capacity(), expected);
            assert_eq!(throttle.available(), expected);
        }
    }

    #[tokio::test]
    async fn test_successes_regain_permit_up_to_ceiling() {
        let throttle = SubmissionThrottle::new(2).with_regain_after(2);
        let permit = throttle.acquire().await.unwrap();
        throttle.record_quota(permit);
        assert_eq!(throttle.capacity(), 1);

        for _ in 0..2 {
            let permit = throttle.acquire().await.unwrap();
            throttle.record_success(permit);
        }
        assert_eq!(throttle.capacity(), 2);
        assert_eq!(throttle.available(), 2);

        for _ in 0..4 {
            let permit = throttle.acquire().await.unwrap();
            throttle.record_success(permit);
        }
        assert_eq!(throttle.capacity(), 2);
    }

    #[tokio::test]
    async fn test_limits_concurrent_holders() {
        let throttle = Arc::new(SubmissionThrottle::new(1));
        let held = throttle.acquire().await.unwrap();

        let waiter = {
            let throttle = throttle.clone();
            tokio::spawn(async move {
                let permit = throttle.acquire().await.unwrap();
                throttle.record_success(permit);
            })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        throttle.record_success(held);
        waiter.await.unwrap();
    }
}
