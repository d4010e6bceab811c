use crate::error::RemoteError;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

const DEFAULT_BUDGET: u64 = 512 * 1024 * 1024;

/// Process-wide bound on the bytes buffered for in-flight retrievals.
///
/// Every read request declares its expected size before it is sent; a
/// request that fits waits its turn, one that can never fit fails with a
/// capacity error. Permits release their share when dropped, i.e. when the
/// consumer has drained (or abandoned) the stream.
pub struct ReadLimiter {
    budget: u64,
    used: Mutex<u64>,
    freed: Notify,
}

impl ReadLimiter {
    pub fn new(budget: u64) -> Arc<Self> {
        Arc::new(Self {
            budget,
            used: Mutex::new(0),
            freed: Notify::new(),
        })
    }

    pub fn with_default_budget() -> Arc<Self> {
        Self::new(DEFAULT_BUDGET)
    }

    pub fn budget(&self) -> u64 {
        self.budget
    }

    pub fn in_use(&self) -> u64 {
        self.used.lock().map(|g| *g).unwrap_or(0)
    }

    /// Waits until `bytes` fit under the budget, then reserves them.
    pub async fn admit(self: &Arc<Self>, bytes: u64) -> Result<ReadPermit, RemoteError> {
        if bytes > self.budget {
            return Err(RemoteError::OverBudget {
                requested: bytes,
                budget: self.budget,
            });
        }
        loop {
            {
                let mut used = self
                    .used
                    .lock()
                    .map_err(|_| RemoteError::Remote("read limiter poisoned".into()))?;
                if *used + bytes <= self.budget {
                    *used += bytes;
                    return Ok(ReadPermit {
                        limiter: self.clone(),
                        bytes,
                    });
                }
            }
            self.freed.notified().await;
        }
    }
}

/// A reservation of read-buffer budget; released on drop.
pub struct ReadPermit {
    limiter: Arc<ReadLimiter>,
    bytes: u64,
}

impl Drop for ReadPermit {
    fn drop(&mut self) {
        if let Ok(mut used) = self.limiter.used.lock() {
            *used = used.saturating_sub(self.bytes);
        }
        self.limiter.freed.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn budget_is_reserved_and_released() {
        let limiter = ReadLimiter::new(100);
        let permit = limiter.admit(60).await.expect("admit");
        assert_eq!(limiter.in_use(), 60);
        drop(permit);
        assert_eq!(limiter.in_use(), 0);
    }

    #[tokio::test]
    async fn oversized_requests_fail_immediately() {
        let limiter = ReadLimiter::new(100);
        assert!(matches!(
            limiter.admit(101).await,
            Err(RemoteError::OverBudget { .. })
        ));
    }

    #[tokio::test]
    async fn requests_beyond_the_budget_wait_for_release() {
        let limiter = ReadLimiter::new(100);
        let first = limiter.admit(80).await.expect("admit");

        let waiting = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.admit(50).await.map(|p| p.bytes) })
        };
        // The second request cannot be admitted yet.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!waiting.is_finished());

        drop(first);
        let admitted = waiting.await.expect("join").expect("admit");
        assert_eq!(admitted, 50);
    }
}
