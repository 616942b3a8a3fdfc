//! Bounded-parallelism gates for outbound backend calls.
//!
//! One gate per call category (research, CRM dispatch), constructed once at
//! startup and shared by every call of that category. Acquisition suspends
//! the caller until a slot frees.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// A fixed-width gate over concurrent outbound calls.
#[derive(Clone)]
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    limit: usize,
}

impl ConcurrencyGate {
    /// Create a gate admitting at most `limit` concurrent holders.
    ///
    /// A zero limit is a configuration error and fails construction.
    pub fn new(limit: usize) -> Result<Self> {
        if limit == 0 {
            anyhow::bail!("concurrency limit must be at least 1");
        }

        Ok(Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
        })
    }

    /// Wait for a slot. The permit releases the slot on drop.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .context("concurrency gate closed")
    }

    /// Configured width of the gate.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Slots currently free (for tests and status output).
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_limit_rejected() {
        assert!(ConcurrencyGate::new(0).is_err());
    }

    #[tokio::test]
    async fn test_permits_release_on_drop() {
        let gate = ConcurrencyGate::new(2).unwrap();

        let p1 = gate.acquire().await.unwrap();
        let _p2 = gate.acquire().await.unwrap();
        assert_eq!(gate.available(), 0);

        drop(p1);
        assert_eq!(gate.available(), 1);
    }

    #[tokio::test]
    async fn test_acquire_blocks_until_slot_frees() {
        let gate = ConcurrencyGate::new(1).unwrap();

        let permit = gate.acquire().await.unwrap();

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move {
                let _p = gate.acquire().await.unwrap();
            })
        };

        // The waiter cannot finish while the permit is held
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(permit);
        waiter.await.unwrap();
    }
}
