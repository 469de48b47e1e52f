//! # Single-Flight Deduplication
//!
//! Collapses concurrent cache misses for the same key into one downstream call. The first
//! caller for a key becomes the leader and does the work; callers arriving while it runs
//! become followers and receive a clone of the leader's result.
//!
//! If the leader fails (or is dropped), the in-flight entry is removed without a value and each
//! follower falls back to doing the work itself. Errors are never shared between callers.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;

type Waiters<T> = Arc<Mutex<HashMap<String, Vec<oneshot::Sender<T>>>>>;

/// Registry of in-flight computations keyed by cache key
pub struct InFlightRegistry<T> {
    in_flight: Waiters<T>,
}

impl<T> Default for InFlightRegistry<T> {
    fn default() -> Self {
        Self {
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

/// Role of a caller joining a key
pub enum Flight<T> {
    /// The caller must do the work and complete the guard
    Leader(FlightGuard<T>),

    /// The caller waits for the leader's value
    Follower(oneshot::Receiver<T>),
}

/// Held by the leader until the work completes
pub struct FlightGuard<T> {
    key: String,
    in_flight: Waiters<T>,
    completed: bool,
}

impl<T: Clone> FlightGuard<T> {
    /// Publish the value to every follower and release the key
    pub fn complete(mut self, value: T) {
        self.completed = true;
        let waiters = self.in_flight.lock().remove(&self.key).unwrap_or_default();
        if !waiters.is_empty() {
            debug!(
                "Single-flight for key {} shared with {} waiters",
                self.key,
                waiters.len()
            );
        }
        for waiter in waiters {
            let _ = waiter.send(value.clone());
        }
    }
}

impl<T> Drop for FlightGuard<T> {
    fn drop(&mut self) {
        // dropping the senders wakes followers with an error
        if !self.completed {
            self.in_flight.lock().remove(&self.key);
        }
    }
}

impl<T: Clone + Send> InFlightRegistry<T> {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the flight for a key
    pub fn join(&self, key: &str) -> Flight<T> {
        let mut in_flight = self.in_flight.lock();
        match in_flight.get_mut(key) {
            Some(waiters) => {
                let (tx, rx) = oneshot::channel();
                waiters.push(tx);
                Flight::Follower(rx)
            }
            None => {
                in_flight.insert(key.to_string(), Vec::new());
                Flight::Leader(FlightGuard {
                    key: key.to_string(),
                    in_flight: self.in_flight.clone(),
                    completed: false,
                })
            }
        }
    }

    /// Run `work` for the key unless another caller is already running it.
    ///
    /// Returns the value and whether it was shared from another caller.
    pub async fn execute<F, Fut, E>(&self, key: &str, work: F) -> Result<(T, bool), E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match self.join(key) {
            Flight::Leader(guard) => {
                let value = work().await?;
                guard.complete(value.clone());
                Ok((value, false))
            }
            Flight::Follower(rx) => match rx.await {
                Ok(value) => Ok((value, true)),
                Err(_) => {
                    debug!("Single-flight leader for key {} failed, retrying", key);
                    work().await.map(|value| (value, false))
                }
            },
        }
    }

    /// Number of keys currently in flight
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_calls_share_one_execution() {
        let registry = Arc::new(InFlightRegistry::<u32>::new());
        let executions = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let registry = registry.clone();
            let executions = executions.clone();
            handles.push(tokio::spawn(async move {
                registry
                    .execute("orders", move || async move {
                        executions.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok::<_, String>(42)
                    })
                    .await
            }));
        }

        let results = futures::future::join_all(handles).await;
        for result in results {
            assert_eq!(result.unwrap().unwrap().0, 42);
        }
        assert_eq!(executions.load(Ordering::SeqCst), 1);
        assert_eq!(registry.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_followers_retry_after_leader_failure() {
        let registry = InFlightRegistry::<u32>::new();

        let leader = match registry.join("k") {
            Flight::Leader(guard) => guard,
            Flight::Follower(_) => panic!("first caller must lead"),
        };
        let follower = match registry.join("k") {
            Flight::Follower(rx) => rx,
            Flight::Leader(_) => panic!("second caller must follow"),
        };

        drop(leader);
        assert!(follower.await.is_err());
        assert_eq!(registry.in_flight_count(), 0);

        let (value, shared) = registry
            .execute("k", || async { Ok::<_, String>(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert!(!shared);
    }

    #[tokio::test]
    async fn test_errors_are_not_shared() {
        let registry = InFlightRegistry::<u32>::new();
        let result = registry
            .execute("k", || async { Err::<u32, _>("boom".to_string()) })
            .await;
        assert!(result.is_err());
        assert_eq!(registry.in_flight_count(), 0);
    }
}
