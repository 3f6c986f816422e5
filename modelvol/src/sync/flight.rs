//! Single-flight rendezvous for keyed operations.
//!
//! When multiple callers request the same operation concurrently, only the
//! first actually runs it; the others wait and receive the same outcome.
//! Uses `DashMap` for the in-flight table and a broadcast channel per key
//! to fan the result out to every waiter.

use std::future::Future;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{Error, Result};

/// In-flight table keyed by operation key.
#[derive(Default)]
pub struct FlightGroup {
    in_flight: DashMap<String, broadcast::Sender<Result<()>>>,
}

enum Entry {
    Leader(broadcast::Sender<Result<()>>),
    Follower(broadcast::Receiver<Result<()>>),
}

/// Removes the in-flight entry if the leader is dropped before
/// completing, so followers fail instead of hanging.
struct LeaderGuard<'a> {
    group: &'a FlightGroup,
    key: &'a str,
    done: bool,
}

impl Drop for LeaderGuard<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.group.in_flight.remove(self.key);
        }
    }
}

impl FlightGroup {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, key: &str) -> Entry {
        match self.in_flight.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => {
                debug!(key, "joining in-flight operation");
                Entry::Follower(entry.get().subscribe())
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let (tx, _rx) = broadcast::channel(1);
                entry.insert(tx.clone());
                Entry::Leader(tx)
            }
        }
    }

    /// Run `work` under `key`, coalescing concurrent callers.
    ///
    /// Returns the operation outcome and whether this caller shared another
    /// caller's execution instead of running its own.
    pub async fn run<F>(&self, key: &str, work: F) -> (Result<()>, bool)
    where
        F: Future<Output = Result<()>>,
    {
        match self.register(key) {
            Entry::Leader(tx) => {
                let mut guard = LeaderGuard {
                    group: self,
                    key,
                    done: false,
                };
                let result = work.await;
                self.in_flight.remove(key);
                guard.done = true;
                let _ = tx.send(result.clone());
                (result, false)
            }
            Entry::Follower(mut rx) => match rx.recv().await {
                Ok(result) => (result, true),
                // The leader was dropped before broadcasting.
                Err(_) => (
                    Err(Error::Canceled(format!(
                        "in-flight operation abandoned: {key}"
                    ))),
                    true,
                ),
            },
        }
    }

    #[cfg(test)]
    fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_execution() {
        let group = Arc::new(FlightGroup::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let group = group.clone();
                let runs = runs.clone();
                tokio::spawn(async move {
                    group
                        .run("key", async {
                            runs.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok(())
                        })
                        .await
                })
            })
            .collect();

        let mut shared_count = 0;
        for task in tasks {
            let (result, shared) = task.await.unwrap();
            assert!(result.is_ok());
            if shared {
                shared_count += 1;
            }
        }

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(shared_count, 9);
        assert_eq!(group.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_error_reaches_every_waiter() {
        let group = Arc::new(FlightGroup::new());

        let leader = {
            let group = group.clone();
            tokio::spawn(async move {
                group
                    .run("key", async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Err(Error::Internal("boom".into()))
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let follower = {
            let group = group.clone();
            tokio::spawn(async move { group.run("key", async { Ok(()) }).await })
        };

        let (leader_result, _) = leader.await.unwrap();
        let (follower_result, shared) = follower.await.unwrap();
        assert!(leader_result.is_err());
        assert!(shared);
        assert_eq!(
            follower_result.unwrap_err().to_string(),
            leader_result.unwrap_err().to_string()
        );
    }

    #[tokio::test]
    async fn test_sequential_runs_do_not_coalesce() {
        let group = FlightGroup::new();
        let runs = AtomicUsize::new(0);

        for _ in 0..3 {
            let (result, shared) = group
                .run("key", async {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await;
            assert!(result.is_ok());
            assert!(!shared);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_different_keys_run_independently() {
        let group = Arc::new(FlightGroup::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..4)
            .map(|i| {
                let group = group.clone();
                let runs = runs.clone();
                tokio::spawn(async move {
                    group
                        .run(&format!("key-{i}"), async {
                            runs.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok(())
                        })
                        .await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().0.unwrap();
        }
        assert_eq!(runs.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_abandoned_leader_fails_followers() {
        let group = Arc::new(FlightGroup::new());

        let leader = {
            let group = group.clone();
            tokio::spawn(async move {
                group
                    .run("key", async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        Ok(())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let follower = {
            let group = group.clone();
            tokio::spawn(async move {
                group
                    .run("key", async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        Ok(())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        leader.abort();
        let _ = leader.await;

        let (result, shared) = follower.await.unwrap();
        assert!(shared);
        assert!(result.unwrap_err().is_canceled());
        assert_eq!(group.in_flight_count(), 0);
    }
}
