//! # In-Flight Batcher
//!
//! Coalesces concurrent loads of the same ids. A request for N ids issues at
//! most one backing call for the ids nobody is already loading and joins the
//! in-flight loads for the rest, so duplicate concurrent requests cost one
//! system-of-record round trip instead of N.
//!
//! Each backing call runs on its own task: a caller that gives up does not
//! strand the other waiters, and the in-flight entries are cleared when the
//! load settles whether or not anyone is still listening.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::{join_all, BoxFuture, Shared};
use futures_util::FutureExt;

use super::store::StoreError;

pub type Batch<V> = Arc<HashMap<String, Arc<V>>>;
type SharedBatch<V> = Shared<BoxFuture<'static, Result<Batch<V>, StoreError>>>;
type InflightMap<V> = HashMap<String, (u64, SharedBatch<V>)>;

pub struct InflightBatcher<V> {
    name: &'static str,
    inflight: Arc<Mutex<InflightMap<V>>>,
    next_batch: AtomicU64,
    backing_calls: AtomicU64,
    coalesced: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatcherStats {
    pub backing_calls: u64,
    /// Ids served by joining someone else's load.
    pub coalesced: u64,
    pub in_flight: usize,
}

fn lock<V>(map: &Mutex<InflightMap<V>>) -> MutexGuard<'_, InflightMap<V>> {
    map.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<V: Send + Sync + 'static> InflightBatcher<V> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inflight: Arc::new(Mutex::new(HashMap::new())),
            next_batch: AtomicU64::new(1),
            backing_calls: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
        }
    }

    /// # Load Many
    ///
    /// Resolves `ids`, calling `loader` once with the ids that are not already
    /// in flight. `loader` yields `(id, value)` pairs; ids it omits are absent
    /// from the result. Any failed batch this request depends on fails the
    /// whole request with that batch's error.
    pub async fn load_many<F, Fut>(&self, ids: &[String], loader: F) -> Result<HashMap<String, Arc<V>>, StoreError>
    where
        F: FnOnce(Vec<String>) -> Fut,
        Fut: Future<Output = Result<Vec<(String, V)>, StoreError>> + Send + 'static,
    {
        let wanted: Vec<String> = {
            let mut seen = HashSet::new();
            ids.iter().filter(|id| seen.insert(id.as_str())).cloned().collect()
        };
        if wanted.is_empty() {
            return Ok(HashMap::new());
        }

        let mut batches: Vec<SharedBatch<V>> = Vec::new();
        let mut joined: HashSet<u64> = HashSet::new();
        let mut missing: Vec<String> = Vec::new();
        {
            let mut inflight = lock(&self.inflight);
            for id in &wanted {
                match inflight.get(id) {
                    Some((batch_id, batch)) => {
                        self.coalesced.fetch_add(1, Ordering::Relaxed);
                        if joined.insert(*batch_id) {
                            batches.push(batch.clone());
                        }
                    }
                    None => missing.push(id.clone()),
                }
            }
            // Registered before the lock is released so a concurrent caller
            // cannot launch the same ids, and the load task cannot clear its
            // slots before they exist.
            if !missing.is_empty() {
                batches.push(self.launch(&mut inflight, missing, loader));
            }
        }

        let mut merged = HashMap::with_capacity(wanted.len());
        for result in join_all(batches).await {
            let batch = result?;
            for id in &wanted {
                if let Some(value) = batch.get(id) {
                    merged.insert(id.clone(), Arc::clone(value));
                }
            }
        }
        Ok(merged)
    }

    fn launch<F, Fut>(&self, inflight: &mut InflightMap<V>, ids: Vec<String>, loader: F) -> SharedBatch<V>
    where
        F: FnOnce(Vec<String>) -> Fut,
        Fut: Future<Output = Result<Vec<(String, V)>, StoreError>> + Send + 'static,
    {
        let batch_id = self.next_batch.fetch_add(1, Ordering::Relaxed);
        self.backing_calls.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(batcher = self.name, batch_id, ids = ids.len(), "launching backing load");

        let load = loader(ids.clone());
        let slots = Arc::clone(&self.inflight);
        let owned = ids.clone();
        let task = tokio::spawn(async move {
            let result = load.await.map(|pairs| {
                Arc::new(
                    pairs
                        .into_iter()
                        .map(|(id, value)| (id, Arc::new(value)))
                        .collect::<HashMap<_, _>>(),
                )
            });
            let mut map = lock(&slots);
            for id in &owned {
                if map.get(id).is_some_and(|(owner, _)| *owner == batch_id) {
                    map.remove(id);
                }
            }
            result
        });

        let name = self.name;
        let shared = async move {
            match task.await {
                Ok(result) => result,
                Err(error) => Err(StoreError::Backend(format!("{} load aborted: {}", name, error))),
            }
        }
        .boxed()
        .shared();

        for id in ids {
            inflight.insert(id, (batch_id, shared.clone()));
        }
        shared
    }

    pub fn stats(&self) -> BatcherStats {
        BatcherStats {
            backing_calls: self.backing_calls.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            in_flight: lock(&self.inflight).len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    async fn slow_echo(ids: Vec<String>) -> Result<Vec<(String, String)>, StoreError> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(ids.into_iter().map(|id| (id.clone(), id.to_uppercase())).collect())
    }

    #[tokio::test]
    async fn concurrent_identical_loads_share_one_backing_call() {
        let batcher = Arc::new(InflightBatcher::<String>::new("test"));
        let calls = Arc::new(AtomicU64::new(0));

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let batcher = Arc::clone(&batcher);
            let calls = Arc::clone(&calls);
            tasks.push(tokio::spawn(async move {
                batcher
                    .load_many(&ids(&["u1", "u2"]), move |ids| {
                        calls.fetch_add(1, Ordering::SeqCst);
                        slow_echo(ids)
                    })
                    .await
            }));
        }
        for task in tasks {
            let loaded = task.await.unwrap().unwrap();
            assert_eq!(loaded.len(), 2);
            assert_eq!(loaded["u1"].as_str(), "U1");
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(batcher.stats().backing_calls, 1);
        assert_eq!(batcher.stats().in_flight, 0);
    }

    #[tokio::test]
    async fn overlapping_requests_only_load_the_difference() {
        let batcher = Arc::new(InflightBatcher::<String>::new("test"));
        let requested = Arc::new(Mutex::new(Vec::<Vec<String>>::new()));

        let first = {
            let batcher = Arc::clone(&batcher);
            let requested = Arc::clone(&requested);
            tokio::spawn(async move {
                batcher
                    .load_many(&ids(&["a", "b"]), move |ids| {
                        requested.lock().unwrap().push(ids.clone());
                        slow_echo(ids)
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        let requested_second = Arc::clone(&requested);
        let second = batcher
            .load_many(&ids(&["b", "c", "c"]), move |ids| {
                requested_second.lock().unwrap().push(ids.clone());
                slow_echo(ids)
            })
            .await
            .unwrap();

        assert_eq!(second.len(), 2);
        assert_eq!(first.await.unwrap().unwrap().len(), 2);
        let requested = requested.lock().unwrap().clone();
        assert_eq!(requested, vec![ids(&["a", "b"]), ids(&["c"])]);
    }

    #[tokio::test]
    async fn errors_reach_every_waiter_and_clear_the_slot() {
        let batcher = InflightBatcher::<String>::new("test");
        let err = batcher
            .load_many(&ids(&["x"]), |_| async { Err(StoreError::Backend("down".into())) })
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::Backend("down".into()));
        assert_eq!(batcher.stats().in_flight, 0);

        let ok = batcher.load_many(&ids(&["x"]), slow_echo).await.unwrap();
        assert_eq!(ok["x"].as_str(), "X");
        assert_eq!(batcher.stats().backing_calls, 2);
    }
}
