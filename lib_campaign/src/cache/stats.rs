//! # Query Statistics
//!
//! Per-operation counters for the resolver: calls, errors and the average of
//! the most recent durations. Operations slower than the configured threshold
//! are logged as slow queries.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

const WINDOW: usize = 100;

#[derive(Default)]
struct OperationStats {
    count: u64,
    errors: u64,
    recent: VecDeque<Duration>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationSnapshot {
    pub count: u64,
    pub errors: u64,
    pub average_ms: f64,
}

pub struct QueryStats {
    slow_threshold: Duration,
    operations: Mutex<HashMap<&'static str, OperationStats>>,
}

impl QueryStats {
    pub fn new(slow_threshold: Duration) -> Self {
        Self {
            slow_threshold,
            operations: Mutex::new(HashMap::new()),
        }
    }

    pub fn record(&self, operation: &'static str, duration: Duration, failed: bool) {
        {
            let mut operations = self.operations.lock().unwrap_or_else(PoisonError::into_inner);
            let stats = operations.entry(operation).or_default();
            if failed {
                stats.errors += 1;
            } else {
                stats.count += 1;
                if stats.recent.len() == WINDOW {
                    stats.recent.pop_front();
                }
                stats.recent.push_back(duration);
            }
        }

        if duration > self.slow_threshold {
            tracing::warn!(
                operation,
                duration_ms = duration.as_millis() as u64,
                "slow query detected"
            );
        }
    }

    /// Awaits `operation_future`, recording its duration and outcome.
    pub async fn track<T, E, F>(&self, operation: &'static str, operation_future: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
    {
        let started = Instant::now();
        let result = operation_future.await;
        self.record(operation, started.elapsed(), result.is_err());
        result
    }

    pub fn snapshot(&self) -> BTreeMap<String, OperationSnapshot> {
        let operations = self.operations.lock().unwrap_or_else(PoisonError::into_inner);
        operations
            .iter()
            .map(|(name, stats)| {
                let average_ms = if stats.recent.is_empty() {
                    0.0
                } else {
                    let total: Duration = stats.recent.iter().sum();
                    total.as_secs_f64() * 1000.0 / stats.recent.len() as f64
                };
                (
                    name.to_string(),
                    OperationSnapshot {
                        count: stats.count,
                        errors: stats.errors,
                        average_ms,
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn average_covers_only_the_recent_window() {
        let stats = QueryStats::new(Duration::from_secs(10));
        for _ in 0..WINDOW {
            stats.record("board_assets", Duration::from_millis(100), false);
        }
        for _ in 0..WINDOW {
            stats.record("board_assets", Duration::from_millis(10), false);
        }
        stats.record("board_assets", Duration::from_millis(1), true);

        let snapshot = stats.snapshot()["board_assets"];
        assert_eq!(snapshot.count, 200);
        assert_eq!(snapshot.errors, 1);
        assert!((snapshot.average_ms - 10.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn track_records_outcome() {
        let stats = QueryStats::new(Duration::from_millis(100));
        let ok: Result<u8, String> = stats.track("user_load", async { Ok(1) }).await;
        let err: Result<u8, String> = stats.track("user_load", async { Err("boom".to_string()) }).await;
        assert!(ok.is_ok() && err.is_err());

        let snapshot = stats.snapshot()["user_load"];
        assert_eq!(snapshot.count, 1);
        assert_eq!(snapshot.errors, 1);
    }
}
