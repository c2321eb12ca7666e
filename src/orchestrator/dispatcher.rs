//! Bounded-parallelism runner for independent async operations.
//!
//! A fixed pool of `limit` workers pulls the next index from a shared atomic
//! cursor, so a slow item never holds back a whole batch. Workers are polled
//! together with `join_all` on the caller's task; nothing is spawned, which
//! lets operations borrow from the caller.

use anyhow::{Result, anyhow};
use futures::FutureExt;
use futures::future::join_all;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::orchestrator::MAX_PARALLEL_ANALYZERS;

#[derive(Debug, Clone, Copy)]
pub struct ConcurrencyLimitedDispatcher {
    limit: usize,
}

impl Default for ConcurrencyLimitedDispatcher {
    fn default() -> Self {
        Self::new(MAX_PARALLEL_ANALYZERS)
    }
}

impl ConcurrencyLimitedDispatcher {
    /// A limit of zero is treated as one.
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Run `op` over every item with at most `limit` in flight.
    ///
    /// The returned vector is in input order. Each slot holds that item's own
    /// outcome: an error or panic in one operation is reported in its slot
    /// and never stops the others. `on_start` is called as a worker picks up
    /// an item, before `op` is polled.
    pub async fn run<T, R, F, Fut, S>(&self, items: &[T], op: F, on_start: S) -> Vec<Result<R>>
    where
        F: Fn(&T, usize) -> Fut,
        Fut: Future<Output = Result<R>>,
        S: Fn(&T, usize),
    {
        if items.is_empty() {
            return Vec::new();
        }

        let cursor = AtomicUsize::new(0);
        let (cursor, op, on_start) = (&cursor, &op, &on_start);

        let workers = (0..self.limit.min(items.len())).map(move |_| async move {
            let mut finished = Vec::new();
            loop {
                let index = cursor.fetch_add(1, Ordering::SeqCst);
                let Some(item) = items.get(index) else {
                    break;
                };
                on_start(item, index);
                let outcome = AssertUnwindSafe(async { op(item, index).await })
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|payload| {
                        Err(anyhow!("Task {} panicked: {}", index, panic_message(&payload)))
                    });
                finished.push((index, outcome));
            }
            finished
        });

        let mut slots: Vec<Option<Result<R>>> = items.iter().map(|_| None).collect();
        for (index, outcome) in join_all(workers).await.into_iter().flatten() {
            slots[index] = Some(outcome);
        }
        slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| slot.unwrap_or_else(|| Err(anyhow!("Task {} was never run", index))))
            .collect()
    }
}

fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    #[tokio::test]
    async fn test_in_flight_never_exceeds_limit_and_order_is_kept() {
        let dispatcher = ConcurrencyLimitedDispatcher::new(2);
        let durations = [50u64, 10, 40, 5, 20];
        let in_flight = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);

        let results = dispatcher
            .run(
                &durations,
                |ms, index| {
                    let (in_flight, peak) = (&in_flight, &peak);
                    let ms = *ms;
                    async move {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(ms)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        Ok(index * 10)
                    }
                },
                |_, _| {},
            )
            .await;

        let values: Vec<usize> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(values, vec![0, 10, 20, 30, 40]);
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_pool_pulls_instead_of_batching() {
        // In chunks of two, item 2 could not finish before the slow item 0.
        let dispatcher = ConcurrencyLimitedDispatcher::new(2);
        let durations = [80u64, 5, 5];
        let started = Mutex::new(Vec::new());
        let finished = Mutex::new(Vec::new());

        dispatcher
            .run(
                &durations,
                |ms, index| {
                    let (ms, finished) = (*ms, &finished);
                    async move {
                        tokio::time::sleep(Duration::from_millis(ms)).await;
                        finished.lock().unwrap().push(index);
                        Ok(())
                    }
                },
                |_, index| started.lock().unwrap().push(index),
            )
            .await;

        assert_eq!(*started.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(*finished.lock().unwrap(), vec![1, 2, 0]);
    }

    #[tokio::test]
    async fn test_failure_is_reported_per_item() {
        let dispatcher = ConcurrencyLimitedDispatcher::new(3);
        let items = ["ok", "bad", "ok"];
        let results = dispatcher
            .run(
                &items,
                |item, _| {
                    let item = *item;
                    async move {
                        if item == "bad" {
                            Err(anyhow!("analysis failed"))
                        } else {
                            Ok(item.len())
                        }
                    }
                },
                |_, _| {},
            )
            .await;

        assert_eq!(results.len(), 3);
        assert_eq!(*results[0].as_ref().unwrap(), 2);
        assert!(results[1].as_ref().unwrap_err().to_string().contains("analysis failed"));
        assert_eq!(*results[2].as_ref().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_panic_becomes_error() {
        let dispatcher = ConcurrencyLimitedDispatcher::new(2);
        let items = [1, 2, 3];
        let results = dispatcher
            .run(
                &items,
                |n, _| {
                    let n = *n;
                    async move {
                        if n == 2 {
                            panic!("boom");
                        }
                        Ok(n)
                    }
                },
                |_, _| {},
            )
            .await;

        assert_eq!(*results[0].as_ref().unwrap(), 1);
        assert!(results[1].as_ref().unwrap_err().to_string().contains("boom"));
        assert_eq!(*results[2].as_ref().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_empty_input_and_zero_limit() {
        let dispatcher = ConcurrencyLimitedDispatcher::new(0);
        assert_eq!(dispatcher.limit(), 1);
        let items: [u8; 0] = [];
        let results = dispatcher
            .run(
                &items,
                |n, _| {
                    let n = *n;
                    async move { Ok(n) }
                },
                |_, _| {},
            )
            .await;
        assert!(results.is_empty());
    }
}
