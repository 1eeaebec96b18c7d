use crate::error::EngineResult;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

type Flight<V> = Shared<BoxFuture<'static, EngineResult<V>>>;

/// Registry guaranteeing at most one in-flight computation per key.
///
/// A caller arriving while a computation for the same key is outstanding awaits that
/// computation's result instead of starting another. The entry is dropped as soon as the
/// computation finishes, so later callers start fresh.
pub struct SingleFlight<K, V> {
    inflight: Arc<Mutex<HashMap<K, (u64, Flight<V>)>>>,
    tickets: AtomicU64,
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
            tickets: AtomicU64::new(0),
        }
    }

    /// Run `start()` for `key` unless a run for `key` is already in flight, in which case
    /// the outstanding run's result is returned.
    pub async fn run<F, Fut>(&self, key: K, start: F) -> EngineResult<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = EngineResult<V>> + Send + 'static,
    {
        let flight = {
            let mut inflight = self.inflight.lock();
            match inflight.get(&key) {
                Some((_, flight)) => flight.clone(),
                None => {
                    let ticket = self.tickets.fetch_add(1, Ordering::Relaxed);
                    let registry = Arc::clone(&self.inflight);
                    let owned_key = key.clone();
                    let work = start();
                    let flight = async move {
                        let result = work.await;
                        let mut inflight = registry.lock();
                        if inflight.get(&owned_key).map_or(false, |(t, _)| *t == ticket) {
                            inflight.remove(&owned_key);
                        }
                        result
                    }
                    .boxed()
                    .shared();
                    inflight.insert(key, (ticket, flight.clone()));
                    flight
                }
            }
        };
        flight.await
    }

    pub fn is_in_flight(&self, key: &K) -> bool {
        self.inflight.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inflight.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> Default for SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_runs_share_one_computation() {
        let flights: SingleFlight<String, u32> = SingleFlight::new();
        let started = Arc::new(AtomicUsize::new(0));

        let run = |value: u32| {
            let started = Arc::clone(&started);
            flights.run("concert-1".to_string(), move || async move {
                started.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(value)
            })
        };

        let (a, b) = tokio::join!(run(1), run(2));
        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert_eq!(a.unwrap(), 1);
        assert_eq!(b.unwrap(), 1);
        assert!(flights.is_empty());
    }

    #[tokio::test]
    async fn test_finished_flight_does_not_capture_later_runs() {
        let flights: SingleFlight<String, u32> = SingleFlight::new();

        let first = flights.run("k".to_string(), || async { Ok(1) }).await;
        let second = flights.run("k".to_string(), || async { Ok(2) }).await;
        assert_eq!(first.unwrap(), 1);
        assert_eq!(second.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_errors_are_shared_with_waiters() {
        let flights: SingleFlight<String, u32> = SingleFlight::new();
        let failing = || {
            flights.run("k".to_string(), || async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Err(EngineError::not_found("concerts", "k"))
            })
        };

        let (a, b) = tokio::join!(failing(), failing());
        assert!(a.unwrap_err().is_not_found());
        assert!(b.unwrap_err().is_not_found());
    }
}
