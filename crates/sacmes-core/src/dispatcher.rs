//! Concurrency-bounded dispatcher
//!
//! A fixed-size admission gate in front of analysis work. Callers wait for
//! a slot, the work runs on its own task holding the slot, and the slot is
//! released when that task ends however it ends (value, error or panic).

use crate::error::DispatchError;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Occupancy of the admission gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LoadMetric {
    /// Slots in use
    pub used: usize,
    /// Gate capacity
    pub total: usize,
}

impl LoadMetric {
    /// `used / total` in `[0, 1]`
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn ratio(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        self.used as f64 / self.total as f64
    }
}

/// Running totals
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    /// Tasks admitted
    pub admitted: u64,
    /// Tasks that returned
    pub completed: u64,
    /// Tasks that panicked
    pub panicked: u64,
    /// Highest number of tasks observed running at once
    pub peak_running: usize,
}

#[derive(Debug, Default)]
struct Counters {
    admitted: AtomicU64,
    completed: AtomicU64,
    panicked: AtomicU64,
    running: AtomicUsize,
    peak_running: AtomicUsize,
}

/// Keeps the running count accurate even when the task unwinds
struct RunningGuard {
    counters: Arc<Counters>,
    _permit: OwnedSemaphorePermit,
}

impl RunningGuard {
    fn enter(counters: Arc<Counters>, permit: OwnedSemaphorePermit) -> Self {
        let now = counters.running.fetch_add(1, Ordering::SeqCst) + 1;
        counters.peak_running.fetch_max(now, Ordering::SeqCst);
        Self {
            counters,
            _permit: permit,
        }
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.counters.running.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Admission-gated task runner
#[derive(Debug, Clone)]
pub struct Dispatcher {
    gate: Arc<Semaphore>,
    capacity: usize,
    counters: Arc<Counters>,
}

impl Dispatcher {
    /// Create dispatcher with `capacity` slots (at least one)
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            gate: Arc::new(Semaphore::new(capacity)),
            capacity,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Gate capacity
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    async fn admit(&self) -> Result<RunningGuard, DispatchError> {
        let permit = Arc::clone(&self.gate)
            .acquire_owned()
            .await
            .map_err(|_| DispatchError::ShutDown)?;
        self.counters.admitted.fetch_add(1, Ordering::Relaxed);
        Ok(RunningGuard::enter(Arc::clone(&self.counters), permit))
    }

    fn finish<T>(&self, joined: Result<T, tokio::task::JoinError>) -> Result<T, DispatchError> {
        match joined {
            Ok(value) => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Err(e) if e.is_panic() => {
                self.counters.panicked.fetch_add(1, Ordering::Relaxed);
                let payload = e.into_panic();
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "panic".to_string());
                tracing::error!("dispatched task panicked: {message}");
                Err(DispatchError::TaskPanicked(message))
            }
            Err(_) => Err(DispatchError::ShutDown),
        }
    }

    /// Run an async task under the gate, waiting for a slot first
    pub async fn submit<F, T>(&self, task: F) -> Result<T, DispatchError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let guard = self.admit().await?;
        let joined = tokio::spawn(async move {
            let _guard = guard;
            task.await
        })
        .await;
        self.finish(joined)
    }

    /// Run CPU-bound work on the blocking pool under the gate
    pub async fn submit_blocking<F, T>(&self, work: F) -> Result<T, DispatchError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let guard = self.admit().await?;
        let joined = tokio::task::spawn_blocking(move || {
            let _guard = guard;
            work()
        })
        .await;
        self.finish(joined)
    }

    /// Current gate occupancy
    #[must_use]
    pub fn load(&self) -> LoadMetric {
        LoadMetric {
            used: self.capacity.saturating_sub(self.gate.available_permits()),
            total: self.capacity,
        }
    }

    /// Snapshot of totals
    #[must_use]
    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            admitted: self.counters.admitted.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            panicked: self.counters.panicked.load(Ordering::Relaxed),
            peak_running: self.counters.peak_running.load(Ordering::SeqCst),
        }
    }

    /// Stop admitting; tasks already running finish normally
    pub fn close(&self) {
        self.gate.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn load_reflects_running_tasks() {
        let dispatcher = Dispatcher::new(4);
        assert_eq!(dispatcher.load().ratio(), 0.0);

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let d = dispatcher.clone();
        let running = tokio::spawn(async move {
            d.submit(async move {
                let _ = rx.await;
            })
            .await
        });

        while dispatcher.load().used == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(dispatcher.load(), LoadMetric { used: 1, total: 4 });
        assert_eq!(dispatcher.load().ratio(), 0.25);

        tx.send(()).unwrap();
        running.await.unwrap().unwrap();
        assert_eq!(dispatcher.load().used, 0);
    }

    #[tokio::test]
    async fn panic_releases_slot() {
        let dispatcher = Dispatcher::new(1);
        let result = dispatcher
            .submit_blocking(|| -> u32 { panic!("bad input") })
            .await;
        assert_eq!(result, Err(DispatchError::TaskPanicked("bad input".into())));
        assert_eq!(dispatcher.load().used, 0);

        // slot is reusable
        assert_eq!(dispatcher.submit(async { 7 }).await, Ok(7));
        let stats = dispatcher.stats();
        assert_eq!(stats.panicked, 1);
        assert_eq!(stats.completed, 1);
    }

    #[tokio::test]
    async fn closed_gate_refuses_new_work() {
        let dispatcher = Dispatcher::new(2);
        dispatcher.close();
        assert_eq!(
            dispatcher.submit(async {}).await,
            Err(DispatchError::ShutDown)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn running_never_exceeds_capacity() {
        let dispatcher = Dispatcher::new(3);
        let mut handles = Vec::new();
        for _ in 0..20 {
            let d = dispatcher.clone();
            handles.push(tokio::spawn(async move {
                d.submit(tokio::time::sleep(Duration::from_millis(5))).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        let stats = dispatcher.stats();
        assert_eq!(stats.admitted, 20);
        assert!(stats.peak_running <= 3, "peak {}", stats.peak_running);
    }
}
