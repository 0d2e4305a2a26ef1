//! Minimal async mutual exclusion over a piece of shared state.
//!
//! Callers submit closures; the gate guarantees at most one closure runs at
//! a time and that waiters acquire in FIFO submission order (tokio's mutex
//! is fair). A closure that returns an error — or panics — releases the
//! gate; the failure propagates to that caller only and queued callers
//! proceed normally.
//!
//! Caller contract: do not call `run` on a gate from within a closure
//! already running on that same gate. There is no reentrancy support and
//! the violation is not detected.

use std::sync::Arc;
use tokio::sync::Mutex;

/// FIFO-serialized access to `T`.
#[derive(Debug)]
pub struct SerialGate<T> {
    inner: Arc<Mutex<T>>,
}

impl<T> Clone for SerialGate<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> SerialGate<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(Mutex::new(value)),
        }
    }

    /// Run `f` with exclusive access to the guarded state.
    ///
    /// The closure must be synchronous: suspension points (probes, network
    /// pushes) belong outside the gate so no caller holds it across IO.
    pub async fn run<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.inner.lock().await;
        f(&mut guard)
    }
}

// ─── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{Duration, sleep};

    #[tokio::test]
    async fn serializes_concurrent_mutations() {
        let gate = SerialGate::new(0u64);
        let mut handles = Vec::new();
        for _ in 0..50 {
            let gate = gate.clone();
            handles.push(tokio::spawn(async move {
                gate.run(|count| *count += 1).await;
            }));
        }
        for handle in handles {
            handle.await.expect("task");
        }
        assert_eq!(gate.run(|count| *count).await, 50);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn fifo_submission_order() {
        let gate = SerialGate::new(Vec::<usize>::new());
        let started = Arc::new(AtomicUsize::new(0));

        // Hold the gate while the queue builds up so acquisition order is
        // decided purely by submission order.
        let holder = {
            let gate = gate.clone();
            tokio::spawn(async move {
                gate.run(|_| std::thread::sleep(std::time::Duration::from_millis(50)))
                    .await;
            })
        };
        sleep(Duration::from_millis(10)).await;

        let mut handles = Vec::new();
        for i in 0..5 {
            let gate = gate.clone();
            let started = Arc::clone(&started);
            handles.push(tokio::spawn(async move {
                started.fetch_add(1, Ordering::SeqCst);
                gate.run(move |order| order.push(i)).await;
            }));
            // Ensure task i enqueues before task i+1 is spawned.
            sleep(Duration::from_millis(5)).await;
        }

        holder.await.expect("holder");
        for handle in handles {
            handle.await.expect("task");
        }

        let order = gate.run(|order| order.clone()).await;
        assert_eq!(order, vec![0, 1, 2, 3, 4], "waiters acquire in FIFO order");
    }

    #[tokio::test]
    async fn error_releases_gate_for_queued_callers() {
        let gate = SerialGate::new(0u64);

        let result: Result<(), &str> = gate.run(|_| Err("boom")).await;
        assert_eq!(result, Err("boom"));

        // The failing closure must not deadlock later callers.
        gate.run(|count| *count += 1).await;
        assert_eq!(gate.run(|count| *count).await, 1);
    }

    #[tokio::test]
    async fn panic_in_closure_does_not_poison() {
        let gate = SerialGate::new(0u64);
        let panicking = {
            let gate = gate.clone();
            tokio::spawn(async move {
                let _: () = gate.run(|_| panic!("intentional")).await;
            })
        };
        assert!(panicking.await.is_err(), "panic surfaces to that caller");

        // tokio's mutex is not poisoned by a panicking holder.
        gate.run(|count| *count += 1).await;
        assert_eq!(gate.run(|count| *count).await, 1);
    }
}
