//! Round-robin load balancing with failover — §4.5.
//!
//! Grounded on original_source's `internal/service/roundrobin.go`
//! (`RoundRobinBalancer`): an `RWMutex`-guarded backend list plus an atomic
//! cursor, so `next()` only needs a read lock (cheap, concurrent) while
//! `add`/`remove` take the write lock (rare). The balancer itself carries no
//! retry knowledge — that lives in the proxy pipeline, which caps attempts
//! at `snapshot().len()` backends per request.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::RwLock;

use url::Url;

/// An upstream origin the proxy may forward requests to. Immutable once
/// inserted (§3).
pub type Backend = Url;

/// Ordered backend list with a monotonically incrementing cursor.
pub struct Balancer {
    backends: RwLock<Vec<Backend>>,
    cursor: AtomicU32,
}

impl Balancer {
    pub fn new(backends: Vec<Backend>) -> Self {
        Self { backends: RwLock::new(backends), cursor: AtomicU32::new(0) }
    }

    /// Atomically advance the cursor and return `backends[(cursor-1) % n]`,
    /// or `None` if there are no backends.
    pub fn next(&self) -> Option<Backend> {
        let next = self.cursor.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let backends = self.backends.read().expect("balancer lock poisoned");
        if backends.is_empty() {
            return None;
        }
        let idx = (next - 1) as usize % backends.len();
        Some(backends[idx].clone())
    }

    pub fn add(&self, backend: Backend) {
        self.backends.write().expect("balancer lock poisoned").push(backend);
    }

    /// Remove the first backend equal to `backend`. Returns whether one was found.
    pub fn remove(&self, backend: &Backend) -> bool {
        let mut backends = self.backends.write().expect("balancer lock poisoned");
        if let Some(idx) = backends.iter().position(|b| b == backend) {
            backends.remove(idx);
            true
        } else {
            false
        }
    }

    pub fn snapshot(&self) -> Vec<Backend> {
        self.backends.read().expect("balancer lock poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.backends.read().expect("balancer lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(n: u16) -> Backend {
        Url::parse(&format!("http://127.0.0.1:{n}")).unwrap()
    }

    #[test]
    fn empty_balancer_returns_none() {
        let balancer = Balancer::new(vec![]);
        assert!(balancer.next().is_none());
    }

    #[test]
    fn single_backend_is_returned_every_time() {
        let balancer = Balancer::new(vec![backend(1)]);
        for _ in 0..5 {
            assert_eq!(balancer.next(), Some(backend(1)));
        }
    }

    #[test]
    fn cycles_through_backends_in_order() {
        let balancer = Balancer::new(vec![backend(1), backend(2), backend(3)]);
        let seen: Vec<_> = (0..6).map(|_| balancer.next().unwrap()).collect();
        assert_eq!(
            seen,
            vec![backend(1), backend(2), backend(3), backend(1), backend(2), backend(3)]
        );
    }

    #[test]
    fn add_extends_the_rotation() {
        let balancer = Balancer::new(vec![backend(1)]);
        balancer.next();
        balancer.add(backend(2));
        assert_eq!(balancer.snapshot(), vec![backend(1), backend(2)]);
    }

    #[test]
    fn remove_reports_whether_backend_was_present() {
        let balancer = Balancer::new(vec![backend(1), backend(2)]);
        assert!(balancer.remove(&backend(1)));
        assert!(!balancer.remove(&backend(1)));
        assert_eq!(balancer.snapshot(), vec![backend(2)]);
    }

    #[test]
    fn fairness_over_a_long_run_is_uniform_across_backends() {
        let n = 4;
        let balancer = Balancer::new((0..n).map(|i| backend(9000 + i)).collect());
        let mut counts = vec![0u32; n as usize];
        for _ in 0..4000 {
            let picked = balancer.next().unwrap();
            let idx = (0..n).position(|i| backend(9000 + i) == picked).unwrap();
            counts[idx] += 1;
        }
        for count in counts {
            assert_eq!(count, 1000, "expected perfectly uniform distribution for single-threaded RR");
        }
    }

    #[test]
    fn concurrent_next_calls_never_exceed_one_pass_worth_of_any_backend() {
        use std::sync::Arc;
        use std::thread;

        let balancer = Arc::new(Balancer::new(vec![backend(1), backend(2)]));
        let handles: Vec<_> = (0..100)
            .map(|_| {
                let balancer = Arc::clone(&balancer);
                thread::spawn(move || balancer.next())
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.len(), 100);
        assert!(results.iter().all(|r| r.is_some()), "balancer must never return None with backends present");
    }
}
