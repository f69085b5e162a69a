//! Connection permit serializing physical engine access.

use parking_lot::{Condvar, Mutex, MutexGuard};

/// Mutual-exclusion permit around the physical engine, with a drain mode.
///
/// Every backend operation goes through [`ConnectionGate::acquire`].
/// Shutdown goes through [`ConnectionGate::drain`], which acquires the
/// permit only once no caller is queued for it, so in-flight operations
/// complete before the engine is torn down.
#[derive(Debug)]
pub(crate) struct ConnectionGate<E> {
    engine: Mutex<E>,
    /// Callers between deciding to acquire and holding the permit.
    queued: Mutex<usize>,
    idle: Condvar,
}

impl<E> ConnectionGate<E> {
    pub(crate) fn new(engine: E) -> Self {
        Self {
            engine: Mutex::new(engine),
            queued: Mutex::new(0),
            idle: Condvar::new(),
        }
    }

    /// Acquires the permit, waiting for the current holder if necessary.
    pub(crate) fn acquire(&self) -> MutexGuard<'_, E> {
        {
            *self.queued.lock() += 1;
        }
        let guard = self.engine.lock();
        {
            let mut queued = self.queued.lock();
            *queued -= 1;
            if *queued == 0 {
                self.idle.notify_all();
            }
        }
        guard
    }

    /// Acquires the permit once no other caller is queued for it.
    pub(crate) fn drain(&self) -> MutexGuard<'_, E> {
        loop {
            let guard = self.engine.lock();
            let mut queued = self.queued.lock();
            if *queued == 0 {
                return guard;
            }
            // Let the queued callers in, then wait until the queue empties.
            drop(guard);
            while *queued > 0 {
                self.idle.wait(&mut queued);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn acquire_serializes_access() {
        let gate = Arc::new(ConnectionGate::new(0u64));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let gate = Arc::clone(&gate);
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    let mut engine = gate.acquire();
                    *engine += 1;
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*gate.acquire(), 800);
    }

    #[test]
    fn drain_waits_for_queued_callers() {
        let gate = Arc::new(ConnectionGate::new(0u64));
        let completed = Arc::new(AtomicUsize::new(0));

        // Hold the permit so the workers pile up in the queue.
        let held = gate.acquire();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let gate = Arc::clone(&gate);
            let completed = Arc::clone(&completed);
            handles.push(thread::spawn(move || {
                let mut engine = gate.acquire();
                *engine += 1;
                completed.fetch_add(1, Ordering::SeqCst);
            }));
        }

        // Give the workers time to enqueue behind the held permit.
        thread::sleep(Duration::from_millis(50));
        drop(held);

        let engine = gate.drain();
        // Drain only admits us after every queued worker ran.
        assert_eq!(completed.load(Ordering::SeqCst), 4);
        assert_eq!(*engine, 4);
        drop(engine);

        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn drain_on_idle_gate_returns_immediately() {
        let gate = ConnectionGate::new(42u64);
        assert_eq!(*gate.drain(), 42);
    }
}
