//! A FIFO ticket lock.
//!
//! `std::sync::Mutex` makes no ordering promise, but transaction starts must
//! be served in arrival order. Each acquirer takes a ticket; the lock serves
//! tickets strictly in sequence.

use std::sync::{Condvar, Mutex, MutexGuard};

#[derive(Default)]
struct TicketState {
    next_ticket: u64,
    now_serving: u64,
}

/// Mutual exclusion with FIFO waiter ordering.
#[derive(Default)]
pub struct FairLock {
    state: Mutex<TicketState>,
    cv: Condvar,
}

impl FairLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until this caller's ticket is served. Waiters are released in
    /// arrival order.
    pub fn acquire(&self) -> FairGuard<'_> {
        let mut state = self.lock_state();
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        while state.now_serving != ticket {
            state = self.cv.wait(state).unwrap_or_else(|e| e.into_inner());
        }
        drop(state);
        FairGuard { lock: self }
    }

    fn lock_state(&self) -> MutexGuard<'_, TicketState> {
        // The state is two counters; a poisoned lock cannot leave them
        // inconsistent, so recover.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn release(&self) {
        let mut state = self.lock_state();
        state.now_serving += 1;
        drop(state);
        self.cv.notify_all();
    }
}

impl std::fmt::Debug for FairLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FairLock").finish_non_exhaustive()
    }
}

/// Guard returned by [`FairLock::acquire`]; releases on drop.
pub struct FairGuard<'a> {
    lock: &'a FairLock,
}

impl Drop for FairGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn exclusive_access() {
        let lock = Arc::new(FairLock::new());
        let counter = Arc::new(AtomicU64::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let lock = Arc::clone(&lock);
            let counter = Arc::clone(&counter);
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    let _guard = lock.acquire();
                    let seen = counter.load(Ordering::SeqCst);
                    counter.store(seen + 1, Ordering::SeqCst);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 800);
    }

    #[test]
    fn waiters_served_in_arrival_order() {
        let lock = Arc::new(FairLock::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        // Hold the lock while the waiters queue up.
        let holder = lock.acquire();

        let mut handles = Vec::new();
        for i in 0..4 {
            let lock = Arc::clone(&lock);
            let order = Arc::clone(&order);
            handles.push(thread::spawn(move || {
                let _guard = lock.acquire();
                order.lock().unwrap().push(i);
            }));
            // Give each thread time to take its ticket before the next starts.
            thread::sleep(Duration::from_millis(50));
        }

        drop(holder);
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }
}
