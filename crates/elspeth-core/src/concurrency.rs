//! Counting semaphore: bounds external-call concurrency across
//! rows, shared by every worker in the orchestrator's `WorkPool`. Built
//! from `std::sync::{Mutex, Condvar}` rather than pulled in as a crate —
//! the same call this repo's `rows_in_flight` backpressure gate makes.

use std::sync::{Condvar, Mutex};

struct State {
    available: usize,
}

/// A counting semaphore. `acquire` blocks until a permit is free;
/// the returned `SemaphorePermit` releases it on drop.
pub struct Semaphore {
    state: Mutex<State>,
    freed: Condvar,
}

impl Semaphore {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(State { available: capacity }),
            freed: Condvar::new(),
        }
    }

    /// Blocks until a permit is available, then holds it until the
    /// returned guard drops.
    pub fn acquire(&self) -> SemaphorePermit<'_> {
        let mut state = self.state.lock().expect("semaphore lock poisoned");
        while state.available == 0 {
            state = self.freed.wait(state).expect("semaphore lock poisoned");
        }
        state.available -= 1;
        SemaphorePermit { sem: self }
    }

    fn release(&self) {
        let mut state = self.state.lock().expect("semaphore lock poisoned");
        state.available += 1;
        self.freed.notify_one();
    }
}

pub struct SemaphorePermit<'a> {
    sem: &'a Semaphore,
}

impl Drop for SemaphorePermit<'_> {
    fn drop(&mut self) {
        self.sem.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn acquire_blocks_until_a_permit_is_released() {
        let sem = Arc::new(Semaphore::new(1));
        let first = sem.acquire();
        let sem2 = Arc::clone(&sem);
        let handle = thread::spawn(move || {
            let _permit = sem2.acquire();
        });
        thread::sleep(Duration::from_millis(20));
        assert!(!handle.is_finished(), "second acquire should still be blocked");
        drop(first);
        handle.join().unwrap();
    }
}
