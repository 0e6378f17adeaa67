//! Condvar-based idle parking
//!
//! Default `Idler` for schedulers without an event loop: workers with no
//! runnable fiber park here until new work is scheduled or the next timer
//! deadline. strand-io swaps in an epoll-backed idler instead.

use crate::scheduler::Idler;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

pub struct ParkIdler {
    /// Wake pending flag, consumed by the next parker.
    pending: Mutex<bool>,
    condvar: Condvar,
    parked: AtomicUsize,
}

impl ParkIdler {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(false),
            condvar: Condvar::new(),
            parked: AtomicUsize::new(0),
        }
    }

    /// Workers currently parked (informational).
    pub fn parked_count(&self) -> usize {
        self.parked.load(Ordering::Relaxed)
    }
}

impl Default for ParkIdler {
    fn default() -> Self {
        Self::new()
    }
}

impl Idler for ParkIdler {
    fn idle(&self, timeout: Option<Duration>) {
        self.parked.fetch_add(1, Ordering::SeqCst);
        let mut pending = self.pending.lock().unwrap();

        if *pending {
            *pending = false;
            self.parked.fetch_sub(1, Ordering::SeqCst);
            return;
        }

        pending = match timeout {
            Some(t) => self.condvar.wait_timeout(pending, t).unwrap().0,
            None => self.condvar.wait(pending).unwrap(),
        };
        if *pending {
            *pending = false;
        }
        self.parked.fetch_sub(1, Ordering::SeqCst);
    }

    fn notify(&self) {
        {
            let mut pending = self.pending.lock().unwrap();
            *pending = true;
        }
        self.condvar.notify_one();
    }
}
