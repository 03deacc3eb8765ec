//! Blocking gate used to park registration attempts during a sweep.

use std::sync::{Condvar, Mutex};

/// A simple open/closed gate.
///
/// Closed while a checkpoint notification sweep is in progress; threads
/// calling [`pass`](BlockingGate::pass) wait until it reopens. The gate is
/// toggled exactly twice per attempt: closed when the checkpoint sweep
/// starts, reopened when the restore sweep starts.
#[derive(Debug, Default)]
pub struct BlockingGate {
    closed: Mutex<bool>,
    reopened: Condvar,
}

impl BlockingGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Close the gate. Subsequent `pass` calls block.
    pub fn close(&self) {
        let mut closed = self.closed.lock().unwrap_or_else(|e| e.into_inner());
        *closed = true;
    }

    /// Reopen the gate and wake every parked thread.
    pub fn open(&self) {
        let mut closed = self.closed.lock().unwrap_or_else(|e| e.into_inner());
        *closed = false;
        self.reopened.notify_all();
    }

    /// Block the calling thread while the gate is closed.
    pub fn pass(&self) {
        let mut closed = self.closed.lock().unwrap_or_else(|e| e.into_inner());
        while *closed {
            tracing::trace!("thread parked on registration gate");
            closed = self
                .reopened
                .wait(closed)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// True when the gate is currently closed.
    pub fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_open_gate_passes_immediately() {
        let gate = BlockingGate::new();
        assert!(!gate.is_closed());
        gate.pass();
    }

    #[test]
    fn test_closed_gate_parks_until_opened() {
        let gate = Arc::new(BlockingGate::new());
        let passed = Arc::new(AtomicBool::new(false));

        gate.close();
        assert!(gate.is_closed());

        let handle = {
            let gate = Arc::clone(&gate);
            let passed = Arc::clone(&passed);
            thread::spawn(move || {
                gate.pass();
                passed.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!passed.load(Ordering::SeqCst), "must park while closed");

        gate.open();
        handle.join().unwrap();
        assert!(passed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_reopen_wakes_all_waiters() {
        let gate = Arc::new(BlockingGate::new());
        gate.close();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let gate = Arc::clone(&gate);
                thread::spawn(move || gate.pass())
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        gate.open();

        for handle in handles {
            handle.join().unwrap();
        }
    }
}
