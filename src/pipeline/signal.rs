//! Binary wake-up signal shared by a waiting consumer and a notifying producer

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// A manual-reset event: once set it stays set until `reset` is called.
#[derive(Default)]
pub struct Signal {
    raised: Mutex<bool>,
    cond: Condvar,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        let mut raised = self.raised.lock();
        *raised = true;
        self.cond.notify_all();
    }

    pub fn reset(&self) {
        *self.raised.lock() = false;
    }

    pub fn is_set(&self) -> bool {
        *self.raised.lock()
    }

    /// Block until the signal is set or `timeout` elapses. Returns whether the
    /// signal was observed set. The signal is left as is.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut raised = self.raised.lock();
        match Instant::now().checked_add(timeout) {
            Some(deadline) => {
                while !*raised {
                    if self.cond.wait_until(&mut raised, deadline).timed_out() {
                        break;
                    }
                }
            }
            None => {
                while !*raised {
                    self.cond.wait(&mut raised);
                }
            }
        }
        *raised
    }

    /// Like [`Signal::wait`], but consumes the signal when it was observed
    /// (auto-reset semantics).
    pub fn take(&self, timeout: Duration) -> bool {
        let observed = self.wait(timeout);
        if observed {
            self.reset();
        }
        observed
    }
}
