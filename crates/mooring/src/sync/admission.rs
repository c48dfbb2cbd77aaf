use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::{event, Level};

/// Counting semaphore that throttles how many sessions may be live at once.
///
/// A permit is acquired before each accept operation and travels with the
/// admitted session; dropping the [`AdmissionPermit`] returns it. Closing
/// the gate permanently disables acquisition and wakes every blocked waiter,
/// so an acceptor can shut down even with no connection churn.
pub struct AdmissionGate {
    shared: Arc<GateShared>,
    max: usize,
}

struct GateShared {
    state: Mutex<GateState>,
    freed: Condvar,
}

struct GateState {
    available: usize,
    closed: bool,
}

/// Outcome of [`AdmissionGate::acquire`].
pub enum AcquireOutcome {
    Acquired(AdmissionPermit),
    /// The gate was closed while waiting (or before).
    Closed,
    /// The caller's cancel flag was raised while waiting.
    Cancelled,
    /// The caller's wait budget ran out; only from [`acquire_within`].
    ///
    /// [`acquire_within`]: AdmissionGate::acquire_within
    TimedOut,
}

impl AdmissionGate {
    pub fn new(max: usize) -> Self {
        Self {
            shared: Arc::new(GateShared {
                state: Mutex::new(GateState {
                    available: max,
                    closed: false,
                }),
                freed: Condvar::new(),
            }),
            max,
        }
    }

    /// Blocks until a permit frees up or the gate closes.
    pub fn acquire(&self) -> AcquireOutcome {
        self.acquire_with(&AtomicBool::new(false))
    }

    /// Blocks until a permit frees up, the gate closes, or `cancel` is
    /// observed raised. The flag is only re-checked when the waiters are
    /// woken, so whoever raises it must also call [`interrupt`].
    ///
    /// [`interrupt`]: AdmissionGate::interrupt
    pub fn acquire_with(&self, cancel: &AtomicBool) -> AcquireOutcome {
        self.acquire_inner(cancel, None)
    }

    /// Like [`acquire_with`], giving up with [`AcquireOutcome::TimedOut`]
    /// once `timeout` elapses. Lets a caller that must not hold a worker
    /// thread indefinitely back off and retry.
    ///
    /// [`acquire_with`]: AdmissionGate::acquire_with
    pub fn acquire_within(&self, cancel: &AtomicBool, timeout: Duration) -> AcquireOutcome {
        // An unrepresentable deadline means the timeout can never elapse.
        self.acquire_inner(cancel, Instant::now().checked_add(timeout))
    }

    fn acquire_inner(&self, cancel: &AtomicBool, deadline: Option<Instant>) -> AcquireOutcome {
        let mut state = self.shared.state.lock().expect("admission gate lock poisoned");

        loop {
            if state.closed {
                return AcquireOutcome::Closed;
            }
            if cancel.load(Ordering::Acquire) {
                return AcquireOutcome::Cancelled;
            }
            if state.available > 0 {
                state.available -= 1;
                return AcquireOutcome::Acquired(AdmissionPermit {
                    shared: Arc::clone(&self.shared),
                });
            }

            state = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return AcquireOutcome::TimedOut;
                    }

                    self.shared
                        .freed
                        .wait_timeout(state, deadline - now)
                        .expect("admission gate lock poisoned")
                        .0
                }
                None => self
                    .shared
                    .freed
                    .wait(state)
                    .expect("admission gate lock poisoned"),
            };
        }
    }

    /// Permanently disables acquisition and wakes every blocked waiter with
    /// [`AcquireOutcome::Closed`]. Permits still in flight may be returned
    /// afterwards; they are accepted and discarded with the gate.
    pub fn close(&self) {
        {
            let mut state = self.shared.state.lock().expect("admission gate lock poisoned");
            state.closed = true;
        }
        self.shared.freed.notify_all();

        event!(Level::DEBUG, "admission gate closed");
    }

    /// Wakes every blocked waiter so it re-checks its cancel flag.
    pub fn interrupt(&self) {
        self.shared.freed.notify_all();
    }

    /// Permits currently free. Meaningful only at quiescent points; used by
    /// conservation checks.
    pub fn available(&self) -> usize {
        self.shared
            .state
            .lock()
            .expect("admission gate lock poisoned")
            .available
    }

    pub fn max(&self) -> usize {
        self.max
    }
}

/// A single admission slot. Dropping it returns the slot to the gate; this
/// is the only release path, so whoever holds the permit decides when the
/// session it admitted stops counting against the budget.
pub struct AdmissionPermit {
    shared: Arc<GateShared>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().expect("admission gate lock poisoned");
            state.available += 1;
        }
        self.shared.freed.notify_one();
    }
}
