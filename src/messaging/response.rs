//! Single-assignment response futures.
//!
//! A [`ResponseFuture`] hands a value from the thread that receives wire data
//! to whichever thread issued the request. It starts pending, is resolved
//! exactly once, and can then be read by any number of waiters.
//!
//! Failures are stored, not raised: the receive thread resolves the future
//! with a [`ResponseFailure`] and keeps going, and the failure surfaces as an
//! error only at `wait()`.
//!
//! [`ResponseFuture::wait_interruptible`] gives up early once an
//! [`InterruptFlag`] is raised, so a caller stuck on a device that never
//! answers can be released from another thread.

use crate::error::{AppResult, ResponseFailure, ScopeError};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How often an interruptible wait looks at its flag.
const INTERRUPT_POLL: Duration = Duration::from_millis(50);

/// Shared "stop what you are doing" flag.
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    /// Whether the flag is raised.
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Raise the flag.
    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Lower the flag.
    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

enum Slot<T> {
    Pending,
    Resolved(Result<T, ResponseFailure>),
}

struct Shared<T> {
    slot: Mutex<Slot<T>>,
    ready: Condvar,
}

/// Blockable, resolve-once value shared between a receiver and its waiters.
///
/// Cloning yields another handle to the same future.
pub struct ResponseFuture<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for ResponseFuture<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> std::fmt::Debug for ResponseFuture<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseFuture")
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

impl<T> Default for ResponseFuture<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ResponseFuture<T> {
    /// Create a pending future.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                slot: Mutex::new(Slot::Pending),
                ready: Condvar::new(),
            }),
        }
    }

    /// Store a value and release all waiters.
    ///
    /// Returns [`ScopeError::AlreadyResolved`] if the future was already
    /// resolved; the first value is kept.
    pub fn resolve(&self, value: T) -> AppResult<()> {
        self.complete(Ok(value))
    }

    /// Store a failure and release all waiters. Counts as the single resolution.
    pub fn fail(&self, failure: ResponseFailure) -> AppResult<()> {
        self.complete(Err(failure))
    }

    fn complete(&self, outcome: Result<T, ResponseFailure>) -> AppResult<()> {
        let mut slot = self.shared.slot.lock();
        if let Slot::Resolved(_) = *slot {
            return Err(ScopeError::AlreadyResolved);
        }
        *slot = Slot::Resolved(outcome);
        drop(slot);
        self.shared.ready.notify_all();
        Ok(())
    }

    /// True once `resolve` or `fail` has been called.
    pub fn is_resolved(&self) -> bool {
        matches!(*self.shared.slot.lock(), Slot::Resolved(_))
    }
}

impl<T: Clone> ResponseFuture<T> {
    /// Block until resolved, then return the value or raise the stored failure.
    pub fn wait(&self) -> AppResult<T> {
        let mut slot = self.shared.slot.lock();
        loop {
            if let Slot::Resolved(outcome) = &*slot {
                return outcome.clone().map_err(ScopeError::from);
            }
            self.shared.ready.wait(&mut slot);
        }
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`, returning `None`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<AppResult<T>> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.shared.slot.lock();
        while let Slot::Pending = *slot {
            if self.shared.ready.wait_until(&mut slot, deadline).timed_out() {
                break;
            }
        }
        match &*slot {
            Slot::Resolved(outcome) => Some(outcome.clone().map_err(ScopeError::from)),
            Slot::Pending => None,
        }
    }

    /// Like [`wait`](Self::wait) but returns [`ScopeError::Interrupted`] once
    /// `interrupt` is raised. The future itself stays pending.
    pub fn wait_interruptible(&self, interrupt: &InterruptFlag) -> AppResult<T> {
        loop {
            if let Some(outcome) = self.wait_timeout(INTERRUPT_POLL) {
                return outcome;
            }
            if interrupt.is_set() {
                return Err(ScopeError::Interrupted);
            }
        }
    }

    /// Non-blocking peek.
    pub fn try_get(&self) -> Option<AppResult<T>> {
        match &*self.shared.slot.lock() {
            Slot::Resolved(outcome) => Some(outcome.clone().map_err(ScopeError::from)),
            Slot::Pending => None,
        }
    }
}
