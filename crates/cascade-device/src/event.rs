//! Completion events.
//!
//! An [`Event`] marks the end of one device command. It is signalled exactly
//! once, either as complete or as failed with the error the command hit.
//! Later commands name the events they must wait for, which is how data
//! dependencies are chained without blocking the issuing thread.

use std::fmt;
use std::sync::Arc;

use cascade_core::{CascadeError, Result};
use parking_lot::{Condvar, Mutex};

/// Observable state of an [`Event`].
#[derive(Debug, Clone, PartialEq)]
pub enum EventStatus {
    Pending,
    Complete,
    Failed(CascadeError),
}

struct EventInner {
    status: Mutex<EventStatus>,
    signalled: Condvar,
}

/// A completion signal shared between the queue and every waiter.
#[derive(Clone)]
pub struct Event {
    inner: Arc<EventInner>,
}

impl Event {
    fn with_status(status: EventStatus) -> Self {
        Self {
            inner: Arc::new(EventInner {
                status: Mutex::new(status),
                signalled: Condvar::new(),
            }),
        }
    }

    /// A pending event that the caller signals with [`complete`](Self::complete)
    /// or [`fail`](Self::fail).
    pub fn user() -> Self {
        Self::with_status(EventStatus::Pending)
    }

    /// An event that has already fired.
    pub fn completed() -> Self {
        Self::with_status(EventStatus::Complete)
    }

    /// An event that has already failed with `err`.
    pub fn failed(err: CascadeError) -> Self {
        Self::with_status(EventStatus::Failed(err))
    }

    fn signal(&self, status: EventStatus) -> bool {
        let mut current = self.inner.status.lock();
        if *current != EventStatus::Pending {
            return false;
        }
        *current = status;
        self.inner.signalled.notify_all();
        true
    }

    /// Mark the event complete. Returns `false` if it was already signalled.
    pub fn complete(&self) -> bool {
        self.signal(EventStatus::Complete)
    }

    /// Mark the event failed. Returns `false` if it was already signalled.
    pub fn fail(&self, err: CascadeError) -> bool {
        self.signal(EventStatus::Failed(err))
    }

    pub fn status(&self) -> EventStatus {
        self.inner.status.lock().clone()
    }

    /// Whether the event has fired, successfully or not.
    pub fn is_complete(&self) -> bool {
        *self.inner.status.lock() != EventStatus::Pending
    }

    pub fn is_failed(&self) -> bool {
        matches!(*self.inner.status.lock(), EventStatus::Failed(_))
    }

    /// Block until the event fires. Returns the stored error if it failed.
    pub fn wait(&self) -> Result<()> {
        let mut status = self.inner.status.lock();
        while *status == EventStatus::Pending {
            self.inner.signalled.wait(&mut status);
        }
        match &*status {
            EventStatus::Failed(err) => Err(err.clone()),
            _ => Ok(()),
        }
    }

    /// Wait for every event in order; the first failure is returned after
    /// all of them have fired.
    pub fn wait_all(events: &[Event]) -> Result<()> {
        let mut first_err = None;
        for event in events {
            if let Err(err) = event.wait() {
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Whether two handles refer to the same signal.
    pub fn ptr_eq(&self, other: &Event) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Event").field(&*self.inner.status.lock()).finish()
    }
}
