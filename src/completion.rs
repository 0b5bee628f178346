//! One-shot completion handles for asynchronous operations.
//!
//! Operations that are executed later on the scheduler (registry updates,
//! interest changes, connects) return a [`Completion`]. Callers either poll
//! it, block on it, or attach a callback with [`Completion::on_complete`].

use crate::error::{InterestError, Result};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

type Callback<T> = Box<dyn FnOnce(Result<T>) + Send + 'static>;

enum State<T> {
    Pending(Vec<Callback<T>>),
    Done(Result<T>),
}

struct Inner<T> {
    state: Mutex<State<T>>,
    ready: Condvar,
}

/// Handle to the result of an operation that completes at most once.
pub struct Completion<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> Completion<T> {
    /// Create a pending completion.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::Pending(Vec::new())),
                ready: Condvar::new(),
            }),
        }
    }

    /// Create a completion that already succeeded.
    pub fn completed(value: T) -> Self {
        let completion = Self::new();
        completion.complete(Ok(value));
        completion
    }

    /// Create a completion that already failed.
    pub fn failed(error: InterestError) -> Self {
        let completion = Self::new();
        completion.complete(Err(error));
        completion
    }

    /// Resolve the completion. Returns false if it was already resolved.
    ///
    /// Callbacks run on the calling thread after the internal lock is
    /// released.
    pub fn complete(&self, result: Result<T>) -> bool {
        let callbacks = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                State::Done(_) => return false,
                State::Pending(callbacks) => {
                    let callbacks = std::mem::take(callbacks);
                    *state = State::Done(result.clone());
                    callbacks
                }
            }
        };
        self.inner.ready.notify_all();

        for callback in callbacks {
            callback(result.clone());
        }
        true
    }

    /// Run `f` once the completion resolves (immediately if it already has).
    pub fn on_complete<F>(&self, f: F)
    where
        F: FnOnce(Result<T>) + Send + 'static,
    {
        let done = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                State::Pending(callbacks) => {
                    callbacks.push(Box::new(f));
                    return;
                }
                State::Done(result) => result.clone(),
            }
        };
        f(done);
    }

    /// Completion resolving to `f` applied to this one's value.
    pub fn map<U, F>(&self, f: F) -> Completion<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let mapped = Completion::new();
        let target = mapped.clone();
        self.on_complete(move |result| {
            target.complete(result.map(f));
        });
        mapped
    }

    /// The result, if resolved.
    pub fn result(&self) -> Option<Result<T>> {
        match &*self.inner.state.lock() {
            State::Done(result) => Some(result.clone()),
            State::Pending(_) => None,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(&*self.inner.state.lock(), State::Done(_))
    }

    /// Block until resolved or until `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while let State::Pending(_) = &*state {
            if self.inner.ready.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        match &*state {
            State::Done(result) => Some(result.clone()),
            State::Pending(_) => None,
        }
    }
}

impl<T: Clone + Send + 'static> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let done = matches!(&*self.inner.state.lock(), State::Done(_));
        f.debug_struct("Completion").field("done", &done).finish()
    }
}
