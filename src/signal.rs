//! Single-assignment completion cell with listener fan-out.

use std::fmt;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

type Listener<T> = Box<dyn FnOnce(T) + Send + 'static>;

struct SignalState<T> {
    value: Option<T>,
    listeners: Vec<Listener<T>>,
}

/// A value published at most once.
///
/// Any number of listeners may be registered; each one runs exactly once, either
/// on the thread calling [`CompletionSignal::complete`] or immediately on the
/// registering thread when the value is already published. Listeners are
/// always invoked without the internal mutex held.
pub struct CompletionSignal<T> {
    state: Mutex<SignalState<T>>,
    cond: Condvar,
}

impl<T: Clone + Send + 'static> CompletionSignal<T> {
    pub fn new() -> CompletionSignal<T> {
        CompletionSignal {
            state: Mutex::new(SignalState {
                value: None,
                listeners: Vec::new(),
            }),
            cond: Condvar::new(),
        }
    }

    pub fn completed(value: T) -> CompletionSignal<T> {
        let signal = CompletionSignal::new();
        signal.complete(value);
        signal
    }

    /// Publish `value`. Returns `false` if a value was already published, in
    /// which case `value` is discarded.
    pub fn complete(&self, value: T) -> bool {
        let listeners = {
            let mut guard = self.state.lock().unwrap();
            if guard.value.is_some() {
                return false;
            }
            guard.value = Some(value.clone());
            std::mem::take(&mut guard.listeners)
        };
        self.cond.notify_all();
        for listener in listeners {
            listener(value.clone());
        }
        true
    }

    pub fn add_listener(&self, listener: impl FnOnce(T) + Send + 'static) {
        let value = {
            let mut guard = self.state.lock().unwrap();
            match &guard.value {
                Some(value) => value.clone(),
                None => {
                    guard.listeners.push(Box::new(listener));
                    return;
                }
            }
        };
        listener(value);
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.state.lock().unwrap().value.is_some()
    }

    pub fn get(&self) -> Option<T> {
        self.state.lock().unwrap().value.clone()
    }

    /// Block until a value is published or `timeout` elapses. `None` waits
    /// without bound.
    pub fn wait(&self, timeout: Option<Duration>) -> Option<T> {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut guard = self.state.lock().unwrap();
        loop {
            if let Some(value) = &guard.value {
                return Some(value.clone());
            }
            match (timeout, deadline) {
                (Some(_), Some(deadline)) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    guard = self.cond.wait_timeout(guard, deadline - now).unwrap().0;
                }
                _ => guard = self.cond.wait(guard).unwrap(),
            }
        }
    }
}

impl<T: Clone + Send + 'static> Default for CompletionSignal<T> {
    fn default() -> Self {
        CompletionSignal::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for CompletionSignal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = self.state.lock().unwrap();
        f.debug_struct("CompletionSignal")
            .field("value", &guard.value)
            .field("listeners", &guard.listeners.len())
            .finish()
    }
}
