//! One-shot completion handles.
//!
//! [`pending`] returns a [`Completer`] kept by the producer and a [`Pending`]
//! handed to the caller. A completer dropped without completing resolves its
//! handle with an `Abandoned` pool error, so a waiter never hangs on a lost
//! item.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use objectstore_core::{Error, PoolErrorKind, Result};
use parking_lot::{Condvar, Mutex};

struct Slot<T> {
    value: Mutex<Option<Result<T>>>,
    done: Condvar,
}

/// Handle to a result that is delivered later.
pub struct Pending<T> {
    slot: Arc<Slot<T>>,
}

/// Producer side of a [`Pending`].
pub struct Completer<T> {
    slot: Option<Arc<Slot<T>>>,
}

pub fn pending<T>() -> (Completer<T>, Pending<T>) {
    let slot = Arc::new(Slot {
        value: Mutex::new(None),
        done: Condvar::new(),
    });
    (
        Completer {
            slot: Some(Arc::clone(&slot)),
        },
        Pending { slot },
    )
}

impl<T> Pending<T> {
    /// A handle that is already resolved.
    pub fn ready(result: Result<T>) -> Self {
        let (completer, pending) = pending();
        completer.complete(result);
        pending
    }

    pub fn is_ready(&self) -> bool {
        self.slot.value.lock().is_some()
    }

    /// Block until the result is delivered.
    pub fn wait(self) -> Result<T> {
        let mut value = self.slot.value.lock();
        loop {
            if let Some(result) = value.take() {
                return result;
            }
            self.slot.done.wait(&mut value);
        }
    }

    /// Block for at most `timeout`. Gives the handle back if nothing arrived.
    pub fn wait_timeout(self, timeout: Duration) -> std::result::Result<Result<T>, Self> {
        {
            let mut value = self.slot.value.lock();
            if value.is_none() {
                self.slot.done.wait_for(&mut value, timeout);
            }
            if let Some(result) = value.take() {
                return Ok(result);
            }
        }
        Err(self)
    }
}

impl<T> Completer<T> {
    pub fn complete(mut self, result: Result<T>) {
        self.deliver(result);
    }

    fn deliver(&mut self, result: Result<T>) {
        if let Some(slot) = self.slot.take() {
            *slot.value.lock() = Some(result);
            slot.done.notify_all();
        }
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        if self.slot.is_some() {
            self.deliver(Err(Error::pool(
                PoolErrorKind::Abandoned,
                "work item finished without a result",
            )));
        }
    }
}

impl<T> fmt::Debug for Pending<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pending").field("ready", &self.is_ready()).finish()
    }
}

impl<T> fmt::Debug for Completer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completer").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn waits_for_another_thread() {
        let (completer, handle) = pending::<u32>();
        let producer = thread::spawn(move || completer.complete(Ok(7)));
        assert_eq!(handle.wait().unwrap(), 7);
        producer.join().unwrap();
    }

    #[test]
    fn dropped_completer_abandons() {
        let (completer, handle) = pending::<u32>();
        drop(completer);
        let err = handle.wait().unwrap_err();
        assert!(matches!(err, Error::Pool(ref p) if p.kind == PoolErrorKind::Abandoned));
    }

    #[test]
    fn timeout_returns_the_handle() {
        let (completer, handle) = pending::<u32>();
        let handle = handle.wait_timeout(Duration::from_millis(5)).unwrap_err();
        assert!(!handle.is_ready());
        completer.complete(Ok(1));
        assert!(handle.is_ready());
        assert_eq!(handle.wait().unwrap(), 1);
    }
}
