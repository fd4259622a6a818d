use parking_lot::Mutex;
use slab::Slab;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

type Callback = Box<dyn FnOnce() + Send + 'static>;

struct Shared {
    cancelled: AtomicBool,
    callbacks: Mutex<Slab<Callback>>,
}

/// Cooperative stop signal shared between threads.
///
/// Cancelling is sticky and idempotent. Callbacks registered with
/// [`CancellationToken::on_cancel`] run once, on the cancelling thread.
#[derive(Clone)]
pub struct CancellationToken {
    shared: Arc<Shared>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                cancelled: AtomicBool::new(false),
                callbacks: Mutex::new(Slab::new()),
            }),
        }
    }

    pub fn cancel(&self) {
        if self.shared.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }

        let callbacks = std::mem::take(&mut *self.shared.callbacks.lock());
        for (_, callback) in callbacks {
            callback();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::Acquire)
    }

    /// Runs `callback` when the token is cancelled, or right away if it
    /// already is. The callback is dropped unrun when the registration is.
    pub fn on_cancel<F>(&self, callback: F) -> CancelRegistration
    where
        F: FnOnce() + Send + 'static,
    {
        let key = {
            let mut callbacks = self.shared.callbacks.lock();

            // Checked under the lock, `cancel` empties the table under it too.
            if !self.is_cancelled() {
                Some(callbacks.insert(Box::new(callback)))
            } else {
                drop(callbacks);
                callback();
                None
            }
        };

        CancelRegistration {
            shared: Arc::downgrade(&self.shared),
            key,
        }
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Keeps a cancel callback registered.
#[must_use = "the callback is unregistered when the registration is dropped"]
#[derive(Debug)]
pub struct CancelRegistration {
    shared: Weak<Shared>,
    key: Option<usize>,
}

impl Drop for CancelRegistration {
    fn drop(&mut self) {
        let (Some(key), Some(shared)) = (self.key, self.shared.upgrade()) else {
            return;
        };

        let callback = shared.callbacks.lock().try_remove(key);
        drop(callback);
    }
}
