use crate::task::Id;
use crate::utils::ScopeGuard;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::task::{Context, Poll, Wake, Waker};

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const NOTIFIED: u8 = 2;
const COMPLETE: u8 = 3;

pub(crate) type OnComplete = Box<dyn FnOnce() + Send + 'static>;

/// Heap owned state of one suspended computation.
///
/// Waking a `RawTask` resumes it inline on the waking thread. This is how a
/// computation follows its continuation across threads: whoever completes the
/// event it waits on runs it next. A wake that arrives while the task is being
/// polled is recorded and the task is polled again before `run` returns.
///
/// [`cancel`](RawTask::cancel) destroys the computation without completing
/// it. If another thread is polling it at that moment, the poller drops it
/// once `poll` returns.
pub(crate) struct RawTask {
    id: Id,

    state: AtomicU8,

    cancelled: AtomicBool,

    // Only locked by the thread that moved the state from IDLE to RUNNING.
    future: Mutex<Option<BoxFuture<'static, ()>>>,

    // Fired once, after the future completed and was dropped, with no lock held.
    on_complete: Mutex<Option<OnComplete>>,
}

impl RawTask {
    #[cfg(test)]
    pub(crate) fn new<F>(future: F) -> Arc<Self>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self::build(Id::next(), Box::pin(future), None)
    }

    pub(crate) fn with_callback<F, C>(future: F, on_complete: C) -> Arc<Self>
    where
        F: Future<Output = ()> + Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        Self::with_id(Id::next(), future, on_complete)
    }

    /// Used when the id must be known before the future is built.
    pub(crate) fn with_id<F, C>(id: Id, future: F, on_complete: C) -> Arc<Self>
    where
        F: Future<Output = ()> + Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        Self::build(id, Box::pin(future), Some(Box::new(on_complete)))
    }

    fn build(
        id: Id,
        future: BoxFuture<'static, ()>,
        on_complete: Option<OnComplete>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            state: AtomicU8::new(IDLE),
            cancelled: AtomicBool::new(false),
            future: Mutex::new(Some(future)),
            on_complete: Mutex::new(on_complete),
        })
    }

    pub(crate) fn id(&self) -> Id {
        self.id
    }

    #[cfg(test)]
    pub(crate) fn is_complete(&self) -> bool {
        self.state.load(Ordering::Acquire) == COMPLETE
    }

    /// Resumes the computation on the calling thread.
    pub(crate) fn run(self: &Arc<Self>) {
        if !self.try_claim() {
            return;
        }

        let waker = Waker::from(Arc::clone(self));
        let mut cx = Context::from_waker(&waker);

        // A panic escaping `poll` leaves the task dead instead of stuck in
        // RUNNING, later wakes become no-ops.
        let mut poisoned = ScopeGuard::new(|| {
            self.state.store(COMPLETE, Ordering::Release);
            tracing::error!(task.id = %self.id, "task panicked while being polled");
        });

        let outcome = loop {
            if self.cancelled.load(Ordering::SeqCst) {
                break Outcome::Cancelled;
            }

            let res = match self.future.lock().as_mut() {
                Some(fut) => fut.as_mut().poll(&mut cx),
                None => Poll::Ready(()),
            };

            if res.is_ready() {
                break Outcome::Complete;
            }

            match self
                .state
                .compare_exchange(RUNNING, IDLE, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => break Outcome::Parked,
                // Woken while polling, go again.
                Err(_) => self.state.store(RUNNING, Ordering::SeqCst),
            }
        };

        poisoned.disarm();

        match outcome {
            Outcome::Complete => self.finish(),
            Outcome::Cancelled => self.discard(),
            // A cancel that raced with parking saw RUNNING and left it to us.
            Outcome::Parked => {
                if self.cancelled.load(Ordering::SeqCst) && self.try_discard() {
                    tracing::trace!(task.id = %self.id, "dropped cancelled task after poll");
                }
            }
        }
    }

    /// Destroys the computation without running it to completion. The
    /// completion callback never fires for a cancelled task.
    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);

        if self.try_discard() {
            tracing::trace!(task.id = %self.id, "dropped cancelled task");
        }
    }

    // Claims an idle task for destruction. Fails if it is being polled or
    // already finished.
    fn try_discard(&self) -> bool {
        if self
            .state
            .compare_exchange(IDLE, COMPLETE, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        self.drop_future();
        true
    }

    fn discard(&self) {
        self.state.store(COMPLETE, Ordering::SeqCst);
        self.drop_future();
    }

    // Dropped outside of the locks, the future may wake other tasks.
    fn drop_future(&self) {
        let fut = self.future.lock().take();
        let on_complete = self.on_complete.lock().take();
        drop(fut);
        drop(on_complete);
    }

    // Moves IDLE -> RUNNING, or leaves a notification for the current poller.
    fn try_claim(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);

        loop {
            let next = match current {
                IDLE => RUNNING,
                RUNNING => NOTIFIED,
                _ => return false,
            };

            match self
                .state
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return next == RUNNING,
                Err(actual) => current = actual,
            }
        }
    }

    fn finish(&self) {
        let fut = self.future.lock().take();
        self.state.store(COMPLETE, Ordering::Release);
        drop(fut);

        let on_complete = self.on_complete.lock().take();
        if let Some(on_complete) = on_complete {
            on_complete();
        }
    }
}

enum Outcome {
    Complete,
    Parked,
    Cancelled,
}

impl Wake for RawTask {
    fn wake(self: Arc<Self>) {
        self.run();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.run();
    }
}

impl fmt::Debug for RawTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawTask")
            .field("id", &self.id)
            .field("state", &self.state.load(Ordering::Relaxed))
            .finish()
    }
}
