use futures::task::AtomicWaker;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Wake, Waker};

/// Countdown shared by the members of a multi-wait and the waiting side.
///
/// Starts at `n + 1`. Each member takes one off when it finishes, the waiter
/// takes the extra one off when it arms. Whoever brings the count to zero
/// moves on: the waiter resumes inline, a member wakes the waiter.
pub(crate) struct CompletionCounter {
    remaining: AtomicUsize,
    waker: AtomicWaker,
    finished: Mutex<SmallVec<[usize; 8]>>,
}

impl CompletionCounter {
    pub(crate) fn new(n: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(n + 1),
            waker: AtomicWaker::new(),
            finished: Mutex::new(SmallVec::new()),
        }
    }

    /// Member `index` finished.
    pub(crate) fn notify_complete_one(&self, index: usize) {
        self.finished.lock().push(index);

        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.waker.wake();
        }
    }

    pub(crate) fn register(&self, waker: &Waker) {
        self.waker.register(waker);
    }

    /// Drops the waiter's share. Returns `true` if the waiter must wait for a
    /// wakeup. Called once, after [`register`](Self::register).
    pub(crate) fn arm(&self) -> bool {
        self.remaining.fetch_sub(1, Ordering::AcqRel) != 1
    }

    pub(crate) fn is_done(&self) -> bool {
        self.remaining.load(Ordering::Acquire) == 0
    }

    /// Member indices in the order they finished.
    pub(crate) fn finish_order(&self) -> SmallVec<[usize; 8]> {
        self.finished.lock().clone()
    }
}

/// Waker handed to member `index`. Only ever woken once, by the member's
/// completion.
pub(crate) struct Notify {
    pub(crate) counter: Arc<CompletionCounter>,
    pub(crate) index: usize,
}

impl Wake for Notify {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.counter.notify_complete_one(self.index);
    }
}
