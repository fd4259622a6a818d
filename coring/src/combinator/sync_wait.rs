use crate::task::Task;
use std::future::IntoFuture;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Wake, Waker};
use std::thread::{self, Thread};

/// Parks the waiting thread until the awaited task completes.
struct Signal {
    done: AtomicBool,
    thread: Thread,
}

impl Signal {
    fn wait(&self) {
        // Loop to absorb spurious unparks.
        while !self.done.load(Ordering::Acquire) {
            thread::park();
        }
    }
}

impl Wake for Signal {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        if self
            .done
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.thread.unpark();
        }
    }
}

/// Blocks the calling thread until `awaitable` completes and returns its
/// output, raising a stored failure.
///
/// The body starts on the calling thread and may finish on any other thread,
/// for example after hopping onto a reactor with
/// [`Reactor::schedule`](crate::runtime::Reactor::schedule).
///
/// Must not be called from a thread whose reactor the body depends on: that
/// reactor would never run while its thread is parked here.
pub fn sync_wait<F>(awaitable: F) -> F::Output
where
    F: IntoFuture,
    F::IntoFuture: Send + 'static,
    F::Output: Send + 'static,
{
    let mut task = Task::new(awaitable);

    let signal = Arc::new(Signal {
        done: AtomicBool::new(false),
        thread: thread::current(),
    });
    let waker = Waker::from(Arc::clone(&signal));
    let mut cx = Context::from_waker(&waker);

    // The task wakes its consumer exactly once, so one wait is enough.
    if task.poll_ready(&mut cx).is_pending() {
        signal.wait();

        if task.poll_ready(&mut cx).is_pending() {
            unreachable!("task woke its consumer before finishing");
        }
    }

    task.take_output()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::CancellationToken;
    use crate::test_utils::{CloneCounter, spawn_reactor};
    use anyhow::Result;
    use std::panic::{self, AssertUnwindSafe};

    #[test]
    fn test_plain_value() {
        assert_eq!(sync_wait(async { 7 }), 7);
    }

    #[test]
    fn test_completes_on_reactor_thread() -> Result<()> {
        let token = CancellationToken::new();
        let (reactor, handle) = spawn_reactor(token.clone())?;

        let caller = thread::current().id();
        let on = {
            let reactor = reactor.clone();
            sync_wait(async move {
                reactor.schedule().await;
                (thread::current().id(), reactor.is_in_local_thread())
            })
        };

        token.cancel();
        handle.join().expect("reactor thread panicked")?;

        assert_ne!(on.0, caller);
        assert!(on.1);
        Ok(())
    }

    #[test]
    fn test_failure_reraised_on_caller() {
        let res = panic::catch_unwind(AssertUnwindSafe(|| {
            let () = sync_wait(async {
                panic!("from body");
            });
        }));

        let payload = res.expect_err("panic should propagate");
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"from body"));
    }

    #[test]
    fn test_temporary_result_moved_not_copied() -> Result<()> {
        let value = sync_wait(async { CloneCounter::new() });
        assert_eq!(value.clones().load(Ordering::Relaxed), 0);
        Ok(())
    }
}
