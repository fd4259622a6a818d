use crate::task::RawTask;
use crate::task::state::CompletionFlag;
use futures::future::BoxFuture;
use futures::ready;
use futures::task::AtomicWaker;
use parking_lot::Mutex;
use pin_project::pin_project;
use std::any::Any;
use std::fmt;
use std::future::{Future, IntoFuture};
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread;

/// Where a producer leaves its result and how it finds its consumer.
pub(crate) struct Promise<T> {
    flag: CompletionFlag,
    waker: AtomicWaker,
    result: Mutex<Option<thread::Result<T>>>,
}

impl<T> Promise<T> {
    fn new() -> Self {
        Self {
            flag: CompletionFlag::new(),
            waker: AtomicWaker::new(),
            result: Mutex::new(None),
        }
    }

    fn store(&self, result: thread::Result<T>) {
        *self.result.lock() = Some(result);
    }

    // Runs after the producer released its own lock, so the consumer can be
    // resumed inline from here.
    fn notify(&self) {
        if self.flag.complete() {
            self.waker.wake();
        }
    }

    fn take(&self) -> Option<thread::Result<T>> {
        self.result.lock().take()
    }
}

/// Runs the body and stores its outcome. A panic escaping the body is caught
/// and kept as the failure.
#[pin_project]
struct Produce<F: Future> {
    #[pin]
    body: F,
    promise: Arc<Promise<F::Output>>,
}

impl<F: Future> Future for Produce<F> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.project();
        let body = this.body;

        let result = match panic::catch_unwind(AssertUnwindSafe(|| body.poll(cx))) {
            Ok(Poll::Pending) => return Poll::Pending,
            Ok(Poll::Ready(value)) => Ok(value),
            Err(payload) => Err(payload),
        };

        this.promise.store(result);
        Poll::Ready(())
    }
}

enum Stage<T> {
    Idle(BoxFuture<'static, T>),
    Running {
        promise: Arc<Promise<T>>,
        body: Arc<RawTask>,
    },
    Finished(thread::Result<T>),
    Consumed,
}

/// A lazily started computation producing exactly one `T`.
///
/// Nothing runs until the task is first awaited. The body then executes
/// inline on the awaiting thread up to its first suspension, and later
/// continues on whichever thread wakes it. When it completes, the awaiting
/// side is resumed exactly once.
///
/// Awaiting `Task<T>` by value moves the output out. [`Task::get`] awaits it
/// by reference instead, leaving the output inside the task. A panic raised by
/// the body is stored and raised again in the awaiting context.
///
/// Dropping an unfinished task destroys its body, wherever it is suspended.
pub struct Task<T> {
    stage: Stage<T>,
}

impl<T: Send + 'static> Task<T> {
    pub fn new<F>(body: F) -> Self
    where
        F: IntoFuture<Output = T>,
        F::IntoFuture: Send + 'static,
    {
        Self {
            stage: Stage::Idle(Box::pin(body.into_future())),
        }
    }

    /// Creates a task that already holds its output.
    pub fn ready(value: T) -> Self {
        Self {
            stage: Stage::Finished(Ok(value)),
        }
    }

    /// Whether the body finished, successfully or not.
    pub fn is_ready(&self) -> bool {
        match &self.stage {
            Stage::Running { promise, .. } => promise.flag.is_done(),
            Stage::Finished(_) => true,
            Stage::Idle(_) | Stage::Consumed => false,
        }
    }

    /// Waits for completion without consuming the output or raising a failure.
    pub fn when_ready(&mut self) -> WhenReady<'_, T> {
        WhenReady { task: self }
    }

    /// Awaits the task by reference.
    pub fn get(&mut self) -> Borrowed<'_, T> {
        Borrowed { task: Some(self) }
    }

    /// Output of a finished task. Panics if the task did not finish
    /// successfully or its output was already moved out.
    pub fn output(&self) -> &T {
        match &self.stage {
            Stage::Finished(Ok(value)) => value,
            Stage::Finished(Err(_)) => panic!("`Task` finished with a failure"),
            _ => panic!("`Task` output is not available"),
        }
    }

    fn start(&mut self) {
        let Stage::Idle(body) = std::mem::replace(&mut self.stage, Stage::Consumed) else {
            return;
        };

        let promise = Arc::new(Promise::new());
        let notify = Arc::clone(&promise);

        let raw = RawTask::with_callback(
            Produce {
                body,
                promise: Arc::clone(&promise),
            },
            move || notify.notify(),
        );

        self.stage = Stage::Running {
            promise,
            body: Arc::clone(&raw),
        };
        raw.run();
    }

    /// Starts the body if needed and registers `cx` as its continuation.
    pub(crate) fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        loop {
            let promise = match &self.stage {
                Stage::Idle(_) => {
                    self.start();
                    continue;
                }
                Stage::Running { promise, .. } => Arc::clone(promise),
                Stage::Finished(_) => return Poll::Ready(()),
                Stage::Consumed => panic!("`Task` polled after completion"),
            };

            promise.waker.register(cx.waker());
            if promise.flag.suspend() {
                return Poll::Pending;
            }

            let Some(result) = promise.take() else {
                unreachable!("result is stored before the completion flag is raised");
            };

            self.stage = Stage::Finished(result);
            return Poll::Ready(());
        }
    }

    /// Removes a stored failure, leaving the task consumed.
    pub(crate) fn take_failure(&mut self) -> Option<Box<dyn Any + Send>> {
        if !matches!(self.stage, Stage::Finished(Err(_))) {
            return None;
        }

        match std::mem::replace(&mut self.stage, Stage::Consumed) {
            Stage::Finished(Err(payload)) => Some(payload),
            _ => None,
        }
    }

    /// Moves the output out, raising a stored failure.
    pub(crate) fn take_output(&mut self) -> T {
        match std::mem::replace(&mut self.stage, Stage::Consumed) {
            Stage::Finished(Ok(value)) => value,
            Stage::Finished(Err(payload)) => panic::resume_unwind(payload),
            _ => panic!("`Task` polled after completion"),
        }
    }
}

impl<T> Unpin for Task<T> {}

impl<T> Drop for Task<T> {
    fn drop(&mut self) {
        if let Stage::Running { promise, body } = &self.stage {
            if !promise.flag.is_done() {
                body.cancel();
            }
        }
    }
}

impl<T: Send + 'static> Future for Task<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let this = self.get_mut();
        ready!(this.poll_ready(cx));
        Poll::Ready(this.take_output())
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage = match &self.stage {
            Stage::Idle(_) => "Idle",
            Stage::Running { .. } => "Running",
            Stage::Finished(Ok(_)) => "Finished",
            Stage::Finished(Err(_)) => "Failed",
            Stage::Consumed => "Consumed",
        };

        f.debug_struct("Task").field("stage", &stage).finish()
    }
}

/// Future returned by [`Task::get`].
#[derive(Debug)]
pub struct Borrowed<'a, T> {
    task: Option<&'a mut Task<T>>,
}

impl<'a, T: Send + 'static> Future for Borrowed<'a, T> {
    type Output = &'a T;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<&'a T> {
        let Some(task) = self.task.as_mut() else {
            panic!("`Borrowed` polled after completion");
        };
        ready!(task.poll_ready(cx));

        let Some(task) = self.task.take() else {
            unreachable!("task checked above");
        };

        if let Some(payload) = task.take_failure() {
            panic::resume_unwind(payload);
        }

        let task: &'a Task<T> = task;
        Poll::Ready(task.output())
    }
}

/// Future returned by [`Task::when_ready`].
#[derive(Debug)]
pub struct WhenReady<'a, T> {
    task: &'a mut Task<T>,
}

impl<T: Send + 'static> Future for WhenReady<'_, T> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        self.task.poll_ready(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate as coring;
    use crate::combinator::sync_wait;
    use crate::future::delay;
    use crate::test_utils::{CloneCounter, mock_waker};
    use anyhow::Result;
    use futures::channel::oneshot;
    use futures::executor::block_on;
    use rstest::rstest;
    use static_assertions::assert_impl_all;
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::Release);
        }
    }

    assert_impl_all!(Task<u32>: Send, Unpin);
    assert_impl_all!(Task<CloneCounter>: Send);

    #[test]
    fn test_body_does_not_run_until_awaited() -> Result<()> {
        let started = Arc::new(AtomicBool::new(false));
        let s = Arc::clone(&started);

        let mut task = Task::new(async move {
            s.store(true, Ordering::Release);
            42
        });

        assert!(!started.load(Ordering::Acquire));
        assert!(!task.is_ready());

        let (waker, data) = mock_waker();
        let mut cx = Context::from_waker(&waker);

        assert_eq!(Pin::new(&mut task).poll(&mut cx), Poll::Ready(42));
        assert!(started.load(Ordering::Acquire));
        assert_eq!(data.get_count(), 0);
        Ok(())
    }

    #[test]
    fn test_suspended_consumer_woken_exactly_once() -> Result<()> {
        let (tx, rx) = futures::channel::oneshot::channel::<&'static str>();

        let mut task = Task::new(async move { rx.await.unwrap_or("dropped") });

        let (waker, data) = mock_waker();
        let mut cx = Context::from_waker(&waker);

        assert!(Pin::new(&mut task).poll(&mut cx).is_pending());
        // Spurious polls only refresh the waker.
        assert!(Pin::new(&mut task).poll(&mut cx).is_pending());

        std::thread::spawn(move || tx.send("done"))
            .join()
            .expect("producer thread panicked")
            .map_err(|_| anyhow::anyhow!("receiver dropped"))?;

        assert_eq!(data.get_count(), 1);
        assert!(task.is_ready());
        assert_eq!(Pin::new(&mut task).poll(&mut cx), Poll::Ready("done"));
        Ok(())
    }

    #[test]
    fn test_failure_raised_in_awaiting_context() {
        let task: Task<u32> = Task::new(async { panic!("boom") });

        let res = panic::catch_unwind(AssertUnwindSafe(|| sync_wait(task)));
        let payload = res.expect_err("panic should propagate");

        assert_eq!(payload.downcast_ref::<&str>(), Some(&"boom"));
    }

    #[test]
    fn test_get_returns_reference_into_task() -> Result<()> {
        let mut task = Task::new(async { String::from("kept") });

        let addr = block_on(async {
            let value: &String = task.get().await;
            value as *const String as usize
        });

        assert_eq!(addr, task.output() as *const String as usize);
        assert_eq!(task.output(), "kept");
        Ok(())
    }

    #[test]
    fn test_by_value_output_not_cloned() -> Result<()> {
        let counter = CloneCounter::new();
        let clones = counter.clones();

        let value = sync_wait(Task::new(async move { counter }));

        assert_eq!(value.clones().load(Ordering::Relaxed), 0);
        assert_eq!(clones.load(Ordering::Relaxed), 0);
        Ok(())
    }

    #[test]
    fn test_named_task_result_copied_by_caller() -> Result<()> {
        let mut task = Task::new(async { CloneCounter::new() });

        let copy = block_on(async { task.get().await.clone() });

        assert_eq!(copy.clones().load(Ordering::Relaxed), 1);
        assert!(task.is_ready());
        Ok(())
    }

    #[test]
    fn test_when_ready_keeps_failure_stored() -> Result<()> {
        let mut task: Task<()> = Task::new(async { panic!("later") });

        block_on(task.when_ready());
        assert!(task.is_ready());
        assert!(task.take_failure().is_some());
        Ok(())
    }

    #[test]
    fn test_dropping_unstarted_task_drops_body() {
        let drops = Arc::new(AtomicUsize::new(0));

        struct Guard(Arc<AtomicUsize>);
        impl Drop for Guard {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }

        let guard = Guard(Arc::clone(&drops));
        let task = Task::new(async move {
            let _g = guard;
        });

        drop(task);
        assert_eq!(drops.load(Ordering::Relaxed), 1);
    }

    #[test]
    #[should_panic(expected = "polled after completion")]
    fn test_poll_after_completion_panics() {
        let mut task = Task::ready(1);
        let (waker, _) = mock_waker();
        let mut cx = Context::from_waker(&waker);

        let _ = Pin::new(&mut task).poll(&mut cx);
        let _ = Pin::new(&mut task).poll(&mut cx);
    }

    #[test]
    fn test_dropping_suspended_task_destroys_body() -> Result<()> {
        let (tx, rx) = oneshot::channel::<()>();
        let ran_on = Arc::new(AtomicBool::new(false));
        let dropped = Arc::new(AtomicBool::new(false));

        let (r, flag) = (Arc::clone(&ran_on), DropFlag(Arc::clone(&dropped)));
        let mut task = Task::new(async move {
            let _flag = flag;
            let _ = rx.await;
            r.store(true, Ordering::Release);
        });

        let (waker, data) = mock_waker();
        let mut cx = Context::from_waker(&waker);
        assert!(Pin::new(&mut task).poll(&mut cx).is_pending());
        assert!(!dropped.load(Ordering::Acquire));

        drop(task);
        assert!(dropped.load(Ordering::Acquire));

        // The receiver went away with the body.
        assert!(tx.send(()).is_err());
        assert!(!ran_on.load(Ordering::Acquire));
        assert_eq!(data.get_count(), 0);
        Ok(())
    }

    #[test]
    fn test_dropping_finished_task_drops_output() -> Result<()> {
        let dropped = Arc::new(AtomicBool::new(false));
        let flag = DropFlag(Arc::clone(&dropped));

        let mut task = Task::new(async move { flag });
        block_on(task.when_ready());
        assert!(!dropped.load(Ordering::Acquire));

        drop(task);
        assert!(dropped.load(Ordering::Acquire));
        Ok(())
    }

    #[coring::test]
    async fn test_dropping_task_with_io_in_flight() -> Result<()> {
        let fired = Arc::new(AtomicBool::new(false));

        let f = Arc::clone(&fired);
        let mut task = Task::new(async move {
            delay(Duration::from_millis(20)).await.expect("delay failed");
            f.store(true, Ordering::Release);
        });

        assert!(futures::poll!(&mut task).is_pending());
        drop(task);

        // The timer still completes in the ring, the body does not resume.
        delay(Duration::from_millis(50)).await?;
        assert!(!fired.load(Ordering::Acquire));
        Ok(())
    }

    #[rstest]
    #[case::one(1)]
    #[case::ten(10)]
    #[case::thousand(1000)]
    fn test_consumer_resumed_once_under_race(#[case] trials: usize) -> Result<()> {
        for trial in 0..trials {
            let (tx, rx) = oneshot::channel::<usize>();
            let barrier = Arc::new(Barrier::new(2));

            let producer = {
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    let _ = tx.send(trial);
                })
            };

            let mut task = Task::new(async move { rx.await.unwrap_or(usize::MAX) });
            let (waker, data) = mock_waker();
            let mut cx = Context::from_waker(&waker);

            barrier.wait();
            let first = Pin::new(&mut task).poll(&mut cx);
            producer.join().expect("producer panicked");

            match first {
                Poll::Ready(value) => {
                    assert_eq!(value, trial);
                    assert_eq!(data.get_count(), 0);
                }
                Poll::Pending => {
                    // The send ran the body inline and resumed us from there.
                    assert_eq!(data.get_count(), 1);
                    assert_eq!(Pin::new(&mut task).poll(&mut cx), Poll::Ready(trial));
                    assert_eq!(data.get_count(), 1);
                }
            }
        }

        Ok(())
    }
}
