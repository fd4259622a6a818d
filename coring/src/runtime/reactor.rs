use crate::context::{self, Core, Job};
use crate::protocol::{Suspend, poll_suspend};
use crate::runtime::{Builder, CancellationToken, ReactorConfig, ReactorError};
use crate::task::{Id, RawTask};
use anyhow::Result;
use futures::FutureExt;
use futures::task::AtomicWaker;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::future::{Future, IntoFuture};
use std::io;
use std::marker::PhantomData;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::panic::AssertUnwindSafe;
use std::pin::{Pin, pin};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Wake, Waker};
use std::thread;

/// A single threaded io_uring event loop.
///
/// A `Reactor` owns one kernel ring and two queues of deferred work: a local
/// queue only its own thread touches, and a remote queue any thread can push
/// to. It is bound to one thread at a time with
/// [`bind_this_thread`](Reactor::bind_this_thread), and driven by
/// [`run`](Reactor::run), [`poll`](Reactor::poll) or
/// [`block_on`](Reactor::block_on) on that thread.
///
/// Each loop iteration resumes every computation whose operation completed,
/// then starts cross-thread spawns, runs cross-thread jobs, runs local jobs,
/// and finally submits new operations, blocking until something happens when
/// there is nothing left to do.
///
/// `Reactor` is a cheap handle, clones refer to the same event loop.
#[derive(Clone)]
pub struct Reactor {
    inner: Arc<Inner>,
}

/// Non-owning handle to a [`Reactor`], obtained with
/// [`Reactor::downgrade`].
///
/// Detached tasks that need to reach their reactor should capture this
/// instead of a `Reactor` clone. The reactor owns its detached tasks, so a
/// task that never completes and holds a strong handle keeps the reactor, its
/// ring and its eventfd alive forever.
#[derive(Clone)]
pub struct WeakReactor {
    inner: Weak<Inner>,
}

struct Inner {
    id: usize,

    cfg: ReactorConfig,

    /// Thread the reactor is bound to.
    owner: Mutex<Option<thread::ThreadId>>,

    stopped: AtomicBool,

    /// The only state other threads may touch.
    remote: Mutex<Remote>,

    notifier: Notifier,

    core: OwnedCore,
}

#[derive(Default)]
struct Remote {
    spawns: Vec<Arc<RawTask>>,
    tasks: VecDeque<Job>,
}

struct OwnedCore(Core);

// Safety: the core is only reached through `Reactor::core`, whose callers are
// running on the thread the reactor is bound to.
unsafe impl Sync for OwnedCore {}

/// Interrupts a blocked loop from other threads. Writes are coalesced until
/// the loop picks them up.
struct Notifier {
    fd: OwnedFd,
    notified: AtomicBool,
}

impl Notifier {
    fn try_new() -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            // Safety: freshly created and owned by nobody else.
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
            notified: AtomicBool::new(false),
        })
    }

    fn notify(&self) {
        if self.notified.swap(true, Ordering::AcqRel) {
            return;
        }

        let buf = 1u64.to_ne_bytes();
        let ret = unsafe { libc::write(self.fd.as_raw_fd(), buf.as_ptr().cast(), buf.len()) };
        if ret < 0 {
            tracing::warn!(error = %io::Error::last_os_error(), "failed to notify reactor");
        }
    }

    // Must run before the remote queue is drained.
    fn reset(&self) {
        self.notified.store(false, Ordering::Release);
    }

    fn is_pending(&self) -> bool {
        self.notified.load(Ordering::Acquire)
    }

    // Consumes the eventfd counter after its poll fired. Returns the number of
    // writes folded into it, zero if there was nothing to read.
    fn drain(&self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        let ret = unsafe { libc::read(self.fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };

        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(0);
            }
            return Err(err);
        }

        if ret as usize != buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("short eventfd read of {ret} bytes"),
            ));
        }

        Ok(u64::from_ne_bytes(buf))
    }
}

/// Whether a pending stop request ends the loop driving a turn. A loop that
/// is about to return must not block in the kernel first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopPolicy {
    Return,

    /// `block_on` only returns with its future.
    Ignore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Block in the kernel when idle.
    Wait,

    /// Never block, yield the thread every so often.
    Spin,
}

impl Reactor {
    /// Creates a reactor with the default configuration.
    pub fn new() -> Result<Reactor> {
        Builder::new().try_build()
    }

    pub(crate) fn with_config(cfg: ReactorConfig) -> Result<Reactor> {
        static NEXT_ID: AtomicUsize = AtomicUsize::new(0);

        let core = Core::try_new(&cfg)?;
        let notifier = Notifier::try_new()?;
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(reactor.id = id, ring_size = cfg.ring_size, "created reactor");

        Ok(Reactor {
            inner: Arc::new(Inner {
                id,
                cfg,
                owner: Mutex::new(None),
                stopped: AtomicBool::new(false),
                remote: Mutex::new(Remote::default()),
                notifier,
                core: OwnedCore(core),
            }),
        })
    }

    /// Creates a handle that does not keep the reactor alive.
    pub fn downgrade(&self) -> WeakReactor {
        WeakReactor {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// # Safety
    ///
    /// The caller must run on the thread this reactor is bound to, which holds
    /// whenever it is the current context.
    pub(crate) unsafe fn core(&self) -> &Core {
        &self.inner.core.0
    }

    /// Binds the reactor to the calling thread and makes it the current
    /// context until the returned guard is dropped.
    pub fn bind_this_thread(&self) -> Result<BindGuard, ReactorError> {
        match context::current_context() {
            Some(current) if current == *self => return Err(ReactorError::AlreadyBound),
            Some(_) => return Err(ReactorError::MultipleContexts),
            None => {}
        }

        {
            let mut owner = self.inner.owner.lock();
            if owner.is_some() {
                return Err(ReactorError::WrongThread);
            }
            *owner = Some(thread::current().id());
        }

        context::set_current(Some(self.clone()));
        tracing::debug!(reactor.id = self.inner.id, "bound reactor to thread");

        Ok(BindGuard {
            reactor: self.clone(),
            _not_send: PhantomData,
        })
    }

    /// Whether the calling thread is the one this reactor is bound to.
    pub fn is_in_local_thread(&self) -> bool {
        context::is_current(self)
    }

    fn check_bound(&self) -> Result<(), ReactorError> {
        match context::current_context() {
            Some(current) if current == *self => Ok(()),
            Some(_) => Err(ReactorError::MultipleContexts),
            None if self.inner.owner.lock().is_some() => Err(ReactorError::WrongThread),
            None => Err(ReactorError::NotBound),
        }
    }

    /// Runs the event loop until [`request_stop`](Reactor::request_stop) is
    /// called from work running on the loop or another thread.
    ///
    /// The stop flag is cleared on entry, so a stop requested before `run` is
    /// discarded.
    pub fn run(&self) -> Result<(), ReactorError> {
        self.run_loop(None, Mode::Wait)
    }

    /// Like [`run`](Reactor::run), also returning once `token` is cancelled.
    pub fn run_with(&self, token: &CancellationToken) -> Result<(), ReactorError> {
        self.run_loop(Some(token), Mode::Wait)
    }

    /// Spinning variant of [`run`](Reactor::run) that never blocks in the
    /// kernel. The thread yields after a configurable number of iterations
    /// without work.
    pub fn poll(&self) -> Result<(), ReactorError> {
        self.run_loop(None, Mode::Spin)
    }

    pub fn poll_with(&self, token: &CancellationToken) -> Result<(), ReactorError> {
        self.run_loop(Some(token), Mode::Spin)
    }

    fn run_loop(&self, token: Option<&CancellationToken>, mode: Mode) -> Result<(), ReactorError> {
        self.check_bound()?;
        self.inner.stopped.store(false, Ordering::Release);

        // Wakes a blocked loop so it sees the cancellation.
        let _registration = token.map(|token| {
            let weak = self.downgrade();
            token.on_cancel(move || {
                if let Some(reactor) = weak.upgrade() {
                    reactor.inner.notifier.notify();
                }
            })
        });

        // Safety: bound to this thread, checked above.
        let core = unsafe { self.core() };

        while !self.is_stopped() && !token.is_some_and(CancellationToken::is_cancelled) {
            let may_block = mode == Mode::Wait
                && !token.is_some_and(CancellationToken::is_cancelled);
            let work = self.turn(core, may_block, StopPolicy::Return, None)?;

            if mode == Mode::Spin {
                self.pace(core, work);
            }
        }

        Ok(())
    }

    // Yields the thread after too many consecutive empty iterations.
    fn pace(&self, core: &Core, work: usize) {
        if work > 0 {
            core.empty_iterations.set(0);
            return;
        }

        let empty = core.empty_iterations.get() + 1;
        if empty >= self.inner.cfg.poll_yield_interval {
            core.empty_iterations.set(0);
            thread::yield_now();
        } else {
            core.empty_iterations.set(empty);
        }
    }

    /// One loop iteration. Returns how many completions and jobs ran.
    fn turn(
        &self,
        core: &Core,
        may_block: bool,
        stop: StopPolicy,
        root_woken: Option<&AtomicBool>,
    ) -> Result<usize, ReactorError> {
        let drained = core.process_cqes();
        if drained.woken {
            if let Err(e) = self.inner.notifier.drain() {
                tracing::warn!(reactor.id = self.inner.id, error = %e, "failed to drain notifier");
            }
        }
        self.inner.notifier.reset();

        let (spawns, tasks) = {
            let mut remote = self.inner.remote.lock();
            (
                std::mem::take(&mut remote.spawns),
                std::mem::take(&mut remote.tasks),
            )
        };

        let mut work = drained.completions + spawns.len() + tasks.len();

        for task in spawns {
            core.insert_detached(Arc::clone(&task));
            task.run();
        }

        for job in tasks {
            job();
        }

        work += core.drain_local();

        if work > 0 {
            tracing::trace!(reactor.id = self.inner.id, work, "loop iteration");
        }

        let block = may_block
            && !self.inner.cfg.io_polling
            && !core.has_local_tasks()
            && !(stop == StopPolicy::Return && self.is_stopped())
            && !self.inner.notifier.is_pending()
            && !root_woken.is_some_and(|woken| woken.load(Ordering::Acquire))
            && core.arm_wakeup(self.inner.notifier.fd.as_raw_fd()).is_ok();

        let want = usize::from(block);
        core.ring
            .borrow_mut()
            .submit_and_wait(want)
            .map_err(|e| ReactorError::Ring(e.raw_os_error().unwrap_or(libc::EIO)))?;

        Ok(work)
    }

    fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Asks the loop to return at the next iteration boundary. Work already
    /// picked up by the current iteration still runs.
    pub fn request_stop(&self) {
        self.inner.stopped.store(true, Ordering::Release);

        if !self.is_in_local_thread() {
            self.inner.notifier.notify();
        }
    }

    /// Queues `job` to run on the reactor's thread. Never runs it inline,
    /// even when called from that thread.
    pub fn post<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.post_job(Box::new(job));
    }

    fn post_job(&self, job: Job) {
        if self.is_in_local_thread() {
            // Safety: on the bound thread.
            unsafe { self.core() }.push_local(job);
            return;
        }

        self.inner.remote.lock().tasks.push_back(job);
        self.inner.notifier.notify();
    }

    /// Runs `job` right away when called from the reactor's thread, otherwise
    /// queues it like [`post`](Reactor::post).
    pub fn dispatch<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_in_local_thread() {
            job();
        } else {
            self.post_job(Box::new(job));
        }
    }

    /// Moves the awaiting computation onto the reactor's thread. Completes
    /// immediately if it already runs there.
    pub fn schedule(&self) -> Schedule {
        Schedule {
            reactor: self.clone(),
            hop: None,
        }
    }

    /// Runs `awaitable` as a detached task owned by the reactor.
    ///
    /// A panic inside the task is logged and only ends that task. The task is
    /// released from the reactor once it completes. From another thread the
    /// task is handed over and started by the next loop iteration.
    ///
    /// Tasks still pending when the last handle to the reactor goes away are
    /// dropped with it. A task holding a `Reactor` clone counts as such a
    /// handle, so capture a [`WeakReactor`] in tasks that may never complete.
    pub fn spawn<F>(&self, awaitable: F) -> Id
    where
        F: IntoFuture,
        F::IntoFuture: Send + 'static,
    {
        let id = Id::next();
        let body = awaitable.into_future();

        let entry = async move {
            if let Err(payload) = AssertUnwindSafe(body).catch_unwind().await {
                tracing::error!(
                    task.id = %id,
                    panic = panic_message(&*payload),
                    "detached task panicked"
                );
            }
        };

        let weak = self.downgrade();
        let task = RawTask::with_id(id, entry, move || {
            let Some(reactor) = weak.upgrade() else {
                return;
            };

            let weak = reactor.downgrade();
            reactor.dispatch(move || {
                if let Some(reactor) = weak.upgrade() {
                    reactor.erase_detached(id);
                }
            });
        });

        tracing::debug!(reactor.id = self.inner.id, task.id = %id, "spawned detached task");

        if self.is_in_local_thread() {
            // Safety: on the bound thread.
            unsafe { self.core() }.insert_detached(Arc::clone(&task));
            task.run();
        } else {
            self.inner.remote.lock().spawns.push(task);
            self.inner.notifier.notify();
        }

        id
    }

    fn erase_detached(&self, id: Id) {
        if !self.is_in_local_thread() {
            return;
        }

        // Safety: on the bound thread.
        if unsafe { self.core() }.erase_detached(id) {
            tracing::debug!(reactor.id = self.inner.id, task.id = %id, "released detached task");
        }
    }

    /// Number of detached tasks still owned by the reactor. Only readable
    /// from the reactor's thread.
    pub fn num_detached(&self) -> Result<usize, ReactorError> {
        self.check_bound()?;

        // Safety: bound to this thread, checked above.
        Ok(unsafe { self.core() }.num_detached())
    }

    /// Drives `future` to completion on the calling thread, running the event
    /// loop in between polls.
    ///
    /// Binds the reactor to the thread for the duration of the call unless it
    /// already is. A stop request does not end `block_on`, only the future
    /// completing does.
    ///
    /// # Panics
    ///
    /// Panics if the reactor cannot be bound to the calling thread.
    #[track_caller]
    pub fn block_on<F: IntoFuture>(&self, future: F) -> F::Output {
        let _guard = match self.bind_this_thread() {
            Ok(guard) => Some(guard),
            Err(ReactorError::AlreadyBound) => None,
            Err(e) => panic!("cannot block on reactor: {e}"),
        };

        let root = Arc::new(RootWaker {
            woken: AtomicBool::new(true),
            reactor: self.downgrade(),
        });
        let waker = Waker::from(Arc::clone(&root));
        let mut cx = Context::from_waker(&waker);

        let mut future = pin!(future.into_future());

        // Safety: bound to this thread above.
        let core = unsafe { self.core() };

        loop {
            if root.woken.swap(false, Ordering::AcqRel) {
                if let Poll::Ready(out) = future.as_mut().poll(&mut cx) {
                    return out;
                }
            }

            let may_block = !self.inner.cfg.io_polling;
            if let Err(e) = self.turn(core, may_block, StopPolicy::Ignore, Some(&root.woken)) {
                panic!("reactor loop failed: {e}");
            }
        }
    }
}

impl PartialEq for Reactor {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Reactor {}

impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reactor")
            .field("id", &self.inner.id)
            .field("cfg", &self.inner.cfg)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl WeakReactor {
    /// Returns the reactor if any strong handle to it is still alive.
    pub fn upgrade(&self) -> Option<Reactor> {
        self.inner.upgrade().map(|inner| Reactor { inner })
    }
}

impl fmt::Debug for WeakReactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakReactor").finish_non_exhaustive()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "<non-string panic payload>"
    }
}

/// Keeps a reactor bound to the thread that created it.
#[must_use = "the reactor is unbound when the guard is dropped"]
#[derive(Debug)]
pub struct BindGuard {
    reactor: Reactor,

    // The binding is per thread.
    _not_send: PhantomData<*const ()>,
}

impl Drop for BindGuard {
    fn drop(&mut self) {
        context::set_current(None);
        *self.reactor.inner.owner.lock() = None;
        tracing::debug!(reactor.id = self.reactor.inner.id, "unbound reactor from thread");
    }
}

struct RootWaker {
    woken: AtomicBool,
    reactor: WeakReactor,
}

impl Wake for RootWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.woken.store(true, Ordering::Release);

        if let Some(reactor) = self.reactor.upgrade() {
            if !reactor.is_in_local_thread() {
                reactor.inner.notifier.notify();
            }
        }
    }
}

struct Hop {
    done: AtomicBool,
    waker: AtomicWaker,
}

/// Future returned by [`Reactor::schedule`].
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct Schedule {
    reactor: Reactor,
    hop: Option<Arc<Hop>>,
}

impl Suspend for Schedule {
    type Output = ();

    fn ready(&self) -> bool {
        match &self.hop {
            Some(hop) => hop.done.load(Ordering::Acquire),
            None => self.reactor.is_in_local_thread(),
        }
    }

    fn suspend(self: Pin<&mut Self>, waker: &Waker) -> bool {
        let this = self.get_mut();

        if let Some(hop) = &this.hop {
            hop.waker.register(waker);
            return !hop.done.load(Ordering::Acquire);
        }

        let hop = Arc::new(Hop {
            done: AtomicBool::new(false),
            waker: AtomicWaker::new(),
        });
        hop.waker.register(waker);

        let resume = Arc::clone(&hop);
        this.reactor.post(move || {
            resume.done.store(true, Ordering::Release);
            resume.waker.wake();
        });

        this.hop = Some(hop);
        true
    }

    fn resume(self: Pin<&mut Self>) {}
}

impl Future for Schedule {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        poll_suspend(self, cx)
    }
}

impl fmt::Debug for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schedule")
            .field("reactor", &self.reactor)
            .field("posted", &self.hop.is_some())
            .finish()
    }
}
