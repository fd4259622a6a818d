use crate::context::{self, try_with_core};
use crate::protocol::{Suspend, poll_suspend};
use crate::runtime::{Reactor, ReactorError, WeakReactor};
use io_uring::squeue::Entry;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, Waker};

pub(crate) mod errors;
pub use self::errors::{IoError, cqe_result};

pub(crate) mod raw;
pub(crate) use self::raw::{CompletionEffect, RawSqe};

/// Issues one kernel operation and resolves to its interpreted completion.
///
/// `fill` describes the operation, `interpret` turns the raw `(result, flags)`
/// pair of the completion into the caller's value. Nothing is submitted until
/// the returned value is first polled, at which point the operation goes to
/// the reactor bound to the polling thread.
pub fn submit_io_task<F, I, R>(fill: F, interpret: I) -> IoTask<F, I>
where
    F: FnOnce() -> Entry,
    I: FnOnce(i32, u32) -> Result<R, IoError> + Send + 'static,
{
    IoTask::new(fill, interpret, None)
}

enum Stage<F, I> {
    Unsubmitted {
        fill: F,
        interpret: I,
        target: Option<WeakReactor>,
    },
    Submitted {
        key: usize,
        interpret: I,
        reactor: WeakReactor,
    },
    Failed(IoError),
    Done,
}

/// The I/O operation envelope returned by [`submit_io_task`].
///
/// The slot holding the kernel's answer is identified by an index carried in
/// the SQE `user_data`. Dropping the envelope while the operation is in flight
/// is allowed: `interpret`, and every buffer it owns, is parked in the slot
/// until the kernel is done with it.
pub struct IoTask<F, I>
where
    I: Send + 'static,
{
    stage: Stage<F, I>,
}

// Nothing is ever pinned in place, `fill` and `interpret` are moved out.
impl<F, I: Send + 'static> Unpin for IoTask<F, I> {}

impl<F, I, R> IoTask<F, I>
where
    F: FnOnce() -> Entry,
    I: FnOnce(i32, u32) -> Result<R, IoError> + Send + 'static,
{
    pub(crate) fn new(fill: F, interpret: I, target: Option<WeakReactor>) -> Self {
        Self {
            stage: Stage::Unsubmitted {
                fill,
                interpret,
                target,
            },
        }
    }

    fn submit(
        fill: F,
        target: Option<WeakReactor>,
        waker: &Waker,
    ) -> Result<(usize, WeakReactor), IoError> {
        let reactor = context::current_context().ok_or(ReactorError::NotBound)?;

        if let Some(target) = target {
            if !target.upgrade().is_some_and(|t| t == reactor) {
                return Err(ReactorError::WrongThread.into());
            }
        }

        let entry = fill();

        let key = try_with_core(|core| -> Result<usize, IoError> {
            let mut slab = core.slab.borrow_mut();
            let reserved = slab.reserve_entry()?;
            let key = reserved.key();

            core.ring
                .borrow_mut()
                .push(&entry.user_data(key as u64))?;

            reserved.commit(RawSqe::new(waker));
            Ok(key)
        })??;

        Ok((key, reactor.downgrade()))
    }

    fn is_completed(key: usize, reactor: &WeakReactor) -> bool {
        if !Self::on_owner(reactor) {
            return false;
        }

        try_with_core(|core| {
            core.slab
                .borrow()
                .get(key)
                .is_ok_and(RawSqe::is_completed)
        })
        .unwrap_or(false)
    }

    fn on_owner(reactor: &WeakReactor) -> bool {
        reactor
            .upgrade()
            .is_some_and(|reactor| context::is_current(&reactor))
    }
}

impl<F, I, R> Suspend for IoTask<F, I>
where
    F: FnOnce() -> Entry,
    I: FnOnce(i32, u32) -> Result<R, IoError> + Send + 'static,
{
    type Output = Result<R, IoError>;

    fn ready(&self) -> bool {
        match &self.stage {
            Stage::Unsubmitted { .. } => false,
            Stage::Submitted { key, reactor, .. } => Self::is_completed(*key, reactor),
            Stage::Failed(_) => true,
            Stage::Done => panic!("Future polled after completion"),
        }
    }

    fn suspend(self: Pin<&mut Self>, waker: &Waker) -> bool {
        let this = self.get_mut();

        match std::mem::replace(&mut this.stage, Stage::Done) {
            Stage::Unsubmitted {
                fill,
                interpret,
                target,
            } => match Self::submit(fill, target, waker) {
                Ok((key, reactor)) => {
                    this.stage = Stage::Submitted {
                        key,
                        interpret,
                        reactor,
                    };
                    true
                }
                Err(e) => {
                    this.stage = Stage::Failed(e);
                    false
                }
            },
            Stage::Submitted {
                key,
                interpret,
                reactor,
            } => {
                // Off the owner thread the slot is out of reach, the waker
                // registered at submission still leads back to this task.
                let suspended = !Self::on_owner(&reactor)
                    || try_with_core(|core| match core.slab.borrow_mut().get_mut(key) {
                        Ok(sqe) if !sqe.is_completed() => {
                            sqe.set_waker(waker);
                            true
                        }
                        _ => false,
                    })
                    .unwrap_or(true);

                this.stage = Stage::Submitted {
                    key,
                    interpret,
                    reactor,
                };
                suspended
            }
            stage => {
                this.stage = stage;
                false
            }
        }
    }

    fn resume(self: Pin<&mut Self>) -> Self::Output {
        let this = self.get_mut();

        match std::mem::replace(&mut this.stage, Stage::Done) {
            Stage::Failed(e) => Err(e),
            Stage::Submitted {
                key,
                interpret,
                reactor,
            } => {
                let taken = try_with_core(|core| core.slab.borrow_mut().take_result(key))?;

                match taken? {
                    Some((result, flags)) => interpret(result, flags),
                    None => {
                        this.stage = Stage::Submitted {
                            key,
                            interpret,
                            reactor,
                        };
                        panic!("resumed before the kernel completed the operation")
                    }
                }
            }
            Stage::Unsubmitted { .. } => panic!("resumed before the operation was submitted"),
            Stage::Done => panic!("Future polled after completion"),
        }
    }
}

impl<F, I, R> Future for IoTask<F, I>
where
    F: FnOnce() -> Entry,
    I: FnOnce(i32, u32) -> Result<R, IoError> + Send + 'static,
{
    type Output = Result<R, IoError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        poll_suspend(self, cx)
    }
}

impl<F, I: Send + 'static> Drop for IoTask<F, I> {
    fn drop(&mut self) {
        let Stage::Submitted {
            key,
            interpret,
            reactor,
        } = std::mem::replace(&mut self.stage, Stage::Done)
        else {
            return;
        };

        let Some(reactor) = reactor.upgrade() else {
            // The ring is gone, nothing can touch the buffers anymore.
            return;
        };

        let owner: Box<dyn std::any::Any + Send> = Box::new(interpret);
        reactor.dispatch(move || orphan(key, owner));
    }
}

// Parks `owner` in the slot of an operation whose envelope went away.
fn orphan(key: usize, owner: Box<dyn std::any::Any + Send>) {
    let released = try_with_core(|core| core.slab.borrow_mut().orphan(key, owner));

    // Dropped outside of the slab borrow.
    drop(released);
}

impl<F, I: Send + 'static> fmt::Debug for IoTask<F, I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage = match &self.stage {
            Stage::Unsubmitted { .. } => "Unsubmitted".to_string(),
            Stage::Submitted { key, .. } => format!("Submitted({key})"),
            Stage::Failed(e) => format!("Failed({e})"),
            Stage::Done => "Done".to_string(),
        };

        f.debug_struct("IoTask").field("stage", &stage).finish()
    }
}

impl Reactor {
    /// Like [`submit_io_task`], but the operation must be issued while this
    /// reactor is the current context, otherwise it resolves to
    /// `IoError::Context(ReactorError::WrongThread)`.
    pub fn submit_io_task<F, I, R>(&self, fill: F, interpret: I) -> IoTask<F, I>
    where
        F: FnOnce() -> Entry,
        I: FnOnce(i32, u32) -> Result<R, IoError> + Send + 'static,
    {
        IoTask::new(fill, interpret, Some(self.downgrade()))
    }
}
