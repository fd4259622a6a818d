use crate::context::ring::{Cqe, SPILL_TO_HEAP_THRESHOLD};
use crate::context::{RawSqeSlab, ReactorRing};
use crate::runtime::ReactorConfig;
use crate::sqe::{CompletionEffect, IoError};
use crate::task::{Id, RawTask};
use anyhow::Result;
use io_uring::{opcode, types};
use smallvec::SmallVec;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::os::unix::io::RawFd;
use std::sync::Arc;

/// Deferred zero argument action executed on the reactor's thread.
pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// `user_data` of the eventfd poll used to interrupt a blocked loop. Slab keys
/// never reach this value.
pub(crate) const WAKE_TOKEN: u64 = u64::MAX;

/// State of one reactor that is only touched from the thread it is bound to.
/// All fields use interior mutability so several of them can be borrowed at
/// once, but no borrow is ever held while user code runs.
pub(crate) struct Core {
    // Declared first so the ring is closed before the slots it may still
    // reference are released.
    pub(crate) ring: RefCell<ReactorRing>,

    /// In-flight operations, keyed by the SQE `user_data`.
    pub(crate) slab: RefCell<RawSqeSlab>,

    pub(crate) local_tasks: RefCell<VecDeque<Job>>,

    /// Fire-and-forget computations owned by the reactor until they finish.
    pub(crate) detached: RefCell<HashMap<Id, Arc<RawTask>>>,

    /// Whether the eventfd poll is currently in the ring.
    pub(crate) wake_armed: Cell<bool>,

    /// Consecutive iterations of `poll()` that found nothing to do.
    pub(crate) empty_iterations: Cell<usize>,
}

/// Outcome of one completion drain.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Drained {
    pub(crate) completions: usize,
    pub(crate) woken: bool,
}

impl Core {
    pub(crate) fn try_new(cfg: &ReactorConfig) -> Result<Self> {
        let ring = ReactorRing::try_new(cfg)?;

        Ok(Core {
            ring: RefCell::new(ring),
            slab: RefCell::new(RawSqeSlab::new(
                cfg.ring_size * cfg.cq_ring_size_multiplier,
            )),
            local_tasks: RefCell::new(VecDeque::new()),
            detached: RefCell::new(HashMap::new()),
            wake_armed: Cell::new(false),
            empty_iterations: Cell::new(0),
        })
    }

    /// Stores every ready completion in its slot and resumes the waiting
    /// continuations, in ring order.
    pub(crate) fn process_cqes(&self) -> Drained {
        let cqes: SmallVec<[Cqe; SPILL_TO_HEAP_THRESHOLD]> = self.ring.borrow_mut().reap();
        let mut drained = Drained::default();

        for cqe in cqes {
            if cqe.user_data == WAKE_TOKEN {
                self.wake_armed.set(false);
                drained.woken = true;
                continue;
            }

            drained.completions += 1;

            let effect = self
                .slab
                .borrow_mut()
                .complete(cqe.user_data as usize, cqe.result, cqe.flags);

            match effect {
                Ok(CompletionEffect::Wake(waker)) => waker.wake(),
                Ok(CompletionEffect::Release(owner)) => drop(owner),
                Ok(CompletionEffect::Stored) => {}
                Ok(CompletionEffect::Duplicate) => {
                    tracing::warn!(key = cqe.user_data, "duplicate completion ignored");
                }
                Err(e) => {
                    tracing::warn!(key = cqe.user_data, error = %e, "completion for unknown slot");
                }
            }
        }

        drained
    }

    pub(crate) fn push_local(&self, job: Job) {
        self.local_tasks.borrow_mut().push_back(job);
    }

    pub(crate) fn has_local_tasks(&self) -> bool {
        !self.local_tasks.borrow().is_empty()
    }

    /// Runs the jobs queued so far. Jobs queued while draining run on the next
    /// call.
    pub(crate) fn drain_local(&self) -> usize {
        let jobs = std::mem::take(&mut *self.local_tasks.borrow_mut());
        let n = jobs.len();

        for job in jobs {
            job();
        }

        n
    }

    /// Puts the eventfd poll back in the ring if the last one fired.
    pub(crate) fn arm_wakeup(&self, fd: RawFd) -> Result<(), IoError> {
        if self.wake_armed.get() {
            return Ok(());
        }

        let entry = opcode::PollAdd::new(types::Fd(fd), libc::POLLIN as u32)
            .build()
            .user_data(WAKE_TOKEN);

        self.ring.borrow_mut().push(&entry)?;
        self.wake_armed.set(true);
        Ok(())
    }

    pub(crate) fn insert_detached(&self, task: Arc<RawTask>) {
        self.detached.borrow_mut().insert(task.id(), task);
    }

    /// Releases a finished detached task.
    pub(crate) fn erase_detached(&self, id: Id) -> bool {
        let task = self.detached.borrow_mut().remove(&id);
        task.is_some()
    }

    pub(crate) fn num_detached(&self) -> usize {
        self.detached.borrow().len()
    }
}
