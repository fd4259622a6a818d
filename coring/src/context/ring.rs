use crate::runtime::ReactorConfig;
use crate::sqe::IoError;
use anyhow::Result;
use io_uring::squeue::Entry;
use io_uring::{CompletionQueue, IoUring, SubmissionQueue};
use smallvec::SmallVec;
use std::io;

// Used wherever we rely on SmallVec to store entries on stack first.
pub(crate) const SPILL_TO_HEAP_THRESHOLD: usize = 16;

/// Snapshot of one completion queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Cqe {
    pub(crate) user_data: u64,
    pub(crate) result: i32,
    pub(crate) flags: u32,
}

/// The kernel ring owned by one reactor.
///
/// Unlike a single issuer ring, submissions may come from whichever thread the
/// reactor is currently bound to, so the ring is created without
/// `IORING_SETUP_SINGLE_ISSUER`.
pub(crate) struct ReactorRing {
    ring: IoUring,
}

impl ReactorRing {
    pub(crate) fn try_new(cfg: &ReactorConfig) -> Result<Self> {
        let mut builder = IoUring::builder();

        builder.setup_cqsize((cfg.ring_size * cfg.cq_ring_size_multiplier) as u32);

        if cfg.io_polling {
            builder.setup_iopoll();
        }

        if cfg.sq_polling {
            builder.setup_sqpoll(cfg.sq_poll_idle);

            if let Some(cpu) = cfg.sq_cpu_affinity {
                builder.setup_sqpoll_cpu(cpu);
            }
        }

        let ring = builder.build(cfg.ring_size as u32)?;

        // Check features and warn users.
        if !ring.params().is_feature_nodrop() {
            tracing::warn!(
                "IORING_FEAT_NODROP is not enabled for this kernel. The kernel will silently drop completions if the CQ ring is full."
            );
        }

        Ok(ReactorRing { ring })
    }

    pub(crate) fn sq(&mut self) -> SubmissionQueue<'_> {
        self.ring.submission()
    }

    pub(crate) fn cq(&mut self) -> CompletionQueue<'_> {
        self.ring.completion()
    }

    pub(crate) fn num_unsubmitted_sqes(&mut self) -> usize {
        self.sq().len()
    }

    #[cfg(test)]
    pub(crate) fn has_ready_cqes(&mut self) -> bool {
        !self.cq().is_empty()
    }

    /// Pushes one entry. A full submission queue is reported, never retried.
    pub(crate) fn push(&mut self, entry: &Entry) -> Result<(), IoError> {
        // Safety: the caller keeps every buffer referenced by `entry` alive
        // until the matching completion is drained.
        unsafe { self.sq().push(entry).map_err(IoError::from) }
    }

    /// Submits pending entries and blocks until `num_to_wait` completions are
    /// available. A signal interrupting the wait is not an error.
    pub(crate) fn submit_and_wait(&mut self, num_to_wait: usize) -> io::Result<usize> {
        // Sync user space and kernel shared queue
        self.ring.submission().sync();

        match self.ring.submitter().submit_and_wait(num_to_wait) {
            Ok(n) => Ok(n),
            Err(e) if e.raw_os_error() == Some(libc::EINTR) => Ok(0),

            // The CQ ring overflowed and the kernel refuses new submissions
            // until completions are reaped, which the next iteration does.
            Err(e) if e.raw_os_error() == Some(libc::EBUSY) => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// Copies every ready completion out of the ring so they can be dispatched
    /// without holding a borrow on the ring.
    pub(crate) fn reap(&mut self) -> SmallVec<[Cqe; SPILL_TO_HEAP_THRESHOLD]> {
        let mut cq = self.cq();
        cq.sync();

        cq.map(|cqe| Cqe {
            user_data: cqe.user_data(),
            result: cqe.result(),
            flags: cqe.flags().into(),
        })
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Builder;
    use crate::test_utils::*;
    use rstest::rstest;

    fn ring_with_size(ring_size: usize) -> Result<ReactorRing> {
        let cfg = ReactorConfig::try_from(Builder::new().ring_size(ring_size))?;
        ReactorRing::try_new(&cfg)
    }

    #[rstest]
    #[case::ring_32(32)]
    #[case::ring_64(64)]
    #[case::ring_128(128)]
    fn test_sq_and_cq_capacity(#[case] ring_size: usize) -> Result<()> {
        let mut ring = ring_with_size(ring_size)?;

        assert_eq!(ring.sq().capacity(), ring_size);
        assert_eq!(ring.cq().capacity(), ring_size * 2);
        assert_eq!(ring.num_unsubmitted_sqes(), 0);

        Ok(())
    }

    #[rstest]
    #[case::one(1)]
    #[case::four(4)]
    #[case::sixteen(16)]
    #[case::spill_to_heap(40)]
    fn test_push_submit_and_reap(#[case] n: usize) -> Result<()> {
        let mut ring = ring_with_size(64)?;

        for i in 0..n {
            ring.push(&nop().user_data(i as u64))?;
        }
        assert_eq!(ring.num_unsubmitted_sqes(), n);

        ring.submit_and_wait(n)?;
        assert_eq!(ring.num_unsubmitted_sqes(), 0);
        assert!(ring.has_ready_cqes());

        let mut cqes = ring.reap();
        cqes.sort_by_key(|cqe| cqe.user_data);

        assert_eq!(cqes.len(), n);
        for (i, cqe) in cqes.iter().enumerate() {
            assert_eq!(cqe.user_data, i as u64);
            assert_eq!(cqe.result, 0);
        }
        assert!(!ring.has_ready_cqes());

        Ok(())
    }

    #[test]
    fn test_sq_ring_full() -> Result<()> {
        let mut ring = ring_with_size(4)?;

        for _ in 0..4 {
            ring.push(&nop())?;
        }

        assert!(matches!(ring.push(&nop()), Err(IoError::SqRingFull(_))));
        Ok(())
    }
}
