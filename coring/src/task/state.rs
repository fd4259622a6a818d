use std::sync::atomic::{AtomicU8, Ordering};

const WAITING: u8 = 0b01;
const DONE: u8 = 0b10;

/// Arbitrates the race between a producer finishing and its consumer
/// suspending.
///
/// Both sides set their own bit with a single `fetch_or` and look at the
/// other side's bit in the returned value. Exactly one of them observes the
/// other bit already set, and that side is the one responsible for moving on:
/// either the consumer does not suspend, or the producer wakes the consumer.
#[derive(Debug, Default)]
pub(crate) struct CompletionFlag {
    state: AtomicU8,
}

impl CompletionFlag {
    pub(crate) const fn new() -> Self {
        Self {
            state: AtomicU8::new(0),
        }
    }

    /// Consumer side. Returns `true` if the consumer must wait for a wakeup,
    /// `false` if the producer already finished.
    pub(crate) fn suspend(&self) -> bool {
        self.state.fetch_or(WAITING, Ordering::AcqRel) & DONE == 0
    }

    /// Producer side. Returns `true` if a consumer is waiting and must be woken.
    pub(crate) fn complete(&self) -> bool {
        self.state.fetch_or(DONE, Ordering::AcqRel) & WAITING != 0
    }

    pub(crate) fn is_done(&self) -> bool {
        self.state.load(Ordering::Acquire) & DONE != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn test_consumer_first() {
        let flag = CompletionFlag::new();
        assert!(flag.suspend());
        assert!(!flag.is_done());
        assert!(flag.complete());
        assert!(flag.is_done());
    }

    #[test]
    fn test_producer_first() {
        let flag = CompletionFlag::new();
        assert!(!flag.complete());
        assert!(!flag.suspend());
    }

    #[rstest]
    #[case::one(1)]
    #[case::ten(10)]
    #[case::thousand(1000)]
    fn test_exactly_one_side_resumes(#[case] trials: usize) {
        for _ in 0..trials {
            let flag = Arc::new(CompletionFlag::new());
            let resumes = Arc::new(AtomicUsize::new(0));
            let barrier = Arc::new(Barrier::new(2));

            let producer = {
                let (flag, resumes, barrier) =
                    (Arc::clone(&flag), Arc::clone(&resumes), Arc::clone(&barrier));
                thread::spawn(move || {
                    barrier.wait();
                    if flag.complete() {
                        resumes.fetch_add(1, Ordering::Relaxed);
                    }
                })
            };

            barrier.wait();
            if !flag.suspend() {
                resumes.fetch_add(1, Ordering::Relaxed);
            }

            producer.join().expect("producer panicked");
            assert_eq!(resumes.load(Ordering::Relaxed), 1);
        }
    }
}
