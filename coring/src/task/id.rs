use std::sync::atomic::{AtomicU64, Ordering};
use std::{fmt, num::NonZeroU64};

/// An opaque ID that uniquely identifies a suspended computation for the
/// lifetime of the process.
///
/// IDs are handed out from a global counter, they are never reused and are
/// only meant for logging and bookkeeping.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct Id(pub(crate) NonZeroU64);

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Id {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);

        let id = COUNTER.fetch_add(1, Ordering::Relaxed);

        // Safety: this number is unimaginably large, even if the runtime was
        // creating 1 billion task/sec, it would take 584 years to wrap around.
        let Some(id) = NonZeroU64::new(id) else {
            Self::exhausted();
        };

        Self(id)
    }

    #[cold]
    fn exhausted() -> ! {
        panic!("failed to generate unique task ID: bitspace exhausted")
    }

    pub fn as_u64(&self) -> u64 {
        self.0.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    #[test]
    fn test_new_task_id_unique_across_threads() {
        let per_thread = 64;

        let handles = (0..4)
            .map(|_| thread::spawn(move || (0..per_thread).map(|_| Id::next()).collect::<Vec<_>>()))
            .collect::<Vec<_>>();

        let all_ids = handles
            .into_iter()
            .flat_map(|h| h.join().expect("id thread panicked"))
            .collect::<HashSet<_>>();

        assert_eq!(all_ids.len(), 4 * per_thread);
    }
}
