use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Wake, Waker};

#[derive(Debug, Default)]
pub(crate) struct WakerData {
    pub wake_count: AtomicUsize,
}

impl WakerData {
    pub(crate) fn get_count(&self) -> usize {
        self.wake_count.load(Ordering::Relaxed)
    }
}

impl Wake for WakerData {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.wake_count.fetch_add(1, Ordering::Relaxed);
    }
}

/// A waker that only counts how often it was woken.
pub(crate) fn mock_waker() -> (Waker, Arc<WakerData>) {
    let data = Arc::new(WakerData::default());
    (Waker::from(Arc::clone(&data)), data)
}

/// Value type that records how many times it was cloned. Moves are not
/// observable, so only copies are counted.
#[derive(Debug)]
pub(crate) struct CloneCounter {
    clones: Arc<AtomicUsize>,
}

impl CloneCounter {
    pub(crate) fn new() -> Self {
        Self {
            clones: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Counter shared by this value and all of its clones.
    pub(crate) fn clones(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.clones)
    }
}

impl Clone for CloneCounter {
    fn clone(&self) -> Self {
        self.clones.fetch_add(1, Ordering::Relaxed);
        Self {
            clones: Arc::clone(&self.clones),
        }
    }
}
