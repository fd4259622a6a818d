use std::any::Any;
use std::fmt;
use std::task::Waker;

/// State of one operation slot. The slot key is what the kernel carries in
/// `user_data`, so a completion can never point at freed memory: at worst it
/// finds a vacant or reused key.
pub(crate) enum RawSqe {
    /// Submitted, waiting for the kernel. Holds the continuation.
    Pending { waker: Option<Waker> },

    /// The kernel reported a result that was not yet collected.
    Completed { result: i32, flags: u32 },

    /// The issuing envelope was dropped while the operation was in flight. The
    /// box owns whatever the kernel may still write into or read from.
    Orphaned(Box<dyn Any + Send>),
}

/// What the completion drain has to do after a slot saw its CQE. Wakers and
/// orphaned owners are handed back so they run outside of any borrow.
pub(crate) enum CompletionEffect {
    Wake(Waker),
    Release(Box<dyn Any + Send>),
    Stored,
    Duplicate,
}

impl RawSqe {
    pub(crate) fn new(waker: &Waker) -> Self {
        RawSqe::Pending {
            waker: Some(waker.clone()),
        }
    }

    pub(crate) fn is_completed(&self) -> bool {
        matches!(self, RawSqe::Completed { .. })
    }

    pub(crate) fn set_waker(&mut self, waker: &Waker) {
        if let RawSqe::Pending { waker: slot } = self {
            // No need to override waker if they are related.
            if slot.as_ref().is_some_and(|w| w.will_wake(waker)) {
                return;
            }

            *slot = Some(waker.clone());
        }
    }

    pub(crate) fn on_completion(&mut self, result: i32, flags: u32) -> CompletionEffect {
        match self {
            RawSqe::Pending { waker } => {
                let waker = waker.take();
                *self = RawSqe::Completed { result, flags };

                match waker {
                    Some(waker) => CompletionEffect::Wake(waker),
                    None => CompletionEffect::Stored,
                }
            }
            RawSqe::Orphaned(_) => {
                let RawSqe::Orphaned(owner) = std::mem::replace(self, RawSqe::Pending { waker: None })
                else {
                    unreachable!("slot is orphaned");
                };
                CompletionEffect::Release(owner)
            }
            RawSqe::Completed { .. } => CompletionEffect::Duplicate,
        }
    }
}

impl fmt::Debug for RawSqe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawSqe::Pending { waker } => f
                .debug_struct("Pending")
                .field("has_waker", &waker.is_some())
                .finish(),
            RawSqe::Completed { result, flags } => f
                .debug_struct("Completed")
                .field("result", result)
                .field("flags", flags)
                .finish(),
            RawSqe::Orphaned(_) => f.write_str("Orphaned"),
        }
    }
}
