/// Errors reported by a [`Reactor`](crate::Reactor).
///
/// Binding violations are usage errors: they are reported instead of
/// tolerated, but are not expected to be recovered from at runtime.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactorError {
    #[error("reactor is not bound to this thread, call `bind_this_thread()` before `run()`")]
    NotBound,

    #[error("more than one reactor bound to this thread")]
    MultipleContexts,

    #[error("reactor is bound to another thread and cannot run on multiple threads")]
    WrongThread,

    #[error("reactor is already bound to this thread")]
    AlreadyBound,

    /// Entering the kernel ring failed, carries the errno.
    #[error("io_uring_enter failed with errno {0}")]
    Ring(i32),
}
