use pin_project::pin_project;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, Waker};

/// The contract every suspendable value in this crate follows.
///
/// A consumer first asks whether the result is already available with
/// [`Suspend::ready`]. If not, it hands its waker to [`Suspend::suspend`],
/// which returns whether the consumer actually has to wait. Once the value is
/// ready, [`Suspend::resume`] produces the output.
///
/// `suspend` can be called more than once with a newer waker when the consumer
/// is polled spuriously. Implementations must replace the stored waker and
/// must not restart the underlying work.
pub trait Suspend {
    type Output;

    /// Cheap synchronous check for an available result.
    fn ready(&self) -> bool;

    /// Registers `waker` as the continuation. Returns `false` if the value
    /// became ready while registering, in which case the caller resumes right
    /// away and the waker will not be called.
    fn suspend(self: Pin<&mut Self>, waker: &Waker) -> bool;

    /// Produces the final value. Calling it before the value is ready, or more
    /// than once, is a programming error.
    fn resume(self: Pin<&mut Self>) -> Self::Output;
}

/// Drives any [`Suspend`] implementation from a `Future::poll`.
pub fn poll_suspend<S>(mut s: Pin<&mut S>, cx: &mut Context<'_>) -> Poll<S::Output>
where
    S: Suspend + ?Sized,
{
    if s.ready() || !s.as_mut().suspend(cx.waker()) {
        return Poll::Ready(s.resume());
    }

    Poll::Pending
}

/// Adapter turning a [`Suspend`] implementation into a [`Future`].
#[pin_project]
#[derive(Debug)]
pub struct Suspended<S> {
    #[pin]
    inner: S,
}

impl<S: Suspend> Suspended<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: Suspend> Future for Suspended<S> {
    type Output = S::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        poll_suspend(self.project().inner, cx)
    }
}
