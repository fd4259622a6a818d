use crate::protocol::{Suspend, poll_suspend};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, Waker};

/// An awaitable that is immediately ready with `value`.
pub fn just<T>(value: T) -> Just<T> {
    Just { value: Some(value) }
}

/// Future returned by [`just`].
#[derive(Debug, Clone)]
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct Just<T> {
    value: Option<T>,
}

// The value is never pinned.
impl<T> Unpin for Just<T> {}

impl<T> Suspend for Just<T> {
    type Output = T;

    fn ready(&self) -> bool {
        true
    }

    fn suspend(self: Pin<&mut Self>, _waker: &Waker) -> bool {
        false
    }

    fn resume(self: Pin<&mut Self>) -> T {
        let Some(value) = self.get_mut().value.take() else {
            panic!("`Just` polled after completion");
        };
        value
    }
}

impl<T> Future for Just<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        poll_suspend(self, cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{CloneCounter, mock_waker};
    use static_assertions::assert_impl_all;
    use std::sync::atomic::Ordering;

    assert_impl_all!(Just<CloneCounter>: Send, Unpin);

    #[test]
    fn test_ready_on_first_poll() {
        let (waker, data) = mock_waker();
        let mut cx = Context::from_waker(&waker);

        let value = CloneCounter::new();
        let clones = value.clones();
        let mut fut = just(value);

        assert!(fut.ready());
        assert!(matches!(Pin::new(&mut fut).poll(&mut cx), Poll::Ready(_)));
        assert_eq!(data.get_count(), 0);
        assert_eq!(clones.load(Ordering::Relaxed), 0);
    }

    #[test]
    #[should_panic(expected = "polled after completion")]
    fn test_second_poll_panics() {
        let (waker, _) = mock_waker();
        let mut cx = Context::from_waker(&waker);

        let mut fut = just(1);
        let _ = Pin::new(&mut fut).poll(&mut cx);
        let _ = Pin::new(&mut fut).poll(&mut cx);
    }
}
