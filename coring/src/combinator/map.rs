use crate::task::Task;
use pin_project::pin_project;
use std::fmt;
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::task::{Context, Poll, ready};

/// Future returned by [`fmap`].
#[pin_project]
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct Fmap<F, M> {
    #[pin]
    inner: F,
    map: Option<M>,
}

impl<F, M, U> Future for Fmap<F, M>
where
    F: Future,
    M: FnOnce(F::Output) -> U,
{
    type Output = U;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<U> {
        let this = self.project();
        let value = ready!(this.inner.poll(cx));

        let Some(map) = this.map.take() else {
            panic!("`Fmap` polled after completion");
        };

        Poll::Ready(map(value))
    }
}

impl<F: fmt::Debug, M> fmt::Debug for Fmap<F, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fmap")
            .field("inner", &self.inner)
            .field("done", &self.map.is_none())
            .finish()
    }
}

/// Applies `map` to the output of `awaitable`.
///
/// `map` runs inline when the output is produced, on whichever thread resumes
/// the awaiting computation. No task is created.
pub fn fmap<F, M, U>(awaitable: F, map: M) -> Fmap<F::IntoFuture, M>
where
    F: IntoFuture,
    M: FnOnce(F::Output) -> U,
{
    Fmap {
        inner: awaitable.into_future(),
        map: Some(map),
    }
}

/// Chains a second awaitable, built from the output of the first.
///
/// The composition is a single [`Task`]: it starts lazily and a failure of
/// either step is raised where its result is obtained.
pub fn flat_map<F, M, G>(awaitable: F, then: M) -> Task<G::Output>
where
    F: IntoFuture,
    F::IntoFuture: Send + 'static,
    M: FnOnce(F::Output) -> G + Send + 'static,
    G: IntoFuture,
    G::IntoFuture: Send + 'static,
    G::Output: Send + 'static,
{
    let first = awaitable.into_future();
    Task::new(async move {
        let second = then(first.await).into_future();
        second.await
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate as coring;
    use crate::combinator::{AwaitableExt, Just, just, sync_wait};
    use crate::future::delay;
    use crate::runtime::Reactor;
    use crate::sqe::IoError;
    use anyhow::Result;
    use std::panic::{self, AssertUnwindSafe};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_fmap_runs_inline() {
        let caller = thread::current().id();

        let (value, ran_on) = sync_wait(fmap(async { 20 }, |v| (v + 1, thread::current().id())));

        assert_eq!(value, 21);
        assert_eq!(ran_on, caller);
    }

    #[coring::test]
    async fn test_fmap_on_io_result() -> Result<()> {
        let waited = fmap(delay(Duration::from_millis(1)), |res| res.map(|()| "waited")).await?;
        assert_eq!(waited, "waited");
        Ok(())
    }

    #[coring::test]
    async fn test_flat_map_chains_steps() -> Result<()> {
        let len = just(String::from("coring"))
            .flat_map(|name| async move {
                delay(Duration::from_millis(1)).await?;
                Ok::<_, IoError>(name.len())
            })
            .await?;

        assert_eq!(len, 6);
        Ok(())
    }

    #[test]
    fn test_flat_map_is_lazy() {
        let task = flat_map(async { 1 }, |_: i32| -> Just<u32> { panic!("never started") });
        drop(task);
    }

    #[test]
    fn test_flat_map_failure_from_either_step() {
        let first = panic::catch_unwind(AssertUnwindSafe(|| {
            sync_wait(flat_map(async { panic!("first step") }, |()| just(1)))
        }));
        assert_eq!(
            first.expect_err("first step should fail").downcast_ref::<&str>(),
            Some(&"first step")
        );

        let second = panic::catch_unwind(AssertUnwindSafe(|| {
            sync_wait(flat_map(async { 1 }, |_: i32| -> Just<u32> {
                panic!("second step")
            }))
        }));
        assert_eq!(
            second.expect_err("second step should fail").downcast_ref::<&str>(),
            Some(&"second step")
        );
    }

    #[coring::test]
    async fn test_ext_methods_compose() -> Result<()> {
        let reactor = crate::context::current_context().expect("bound by the test macro");

        let doubled = async { 21 }
            .fmap(|v| v * 2)
            .flat_map(move |v| {
                let reactor: Reactor = reactor;
                async move {
                    reactor.schedule().await;
                    v
                }
            })
            .await;

        assert_eq!(doubled, 42);
        Ok(())
    }
}
