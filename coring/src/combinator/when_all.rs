use crate::combinator::counter::{CompletionCounter, Notify};
use crate::protocol::{Suspend, poll_suspend};
use crate::task::Task;
use std::any::Any;
use std::fmt;
use std::future::{Future, IntoFuture};
use std::panic;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

mod sealed {
    pub trait Sealed {}
}

/// A fixed set of tasks awaited together by [`WhenAll`].
///
/// Implemented for tuples of [`Task`]s, `Vec<Task<T>>` and borrowed slices
/// of tasks. Members are addressed by their input position.
pub trait Join: sealed::Sealed + Unpin {
    type Output;

    #[doc(hidden)]
    fn len(&self) -> usize;

    /// Starts member `index` if needed and registers `cx` as its continuation.
    #[doc(hidden)]
    fn poll_member(&mut self, index: usize, cx: &mut Context<'_>) -> Poll<()>;

    #[doc(hidden)]
    fn take_failure(&mut self, index: usize) -> Option<Box<dyn Any + Send>>;

    /// Collects every output in input order. All members finished successfully.
    #[doc(hidden)]
    fn take_outputs(&mut self) -> Self::Output;
}

/// Conversion into the member set of a [`WhenAll`].
pub trait IntoWhenAll {
    type Join: Join;

    fn into_join(self) -> Self::Join;
}

/// Waits for every awaitable in `awaitables` and returns their outputs in
/// input order.
///
/// Accepts tuples of up to eight awaitables, a `Vec` of awaitables, or a
/// mutable slice of [`Task`]s. Owned inputs are moved into the combinator,
/// which starts and owns them. A borrowed slice stays owned by the caller and
/// the outputs are returned by reference.
///
/// Members that finish with `()` still occupy their slot. If members fail,
/// the combinator waits for all of them before raising the failure that
/// happened first.
pub fn when_all<I: IntoWhenAll>(awaitables: I) -> WhenAll<I::Join> {
    WhenAll {
        join: awaitables.into_join(),
        stage: Stage::Idle,
    }
}

enum Stage {
    Idle,
    Waiting(Arc<CompletionCounter>),
    Done,
}

/// Future returned by [`when_all`].
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct WhenAll<J> {
    join: J,
    stage: Stage,
}

impl<J: Join> WhenAll<J> {
    // Starts every member with a waker bound to its slot.
    fn start(&mut self, waker: &Waker) -> bool {
        let len = self.join.len();
        let counter = Arc::new(CompletionCounter::new(len));
        counter.register(waker);

        for index in 0..len {
            let notify = Waker::from(Arc::new(Notify {
                counter: Arc::clone(&counter),
                index,
            }));

            if self
                .join
                .poll_member(index, &mut Context::from_waker(&notify))
                .is_ready()
            {
                counter.notify_complete_one(index);
            }
        }

        let pending = counter.arm();
        self.stage = Stage::Waiting(counter);
        pending
    }
}

impl<J: Join> Suspend for WhenAll<J> {
    type Output = J::Output;

    fn ready(&self) -> bool {
        match &self.stage {
            Stage::Waiting(counter) => counter.is_done(),
            Stage::Idle | Stage::Done => false,
        }
    }

    fn suspend(self: Pin<&mut Self>, waker: &Waker) -> bool {
        let this = self.get_mut();

        match &this.stage {
            Stage::Idle => this.start(waker),
            Stage::Waiting(counter) => {
                counter.register(waker);
                !counter.is_done()
            }
            Stage::Done => panic!("`WhenAll` polled after completion"),
        }
    }

    fn resume(self: Pin<&mut Self>) -> J::Output {
        let this = self.get_mut();

        let Stage::Waiting(counter) = std::mem::replace(&mut this.stage, Stage::Done) else {
            panic!("`WhenAll` resumed before completion");
        };

        // Every member is done, this only moves results into place.
        let mut cx = Context::from_waker(Waker::noop());
        for index in 0..this.join.len() {
            if this.join.poll_member(index, &mut cx).is_pending() {
                unreachable!("member {index} counted as finished but still pending");
            }
        }

        for index in counter.finish_order() {
            if let Some(payload) = this.join.take_failure(index) {
                panic::resume_unwind(payload);
            }
        }

        this.join.take_outputs()
    }
}

impl<J: Join> Future for WhenAll<J> {
    type Output = J::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<J::Output> {
        poll_suspend(self, cx)
    }
}

impl<J: Join> fmt::Debug for WhenAll<J> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage = match &self.stage {
            Stage::Idle => "Idle",
            Stage::Waiting(_) => "Waiting",
            Stage::Done => "Done",
        };

        f.debug_struct("WhenAll")
            .field("len", &self.join.len())
            .field("stage", &stage)
            .finish()
    }
}

impl<T: Send + 'static> sealed::Sealed for Vec<Task<T>> {}

impl<T: Send + 'static> Join for Vec<Task<T>> {
    type Output = Vec<T>;

    fn len(&self) -> usize {
        Vec::len(self)
    }

    fn poll_member(&mut self, index: usize, cx: &mut Context<'_>) -> Poll<()> {
        self[index].poll_ready(cx)
    }

    fn take_failure(&mut self, index: usize) -> Option<Box<dyn Any + Send>> {
        self[index].take_failure()
    }

    fn take_outputs(&mut self) -> Vec<T> {
        self.iter_mut().map(Task::take_output).collect()
    }
}

impl<F> IntoWhenAll for Vec<F>
where
    F: IntoFuture,
    F::IntoFuture: Send + 'static,
    F::Output: Send + 'static,
{
    type Join = Vec<Task<F::Output>>;

    fn into_join(self) -> Self::Join {
        self.into_iter().map(Task::new).collect()
    }
}

impl<T: Send + 'static> sealed::Sealed for &mut [Task<T>] {}

impl<'a, T: Send + 'static> Join for &'a mut [Task<T>] {
    type Output = Vec<&'a T>;

    fn len(&self) -> usize {
        <[Task<T>]>::len(self)
    }

    fn poll_member(&mut self, index: usize, cx: &mut Context<'_>) -> Poll<()> {
        self[index].poll_ready(cx)
    }

    fn take_failure(&mut self, index: usize) -> Option<Box<dyn Any + Send>> {
        self[index].take_failure()
    }

    fn take_outputs(&mut self) -> Vec<&'a T> {
        let tasks: &'a mut [Task<T>] = std::mem::take(self);
        let tasks: &'a [Task<T>] = tasks;
        tasks.iter().map(Task::output).collect()
    }
}

impl<'a, T: Send + 'static> IntoWhenAll for &'a mut [Task<T>] {
    type Join = Self;

    fn into_join(self) -> Self {
        self
    }
}

impl<'a, T: Send + 'static> IntoWhenAll for &'a mut Vec<Task<T>> {
    type Join = &'a mut [Task<T>];

    fn into_join(self) -> Self::Join {
        self.as_mut_slice()
    }
}

macro_rules! impl_when_all_tuple {
    ($len:literal => $($idx:tt $T:ident $F:ident),+) => {
        impl<$($T: Send + 'static),+> sealed::Sealed for ($(Task<$T>,)+) {}

        impl<$($T: Send + 'static),+> Join for ($(Task<$T>,)+) {
            type Output = ($($T,)+);

            fn len(&self) -> usize {
                $len
            }

            fn poll_member(&mut self, index: usize, cx: &mut Context<'_>) -> Poll<()> {
                match index {
                    $($idx => self.$idx.poll_ready(cx),)+
                    _ => unreachable!("no member at index {index}"),
                }
            }

            fn take_failure(&mut self, index: usize) -> Option<Box<dyn Any + Send>> {
                match index {
                    $($idx => self.$idx.take_failure(),)+
                    _ => unreachable!("no member at index {index}"),
                }
            }

            fn take_outputs(&mut self) -> Self::Output {
                ($(self.$idx.take_output(),)+)
            }
        }

        impl<$($F),+> IntoWhenAll for ($($F,)+)
        where
            $(
                $F: IntoFuture,
                <$F as IntoFuture>::IntoFuture: Send + 'static,
                <$F as IntoFuture>::Output: Send + 'static,
            )+
        {
            type Join = ($(Task<<$F as IntoFuture>::Output>,)+);

            fn into_join(self) -> Self::Join {
                ($(Task::new(self.$idx),)+)
            }
        }
    };
}

impl_when_all_tuple!(1 => 0 T0 F0);
impl_when_all_tuple!(2 => 0 T0 F0, 1 T1 F1);
impl_when_all_tuple!(3 => 0 T0 F0, 1 T1 F1, 2 T2 F2);
impl_when_all_tuple!(4 => 0 T0 F0, 1 T1 F1, 2 T2 F2, 3 T3 F3);
impl_when_all_tuple!(5 => 0 T0 F0, 1 T1 F1, 2 T2 F2, 3 T3 F3, 4 T4 F4);
impl_when_all_tuple!(6 => 0 T0 F0, 1 T1 F1, 2 T2 F2, 3 T3 F3, 4 T4 F4, 5 T5 F5);
impl_when_all_tuple!(7 => 0 T0 F0, 1 T1 F1, 2 T2 F2, 3 T3 F3, 4 T4 F4, 5 T5 F5, 6 T6 F6);
impl_when_all_tuple!(8 => 0 T0 F0, 1 T1 F1, 2 T2 F2, 3 T3 F3, 4 T4 F4, 5 T5 F5, 6 T6 F6, 7 T7 F7);
