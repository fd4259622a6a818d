//! Composition of awaitables.
//!
//! Everything here works with any [`IntoFuture`], including [`Task`]s,
//! I/O operations and other combinators, and follows the same exactly-once
//! resumption rules as the rest of the crate.

use crate::task::Task;
use std::future::IntoFuture;

pub(crate) mod counter;

mod just;
pub use self::just::{Just, just};

mod map;
pub use self::map::{Fmap, flat_map, fmap};

mod sync_wait;
pub use self::sync_wait::sync_wait;

mod when_all;
pub use self::when_all::{IntoWhenAll, Join, WhenAll, when_all};

/// Method forms of [`fmap`] and [`flat_map`].
pub trait AwaitableExt: IntoFuture + Sized {
    fn fmap<M, U>(self, map: M) -> Fmap<Self::IntoFuture, M>
    where
        M: FnOnce(Self::Output) -> U,
    {
        fmap(self, map)
    }

    fn flat_map<M, G>(self, then: M) -> Task<G::Output>
    where
        Self::IntoFuture: Send + 'static,
        M: FnOnce(Self::Output) -> G + Send + 'static,
        G: IntoFuture,
        G::IntoFuture: Send + 'static,
        G::Output: Send + 'static,
    {
        flat_map(self, then)
    }
}

impl<F: IntoFuture> AwaitableExt for F {}
