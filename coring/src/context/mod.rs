use crate::runtime::{Reactor, ReactorError};
use std::cell::RefCell;
use std::thread_local;

mod core;
pub(crate) use self::core::{Core, Job};

pub(crate) mod ring;
pub(crate) use self::ring::ReactorRing;

pub(crate) mod slab;
pub(crate) use self::slab::RawSqeSlab;

thread_local! {
    static CURRENT: RefCell<Option<Reactor>> = const { RefCell::new(None) };
}

/// The reactor bound to the calling thread, if any.
///
/// Operations issued through [`submit_io_task`](crate::submit_io_task) go to
/// this reactor, so code running on the reactor never needs to carry a handle
/// around.
pub fn current_context() -> Option<Reactor> {
    CURRENT
        .try_with(|current| current.borrow().clone())
        .ok()
        .flatten()
}

pub(crate) fn is_current(reactor: &Reactor) -> bool {
    CURRENT
        .try_with(|current| current.borrow().as_ref() == Some(reactor))
        .unwrap_or(false)
}

// Installs or clears the current reactor, returning the previous one.
pub(crate) fn set_current(reactor: Option<Reactor>) -> Option<Reactor> {
    CURRENT
        .try_with(|current| current.replace(reactor))
        .ok()
        .flatten()
}

/// Runs `f` against the core of the reactor bound to this thread.
#[inline(always)]
pub(crate) fn try_with_core<F, R>(f: F) -> Result<R, ReactorError>
where
    F: FnOnce(&Core) -> R,
{
    CURRENT
        .try_with(|current| {
            let current = current.borrow();
            let reactor = current.as_ref().ok_or(ReactorError::NotBound)?;

            // Safety: CURRENT only holds a reactor on the thread it is bound to.
            Ok(f(unsafe { reactor.core() }))
        })
        .unwrap_or(Err(ReactorError::NotBound))
}

#[cfg(test)]
#[track_caller]
pub(crate) fn with_core<F, R>(f: F) -> R
where
    F: FnOnce(&Core) -> R,
{
    match try_with_core(f) {
        Ok(res) => res,
        Err(e) => panic!("{e}"),
    }
}

#[cfg(test)]
pub(crate) fn with_slab_mut<F, R>(f: F) -> R
where
    F: FnOnce(&mut RawSqeSlab) -> R,
{
    with_core(|core| f(&mut core.slab.borrow_mut()))
}

#[cfg(test)]
pub(crate) fn with_ring_mut<F, R>(f: F) -> R
where
    F: FnOnce(&mut ReactorRing) -> R,
{
    with_core(|core| f(&mut core.ring.borrow_mut()))
}

#[cfg(test)]
pub(crate) fn with_slab_and_ring_mut<F, R>(f: F) -> R
where
    F: FnOnce(&mut RawSqeSlab, &mut ReactorRing) -> R,
{
    with_core(|core| {
        let mut slab = core.slab.borrow_mut();
        let mut ring = core.ring.borrow_mut();
        f(&mut slab, &mut ring)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Builder;
    use anyhow::Result;
    use std::panic::catch_unwind;
    use std::thread;

    #[test]
    fn test_no_context_outside_bound_thread() -> Result<()> {
        assert!(current_context().is_none());
        assert_eq!(try_with_core(|_| ()), Err(ReactorError::NotBound));
        assert!(catch_unwind(|| with_core(|_| ())).is_err());
        Ok(())
    }

    #[test]
    fn test_context_is_thread_local() -> Result<()> {
        let a = Builder::new().ring_size(32).try_build()?;
        let b = Builder::new().ring_size(64).try_build()?;

        let _guard = a.bind_this_thread()?;
        assert_eq!(current_context().as_ref(), Some(&a));

        with_slab_and_ring_mut(|slab, ring| {
            assert!(slab.capacity() >= 64);
            assert_eq!(ring.sq().capacity(), 32);
        });

        let handle = thread::spawn(move || -> Result<()> {
            assert!(current_context().is_none());

            let _guard = b.bind_this_thread()?;
            assert_eq!(current_context().as_ref(), Some(&b));
            with_ring_mut(|ring| assert_eq!(ring.sq().capacity(), 64));
            Ok(())
        });

        handle.join().expect("thread panicked")?;

        with_ring_mut(|ring| assert_eq!(ring.sq().capacity(), 32));
        Ok(())
    }

    #[test]
    fn test_context_cleared_when_guard_dropped() -> Result<()> {
        let reactor = Builder::new().ring_size(8).try_build()?;

        {
            let _guard = reactor.bind_this_thread()?;
            assert!(is_current(&reactor));
            with_slab_mut(|slab| assert_eq!(slab.len(), 0));
        }

        assert!(!is_current(&reactor));
        assert!(current_context().is_none());
        Ok(())
    }
}
