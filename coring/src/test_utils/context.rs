use crate::runtime::{BindGuard, Builder, CancellationToken, Reactor};
use anyhow::Result;
use std::sync::mpsc;
use std::thread;

/// Builds a reactor and binds it to the calling thread. Drop the guard before
/// the reactor.
#[must_use]
pub(crate) fn bind_reactor(ring_size: Option<usize>) -> Result<(Reactor, BindGuard)> {
    let reactor = Builder::new().ring_size(ring_size.unwrap_or(64)).try_build()?;
    let guard = reactor.bind_this_thread()?;

    Ok((reactor, guard))
}

/// Runs a fresh reactor on its own thread until `token` is cancelled or the
/// reactor is asked to stop. Returns once the loop is about to start.
pub(crate) fn spawn_reactor(
    token: CancellationToken,
) -> Result<(Reactor, thread::JoinHandle<Result<()>>)> {
    let (tx, rx) = mpsc::channel();

    let handle = thread::spawn(move || -> Result<()> {
        let (reactor, _guard) = bind_reactor(None)?;
        tx.send(reactor.clone())?;
        reactor.run_with(&token)?;
        Ok(())
    });

    let reactor = rx.recv()?;
    Ok((reactor, handle))
}
