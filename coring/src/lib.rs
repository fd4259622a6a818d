//! A single threaded io_uring reactor with composable, exactly-once
//! resumable computations.
//!
//! Every thread that performs I/O binds its own [`Reactor`]. Kernel
//! operations are issued with [`submit_io_task`], computations are wrapped in
//! lazily started [`Task`]s, and moved between reactors with
//! [`Reactor::schedule`], [`Reactor::post`] and [`Reactor::dispatch`].
//!
//! ```no_run
//! use coring::future::{read_at, write_at};
//! use std::os::fd::AsRawFd;
//!
//! #[coring::main]
//! async fn main() -> anyhow::Result<()> {
//!     let file = tempfile::tempfile()?;
//!     let fd = file.as_raw_fd();
//!
//!     write_at(fd, b"hello world.".to_vec(), 0).await?;
//!     let (n, buf) = read_at(fd, vec![0; 16], 0).await?;
//!     assert_eq!(&buf[..n], b"hello world.");
//!     Ok(())
//! }
//! ```

#[doc(inline)]
pub use coring_macros::main;

#[doc(inline)]
pub use coring_macros::test;

pub mod combinator;
pub use combinator::{AwaitableExt, flat_map, fmap, just, sync_wait, when_all};

mod context;
pub use context::current_context;

pub mod future;

pub mod protocol;
pub use protocol::{Suspend, Suspended, poll_suspend};

pub mod runtime;
pub use runtime::{BindGuard, Builder, CancellationToken, Reactor, ReactorError, WeakReactor};

mod sqe;
pub use sqe::{IoError, IoTask, cqe_result, submit_io_task};

pub mod task;
pub use task::Task;

mod utils;

#[cfg(test)]
mod test_utils;
