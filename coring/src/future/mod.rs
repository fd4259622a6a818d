//! Ready-made kernel operations built on [`submit_io_task`](crate::submit_io_task).
//!
//! Buffers are passed by value and handed back on completion. They are owned
//! by the operation while the kernel may access them, even if the returned
//! future is dropped early.

mod ops;
pub use ops::{close, delay, fsync, nop, openat, read_at, timeout, write_at};
