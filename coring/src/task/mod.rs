pub mod id;
pub use self::id::Id;

pub(crate) mod raw;
pub(crate) use self::raw::RawTask;

pub(crate) mod state;

#[allow(clippy::module_inception)]
mod task;
pub use self::task::{Borrowed, Task, WhenReady};
