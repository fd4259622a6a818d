// Public API
mod builder;
pub use builder::Builder;
pub(crate) use builder::ReactorConfig;

mod cancel;
pub use cancel::{CancelRegistration, CancellationToken};

mod errors;
pub use errors::ReactorError;

mod reactor;
pub use reactor::{BindGuard, Reactor, Schedule, WeakReactor};
