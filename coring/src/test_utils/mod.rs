use io_uring::opcode::Nop;
use io_uring::squeue::Entry;

mod context;
pub(crate) use context::{bind_reactor, spawn_reactor};

mod logging;
pub(crate) use logging::init_test_logging;

pub(crate) mod mocks;
pub(crate) use mocks::{CloneCounter, mock_waker};

pub(crate) fn nop() -> Entry {
    Nop::new().build()
}
