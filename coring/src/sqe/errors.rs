use crate::runtime::ReactorError;
use io_uring::squeue::PushError;
use std::io::{self, Error};

/// Errors produced while issuing or completing an I/O operation.
#[derive(thiserror::Error, Debug)]
pub enum IoError {
    /// The submission queue ring for io_uring is full. The operation was never
    /// handed to the kernel.
    #[error("Submission queue ring is full, cannot submit IO")]
    SqRingFull(#[from] PushError),

    /// Every operation slot is taken by an in-flight operation.
    #[error("Slab allocator is full, cannot allocate new resource")]
    SlabFull,

    /// The operation was issued from a thread without a usable reactor.
    #[error("Reactor error: {0}")]
    Context(#[from] ReactorError),

    /// The kernel completed the operation with a negative result code.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl IoError {
    pub(crate) fn from_errno(errno: i32) -> Self {
        IoError::Io(Error::from_raw_os_error(errno))
    }

    /// Resource exhaustion errors go away once in-flight operations complete.
    /// The reactor never retries on its own, callers decide.
    pub fn is_retryable(&self) -> bool {
        match self {
            IoError::SlabFull => true,
            IoError::SqRingFull { .. } => true,
            IoError::Io(e) => e
                .raw_os_error()
                .is_some_and(|errno| matches!(errno, libc::EAGAIN | libc::EINTR)),
            _ => false,
        }
    }

    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            IoError::Io(e) => e.raw_os_error(),
            _ => None,
        }
    }
}

impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::SqRingFull { .. }, Self::SqRingFull { .. }) => true,
            (Self::SlabFull, Self::SlabFull) => true,
            (Self::Context(a), Self::Context(b)) => a == b,
            (Self::Io(a), Self::Io(b)) => match (a.raw_os_error(), b.raw_os_error()) {
                (Some(a), Some(b)) => a == b,
                _ => a.kind() == b.kind(),
            },
            _ => false,
        }
    }
}

impl From<IoError> for io::Error {
    fn from(e: IoError) -> Self {
        match e {
            IoError::Io(io_err) => io_err,
            _ => Error::other(e.to_string()),
        }
    }
}

/// Maps a raw completion code to its success value or a structured error.
pub fn cqe_result(res: i32) -> Result<u32, IoError> {
    if res < 0 {
        Err(IoError::from_errno(-res))
    } else {
        Ok(res as u32)
    }
}
