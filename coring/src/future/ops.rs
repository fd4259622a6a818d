use crate::sqe::{IoError, cqe_result, submit_io_task};
use io_uring::opcode;
use io_uring::types::{Fd, TimeoutFlags, Timespec};
use std::ffi::CString;
use std::future::Future;
use std::os::fd::{FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::time::Duration;

/// Completes immediately with no effect. Useful to measure the round trip
/// through the ring.
pub fn nop() -> impl Future<Output = Result<(), IoError>> + Send {
    let entry = opcode::Nop::new().build();
    submit_io_task(move || entry, |res, _| cqe_result(res).map(|_| ()))
}

/// Timer that fires after `when`, or at `when` with `TimeoutFlags::ABS`.
///
/// Expiry is reported by the kernel as `-ETIME` and counts as success.
pub fn timeout(
    when: Duration,
    flags: TimeoutFlags,
) -> impl Future<Output = Result<(), IoError>> + Send {
    // Boxed so the address handed to the kernel survives moving the future.
    let timespec = Box::new(Timespec::from(when));
    let entry = opcode::Timeout::new(std::ptr::from_ref(&*timespec))
        .count(0)
        .flags(flags)
        .build();

    submit_io_task(move || entry, move |res, _| {
        let _timespec = timespec;
        match res {
            res if res == -libc::ETIME => Ok(()),
            res => cqe_result(res).map(|_| ()),
        }
    })
}

/// Suspends the caller for `duration`.
pub fn delay(duration: Duration) -> impl Future<Output = Result<(), IoError>> + Send {
    timeout(duration, TimeoutFlags::empty())
}

/// Opens `path` relative to `dirfd` (`libc::AT_FDCWD` for the working
/// directory). `O_CLOEXEC` is always added.
pub fn openat<P: AsRef<Path>>(
    dirfd: RawFd,
    path: P,
    flags: i32,
    mode: u32,
) -> impl Future<Output = Result<OwnedFd, IoError>> + Send {
    let path = CString::new(path.as_ref().as_os_str().as_bytes());

    let (path, entry) = match path {
        Ok(path) => {
            let entry = opcode::OpenAt::new(Fd(dirfd), path.as_ptr())
                .flags(flags | libc::O_CLOEXEC)
                .mode(mode)
                .build();
            (Some(path), entry)
        }
        // Interior NUL, resolved without reaching the kernel.
        Err(_) => (None, opcode::Nop::new().build()),
    };

    submit_io_task(move || entry, move |res, _| {
        let Some(_path) = path else {
            return Err(IoError::from_errno(libc::EINVAL));
        };

        let fd = cqe_result(res)?;
        // Safety: the kernel just opened this descriptor for us.
        Ok(unsafe { OwnedFd::from_raw_fd(fd as RawFd) })
    })
}

/// Reads up to `buf.len()` bytes at `offset`. Resolves to the number of bytes
/// read and the buffer truncated to it. A single read covers at most
/// `u32::MAX` bytes.
pub fn read_at(
    fd: RawFd,
    mut buf: Vec<u8>,
    offset: u64,
) -> impl Future<Output = Result<(usize, Vec<u8>), IoError>> + Send {
    let entry = opcode::Read::new(Fd(fd), buf.as_mut_ptr(), op_len(buf.len()))
        .offset(offset)
        .build();

    submit_io_task(move || entry, move |res, _| {
        let n = cqe_result(res)? as usize;
        buf.truncate(n);
        Ok((n, buf))
    })
}

/// Writes `buf` at `offset`. Resolves to the number of bytes written, which
/// is short for buffers longer than `u32::MAX`.
pub fn write_at(
    fd: RawFd,
    buf: Vec<u8>,
    offset: u64,
) -> impl Future<Output = Result<usize, IoError>> + Send {
    let entry = opcode::Write::new(Fd(fd), buf.as_ptr(), op_len(buf.len()))
        .offset(offset)
        .build();

    submit_io_task(move || entry, move |res, _| {
        let _buf = buf;
        Ok(cqe_result(res)? as usize)
    })
}

pub fn fsync(fd: RawFd) -> impl Future<Output = Result<(), IoError>> + Send {
    let entry = opcode::Fsync::new(Fd(fd)).build();
    submit_io_task(move || entry, |res, _| cqe_result(res).map(|_| ()))
}

// Ring operations carry a 32 bit length, longer buffers are transferred short.
fn op_len(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

/// Closes `fd` through the ring.
pub fn close(fd: OwnedFd) -> impl Future<Output = Result<(), IoError>> + Send {
    let entry = opcode::Close::new(Fd(fd.into_raw_fd())).build();
    submit_io_task(move || entry, |res, _| cqe_result(res).map(|_| ()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate as coring;
    use crate::combinator::when_all;
    use anyhow::Result;
    use either::Either;
    use rstest::rstest;
    use std::io::{Read, Seek, SeekFrom, Write};
    use std::os::fd::AsRawFd;
    use std::time::Instant;

    #[coring::test]
    async fn test_nop() -> Result<()> {
        nop().await?;
        Ok(())
    }

    #[coring::test]
    async fn test_write_then_read_round_trip() -> Result<()> {
        let file = tempfile::tempfile()?;
        let fd = file.as_raw_fd();

        let written = write_at(fd, b"hello world.".to_vec(), 0).await?;
        assert_eq!(written, 12);

        fsync(fd).await?;

        let (n, buf) = read_at(fd, vec![0; 16], 0).await?;
        assert_eq!(n, 12);
        assert_eq!(buf, b"hello world.");
        Ok(())
    }

    #[coring::test]
    async fn test_read_at_offset_sees_std_writes() -> Result<()> {
        let mut file = tempfile::tempfile()?;
        file.write_all(b"0123456789")?;

        let (n, buf) = read_at(file.as_raw_fd(), vec![0; 4], 6).await?;
        assert_eq!(n, 4);
        assert_eq!(buf, b"6789");

        let (n, buf) = read_at(file.as_raw_fd(), vec![0; 4], 100).await?;
        assert_eq!(n, 0);
        assert!(buf.is_empty());
        Ok(())
    }

    #[coring::test]
    async fn test_write_visible_through_std() -> Result<()> {
        let mut file = tempfile::tempfile()?;

        write_at(file.as_raw_fd(), b"ring".to_vec(), 0).await?;

        let mut out = String::new();
        file.seek(SeekFrom::Start(0))?;
        file.read_to_string(&mut out)?;
        assert_eq!(out, "ring");
        Ok(())
    }

    #[coring::test]
    async fn test_delay_waits_at_least_duration() -> Result<()> {
        let start = Instant::now();
        delay(Duration::from_millis(123)).await?;
        assert!(start.elapsed() >= Duration::from_millis(123));
        Ok(())
    }

    #[coring::test]
    async fn test_delays_run_concurrently() -> Result<()> {
        let start = Instant::now();

        let (a, b) = when_all((
            delay(Duration::from_millis(100)),
            delay(Duration::from_millis(100)),
        ))
        .await;
        a?;
        b?;

        assert!(start.elapsed() < Duration::from_millis(190));
        Ok(())
    }

    #[coring::test]
    async fn test_openat_then_close() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("created");

        let fd = openat(
            libc::AT_FDCWD,
            &path,
            libc::O_CREAT | libc::O_WRONLY,
            0o644,
        )
        .await?;
        close(fd).await?;

        assert!(path.exists());
        Ok(())
    }

    #[rstest]
    #[case::missing_file("/definitely/not/here", Either::Right(libc::ENOENT))]
    #[case::interior_nul("bad\0path", Either::Right(libc::EINVAL))]
    #[case::root("/", Either::Left(()))]
    #[coring::test]
    async fn test_openat_errno(
        #[case] path: &str,
        #[case] expected: Either<(), i32>,
    ) -> Result<()> {
        let res = openat(libc::AT_FDCWD, path, libc::O_RDONLY, 0).await;

        match (res, expected) {
            (Ok(_fd), Either::Left(())) => {}
            (Err(e), Either::Right(errno)) => assert_eq!(e.raw_os_error(), Some(errno)),
            (res, expected) => panic!("got {res:?}, expected {expected:?}"),
        }

        Ok(())
    }

    #[rstest]
    #[case::empty(0, 0)]
    #[case::small(4096, 4096)]
    #[case::max(u32::MAX as usize, u32::MAX)]
    #[case::oversized(u32::MAX as usize + 1, u32::MAX)]
    fn test_op_len_clamps_to_ring_limit(#[case] len: usize, #[case] expected: u32) {
        assert_eq!(op_len(len), expected);
    }

    #[coring::test]
    async fn test_fsync_bad_fd() -> Result<()> {
        let err = fsync(-1).await.expect_err("fsync on -1 must fail");
        assert_eq!(err.raw_os_error(), Some(libc::EBADF));
        Ok(())
    }
}
