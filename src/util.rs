//! Small conversion helpers shared by the ring and its callers: duration to
//! kernel timespec, iovec construction, and interpretation of raw completion
//! codes.

use std::{io, time::Duration};

use io_uring::types::Timespec;
use nix::libc;

/// Convert a [Duration] into the kernel timespec representation used by the
/// timeout opcodes.
pub fn timespec(dur: Duration) -> Timespec {
    Timespec::new().sec(dur.as_secs()).nsec(dur.subsec_nanos())
}

/// Build an iovec describing an immutable buffer, for use with the vectored
/// and registered-buffer operations. The kernel never writes through it, but
/// the iovec ABI carries a mutable base pointer either way.
pub fn iovec(buf: &[u8]) -> libc::iovec {
    libc::iovec {
        iov_base: buf.as_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    }
}

/// Build an iovec describing a mutable buffer the kernel may write into.
pub fn iovec_mut(buf: &mut [u8]) -> libc::iovec {
    libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    }
}

/// Interpret a raw completion code, turning `-errno` values into an
/// [io::Error].
///
/// `-ETIME` is how an expired timeout reports itself and is passed through as
/// success, so a plain `ring.timeout(..).await` can be funnelled through this
/// without special casing.
pub fn completion_result(ret: i32) -> io::Result<i32> {
    if ret >= 0 || ret == -libc::ETIME {
        Ok(ret)
    } else {
        Err(io::Error::from_raw_os_error(-ret))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timespec_splits_seconds_and_nanos() {
        let ts = timespec(Duration::new(1, 500_000_000));
        // Timespec exposes no field accessors; compare debug renderings
        // against an identically built value.
        let expected = Timespec::new().sec(1).nsec(500_000_000);
        assert_eq!(format!("{ts:?}"), format!("{expected:?}"));
    }

    #[test]
    fn iovec_covers_whole_buffer() {
        let buf = [0u8; 16];
        let iov = iovec(&buf);
        assert_eq!(iov.iov_base as *const u8, buf.as_ptr());
        assert_eq!(iov.iov_len, 16);
    }

    #[test]
    fn completion_result_maps_errno() {
        assert_eq!(completion_result(5).unwrap(), 5);
        assert_eq!(completion_result(0).unwrap(), 0);
        assert_eq!(completion_result(-libc::ETIME).unwrap(), -libc::ETIME);

        let err = completion_result(-libc::EBADF).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EBADF));
    }
}
