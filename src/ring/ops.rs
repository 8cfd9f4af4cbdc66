//! The operation surface: one method per supported opcode, each preparing a
//! single submission entry and returning an awaitable [Op].
//!
//! Shared shape: build the opcode entry, wrap it with the pass-through
//! submission flags into an [Op], await it. Nothing is submitted to the
//! kernel here; the driver batches submissions when the loop next waits (or
//! the gatekeeper flushes under pressure).
//!
//! Results are the raw completion codes: `>= 0` is the operation's success
//! value (bytes transferred, the new descriptor, ...), `< 0` is `-errno`.
//! The surface never interprets them; [crate::util::completion_result] is
//! available for callers that want an [std::io::Result] view.
//!
//! Pointer lifetimes: submissions carry raw pointers into caller memory.
//! Buffers and iovec/msghdr/sockaddr arguments are borrowed by the returned
//! future, and an armed future drives the ring on drop until its completion
//! arrives, so those pointers stay valid for as long as the kernel can use
//! them. Leaking an armed future (`mem::forget`) voids that guarantee.

use std::{ffi::CStr, mem, os::fd::RawFd, time::Duration};

use io_uring::{
    opcode,
    squeue,
    types::{self, Fd},
};
use nix::{errno::Errno, libc};

use super::{op::Op, Ring};
use crate::util;

impl Ring {
    fn prepare(&self, entry: squeue::Entry, iflags: squeue::Flags) -> Op<'_> {
        Op::new(self, entry, iflags)
    }

    /// Read from a file descriptor at a given offset, like `pread(2)`.
    ///
    /// Decays to a single-element [Ring::readv] on kernels without the
    /// linear read opcode.
    pub async fn read(&self, fd: RawFd, buf: &mut [u8], offset: u64, iflags: squeue::Flags) -> i32 {
        if self.support.rw {
            let entry = opcode::Read::new(Fd(fd), buf.as_mut_ptr(), buf.len() as u32)
                .offset(offset)
                .build();
            self.prepare(entry, iflags).await
        } else {
            let iov = [util::iovec_mut(buf)];
            self.readv(fd, &iov, offset, iflags).await
        }
    }

    /// Write to a file descriptor at a given offset, like `pwrite(2)`.
    pub async fn write(&self, fd: RawFd, buf: &[u8], offset: u64, iflags: squeue::Flags) -> i32 {
        if self.support.rw {
            let entry = opcode::Write::new(Fd(fd), buf.as_ptr(), buf.len() as u32)
                .offset(offset)
                .build();
            self.prepare(entry, iflags).await
        } else {
            let iov = [util::iovec(buf)];
            self.writev(fd, &iov, offset, iflags).await
        }
    }

    /// Scatter read into multiple buffers at a given offset, like
    /// `preadv2(2)`.
    pub async fn readv(
        &self,
        fd: RawFd,
        iovecs: &[libc::iovec],
        offset: u64,
        iflags: squeue::Flags,
    ) -> i32 {
        let entry = opcode::Readv::new(Fd(fd), iovecs.as_ptr(), iovecs.len() as u32)
            .offset(offset)
            .build();
        self.prepare(entry, iflags).await
    }

    /// Gather write from multiple buffers at a given offset, like
    /// `pwritev2(2)`.
    pub async fn writev(
        &self,
        fd: RawFd,
        iovecs: &[libc::iovec],
        offset: u64,
        iflags: squeue::Flags,
    ) -> i32 {
        let entry = opcode::Writev::new(Fd(fd), iovecs.as_ptr(), iovecs.len() as u32)
            .offset(offset)
            .build();
        self.prepare(entry, iflags).await
    }

    /// Read into a buffer registered with [Ring::register_buffers].
    /// `buf_index` selects the registration slot; `buf` must lie inside it.
    pub async fn read_fixed(
        &self,
        fd: RawFd,
        buf: &mut [u8],
        offset: u64,
        buf_index: u16,
        iflags: squeue::Flags,
    ) -> i32 {
        let entry = opcode::ReadFixed::new(Fd(fd), buf.as_mut_ptr(), buf.len() as u32, buf_index)
            .offset(offset)
            .build();
        self.prepare(entry, iflags).await
    }

    /// Write from a buffer registered with [Ring::register_buffers].
    pub async fn write_fixed(
        &self,
        fd: RawFd,
        buf: &[u8],
        offset: u64,
        buf_index: u16,
        iflags: squeue::Flags,
    ) -> i32 {
        let entry = opcode::WriteFixed::new(Fd(fd), buf.as_ptr(), buf.len() as u32, buf_index)
            .offset(offset)
            .build();
        self.prepare(entry, iflags).await
    }

    /// Flush a file's in-core state to its backing device, like `fsync(2)`.
    /// [types::FsyncFlags::DATASYNC] selects the data-only variant.
    pub async fn fsync(&self, fd: RawFd, flags: types::FsyncFlags, iflags: squeue::Flags) -> i32 {
        let entry = opcode::Fsync::new(Fd(fd)).flags(flags).build();
        self.prepare(entry, iflags).await
    }

    /// Sync a byte range of a file with disk, like `sync_file_range(2)`.
    /// `range_flags` is the raw `SYNC_FILE_RANGE_*` set, unchanged.
    pub async fn sync_file_range(
        &self,
        fd: RawFd,
        offset: u64,
        len: u32,
        range_flags: u32,
        iflags: squeue::Flags,
    ) -> i32 {
        let entry = opcode::SyncFileRange::new(Fd(fd), len)
            .offset(offset)
            .flags(range_flags)
            .build();
        self.prepare(entry, iflags).await
    }

    /// Receive from a connected socket, like `recv(2)`. `flags` is the raw
    /// `MSG_*` set.
    ///
    /// Decays to a single-element [Ring::recvmsg] on kernels without the
    /// plain socket opcodes.
    pub async fn recv(&self, fd: RawFd, buf: &mut [u8], flags: i32, iflags: squeue::Flags) -> i32 {
        if self.support.socket_io {
            let entry = opcode::Recv::new(Fd(fd), buf.as_mut_ptr(), buf.len() as u32)
                .flags(flags)
                .build();
            self.prepare(entry, iflags).await
        } else {
            let mut iov = [util::iovec_mut(buf)];
            // SAFETY: an all-zero msghdr is the valid "no name, no control
            // data" message.
            let mut msg: libc::msghdr = unsafe { mem::zeroed() };
            msg.msg_iov = iov.as_mut_ptr();
            msg.msg_iovlen = 1;
            self.recvmsg(fd, &mut msg, flags as u32, iflags).await
        }
    }

    /// Send on a connected socket, like `send(2)`. `flags` is the raw
    /// `MSG_*` set.
    pub async fn send(&self, fd: RawFd, buf: &[u8], flags: i32, iflags: squeue::Flags) -> i32 {
        if self.support.socket_io {
            let entry = opcode::Send::new(Fd(fd), buf.as_ptr(), buf.len() as u32)
                .flags(flags)
                .build();
            self.prepare(entry, iflags).await
        } else {
            let mut iov = [util::iovec(buf)];
            // SAFETY: as in the recv fallback.
            let mut msg: libc::msghdr = unsafe { mem::zeroed() };
            msg.msg_iov = iov.as_mut_ptr();
            msg.msg_iovlen = 1;
            self.sendmsg(fd, &msg, flags as u32, iflags).await
        }
    }

    /// Receive a full message, scatter buffers and ancillary data included,
    /// like `recvmsg(2)`.
    pub async fn recvmsg(
        &self,
        fd: RawFd,
        msg: &mut libc::msghdr,
        flags: u32,
        iflags: squeue::Flags,
    ) -> i32 {
        let entry = opcode::RecvMsg::new(Fd(fd), msg as *mut libc::msghdr)
            .flags(flags)
            .build();
        self.prepare(entry, iflags).await
    }

    /// Send a full message, gather buffers and ancillary data included, like
    /// `sendmsg(2)`.
    pub async fn sendmsg(
        &self,
        fd: RawFd,
        msg: &libc::msghdr,
        flags: u32,
        iflags: squeue::Flags,
    ) -> i32 {
        let entry = opcode::SendMsg::new(Fd(fd), msg as *const libc::msghdr)
            .flags(flags)
            .build();
        self.prepare(entry, iflags).await
    }

    /// One-shot readiness notification, like `poll(2)` with a single fd. The
    /// result is the ready event mask.
    pub async fn poll(&self, fd: RawFd, poll_mask: u32, iflags: squeue::Flags) -> i32 {
        let entry = opcode::PollAdd::new(Fd(fd), poll_mask).build();
        self.prepare(entry, iflags).await
    }

    /// Queue a no-op. Its only observable effect is a trip through the
    /// driver, which is exactly what [Ring::yield_now] wants.
    pub async fn nop(&self, iflags: squeue::Flags) -> i32 {
        self.prepare(opcode::Nop::new().build(), iflags).await
    }

    /// Give the driver a chance to dispatch other completions before this
    /// computation continues.
    pub async fn yield_now(&self) {
        self.nop(squeue::Flags::empty()).await;
    }

    /// Accept a connection, like `accept4(2)`. `addr`/`addrlen` may be null
    /// when the peer address is not wanted; otherwise they must stay valid
    /// until the accept completes. The result is the new descriptor.
    pub async fn accept(
        &self,
        fd: RawFd,
        addr: *mut libc::sockaddr,
        addrlen: *mut libc::socklen_t,
        flags: i32,
        iflags: squeue::Flags,
    ) -> i32 {
        let entry = opcode::Accept::new(Fd(fd), addr, addrlen).flags(flags).build();
        self.prepare(entry, iflags).await
    }

    /// Initiate a connection, like `connect(2)`. `addr` must stay valid
    /// until the connect completes.
    pub async fn connect(
        &self,
        fd: RawFd,
        addr: *const libc::sockaddr,
        addrlen: libc::socklen_t,
        iflags: squeue::Flags,
    ) -> i32 {
        let entry = opcode::Connect::new(Fd(fd), addr, addrlen).build();
        self.prepare(entry, iflags).await
    }

    /// Sleep for a relative duration. Expiry reports `-ETIME`, which is the
    /// timer's success value, not a failure.
    pub async fn timeout(&self, dur: Duration, iflags: squeue::Flags) -> i32 {
        let ts = util::timespec(dur);
        // The timespec lives in this frame, which stays pinned until the
        // completion arrives; the kernel reads it at submit time.
        self.prepare(opcode::Timeout::new(&ts).build(), iflags).await
    }

    /// Arm a timeout against the previous submission, which must have been
    /// issued with [squeue::Flags::IO_LINK]. If the duration elapses first
    /// the linked operation completes with `-ECANCELED` and this one with
    /// `-ETIME`; if the operation finishes first this completes with
    /// `-ECANCELED`.
    pub async fn link_timeout(&self, dur: Duration, iflags: squeue::Flags) -> i32 {
        let ts = util::timespec(dur);
        self.prepare(opcode::LinkTimeout::new(&ts).build(), iflags).await
    }

    /// Open a file relative to a directory descriptor, like `openat(2)`.
    /// The result is the new descriptor.
    ///
    /// Decays to one yield plus the blocking syscall on kernels without the
    /// opcode.
    pub async fn openat(
        &self,
        dirfd: RawFd,
        path: &CStr,
        flags: i32,
        mode: libc::mode_t,
        iflags: squeue::Flags,
    ) -> i32 {
        if self.support.openat {
            let entry = opcode::OpenAt::new(Fd(dirfd), path.as_ptr())
                .flags(flags)
                .mode(mode)
                .build();
            self.prepare(entry, iflags).await
        } else {
            self.yield_now().await;
            // SAFETY: the path is a valid nul-terminated string borrowed for
            // the duration of the call.
            let ret = unsafe { libc::openat(dirfd, path.as_ptr(), flags, mode as libc::c_uint) };
            if ret < 0 {
                -Errno::last_raw()
            } else {
                ret
            }
        }
    }

    /// Close a file descriptor.
    pub async fn close(&self, fd: RawFd, iflags: squeue::Flags) -> i32 {
        if self.support.close {
            self.prepare(opcode::Close::new(Fd(fd)).build(), iflags).await
        } else {
            self.yield_now().await;
            // SAFETY: plain close; ownership of the descriptor is the
            // caller's contract either way.
            let ret = unsafe { libc::close(fd) };
            if ret < 0 {
                -Errno::last_raw()
            } else {
                ret
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        ffi::CString,
        net::{Ipv4Addr, TcpListener},
        os::fd::AsRawFd,
        time::{Duration, Instant},
    };

    use futures::pin_mut;
    use io_uring::{squeue::Flags, types::FsyncFlags};
    use nix::libc;

    use crate::ring::Ring;

    fn scratch_path(tag: &str) -> CString {
        CString::new(format!("/tmp/ringio-{}-{}", tag, std::process::id())).unwrap()
    }

    #[test]
    fn nop_resolves_with_zero() {
        let ring = Ring::new(4).unwrap();
        assert_eq!(ring.run(ring.nop(Flags::empty())), 0);
    }

    #[test]
    fn read_from_preloaded_pipe() {
        let ring = Ring::new(4).unwrap();
        let (r, w) = nix::unistd::pipe().unwrap();
        nix::unistd::write(&w, b"OK").unwrap();

        let mut buf = [0u8; 4];
        let read = ring.run(ring.read(r.as_raw_fd(), &mut buf, 0, Flags::empty()));

        assert_eq!(read, 2);
        assert_eq!(&buf[..2], b"OK");
    }

    #[test]
    fn write_then_read_roundtrip() {
        let ring = Ring::default();
        let path = scratch_path("roundtrip");

        ring.run(async {
            let fd = ring
                .openat(
                    libc::AT_FDCWD,
                    &path,
                    libc::O_CREAT | libc::O_RDWR | libc::O_TRUNC,
                    0o600,
                    Flags::empty(),
                )
                .await;
            assert!(fd >= 0, "openat failed: {fd}");

            assert_eq!(ring.write(fd, b"hello", 0, Flags::empty()).await, 5);

            let mut buf = [0u8; 5];
            assert_eq!(ring.read(fd, &mut buf, 0, Flags::empty()).await, 5);
            assert_eq!(&buf, b"hello");

            assert_eq!(ring.fsync(fd, FsyncFlags::empty(), Flags::empty()).await, 0);
            assert_eq!(ring.close(fd, Flags::empty()).await, 0);
        });

        std::fs::remove_file(path.to_str().unwrap()).unwrap();
    }

    #[test]
    fn vectored_matches_linear() {
        let ring = Ring::default();
        let path = scratch_path("vectored");

        ring.run(async {
            let fd = ring
                .openat(
                    libc::AT_FDCWD,
                    &path,
                    libc::O_CREAT | libc::O_RDWR | libc::O_TRUNC,
                    0o600,
                    Flags::empty(),
                )
                .await;
            assert!(fd >= 0);

            let head = b"hello ".to_vec();
            let tail = b"world".to_vec();
            let out = [crate::util::iovec(&head), crate::util::iovec(&tail)];
            assert_eq!(ring.writev(fd, &out, 0, Flags::empty()).await, 11);

            // The vectored write and a linear read observe the same bytes,
            // which is exactly what the pre-5.6 read/write decay relies on.
            let mut linear = [0u8; 11];
            assert_eq!(ring.read(fd, &mut linear, 0, Flags::empty()).await, 11);
            assert_eq!(&linear, b"hello world");

            let mut first = [0u8; 6];
            let mut second = [0u8; 5];
            let vecs = [
                crate::util::iovec_mut(&mut first),
                crate::util::iovec_mut(&mut second),
            ];
            assert_eq!(ring.readv(fd, &vecs, 0, Flags::empty()).await, 11);
            assert_eq!(&first, b"hello ");
            assert_eq!(&second, b"world");

            assert_eq!(ring.close(fd, Flags::empty()).await, 0);
        });

        std::fs::remove_file(path.to_str().unwrap()).unwrap();
    }

    #[test]
    fn timeout_fires_after_duration() {
        let ring = Ring::new(4).unwrap();
        let started = Instant::now();

        let ret = ring.run(ring.timeout(Duration::from_millis(50), Flags::empty()));
        let elapsed = started.elapsed();

        assert_eq!(ret, -libc::ETIME);
        assert!(elapsed >= Duration::from_millis(50), "fired early: {elapsed:?}");
        assert!(elapsed < Duration::from_millis(250), "fired late: {elapsed:?}");
    }

    #[test]
    fn linked_timeout_cancels_stuck_read() {
        let ring = Ring::new(8).unwrap();
        // Keep the write end open so the read can never complete on its own.
        let (r, _w) = nix::unistd::pipe().unwrap();
        let mut buf = [0u8; 8];
        let started = Instant::now();

        let (read, timer) = ring.run(async {
            futures::join!(
                ring.read(r.as_raw_fd(), &mut buf, 0, Flags::IO_LINK),
                ring.link_timeout(Duration::from_millis(20), Flags::empty()),
            )
        });
        let elapsed = started.elapsed();

        assert!(
            read == -libc::ECANCELED || read == -libc::EINTR,
            "read survived its linked timeout: {read}"
        );
        assert_eq!(timer, -libc::ETIME);
        assert!(elapsed >= Duration::from_millis(20));
        assert!(elapsed < Duration::from_millis(500), "took {elapsed:?}");
    }

    #[test]
    fn pressure_flush_completes_every_nop() {
        let ring = Ring::new(4).unwrap();

        // Ten submissions against a depth-4 queue, armed in a single poll:
        // the gatekeeper has to flush mid-arm or this never even submits.
        let results = ring.run(async {
            let ops: Vec<_> = (0..10).map(|_| ring.nop(Flags::empty())).collect();
            futures::future::join_all(ops).await
        });

        assert_eq!(results.len(), 10);
        assert!(results.iter().all(|ret| *ret == 0), "{results:?}");
    }

    #[test]
    fn dropped_read_is_reaped_in_bounded_time() {
        let ring = Ring::new(4).unwrap();
        let (r, _w) = nix::unistd::pipe().unwrap();
        let mut buf = [0u8; 8];
        let started = Instant::now();

        ring.run(async {
            {
                let read = ring.read(r.as_raw_fd(), &mut buf, 0, Flags::empty());
                pin_mut!(read);
                // Arm the submission, then abandon the operation. The drop
                // must cancel it and wait out the completion.
                assert!(futures::poll!(read.as_mut()).is_pending());
            }
        });

        assert!(
            started.elapsed() < Duration::from_secs(2),
            "cancellation did not finish in bounded time"
        );
    }

    #[test]
    fn poll_reports_readable_pipe() {
        let ring = Ring::new(4).unwrap();
        let (r, w) = nix::unistd::pipe().unwrap();
        nix::unistd::write(&w, b"x").unwrap();

        let events = ring.run(ring.poll(r.as_raw_fd(), libc::POLLIN as u32, Flags::empty()));
        assert!(events >= 0);
        assert_ne!(events & libc::POLLIN as i32, 0, "events: {events:#x}");
    }

    #[test]
    fn accept_connect_echo() {
        let ring = Ring::new(16).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let client = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(client >= 0);

        let addr = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: port.to_be(),
            sin_addr: libc::in_addr {
                s_addr: u32::from(Ipv4Addr::LOCALHOST).to_be(),
            },
            sin_zero: [0; 8],
        };

        ring.run(async {
            let rc = ring
                .connect(
                    client,
                    &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                    Flags::empty(),
                )
                .await;
            assert_eq!(rc, 0, "connect failed: {rc}");

            let conn = ring
                .accept(
                    listener.as_raw_fd(),
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                    0,
                    Flags::empty(),
                )
                .await;
            assert!(conn >= 0, "accept failed: {conn}");

            assert_eq!(ring.send(conn, b"ping", 0, Flags::empty()).await, 4);

            let mut buf = [0u8; 8];
            let got = ring.recv(client, &mut buf, 0, Flags::empty()).await;
            assert_eq!(got, 4);
            assert_eq!(&buf[..4], b"ping");

            assert_eq!(ring.close(conn, Flags::empty()).await, 0);
            assert_eq!(ring.close(client, Flags::empty()).await, 0);
        });
    }

    #[test]
    fn fixed_buffer_read_between_register_and_unregister() {
        let ring = Ring::new(4).unwrap();
        let path = scratch_path("fixed");
        std::fs::write(path.to_str().unwrap(), b"fixed contents").unwrap();

        let mut backing = vec![0u8; 4096];
        let iovecs = [crate::util::iovec_mut(&mut backing)];
        unsafe { ring.register_buffers(&iovecs) }.unwrap();

        let file = std::fs::File::open(path.to_str().unwrap()).unwrap();
        let got = ring.run(ring.read_fixed(file.as_raw_fd(), &mut backing, 0, 0, Flags::empty()));
        assert_eq!(got, 14);
        assert_eq!(&backing[..14], b"fixed contents");

        ring.unregister_buffers().unwrap();

        // Outside the registration window the same submission is refused.
        let refused =
            ring.run(ring.read_fixed(file.as_raw_fd(), &mut backing, 0, 0, Flags::empty()));
        assert_eq!(refused, -libc::EFAULT);

        std::fs::remove_file(path.to_str().unwrap()).unwrap();
    }

    #[test]
    fn sync_file_range_flushes_written_range() {
        let ring = Ring::new(4).unwrap();
        let path = scratch_path("sfr");

        ring.run(async {
            let fd = ring
                .openat(
                    libc::AT_FDCWD,
                    &path,
                    libc::O_CREAT | libc::O_RDWR | libc::O_TRUNC,
                    0o600,
                    Flags::empty(),
                )
                .await;
            assert!(fd >= 0);

            assert_eq!(ring.write(fd, b"dirty pages", 0, Flags::empty()).await, 11);
            let rc = ring
                .sync_file_range(
                    fd,
                    0,
                    11,
                    (libc::SYNC_FILE_RANGE_WRITE | libc::SYNC_FILE_RANGE_WAIT_AFTER) as u32,
                    Flags::empty(),
                )
                .await;
            assert_eq!(rc, 0);

            assert_eq!(ring.close(fd, Flags::empty()).await, 0);
        });

        std::fs::remove_file(path.to_str().unwrap()).unwrap();
    }

    #[test]
    fn sendmsg_recvmsg_roundtrip() {
        let ring = Ring::new(8).unwrap();
        let mut fds = [0 as libc::c_int; 2];
        let rc = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        };
        assert_eq!(rc, 0);
        let (a, b) = (fds[0], fds[1]);

        ring.run(async {
            let payload = b"datagram".to_vec();
            let mut out_iov = [crate::util::iovec(&payload)];
            // SAFETY: zeroed msghdr plus an iovec is a complete message.
            let mut out: libc::msghdr = unsafe { std::mem::zeroed() };
            out.msg_iov = out_iov.as_mut_ptr();
            out.msg_iovlen = 1;
            assert_eq!(ring.sendmsg(a, &out, 0, Flags::empty()).await, 8);

            let mut buf = vec![0u8; 32];
            let mut in_iov = [crate::util::iovec_mut(&mut buf)];
            // SAFETY: as above.
            let mut incoming: libc::msghdr = unsafe { std::mem::zeroed() };
            incoming.msg_iov = in_iov.as_mut_ptr();
            incoming.msg_iovlen = 1;
            assert_eq!(ring.recvmsg(b, &mut incoming, 0, Flags::empty()).await, 8);
            assert_eq!(&buf[..8], b"datagram");

            assert_eq!(ring.close(a, Flags::empty()).await, 0);
            assert_eq!(ring.close(b, Flags::empty()).await, 0);
        });
    }
}
