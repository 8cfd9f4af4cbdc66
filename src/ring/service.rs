use std::{
    cell::{Cell, RefCell, RefMut},
    future::Future,
    os::fd::RawFd,
    sync::Arc,
    task::{Context, Poll},
};

use futures::{
    pin_mut,
    task::{waker, ArcWake},
};
use io_uring::{opcode, squeue, IoUring, Probe};
use nix::libc;
use tracing::{debug, trace};

use super::{
    error::{Error, Result},
    promise::Promise,
};

/// Submission-queue depth used by [Ring::default].
pub const DEFAULT_ENTRIES: u32 = 64;

/// Which of the opcodes with a pre-5.6 fallback the running kernel actually
/// supports. Probed once at ring construction; when the probe registration
/// itself is unavailable the kernel predates all four, so everything decays.
#[derive(Debug, Clone, Copy)]
pub(crate) struct OpSupport {
    pub(crate) rw: bool,
    pub(crate) socket_io: bool,
    pub(crate) openat: bool,
    pub(crate) close: bool,
}

impl OpSupport {
    fn probe(uring: &IoUring) -> OpSupport {
        let mut probe = Probe::new();
        if uring.submitter().register_probe(&mut probe).is_err() {
            return OpSupport {
                rw: false,
                socket_io: false,
                openat: false,
                close: false,
            };
        }

        OpSupport {
            rw: probe.is_supported(opcode::Read::CODE) && probe.is_supported(opcode::Write::CODE),
            socket_io: probe.is_supported(opcode::Recv::CODE)
                && probe.is_supported(opcode::Send::CODE),
            openat: probe.is_supported(opcode::OpenAt::CODE),
            close: probe.is_supported(opcode::Close::CODE),
        }
    }
}

/// A single-threaded io_uring context: one kernel ring, the submission
/// gatekeeper that feeds it, and the driver loop that reaps completions and
/// resumes the computations waiting on them.
///
/// One `Ring` is driven by exactly one loop. Interior state is [Cell]/
/// [RefCell] based and the operation futures hold raw pointers into their own
/// frames, so the type is neither [Send] nor [Sync]; the single-loop
/// ownership rule is enforced by the compiler rather than at runtime.
///
/// Operations are issued through the methods in the operation surface (see
/// `ops.rs`), awaited inside a root future handed to [Ring::run].
pub struct Ring {
    uring: RefCell<IoUring>,
    /// Completions walked in the current batch but not yet released back to
    /// the kernel. The gatekeeper releases them early when the submission
    /// queue fills mid-batch.
    pending: Cell<u32>,
    pub(crate) support: OpSupport,
}

impl Ring {
    /// Create a ring with the given submission-queue depth.
    pub fn new(entries: u32) -> Result<Ring> {
        Ring::from_builder(&IoUring::builder(), entries)
    }

    /// Create a ring from a caller-configured [io_uring::Builder], for setup
    /// flags beyond the defaults (SQPOLL, single issuer, and friends). The
    /// flags are passed through to the kernel unchanged.
    pub fn from_builder(builder: &io_uring::Builder, entries: u32) -> Result<Ring> {
        let uring = builder
            .build(entries)
            .map_err(|err| Error::setup("queue_init", err))?;

        let support = OpSupport::probe(&uring);
        debug!(?support, entries, "ring initialised");

        Ok(Ring {
            uring: RefCell::new(uring),
            pending: Cell::new(0),
            support,
        })
    }

    /// Escape hatch: run a closure against the raw [IoUring] handle.
    ///
    /// Must not be called while the ring is borrowed by the driver, i.e. only
    /// from straight-line code between awaits or outside [Ring::run].
    pub fn with_raw<R>(&self, f: impl FnOnce(&mut IoUring) -> R) -> R {
        f(&mut self.raw())
    }

    fn raw(&self) -> RefMut<'_, IoUring> {
        self.uring.borrow_mut()
    }

    /// Hand a fully prepared entry to the submission queue. Never drops the
    /// entry: when the queue is full, the in-progress completion batch is
    /// released to the kernel and the ring submitted to make room, after
    /// which the retry must succeed.
    pub(crate) fn push(&self, entry: squeue::Entry) {
        let mut uring = self.raw();

        // SAFETY: the entry's pointers are owned or borrowed by the issuing
        // operation, which stays alive until its completion is reaped.
        unsafe {
            if uring.submission().push(&entry).is_ok() {
                return;
            }
        }

        trace!(
            flushed = self.pending.get(),
            "submission queue full, flushing"
        );
        uring.completion().sync();
        self.pending.set(0);
        uring
            .submit()
            .expect("ring submit while flushing a full submission queue failed");

        // SAFETY: as above; the submit drained the queue, so a second failure
        // means the ring state is corrupt and continuing would lose the
        // operation.
        unsafe {
            let mut sq = uring.submission();
            sq.sync();
            sq.push(&entry)
                .expect("submission queue still full after flush");
        }
    }

    /// The cancellation hook installed into every [Promise]: queue an
    /// async-cancel targeting the in-flight operation by its user data. The
    /// cancel entry itself carries null user data and is skipped by the
    /// dispatcher.
    pub(crate) unsafe fn cancel_hook(ctx: *const (), target: *const Promise) {
        let ring = unsafe { &*(ctx as *const Ring) };
        ring.push(opcode::AsyncCancel::new(target as u64).build());
    }

    /// Submit everything queued and block until at least one completion is
    /// available, then dispatch the whole visible batch.
    pub(crate) fn wait_for_completions(&self) {
        self.submit_and_wait();
        self.dispatch_completions();
    }

    fn submit_and_wait(&self) {
        match self.uring.borrow().submitter().submit_and_wait(1) {
            Ok(_) => {}
            Err(err) => match err.raw_os_error() {
                // A signal or a busy ring just means we go around again.
                Some(libc::EINTR) | Some(libc::EBUSY) => {}
                _ => panic!("io_uring submit_and_wait failed: {err}"),
            },
        }
    }

    /// Walk every completion currently visible, in posting order, resolving
    /// the promise whose address each one carries. Entries with null user
    /// data (async-cancel completions) are counted but not dispatched; the
    /// consumer index advances by entries observed, not by promises resolved.
    fn dispatch_completions(&self) {
        let mut uring = self.raw();
        let mut cq = uring.completion();
        cq.sync();

        for cqe in &mut cq {
            self.pending.set(self.pending.get() + 1);

            let promise = cqe.user_data() as *const Promise;
            // SAFETY: a non-null user data pointer is a promise address we
            // wrote into the matching submission, and the owning operation
            // keeps it alive until this resolution.
            if let Some(promise) = unsafe { promise.as_ref() } {
                promise.resolve(cqe.result());
            }
        }

        trace!(completions = self.pending.get(), "dispatched batch");
        cq.sync();
        self.pending.set(0);
    }

    /// Drive `root` to completion, blocking the current thread.
    ///
    /// The root future is polled once up front, so a root that is already
    /// done returns immediately without touching the kernel, and a root that
    /// suspends has queued its first submissions by the time the loop waits.
    /// A root that suspends on something other than a ring operation (with
    /// nothing in flight) would wait forever; that is the caller's contract.
    ///
    /// Completions are dispatched in kernel posting order. Work resumed by a
    /// completion runs on the next poll of the root, after the whole batch
    /// has been dispatched; submissions it queues are picked up by the next
    /// submit-and-wait.
    pub fn run<F: Future>(&self, root: F) -> F::Output {
        pin_mut!(root);
        let waker = waker(Arc::new(LoopWaker));
        let mut cx = Context::from_waker(&waker);

        loop {
            if let Poll::Ready(value) = root.as_mut().poll(&mut cx) {
                return value;
            }
            self.wait_for_completions();
        }
    }

    /// Register a file-descriptor set with the kernel, enabling the
    /// fixed-file submission flag for those slots.
    pub fn register_files(&self, fds: &[RawFd]) -> Result<()> {
        self.uring
            .borrow()
            .submitter()
            .register_files(fds)
            .map(|_| ())
            .map_err(|err| Error::setup("register_files", err))
    }

    /// Replace a contiguous range of the registered file set starting at
    /// `offset`.
    pub fn register_files_update(&self, offset: u32, fds: &[RawFd]) -> Result<()> {
        self.uring
            .borrow()
            .submitter()
            .register_files_update(offset, fds)
            .map(|_| ())
            .map_err(|err| Error::setup("register_files_update", err))
    }

    /// Drop the registered file set.
    pub fn unregister_files(&self) -> Result<()> {
        self.uring
            .borrow()
            .submitter()
            .unregister_files()
            .map_err(|err| Error::setup("unregister_files", err))
    }

    /// Register fixed buffers for `read_fixed`/`write_fixed`.
    ///
    /// # Safety
    ///
    /// The memory each iovec describes must stay valid (and, for read
    /// buffers, writable) until [Ring::unregister_buffers] returns; the
    /// kernel holds the mapping for the lifetime of the registration.
    pub unsafe fn register_buffers(&self, iovecs: &[libc::iovec]) -> Result<()> {
        unsafe { self.uring.borrow().submitter().register_buffers(iovecs) }
            .map(|_| ())
            .map_err(|err| Error::setup("register_buffers", err))
    }

    /// Drop the fixed-buffer registration.
    pub fn unregister_buffers(&self) -> Result<()> {
        self.uring
            .borrow()
            .submitter()
            .unregister_buffers()
            .map_err(|err| Error::setup("unregister_buffers", err))
    }
}

impl Default for Ring {
    fn default() -> Ring {
        Ring::new(DEFAULT_ENTRIES).expect("failed to initialise the default io_uring queue")
    }
}

/// The driver's waker. Completion dispatch already happens strictly between
/// polls of the root, so a wake has nothing to schedule; the next poll is
/// coming regardless.
struct LoopWaker;

impl ArcWake for LoopWaker {
    fn wake_by_ref(_arc_self: &Arc<Self>) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::os::fd::AsRawFd;

    #[test]
    fn builds_with_default_depth() {
        let ring = Ring::default();
        assert!(ring.support.rw, "pre-5.6 kernels are not test targets");
    }

    #[test]
    fn ready_root_returns_without_waiting() {
        let ring = Ring::new(4).unwrap();
        assert_eq!(ring.run(async { 42 }), 42);
    }

    #[test]
    fn file_registration_lifecycle() {
        let ring = Ring::new(4).unwrap();
        let (r, w) = nix::unistd::pipe().unwrap();

        ring.register_files(&[r.as_raw_fd(), w.as_raw_fd()]).unwrap();
        ring.register_files_update(1, &[r.as_raw_fd()]).unwrap();
        ring.unregister_files().unwrap();

        // Nothing registered any more: the kernel reports ENXIO.
        let err = ring.unregister_files().unwrap_err();
        let Error::Setup { action, source } = err;
        assert_eq!(action, "unregister_files");
        assert_eq!(source.raw_os_error(), Some(libc::ENXIO));
    }

    #[test]
    fn buffer_registration_lifecycle() {
        let ring = Ring::new(4).unwrap();
        let mut backing = vec![0u8; 4096];
        let iovecs = [crate::util::iovec_mut(&mut backing)];

        unsafe { ring.register_buffers(&iovecs) }.unwrap();
        ring.unregister_buffers().unwrap();

        let err = ring.unregister_buffers().unwrap_err();
        let Error::Setup { source, .. } = err;
        assert_eq!(source.raw_os_error(), Some(libc::ENXIO));
    }
}
