use std::{
    future::Future,
    marker::PhantomPinned,
    pin::Pin,
    task::{Context, Poll},
};

use io_uring::squeue;

use super::{promise::Promise, Ring};

/// An in-flight (or about to be in-flight) ring operation: a prepared
/// submission entry paired with the [Promise] the driver will resolve.
///
/// Every method on the operation surface returns one of these. The entry is
/// handed to the ring on the first poll, once the future is pinned and the
/// promise address is therefore stable for the kernel round-trip. Until the
/// first poll nothing has been submitted, so an `Op` that is created and
/// dropped unpolled costs nothing.
///
/// Dropping an armed, unresolved `Op` requests cancellation and then drives
/// the ring until the operation's completion arrives. That keeps two
/// contracts at once: the promise is never dropped while the kernel still
/// holds its address, and buffers borrowed by the submission stay valid for
/// as long as the kernel can touch them.
pub struct Op<'ring> {
    ring: &'ring Ring,
    entry: Option<squeue::Entry>,
    iflags: squeue::Flags,
    promise: Promise,
    _pin: PhantomPinned,
}

impl<'ring> Op<'ring> {
    pub(crate) fn new(ring: &'ring Ring, entry: squeue::Entry, iflags: squeue::Flags) -> Op<'ring> {
        Op {
            ring,
            entry: Some(entry),
            iflags,
            promise: Promise::new(Ring::cancel_hook, ring as *const Ring as *const ()),
            _pin: PhantomPinned,
        }
    }
}

impl Future for Op<'_> {
    type Output = i32;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<i32> {
        // SAFETY: nothing below moves out of the pinned frame. The promise
        // address handed to the kernel stays valid because the frame cannot
        // move or drop until the completion has been delivered.
        let this = unsafe { self.get_unchecked_mut() };

        if let Some(entry) = this.entry.take() {
            let addr = &this.promise as *const Promise as u64;
            this.ring.push(entry.flags(this.iflags).user_data(addr));
        }

        match this.promise.attach(cx.waker()) {
            Some(result) => Poll::Ready(result),
            None => Poll::Pending,
        }
    }
}

impl Drop for Op<'_> {
    fn drop(&mut self) {
        // Armed and still unresolved: the kernel holds our promise address.
        // Ask for cancellation and reap completions until ours lands.
        if self.entry.is_none() && !self.promise.is_resolved() {
            self.promise.request_cancel();
            while !self.promise.is_resolved() {
                self.ring.wait_for_completions();
            }
        }
    }
}
