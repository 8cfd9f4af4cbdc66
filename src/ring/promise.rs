use std::{cell::Cell, marker::PhantomPinned, task::Waker};

/// The cancellation closure a [Promise] carries while its operation is in
/// flight: a plain function pointer plus an opaque context (in practice the
/// owning ring). Two words, no allocation.
///
/// The hook is handed the promise address so it can queue an async-cancel
/// submission that targets the in-flight operation by its user data.
#[derive(Clone, Copy)]
pub(crate) struct CancelHook {
    pub(crate) hook: unsafe fn(*const (), *const Promise),
    pub(crate) ctx: *const (),
}

/// A single-shot cell bridging one kernel submission to its suspended caller.
///
/// The promise lives inside the pinned operation future, and its address is
/// what the submission carries as user data. The driver resolves it through
/// that pointer when the matching completion arrives, which is why every
/// field is interior-mutable: resolution happens through a shared reference
/// reconstructed from the raw address.
///
/// Lifecycle: unresolved with no waiter, then (after the caller suspends)
/// unresolved with a waiter attached, then resolved. Resolution happens
/// exactly once; the stored value is the raw completion code, negative values
/// being `-errno` by kernel convention. The promise never interprets it.
pub(crate) struct Promise {
    result: Cell<Option<i32>>,
    waker: Cell<Option<Waker>>,
    cancel: Cell<Option<CancelHook>>,
    _pin: PhantomPinned,
}

impl Promise {
    pub(crate) fn new(hook: unsafe fn(*const (), *const Promise), ctx: *const ()) -> Promise {
        Promise {
            result: Cell::new(None),
            waker: Cell::new(None),
            cancel: Cell::new(Some(CancelHook { hook, ctx })),
            _pin: PhantomPinned,
        }
    }

    /// Record the caller's waker, or short-circuit with the stored result if
    /// the completion already arrived before the caller got to suspend.
    pub(crate) fn attach(&self, waker: &Waker) -> Option<i32> {
        match self.result.get() {
            Some(result) => Some(result),
            None => {
                self.waker.set(Some(waker.clone()));
                None
            }
        }
    }

    /// Store the completion result and wake the attached waiter. Called by
    /// the driver exactly once per in-flight operation; a second call is a
    /// bookkeeping bug upstream.
    pub(crate) fn resolve(&self, result: i32) {
        debug_assert!(
            self.result.get().is_none(),
            "promise resolved twice (result {result})"
        );
        self.cancel.set(None);
        self.result.set(Some(result));
        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
    }

    pub(crate) fn is_resolved(&self) -> bool {
        self.result.get().is_some()
    }

    /// Fire the cancellation hook, at most once. The in-flight operation will
    /// still complete through the normal path, either with its natural result
    /// or with `-ECANCELED`.
    pub(crate) fn request_cancel(&self) {
        if let Some(hook) = self.cancel.take() {
            // SAFETY: the hook and context were installed together by the
            // ring that owns this operation, and the ring outlives it.
            unsafe { (hook.hook)(hook.ctx, self as *const Promise) };
        }
    }
}
