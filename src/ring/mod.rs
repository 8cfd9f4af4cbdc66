//! The completion-based event loop itself. This module exposes the [Ring],
//! which owns the kernel queue pair and plays three roles at once: the
//! operation surface that prepares one submission entry per call, the
//! gatekeeper that guarantees a submission slot is always found, and the
//! driver that blocks for completions and resumes whichever computations
//! they belong to.
//!
//! The moving part underneath is the [promise::Promise]: a pinned, one-shot
//! cell whose address rides along as the submission's user data. When the
//! kernel posts the matching completion the driver reconstructs the promise
//! from that address and resolves it with the raw result code, waking the
//! caller suspended on the [op::Op] that owns it.

mod error;
mod op;
mod ops;
mod promise;
mod service;

pub use error::{Error, Result};
pub use op::Op;
pub use service::{Ring, DEFAULT_ENTRIES};
