//! # ringio
//!
//! A deliberately small async runtime for Linux built directly on `io_uring`.
//! One [Ring] owns one kernel queue pair and is driven by one single-threaded
//! loop: operations are queued as submission entries, the loop submits and
//! blocks for completions, and each completion resumes exactly the
//! computation that issued it. There is no thread pool, no work stealing and
//! no reactor thread; the design bets on the kernel's completion queue being
//! the only scheduler you need for I/O-bound work.
//!
//! Every system-call wrapper on the [Ring] (`read`, `write`, `accept`,
//! `connect`, `send`, `recv`, `timeout`, `openat`, ...) returns a future
//! resolving to the raw kernel result: `>= 0` on success, `-errno` on
//! failure. The runtime never interprets results, retries, or buffers; what
//! the kernel says is what the caller sees. [util::completion_result] turns
//! that convention into an [std::io::Result] where that reads better.
//!
//! Reading two bytes preloaded into a pipe:
//!
//! ```no_run
//! use io_uring::squeue::Flags;
//! use ringio::Ring;
//!
//! fn main() -> ringio::Result<()> {
//!     let ring = Ring::new(64)?;
//!
//!     let (r, w) = nix::unistd::pipe().expect("pipe");
//!     nix::unistd::write(&w, b"OK").expect("preload");
//!
//!     use std::os::fd::AsRawFd;
//!     let mut buf = [0u8; 4];
//!     let read = ring.run(ring.read(r.as_raw_fd(), &mut buf, 0, Flags::empty()));
//!
//!     assert_eq!(read, 2);
//!     assert_eq!(&buf[..2], b"OK");
//!     Ok(())
//! }
//! ```
//!
//! Operations compose with ordinary future combinators; the loop only ever
//! sees one root. Submission flags (`IO_LINK`, `IO_DRAIN`, `FIXED_FILE`, ...)
//! pass through to the kernel untouched, so linked pairs like a read guarded
//! by [Ring::link_timeout] work exactly as they do in raw `io_uring`:
//!
//! ```no_run
//! # use std::time::Duration;
//! # use std::os::fd::AsRawFd;
//! use io_uring::squeue::Flags;
//! # let ring = ringio::Ring::new(64).unwrap();
//! # let (r, _w) = nix::unistd::pipe().unwrap();
//! # let mut buf = [0u8; 16];
//! let (_read, _timer) = ring.run(async {
//!     futures::join!(
//!         ring.read(r.as_raw_fd(), &mut buf, 0, Flags::IO_LINK),
//!         ring.link_timeout(Duration::from_millis(20), Flags::empty()),
//!     )
//! });
//! ```
//!
//! The ring is `!Send` and `!Sync` on purpose: a queue pair belongs to the
//! thread that drives it, and moving in-flight state between threads is
//! exactly the class of bug this crate refuses to make expressible.

pub mod ring;
pub mod util;

pub use ring::{Error, Op, Result, Ring, DEFAULT_ENTRIES};
