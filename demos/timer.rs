//! Fire a handful of kernel timers from a single loop.
//!
//! ```sh
//! RUST_LOG=trace cargo run --example timer
//! ```

use std::time::{Duration, Instant};

use io_uring::squeue::Flags;
use nix::libc;

use ringio::Ring;

fn main() -> ringio::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let ring = Ring::new(8)?;
    let started = Instant::now();

    let (a, b, c) = ring.run(async {
        futures::join!(
            ring.timeout(Duration::from_millis(10), Flags::empty()),
            ring.timeout(Duration::from_millis(20), Flags::empty()),
            ring.timeout(Duration::from_millis(30), Flags::empty()),
        )
    });

    for (label, ret) in [("10ms", a), ("20ms", b), ("30ms", c)] {
        assert_eq!(ret, -libc::ETIME, "timer did not expire cleanly");
        println!("{label} timer expired");
    }
    println!("all timers done after {:?}", started.elapsed());

    Ok(())
}
