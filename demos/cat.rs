//! A tiny `cat`: open each argument through the ring, read it in 4 KiB
//! chunks, and write every chunk to stdout, all as ring operations.
//!
//! ```sh
//! cargo run --example cat -- /etc/hostname
//! ```

use std::ffi::CString;

use io_uring::squeue::Flags;
use nix::libc;

use ringio::{util, Ring};

fn main() -> ringio::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let ring = Ring::default();

    for arg in std::env::args().skip(1) {
        let path = CString::new(arg.clone()).expect("path contains a nul byte");

        ring.run(async {
            let fd = ring
                .openat(libc::AT_FDCWD, &path, libc::O_RDONLY, 0, Flags::empty())
                .await;
            let fd = match util::completion_result(fd) {
                Ok(fd) => fd,
                Err(err) => {
                    eprintln!("cat: {arg}: {err}");
                    return;
                }
            };

            let mut buf = vec![0u8; 4096];
            let mut offset = 0u64;
            loop {
                let read = ring.read(fd, &mut buf, offset, Flags::empty()).await;
                match util::completion_result(read) {
                    Ok(0) => break,
                    Ok(n) => {
                        let mut written = 0usize;
                        while written < n as usize {
                            // Offset -1: write at stdout's current file
                            // position, whatever it is pointed at.
                            let out = ring
                                .write(
                                    libc::STDOUT_FILENO,
                                    &buf[written..n as usize],
                                    u64::MAX,
                                    Flags::empty(),
                                )
                                .await;
                            written += util::completion_result(out)
                                .expect("writing to stdout failed")
                                as usize;
                        }
                        offset += n as u64;
                    }
                    Err(err) => {
                        eprintln!("cat: {arg}: {err}");
                        break;
                    }
                }
            }

            ring.close(fd, Flags::empty()).await;
        });
    }

    Ok(())
}
