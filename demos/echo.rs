//! A one-connection-at-a-time TCP echo server on a single ring.
//!
//! ```sh
//! cargo run --example echo -- 9091
//! # elsewhere:
//! printf 'hello\n' | nc 127.0.0.1 9091
//! ```

use std::{net::TcpListener, os::fd::AsRawFd};

use io_uring::squeue::Flags;

use ringio::{util, Ring};

fn main() -> ringio::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let port: u16 = std::env::args()
        .nth(1)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(9091);

    let listener = TcpListener::bind(("0.0.0.0", port)).expect("bind failed");
    println!("echoing on {}", listener.local_addr().unwrap());

    let ring = Ring::default();
    let mut buf = vec![0u8; 4096];

    ring.run(async {
        loop {
            let conn = ring
                .accept(
                    listener.as_raw_fd(),
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                    0,
                    Flags::empty(),
                )
                .await;
            let conn = match util::completion_result(conn) {
                Ok(fd) => fd,
                Err(err) => {
                    eprintln!("accept failed: {err}");
                    continue;
                }
            };

            loop {
                let got = ring.recv(conn, &mut buf, 0, Flags::empty()).await;
                let got = match util::completion_result(got) {
                    Ok(0) => break,
                    Ok(n) => n as usize,
                    Err(err) => {
                        eprintln!("recv failed: {err}");
                        break;
                    }
                };

                let mut sent = 0usize;
                while sent < got {
                    let n = ring.send(conn, &buf[sent..got], 0, Flags::empty()).await;
                    match util::completion_result(n) {
                        Ok(n) => sent += n as usize,
                        Err(err) => {
                            eprintln!("send failed: {err}");
                            break;
                        }
                    }
                }
            }

            ring.close(conn, Flags::empty()).await;
        }
    })
}
