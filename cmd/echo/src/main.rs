//! TCP echo server, one fiber per connection.
//!
//! The handler is written as ordinary blocking code; the hook layer turns
//! every read/write into cooperative suspension on the IoManager.
//!
//! Usage:
//!     strand-echo [port] [workers]
//!
//! Environment:
//!     STRAND_ECHO_READ_TIMEOUT_MS   per-connection read deadline (0 = none)
//!
//! Test with:
//!     echo hello | nc localhost 9900

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use strand::net::{TcpListener, TcpStream};
use strand::{env_get, ferror, finfo, IoManager, RuntimeConfig};

fn handle(stream: TcpStream, read_timeout_ms: u64) {
    if read_timeout_ms > 0 {
        let _ = stream.set_read_timeout(Some(Duration::from_millis(read_timeout_ms)));
    }
    let _ = stream.set_nodelay(true);

    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if let Err(e) = stream.write_all(&buf[..n]) {
                    ferror!("echo write failed: errno {}", e);
                    break;
                }
            }
            Err(e) if e == libc::ETIMEDOUT => {
                finfo!("connection idle for {} ms, dropping", read_timeout_ms);
                break;
            }
            Err(e) => {
                ferror!("echo read failed: errno {}", e);
                break;
            }
        }
    }
}

fn main() {
    let mut args = std::env::args().skip(1);
    let port: u16 = args.next().and_then(|a| a.parse().ok()).unwrap_or(9900);
    let workers: usize = args.next().and_then(|a| a.parse().ok()).unwrap_or(4);
    let read_timeout_ms: u64 = env_get("STRAND_ECHO_READ_TIMEOUT_MS", 0);

    let iom = IoManager::new(RuntimeConfig::new().name("echo").workers(workers))
        .expect("failed to start IoManager");

    finfo!("echo server listening on 0.0.0.0:{} ({} workers)", port, workers);

    iom.spawn(move || {
        let listener = match TcpListener::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)) {
            Ok(l) => l,
            Err(e) => {
                ferror!("bind :{} failed: errno {}", port, e);
                return;
            }
        };
        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    finfo!("accepted {}", peer);
                    strand::spawn(move || handle(stream, read_timeout_ms));
                }
                Err(e) => {
                    ferror!("accept failed: errno {}", e);
                    break;
                }
            }
        }
    })
    .expect("failed to spawn acceptor");

    // The acceptor never finishes; park main forever.
    loop {
        std::thread::park();
    }
}
