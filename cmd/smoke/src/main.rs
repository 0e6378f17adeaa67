//! Runtime smoke scenarios.
//!
//! Exercises the paths a deployment depends on (spawn/yield, hooked sleep,
//! read deadlines, echo round trip, close-wakes-reader) and prints a
//! pass/fail summary. Exits nonzero on any failure.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use strand::net::{TcpListener, TcpStream};
use strand::{finfo, fprintln, yield_now, IoManager, RuntimeConfig};

fn scenario(name: &str, passed: bool, failures: &AtomicUsize) {
    if passed {
        fprintln!("ok   {}", name);
    } else {
        fprintln!("FAIL {}", name);
        failures.fetch_add(1, Ordering::SeqCst);
    }
}

fn spawn_and_yield(iom: &Arc<IoManager>) -> bool {
    let count = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::channel();

    for _ in 0..100 {
        let count = count.clone();
        let tx = tx.clone();
        if iom
            .spawn(move || {
                yield_now();
                if count.fetch_add(1, Ordering::SeqCst) + 1 == 100 {
                    let _ = tx.send(());
                }
            })
            .is_err()
        {
            return false;
        }
    }
    rx.recv_timeout(Duration::from_secs(5)).is_ok()
}

fn hooked_sleep(iom: &Arc<IoManager>) -> bool {
    let (tx, rx) = mpsc::channel();
    iom.spawn(move || {
        let start = Instant::now();
        strand::sleep_ms(120);
        let _ = tx.send(start.elapsed() >= Duration::from_millis(110));
    })
    .ok();
    rx.recv_timeout(Duration::from_secs(5)).unwrap_or(false)
}

fn read_deadline(iom: &Arc<IoManager>) -> bool {
    let (tx, rx) = mpsc::channel();
    iom.spawn(move || {
        let result: Result<bool, i32> = (|| {
            let listener = TcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))?;
            let addr = listener.local_addr()?;

            let keep = Arc::new(std::sync::Mutex::new(None));
            {
                let keep = keep.clone();
                strand::spawn(move || {
                    // Keep the peer open and silent.
                    if let Ok((stream, _)) = listener.accept() {
                        *keep.lock().unwrap() = Some(stream);
                        strand::sleep_ms(1000);
                    }
                });
            }

            let stream = TcpStream::connect(addr)?;
            stream.set_read_timeout(Some(Duration::from_millis(100)))?;
            let start = Instant::now();
            let mut buf = [0u8; 8];
            match stream.read(&mut buf) {
                Err(e) if e == libc::ETIMEDOUT => {
                    Ok(start.elapsed() >= Duration::from_millis(90))
                }
                _ => Ok(false),
            }
        })();
        let _ = tx.send(result.unwrap_or(false));
    })
    .ok();
    rx.recv_timeout(Duration::from_secs(5)).unwrap_or(false)
}

fn close_wakes_reader(iom: &Arc<IoManager>) -> bool {
    let mut fds = [0 as libc::c_int; 2];
    if unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) } != 0 {
        return false;
    }
    let (a, b) = (fds[0], fds[1]);
    let (tx, rx) = mpsc::channel();

    iom.spawn(move || {
        // Adopt the fd and park in a blocking read with no deadline.
        strand::FdMgr::instance().get(a, true);
        let mut buf = [0u8; 8];
        let n = strand::hook::read(a, buf.as_mut_ptr() as *mut libc::c_void, buf.len());
        let e = unsafe { *libc::__errno_location() };
        // The forced resume surfaces a failure, not a crash.
        let _ = tx.send(n == -1 && e != 0);
    })
    .ok();

    iom.spawn(move || {
        // Give the reader time to park, then yank the fd out from under it.
        strand::sleep_ms(50);
        strand::hook::close(a);
    })
    .ok();

    let ok = rx.recv_timeout(Duration::from_secs(5)).unwrap_or(false);
    unsafe { libc::close(b) };
    ok
}

fn echo_round_trip(iom: &Arc<IoManager>) -> bool {
    let (tx, rx) = mpsc::channel();
    iom.spawn(move || {
        let result = (|| {
            let listener = TcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))?;
            let addr = listener.local_addr()?;

            strand::spawn(move || {
                if let Ok((stream, _)) = listener.accept() {
                    let mut buf = [0u8; 32];
                    if let Ok(n) = stream.read(&mut buf) {
                        let _ = stream.write_all(&buf[..n]);
                    }
                }
            });

            let stream = TcpStream::connect(addr)?;
            stream.write_all(b"smoke")?;
            let mut buf = [0u8; 32];
            let n = stream.read(&mut buf)?;
            Ok::<bool, i32>(&buf[..n] == b"smoke")
        })();
        let _ = tx.send(result.unwrap_or(false));
    })
    .ok();
    rx.recv_timeout(Duration::from_secs(5)).unwrap_or(false)
}

fn main() {
    let iom = IoManager::new(RuntimeConfig::new().name("smoke").workers(2))
        .expect("failed to start IoManager");
    let failures = AtomicUsize::new(0);

    finfo!("running smoke scenarios");
    scenario("spawn 100 fibers with yields", spawn_and_yield(&iom), &failures);
    scenario("hooked sleep parks the fiber", hooked_sleep(&iom), &failures);
    scenario("read deadline surfaces ETIMEDOUT", read_deadline(&iom), &failures);
    scenario("echo round trip over loopback", echo_round_trip(&iom), &failures);
    scenario("close wakes a pending reader", close_wakes_reader(&iom), &failures);

    let failed = failures.load(Ordering::SeqCst);
    if failed > 0 {
        fprintln!("{} scenario(s) failed", failed);
        std::process::exit(1);
    }
    fprintln!("all scenarios passed");
    std::process::exit(0);
}
