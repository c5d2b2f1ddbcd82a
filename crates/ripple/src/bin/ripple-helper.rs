//! Child-side fixture for the spawn tests. The first argument picks a
//! mode:
//!
//!   echo   bridge fd 0/1 as pipe handles, accumulate stdin until EOF,
//!          then write everything back to stdout
//!   ipc    treat fd 0 as an IPC pipe, claim the TCP socket passed over
//!          it and greet the peer on that socket
//!   hello  print a line and exit with status 1

use std::cell::RefCell;
use std::os::fd::{FromRawFd, OwnedFd};
use std::rc::Rc;

use ripple::{EventLoop, PipeHandle};

fn main() {
    let mode = std::env::args().nth(1).unwrap_or_default();
    match mode.as_str() {
        "echo" => echo(),
        "ipc" => ipc(),
        "hello" => {
            println!("hello world");
            std::process::exit(1);
        }
        other => {
            eprintln!("ripple-helper: unknown mode {:?}", other);
            std::process::exit(2);
        }
    }
}

fn ipc() {
    let lp = EventLoop::new().unwrap();

    let chan = PipeHandle::new(&lp, true);
    chan.open(unsafe { OwnedFd::from_raw_fd(0) }).unwrap();

    let chan2 = chan.clone();
    chan.read2_start(
        |hint| vec![0u8; hint.max(64)],
        move |res, _buf, kind| match res {
            Ok(_) => {
                if kind.is_some() {
                    let conn = chan2.accept_tcp().unwrap();
                    let conn2 = conn.clone();
                    conn.write(b"from-child", move |r| {
                        r.unwrap();
                        conn2.close_silent();
                    })
                    .unwrap();
                }
            }
            Err(e) if e.is_eof() => chan2.close_silent(),
            Err(e) => {
                eprintln!("ripple-helper: ipc read failed: {}", e);
                std::process::exit(3);
            }
        },
    )
    .unwrap();

    lp.run();
}

fn echo() {
    let lp = EventLoop::new().unwrap();

    let stdin = PipeHandle::new(&lp, false);
    stdin.open(unsafe { OwnedFd::from_raw_fd(0) }).unwrap();
    let stdout = PipeHandle::new(&lp, false);
    stdout.open(unsafe { OwnedFd::from_raw_fd(1) }).unwrap();

    let acc: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
    let acc2 = Rc::clone(&acc);
    let stdin2 = stdin.clone();
    let stdout2 = stdout.clone();

    stdin
        .read_start(
            |hint| vec![0u8; hint.max(64)],
            move |res, buf| match res {
                Ok(n) => acc2.borrow_mut().extend_from_slice(&buf[..n]),
                Err(e) if e.is_eof() => {
                    let data = acc2.borrow().clone();
                    let out = stdout2.clone();
                    stdout2
                        .write(&data, move |r| {
                            r.unwrap();
                            out.close_silent();
                        })
                        .unwrap();
                    stdin2.close_silent();
                }
                Err(e) => {
                    eprintln!("ripple-helper: stdin read failed: {}", e);
                    std::process::exit(3);
                }
            },
        )
        .unwrap();

    lp.run();
}
