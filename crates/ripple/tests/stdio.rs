//! Child processes wired up over IPC stdio pipes.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use ripple::{EventLoop, PipeHandle, ProcessHandle, ProcessOptions};

const HELPER: &str = env!("CARGO_BIN_EXE_ripple-helper");

#[test]
fn child_echoes_chunked_stdin() {
    let lp = EventLoop::new().unwrap();

    let stdin = PipeHandle::new(&lp, false);
    let stdout = PipeHandle::new(&lp, false);

    let mut opts = ProcessOptions::new(HELPER);
    opts.args = vec!["echo".into()];
    opts.stdin = Some(stdin.clone());
    opts.stdout = Some(stdout.clone());

    let status = Rc::new(RefCell::new(None));
    let status2 = Rc::clone(&status);
    let child_slot: Rc<RefCell<Option<ProcessHandle>>> = Rc::new(RefCell::new(None));
    let slot2 = Rc::clone(&child_slot);
    let child = ProcessHandle::spawn(&lp, opts, move |code, sig| {
        *status2.borrow_mut() = Some((code, sig));
        if let Some(c) = slot2.borrow_mut().take() {
            c.close_silent();
        }
    })
    .unwrap();
    *child_slot.borrow_mut() = Some(child);

    let out: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
    let reads = Rc::new(Cell::new(0u32));
    let writes = Rc::new(Cell::new(0u32));
    {
        let sink = Rc::clone(&out);
        let reads2 = Rc::clone(&reads);
        let stdout2 = stdout.clone();
        stdout
            .read_start(
                |hint| vec![0u8; hint.max(64)],
                move |res, buf| match res {
                    Ok(n) => {
                        reads2.set(reads2.get() + 1);
                        sink.borrow_mut().extend_from_slice(&buf[..n]);
                    }
                    Err(e) if e.is_eof() => stdout2.close_silent(),
                    Err(e) => panic!("stdout read failed: {}", e),
                },
            )
            .unwrap();
    }

    for chunk in [&b"he"[..], b"ll", b"o ", b"wo", b"rl", b"d", b"\n"] {
        let w2 = Rc::clone(&writes);
        stdin
            .write(chunk, move |r| {
                r.unwrap();
                w2.set(w2.get() + 1);
            })
            .unwrap();
    }
    {
        let stdin2 = stdin.clone();
        stdin
            .shutdown(move |r| {
                r.unwrap();
                stdin2.close_silent();
            })
            .unwrap();
    }

    // Child exit may land before or after the output drains; the loop
    // keeps running until every handle has closed.
    lp.run();

    assert_eq!(out.borrow().as_slice(), b"hello world\n");
    assert_eq!(*status.borrow(), Some((0, 0)));
    // one callback per write, in order; the echo arrives as one buffer
    assert_eq!(writes.get(), 7);
    assert_eq!(reads.get(), 1);
}

#[test]
fn child_exit_status_is_reported() {
    let lp = EventLoop::new().unwrap();

    let stdout = PipeHandle::new(&lp, false);
    let mut opts = ProcessOptions::new(HELPER);
    opts.args = vec!["hello".into()];
    opts.stdout = Some(stdout.clone());

    let status = Rc::new(RefCell::new(None));
    let status2 = Rc::clone(&status);
    let child_slot: Rc<RefCell<Option<ProcessHandle>>> = Rc::new(RefCell::new(None));
    let slot2 = Rc::clone(&child_slot);
    let child = ProcessHandle::spawn(&lp, opts, move |code, sig| {
        *status2.borrow_mut() = Some((code, sig));
        if let Some(c) = slot2.borrow_mut().take() {
            c.close_silent();
        }
    })
    .unwrap();
    *child_slot.borrow_mut() = Some(child);

    let out: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
    {
        let sink = Rc::clone(&out);
        let stdout2 = stdout.clone();
        stdout
            .read_start(
                |hint| vec![0u8; hint.max(64)],
                move |res, buf| match res {
                    Ok(n) => sink.borrow_mut().extend_from_slice(&buf[..n]),
                    Err(e) if e.is_eof() => stdout2.close_silent(),
                    Err(e) => panic!("stdout read failed: {}", e),
                },
            )
            .unwrap();
    }

    lp.run();

    assert_eq!(out.borrow().as_slice(), b"hello world\n");
    assert_eq!(*status.borrow(), Some((1, 0)));
}
