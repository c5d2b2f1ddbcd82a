//! A shut-down pipe whose peer goes quiet must still see EOF: after
//! the local write side closes, a short grace timer forces the read
//! callback to report end-of-stream even though the peer never closed.

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Instant;

use ripple::{EventLoop, PipeHandle};

fn pipe_name(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("ripple-eof-{}-{}.sock", tag, std::process::id()))
}

#[test]
fn shutdown_forces_eof_when_peer_stays_silent() {
    let lp = EventLoop::new().unwrap();
    let name = pipe_name("silent");

    // Server accepts and then sits on the connection without ever
    // writing or closing it.
    let srv = PipeHandle::new(&lp, false);
    srv.bind(&name).unwrap();
    let held: Rc<RefCell<Option<PipeHandle>>> = Rc::new(RefCell::new(None));
    {
        let srv2 = srv.clone();
        let held2 = Rc::clone(&held);
        srv.listen(8, move |r| {
            r.unwrap();
            *held2.borrow_mut() = Some(srv2.accept().unwrap());
        })
        .unwrap();
    }

    let cli = PipeHandle::new(&lp, false);
    let got_eof = Rc::new(RefCell::new(false));
    let started = Instant::now();

    {
        let cli2 = cli.clone();
        let srv2 = srv.clone();
        let held2 = Rc::clone(&held);
        let got_eof2 = Rc::clone(&got_eof);
        cli.connect(&name, move |r| {
            r.unwrap();
            let cli3 = cli2.clone();
            let srv3 = srv2.clone();
            let held3 = Rc::clone(&held2);
            let seen = Rc::clone(&got_eof2);
            cli2.read_start(
                |hint| vec![0u8; hint.max(64)],
                move |res, _buf| match res {
                    Ok(n) => panic!("unexpected {} bytes from a silent peer", n),
                    Err(e) if e.is_eof() => {
                        *seen.borrow_mut() = true;
                        cli3.close_silent();
                        srv3.close_silent();
                        if let Some(conn) = held3.borrow_mut().take() {
                            conn.close_silent();
                        }
                    }
                    Err(e) => panic!("read failed: {}", e),
                },
            )
            .unwrap();
            cli2.shutdown(|r| r.unwrap()).unwrap();
        })
        .unwrap();
    }

    lp.run();

    assert!(*got_eof.borrow());
    // Grace window is ~50ms; anything well below that means the EOF
    // came from somewhere else.
    assert!(started.elapsed().as_millis() >= 30);
}
