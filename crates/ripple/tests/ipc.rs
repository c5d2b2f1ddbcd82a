//! IPC pipes: framed data plus a TCP handle crossing the connection.
//!
//! One loop plays both sides: a TCP client's socket is passed over an
//! IPC pipe, the receiver claims it with `accept_tcp` and answers on
//! it, and the original TCP peer sees the reply.

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

use ripple::{EventLoop, HandleKind, PipeHandle, ProcessHandle, ProcessOptions, TcpHandle};

const HELPER: &str = env!("CARGO_BIN_EXE_ripple-helper");

fn pipe_name(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("ripple-ipc-{}-{}.sock", tag, std::process::id()))
}

#[test]
fn pass_tcp_socket_across_ipc_pipe() {
    let lp = EventLoop::new().unwrap();

    let ping: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
    let pong: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
    let passed_kind: Rc<RefCell<Option<HandleKind>>> = Rc::new(RefCell::new(None));

    // TCP: server echoes nothing; it just waits for "pong" written on
    // the passed socket's peer.
    let tsrv = TcpHandle::new(&lp);
    tsrv.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let taddr = tsrv.getsockname().unwrap();
    let tcli = TcpHandle::new(&lp);

    {
        let tsrv2 = tsrv.clone();
        let tsrv3 = tsrv.clone();
        let tcli2 = tcli.clone();
        let pong2 = Rc::clone(&pong);
        tsrv.listen(8, move |r| {
            r.unwrap();
            let conn = tsrv2.accept().unwrap();
            let conn2 = conn.clone();
            let tsrv4 = tsrv3.clone();
            let tcli3 = tcli2.clone();
            let sink = Rc::clone(&pong2);
            conn.read_start(
                |hint| vec![0u8; hint.max(64)],
                move |res, buf| match res {
                    Ok(n) => {
                        sink.borrow_mut().extend_from_slice(&buf[..n]);
                        if sink.borrow().len() >= 4 {
                            conn2.close_silent();
                            tsrv4.close_silent();
                            tcli3.close_silent();
                        }
                    }
                    Err(e) if e.is_eof() => {}
                    Err(e) => panic!("tcp read failed: {}", e),
                },
            )
            .unwrap();
        })
        .unwrap();
    }

    // IPC pipe pair.
    let name = pipe_name("pass");
    let psrv = PipeHandle::new(&lp, true);
    psrv.bind(&name).unwrap();
    {
        let psrv2 = psrv.clone();
        let psrv3 = psrv.clone();
        let ping2 = Rc::clone(&ping);
        let kind2 = Rc::clone(&passed_kind);
        psrv.listen(8, move |r| {
            r.unwrap();
            let paccepted = psrv2.accept().unwrap();
            let pa2 = paccepted.clone();
            let psrv4 = psrv3.clone();
            let data_sink = Rc::clone(&ping2);
            let kind_sink = Rc::clone(&kind2);
            paccepted
                .read2_start(
                    |hint| vec![0u8; hint.max(64)],
                    move |res, buf, kind| match res {
                        Ok(n) => {
                            if let Some(kind) = kind {
                                *kind_sink.borrow_mut() = Some(kind);
                                let imported = pa2.accept_tcp().unwrap();
                                let imp2 = imported.clone();
                                imported
                                    .write(b"pong", move |r| {
                                        r.unwrap();
                                        imp2.close_silent();
                                    })
                                    .unwrap();
                            } else {
                                data_sink.borrow_mut().extend_from_slice(&buf[..n]);
                            }
                        }
                        Err(e) if e.is_eof() => {
                            pa2.close_silent();
                            psrv4.close_silent();
                        }
                        Err(e) => panic!("ipc read failed: {}", e),
                    },
                )
                .unwrap();
        })
        .unwrap();
    }

    // Once both connects land, pass the TCP client over the pipe.
    let pcli = PipeHandle::new(&lp, true);
    let ready = Rc::new(RefCell::new(0u8));
    let send: Rc<dyn Fn()> = {
        let pcli = pcli.clone();
        let tcli = tcli.clone();
        Rc::new(move || {
            let done = pcli.clone();
            pcli.write2(b"ping", &tcli, move |r| {
                r.unwrap();
                done.close_silent();
            })
            .unwrap();
        })
    };

    {
        let ready2 = Rc::clone(&ready);
        let send2 = Rc::clone(&send);
        tcli.connect(taddr, move |r| {
            r.unwrap();
            *ready2.borrow_mut() += 1;
            if *ready2.borrow() == 2 {
                send2();
            }
        })
        .unwrap();
    }
    {
        let ready2 = Rc::clone(&ready);
        let send2 = Rc::clone(&send);
        pcli.connect(&name, move |r| {
            r.unwrap();
            *ready2.borrow_mut() += 1;
            if *ready2.borrow() == 2 {
                send2();
            }
        })
        .unwrap();
    }

    lp.run();

    assert_eq!(ping.borrow().as_slice(), b"ping");
    assert_eq!(pong.borrow().as_slice(), b"pong");
    assert_eq!(*passed_kind.borrow(), Some(HandleKind::Tcp));
}

#[test]
fn pass_tcp_socket_to_spawned_child() {
    let lp = EventLoop::new().unwrap();

    // The child greets us on whatever socket crosses its stdin pipe.
    let tsrv = TcpHandle::new(&lp);
    tsrv.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let taddr = tsrv.getsockname().unwrap();

    let greeting: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
    {
        let tsrv2 = tsrv.clone();
        let tsrv3 = tsrv.clone();
        let sink = Rc::clone(&greeting);
        tsrv.listen(8, move |r| {
            r.unwrap();
            let conn = tsrv2.accept().unwrap();
            let conn2 = conn.clone();
            let tsrv4 = tsrv3.clone();
            let sink2 = Rc::clone(&sink);
            conn.read_start(
                |hint| vec![0u8; hint.max(64)],
                move |res, buf| match res {
                    Ok(n) => sink2.borrow_mut().extend_from_slice(&buf[..n]),
                    Err(e) if e.is_eof() => {
                        conn2.close_silent();
                        tsrv4.close_silent();
                    }
                    Err(e) => panic!("tcp read failed: {}", e),
                },
            )
            .unwrap();
        })
        .unwrap();
    }

    let chan = PipeHandle::new(&lp, true);
    let mut opts = ProcessOptions::new(HELPER);
    opts.args = vec!["ipc".into()];
    opts.stdin = Some(chan.clone());

    let status = Rc::new(RefCell::new(None));
    let child_slot: Rc<RefCell<Option<ProcessHandle>>> = Rc::new(RefCell::new(None));
    {
        let status2 = Rc::clone(&status);
        let slot2 = Rc::clone(&child_slot);
        let child = ProcessHandle::spawn(&lp, opts, move |code, sig| {
            *status2.borrow_mut() = Some((code, sig));
            if let Some(c) = slot2.borrow_mut().take() {
                c.close_silent();
            }
        })
        .unwrap();
        *child_slot.borrow_mut() = Some(child);
    }

    let tcli = TcpHandle::new(&lp);
    {
        let tcli2 = tcli.clone();
        let chan2 = chan.clone();
        tcli.connect(taddr, move |r| {
            r.unwrap();
            let tcli3 = tcli2.clone();
            let chan3 = chan2.clone();
            chan2
                .write2(b"go", &tcli2, move |r| {
                    r.unwrap();
                    // our copy of the socket is no longer needed; the
                    // child holds its own descriptor
                    tcli3.close_silent();
                    chan3.close_silent();
                })
                .unwrap();
        })
        .unwrap();
    }

    lp.run();

    assert_eq!(greeting.borrow().as_slice(), b"from-child");
    assert_eq!(*status.borrow(), Some((0, 0)));
}
