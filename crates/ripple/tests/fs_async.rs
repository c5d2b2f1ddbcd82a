//! Async filesystem requests: work runs on the pool, completions come
//! back through the loop in callback chains.

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

use ripple::{fs, EventLoop};

fn scratch_file(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("ripple-fs-{}-{}", tag, std::process::id()))
}

#[test]
fn chained_open_write_read_close_unlink() {
    let lp = EventLoop::new().unwrap();
    let path = scratch_file("chain");
    let _ = std::fs::remove_file(&path);

    let steps: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));
    let payload: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));

    let lp1 = lp.clone();
    let path1 = path.clone();
    let steps1 = Rc::clone(&steps);
    let payload1 = Rc::clone(&payload);
    fs::open(
        &lp,
        &path,
        libc::O_CREAT | libc::O_RDWR,
        0o644,
        Some(Box::new(move |req| {
            assert_eq!(req.error(), None);
            let fd = req.result() as i32;
            steps1.borrow_mut().push("open");

            let lp2 = lp1.clone();
            let path2 = path1.clone();
            let steps2 = Rc::clone(&steps1);
            let payload2 = Rc::clone(&payload1);
            fs::write(
                &lp1,
                fd,
                b"ripple payload",
                0,
                Some(Box::new(move |req| {
                    assert_eq!(req.error(), None);
                    assert_eq!(req.result(), 14);
                    steps2.borrow_mut().push("write");

                    let lp3 = lp2.clone();
                    let path3 = path2.clone();
                    let steps3 = Rc::clone(&steps2);
                    let payload3 = Rc::clone(&payload2);
                    fs::read(
                        &lp2,
                        fd,
                        64,
                        0,
                        Some(Box::new(move |req| {
                            assert_eq!(req.error(), None);
                            let n = req.result() as usize;
                            payload3.borrow_mut().extend_from_slice(&req.data()[..n]);
                            steps3.borrow_mut().push("read");

                            let lp4 = lp3.clone();
                            let path4 = path3.clone();
                            let steps4 = Rc::clone(&steps3);
                            fs::fstat(
                                &lp3,
                                fd,
                                Some(Box::new(move |req| {
                                    assert_eq!(req.error(), None);
                                    let st = req.stat().unwrap();
                                    assert_eq!(st.size, 14);
                                    assert!(st.is_file());
                                    steps4.borrow_mut().push("fstat");

                                    let lp5 = lp4.clone();
                                    let path5 = path4.clone();
                                    let steps5 = Rc::clone(&steps4);
                                    fs::close(
                                        &lp4,
                                        fd,
                                        Some(Box::new(move |req| {
                                            assert_eq!(req.error(), None);
                                            steps5.borrow_mut().push("close");

                                            let steps6 = Rc::clone(&steps5);
                                            fs::unlink(
                                                &lp5,
                                                &path5,
                                                Some(Box::new(move |req| {
                                                    assert_eq!(req.error(), None);
                                                    steps6.borrow_mut().push("unlink");
                                                })),
                                            )
                                            .unwrap();
                                        })),
                                    )
                                    .unwrap();
                                })),
                            )
                            .unwrap();
                        })),
                    )
                    .unwrap();
                })),
            )
            .unwrap();
        })),
    )
    .unwrap();

    lp.run();

    assert_eq!(payload.borrow().as_slice(), b"ripple payload");
    assert_eq!(
        steps.borrow().as_slice(),
        &["open", "write", "read", "fstat", "close", "unlink"]
    );
    assert!(!path.exists());
}

#[test]
fn async_stat_missing_file_reports_enoent() {
    let lp = EventLoop::new().unwrap();
    let path = scratch_file("missing");
    let _ = std::fs::remove_file(&path);

    let seen = Rc::new(RefCell::new(None));
    let seen2 = Rc::clone(&seen);
    fs::stat(
        &lp,
        &path,
        Some(Box::new(move |req| {
            *seen2.borrow_mut() = req.error();
        })),
    )
    .unwrap();

    lp.run();

    let err = seen.borrow().expect("stat should fail");
    assert_eq!(err.code(), ripple::Code::Enoent);
}

#[test]
fn async_readdir_lists_created_entries() {
    let lp = EventLoop::new().unwrap();
    let dir = scratch_file("dir");
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir(&dir).unwrap();
    std::fs::write(dir.join("a.txt"), b"a").unwrap();
    std::fs::write(dir.join("b.txt"), b"b").unwrap();

    let names: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
    let names2 = Rc::clone(&names);
    fs::readdir(
        &lp,
        &dir,
        Some(Box::new(move |req| {
            assert_eq!(req.error(), None);
            let mut got: Vec<String> = req
                .entries()
                .iter()
                .map(|e| e.to_string_lossy().into_owned())
                .collect();
            got.sort();
            *names2.borrow_mut() = got;
        })),
    )
    .unwrap();

    lp.run();

    assert_eq!(names.borrow().as_slice(), &["a.txt", "b.txt"]);
    std::fs::remove_dir_all(&dir).unwrap();
}
