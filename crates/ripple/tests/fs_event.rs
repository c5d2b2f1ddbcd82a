//! Directory watching through the loop. Kernel watch backends batch
//! and coalesce, so these tests assert that events arrive, not their
//! exact shape.

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

use ripple::{EventLoop, FsEventHandle, TimerHandle};

fn scratch_dir(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("ripple-watch-{}-{}", tag, std::process::id()))
}

#[test]
fn directory_watch_sees_file_creation() {
    let lp = EventLoop::new().unwrap();
    let dir = scratch_dir("create");
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir(&dir).unwrap();

    let fired = Rc::new(RefCell::new(false));
    let timed_out = Rc::new(RefCell::new(false));

    let watcher = FsEventHandle::new(&lp);
    let guard = TimerHandle::new(&lp);

    {
        let fired2 = Rc::clone(&fired);
        let watcher2 = watcher.clone();
        let guard2 = guard.clone();
        watcher
            .start(&dir, move |_name, res| {
                res.unwrap();
                if *fired2.borrow() {
                    return;
                }
                *fired2.borrow_mut() = true;
                watcher2.close_silent();
                guard2.close_silent();
            })
            .unwrap();
    }

    // Watchdog: tear everything down if no event ever lands so the
    // loop still drains and the test fails with a clear assert.
    {
        let timed_out2 = Rc::clone(&timed_out);
        let watcher2 = watcher.clone();
        let guard2 = guard.clone();
        guard
            .start(
                move || {
                    if !watcher2.is_closing() {
                        *timed_out2.borrow_mut() = true;
                        watcher2.close_silent();
                    }
                    guard2.close_silent();
                },
                5000,
                0,
            )
            .unwrap();
    }

    // The write happens after the watch is armed but before run(); the
    // backend thread delivers it once the loop starts dequeuing.
    std::fs::write(dir.join("born.txt"), b"x").unwrap();

    lp.run();

    assert!(!*timed_out.borrow(), "no watch event within 5s");
    assert!(*fired.borrow());
    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn watching_a_missing_path_fails_immediately() {
    let lp = EventLoop::new().unwrap();
    let dir = scratch_dir("absent");
    let _ = std::fs::remove_dir_all(&dir);

    let watcher = FsEventHandle::new(&lp);
    let err = watcher
        .start(&dir, |_name, _res| panic!("must not fire"))
        .unwrap_err();
    assert_eq!(err.code(), ripple::Code::Enoent);

    watcher.close_silent();
    lp.run();
}
