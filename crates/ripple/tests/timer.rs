//! Timer ordering and restart semantics.

use std::cell::RefCell;
use std::rc::Rc;

use ripple::{EventLoop, TimerHandle};

#[test]
fn equal_deadlines_fire_in_start_order() {
    let lp = EventLoop::new().unwrap();
    let order: Rc<RefCell<Vec<u32>>> = Rc::new(RefCell::new(Vec::new()));

    for id in 0..3u32 {
        let t = TimerHandle::new(&lp);
        let t2 = t.clone();
        let o = Rc::clone(&order);
        t.start(
            move || {
                o.borrow_mut().push(id);
                t2.close_silent();
            },
            10,
            0,
        )
        .unwrap();
    }

    lp.run();
    assert_eq!(*order.borrow(), vec![0, 1, 2]);
}

#[test]
fn stopped_timer_does_not_fire() {
    let lp = EventLoop::new().unwrap();
    let fired = Rc::new(RefCell::new(false));

    let victim = TimerHandle::new(&lp);
    let f2 = Rc::clone(&fired);
    victim
        .start(
            move || {
                *f2.borrow_mut() = true;
            },
            20,
            0,
        )
        .unwrap();

    let killer = TimerHandle::new(&lp);
    let k2 = killer.clone();
    let v2 = victim.clone();
    killer
        .start(
            move || {
                v2.stop().unwrap();
                v2.close_silent();
                k2.close_silent();
            },
            1,
            0,
        )
        .unwrap();

    lp.run();
    assert!(!*fired.borrow());
}

#[test]
fn again_restarts_a_repeating_timer() {
    let lp = EventLoop::new().unwrap();
    let count = Rc::new(RefCell::new(0u32));

    let t = TimerHandle::new(&lp);
    let t2 = t.clone();
    let c2 = Rc::clone(&count);
    t.start(
        move || {
            *c2.borrow_mut() += 1;
            if *c2.borrow() == 2 {
                t2.close_silent();
            }
        },
        1,
        2,
    )
    .unwrap();

    t.stop().unwrap();
    // a stopped repeating timer restarts with its repeat interval
    t.again().unwrap();

    lp.run();
    assert_eq!(*count.borrow(), 2);
}
