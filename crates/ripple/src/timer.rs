//! Timers.
//!
//! A binary min-heap keyed by `(deadline, sequence)`: equal deadlines
//! fire in insertion order. Cancellation is lazy — stopping a timer
//! bumps its generation and the stale heap entry is skipped when it
//! surfaces. The queue tracks its live count so the loop can tell a
//! heap full of corpses from real work.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::rc::Rc;

use ripple_core::error::{Code, Error, Result};
use ripple_core::handle::HandleKind;

use crate::event_loop::EventLoop;
use crate::handle::{Handle, HandleCore};

pub type TimerCb = Box<dyn FnMut()>;

pub(crate) struct TimerInner {
    pub(crate) core: HandleCore,
    pub(crate) cb: Option<Rc<RefCell<TimerCb>>>,
    timeout: u64,
    repeat: u64,
    /// Bumped on start/stop; a heap entry is live only while its
    /// generation matches.
    gen: u64,
    scheduled: bool,
}

/// A one-shot or repeating timer handle.
#[derive(Clone)]
pub struct TimerHandle {
    pub(crate) inner: Rc<RefCell<TimerInner>>,
}

struct Entry {
    deadline: u64,
    seq: u64,
    gen: u64,
    timer: TimerHandle,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed: BinaryHeap is a max-heap, we want the nearest deadline
    // on top. Sequence breaks ties in insertion order.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
pub(crate) struct TimerQueue {
    heap: BinaryHeap<Entry>,
    seq: u64,
    live: usize,
}

impl TimerQueue {
    pub(crate) fn new() -> Self {
        TimerQueue::default()
    }

    pub(crate) fn live(&self) -> usize {
        self.live
    }

    fn schedule(&mut self, timer: TimerHandle, deadline: u64, gen: u64) {
        let seq = self.seq;
        self.seq += 1;
        self.heap.push(Entry { deadline, seq, gen, timer });
        self.live += 1;
    }

    fn top_is_stale(&self) -> bool {
        match self.heap.peek() {
            Some(e) => {
                let t = e.timer.inner.borrow();
                e.gen != t.gen || !t.scheduled
            }
            None => false,
        }
    }

    fn drop_stale_top(&mut self) {
        while self.top_is_stale() {
            self.heap.pop();
        }
    }

    /// Deadline of the nearest live timer, if any.
    pub(crate) fn next_deadline(&mut self) -> Option<u64> {
        self.drop_stale_top();
        self.heap.peek().map(|e| e.deadline)
    }

    /// Pop everything due at `now`, re-arming repeating timers at
    /// `deadline + repeat` with the same generation. The caller runs the
    /// returned callbacks in order, re-checking each generation first so
    /// a stop from an earlier callback in the batch takes effect.
    pub(crate) fn pop_due(&mut self, now: u64) -> Vec<(TimerHandle, u64)> {
        let mut due = Vec::new();
        loop {
            self.drop_stale_top();
            match self.heap.peek() {
                Some(e) if e.deadline <= now => {}
                _ => break,
            }
            let e = match self.heap.pop() {
                Some(e) => e,
                None => break,
            };
            self.live -= 1;
            let repeat = {
                let t = e.timer.inner.borrow();
                t.repeat
            };
            if repeat > 0 {
                let next = e.deadline.saturating_add(repeat);
                self.schedule(e.timer.clone(), next, e.gen);
            } else {
                e.timer.inner.borrow_mut().scheduled = false;
            }
            due.push((e.timer, e.gen));
        }
        due
    }

    /// Drop a liveness unit for a timer being stopped; the heap entry
    /// dies lazily.
    fn invalidate(&mut self) {
        debug_assert!(self.live > 0);
        self.live -= 1;
    }
}

impl TimerHandle {
    pub fn new(lp: &EventLoop) -> TimerHandle {
        TimerHandle {
            inner: Rc::new(RefCell::new(TimerInner {
                core: HandleCore::new(lp, HandleKind::Timer),
                cb: None,
                timeout: 0,
                repeat: 0,
                gen: 0,
                scheduled: false,
            })),
        }
    }

    /// Arm the timer: `cb` fires once after `timeout` ms, then every
    /// `repeat` ms if non-zero. Restarting an armed timer re-arms it.
    pub fn start(&self, cb: impl FnMut() + 'static, timeout: u64, repeat: u64) -> Result<()> {
        let lp = {
            let t = self.inner.borrow();
            if t.core.flags.is_closing() {
                return Err(t.core.lp.fail(Error::new(Code::Ebadf)));
            }
            t.core.lp.clone()
        };
        self.stop()?;
        let deadline = lp.now().saturating_add(timeout);
        let gen = {
            let mut t = self.inner.borrow_mut();
            t.cb = Some(Rc::new(RefCell::new(Box::new(cb))));
            t.timeout = timeout;
            t.repeat = repeat;
            t.gen += 1;
            t.scheduled = true;
            t.gen
        };
        lp.inner.timers.borrow_mut().schedule(self.clone(), deadline, gen);
        Ok(())
    }

    pub fn stop(&self) -> Result<()> {
        let mut t = self.inner.borrow_mut();
        if t.scheduled {
            t.scheduled = false;
            t.gen += 1;
            t.core.lp.inner.timers.borrow_mut().invalidate();
        }
        Ok(())
    }

    /// Stop and re-arm with the repeat interval. Errors with EINVAL if
    /// the timer was never started or has no repeat.
    pub fn again(&self) -> Result<()> {
        let (lp, cb, repeat) = {
            let t = self.inner.borrow();
            match (&t.cb, t.repeat) {
                (Some(cb), r) => (t.core.lp.clone(), Rc::clone(cb), r),
                (None, _) => return Err(t.core.lp.fail(Error::new(Code::Einval))),
            }
        };
        if repeat == 0 {
            return Err(lp.fail(Error::new(Code::Einval)));
        }
        self.stop()?;
        let deadline = lp.now().saturating_add(repeat);
        let gen = {
            let mut t = self.inner.borrow_mut();
            t.cb = Some(cb);
            t.timeout = repeat;
            t.gen += 1;
            t.scheduled = true;
            t.gen
        };
        lp.inner.timers.borrow_mut().schedule(self.clone(), deadline, gen);
        Ok(())
    }

    pub fn set_repeat(&self, repeat: u64) {
        self.inner.borrow_mut().repeat = repeat;
    }

    pub fn repeat(&self) -> u64 {
        self.inner.borrow().repeat
    }

    pub fn is_active(&self) -> bool {
        self.inner.borrow().scheduled
    }

    pub fn close(&self, cb: impl FnOnce() + 'static) {
        crate::handle::close(Handle::Timer(self.clone()), Some(Box::new(cb)));
    }

    /// Close without a callback.
    pub fn close_silent(&self) {
        crate::handle::close(Handle::Timer(self.clone()), None);
    }

    pub(crate) fn take_cb(&self, gen: u64) -> Option<Rc<RefCell<TimerCb>>> {
        let t = self.inner.borrow();
        if t.gen != gen || t.core.flags.is_closing() {
            return None;
        }
        t.cb.as_ref().map(Rc::clone)
    }

    /// Stop, used by the close protocol.
    pub(crate) fn close_start(&self) {
        let _ = self.stop();
    }

    pub(crate) fn endgame_cleanup(&self) {
        self.inner.borrow_mut().cb = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lp() -> EventLoop {
        EventLoop::new().unwrap()
    }

    #[test]
    fn test_insert_and_pop_order() {
        let lp = lp();
        let a = TimerHandle::new(&lp);
        let b = TimerHandle::new(&lp);
        let c = TimerHandle::new(&lp);
        a.start(|| {}, 20, 0).unwrap();
        b.start(|| {}, 10, 0).unwrap();
        c.start(|| {}, 20, 0).unwrap();

        let mut q = lp.inner.timers.borrow_mut();
        assert_eq!(q.live(), 3);
        let due = q.pop_due(lp.now() + 100);
        assert_eq!(due.len(), 3);
        // b (earliest), then a before c (same deadline, insertion order)
        assert!(Rc::ptr_eq(&due[0].0.inner, &b.inner));
        assert!(Rc::ptr_eq(&due[1].0.inner, &a.inner));
        assert!(Rc::ptr_eq(&due[2].0.inner, &c.inner));
        assert_eq!(q.live(), 0);
        drop(q);
        a.close_silent();
        b.close_silent();
        c.close_silent();
        lp.run();
    }

    #[test]
    fn test_stop_is_lazy_but_effective() {
        let lp = lp();
        let t = TimerHandle::new(&lp);
        t.start(|| {}, 5, 0).unwrap();
        t.stop().unwrap();
        let mut q = lp.inner.timers.borrow_mut();
        assert_eq!(q.live(), 0);
        assert!(q.next_deadline().is_none());
        assert!(q.pop_due(lp.now() + 100).is_empty());
        drop(q);
        t.close_silent();
        lp.run();
    }

    #[test]
    fn test_repeat_reschedules() {
        let lp = lp();
        let t = TimerHandle::new(&lp);
        t.start(|| {}, 0, 10).unwrap();
        let mut q = lp.inner.timers.borrow_mut();
        let due = q.pop_due(lp.now());
        assert_eq!(due.len(), 1);
        // still live: re-armed at deadline + repeat
        assert_eq!(q.live(), 1);
        assert!(q.next_deadline().is_some());
        drop(q);
        t.close_silent();
        lp.run();
    }

    #[test]
    fn test_again_requires_repeat() {
        let lp = lp();
        let t = TimerHandle::new(&lp);
        assert_eq!(t.again().unwrap_err().code(), Code::Einval);
        t.start(|| {}, 5, 0).unwrap();
        assert_eq!(t.again().unwrap_err().code(), Code::Einval);
        t.set_repeat(7);
        t.again().unwrap();
        assert!(t.is_active());
        t.close_silent();
        lp.run();
    }
}
