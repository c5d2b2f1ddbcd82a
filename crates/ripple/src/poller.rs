//! Readiness-to-completion bridge.
//!
//! The loop thread never touches epoll. It arms single-shot interests
//! here; a dedicated thread polls and converts each fired interest into
//! one `Packet::Io` on the completion port. This is what turns a
//! readiness platform into the completion model the loop is written
//! against: one armed interest, one packet.
//!
//! Commands travel over a lock-free queue and a `mio::Waker` kicks the
//! poll out of its block. Command order is preserved, which matters when
//! a descriptor number is closed and immediately reused: the `Forget`
//! for the old incarnation is processed before the `Arm` for the new
//! one.

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::thread;

use crossbeam_queue::SegQueue;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};

use ripple_core::{rdebug, rerror, rtrace};

use crate::port::{CompletionPort, Packet};

const WAKE_TOKEN: Token = Token(usize::MAX);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Read,
    Write,
}

enum Cmd {
    Arm {
        fd: RawFd,
        token: u64,
        dir: Direction,
    },
    Forget {
        fd: RawFd,
    },
    Shutdown,
}

#[derive(Default)]
struct FdState {
    rd: Option<u64>,
    wr: Option<u64>,
    registered: bool,
}

pub(crate) struct Poller {
    cmds: Arc<SegQueue<Cmd>>,
    waker: Arc<Waker>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Poller {
    pub(crate) fn new(port: Arc<CompletionPort>) -> io::Result<Poller> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        let cmds: Arc<SegQueue<Cmd>> = Arc::new(SegQueue::new());

        let thread_cmds = Arc::clone(&cmds);
        let thread = thread::Builder::new()
            .name("ripple-poll".into())
            .spawn(move || poll_loop(poll, port, thread_cmds))?;

        Ok(Poller {
            cmds,
            waker,
            thread: Some(thread),
        })
    }

    /// Arm a single-shot interest. Exactly one `Packet::Io { token }`
    /// will be posted once the direction is ready (or the descriptor
    /// errors out).
    pub(crate) fn arm(&self, fd: RawFd, token: u64, dir: Direction) {
        self.cmds.push(Cmd::Arm { fd, token, dir });
        self.wake();
    }

    /// Drop all interest in `fd`. Armed tokens for it will never fire;
    /// the caller synthesizes their completions.
    pub(crate) fn forget(&self, fd: RawFd) {
        self.cmds.push(Cmd::Forget { fd });
        self.wake();
    }

    fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            rerror!("poller: wake failed: {}", e);
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.cmds.push(Cmd::Shutdown);
        self.wake();
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

fn interest_of(st: &FdState) -> Option<Interest> {
    match (st.rd.is_some(), st.wr.is_some()) {
        (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}

/// Bring the kernel registration in line with the armed slots.
///
/// Registration errors are logged and swallowed: a racing close makes
/// them expected, and the armed token will be completed synthetically by
/// the closer in that case.
fn reconcile(poll: &Poll, fd: RawFd, st: &mut FdState) {
    let mut src = SourceFd(&fd);
    match interest_of(st) {
        Some(interest) => {
            let res = if st.registered {
                poll.registry().reregister(&mut src, Token(fd as usize), interest)
            } else {
                poll.registry().register(&mut src, Token(fd as usize), interest)
            };
            match res {
                Ok(()) => st.registered = true,
                Err(e) => rdebug!("poller: (re)register fd={} failed: {}", fd, e),
            }
        }
        None => {
            if st.registered {
                if let Err(e) = poll.registry().deregister(&mut src) {
                    rdebug!("poller: deregister fd={} failed: {}", fd, e);
                }
                st.registered = false;
            }
        }
    }
}

fn poll_loop(mut poll: Poll, port: Arc<CompletionPort>, cmds: Arc<SegQueue<Cmd>>) {
    let mut events = Events::with_capacity(256);
    let mut fds: HashMap<RawFd, FdState> = HashMap::new();

    'outer: loop {
        if let Err(e) = poll.poll(&mut events, None) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            rerror!("poller: poll failed: {}", e);
            break;
        }

        // Commands first: a Forget must win over events already captured
        // for the same descriptor.
        while let Some(cmd) = cmds.pop() {
            match cmd {
                Cmd::Arm { fd, token, dir } => {
                    rtrace!("poller: arm fd={} token={} {:?}", fd, token, dir);
                    let st = fds.entry(fd).or_default();
                    let slot = match dir {
                        Direction::Read => &mut st.rd,
                        Direction::Write => &mut st.wr,
                    };
                    if let Some(old) = slot.replace(token) {
                        rdebug!("poller: fd={} re-armed over token {}", fd, old);
                    }
                    reconcile(&poll, fd, st);
                }
                Cmd::Forget { fd } => {
                    rtrace!("poller: forget fd={}", fd);
                    if let Some(mut st) = fds.remove(&fd) {
                        st.rd = None;
                        st.wr = None;
                        reconcile(&poll, fd, &mut st);
                    }
                }
                Cmd::Shutdown => break 'outer,
            }
        }

        let mut touched: Vec<RawFd> = Vec::new();
        for ev in events.iter() {
            if ev.token() == WAKE_TOKEN {
                continue;
            }
            let fd = ev.token().0 as RawFd;
            let Some(st) = fds.get_mut(&fd) else { continue };

            // An errored or half-closed descriptor satisfies both
            // directions: the follow-up syscall reports the real error.
            let broken = ev.is_error() || ev.is_read_closed() || ev.is_write_closed();
            if ev.is_readable() || broken {
                if let Some(token) = st.rd.take() {
                    port.post(Packet::Io { token });
                }
            }
            if ev.is_writable() || broken {
                if let Some(token) = st.wr.take() {
                    port.post(Packet::Io { token });
                }
            }
            touched.push(fd);
        }

        for fd in touched {
            if let Some(st) = fds.get_mut(&fd) {
                reconcile(&poll, fd, st);
                if !st.registered && st.rd.is_none() && st.wr.is_none() {
                    fds.remove(&fd);
                }
            }
        }
    }
    rdebug!("poller: thread exiting, {} descriptors tracked", fds.len());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys;
    use std::os::fd::AsRawFd;
    use std::time::Duration;

    #[test]
    fn test_read_interest_fires_once() {
        let port = Arc::new(CompletionPort::new());
        let poller = Poller::new(Arc::clone(&port)).unwrap();
        let (a, b) = sys::socketpair_stream().unwrap();

        poller.arm(b.as_raw_fd(), 11, Direction::Read);
        sys::write_nb(a.as_raw_fd(), b"x").unwrap();

        let p = port.dequeue(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(p.token(), 11);
        // single-shot: no second packet without re-arming
        assert!(port.dequeue(Some(Duration::from_millis(50))).is_none());
    }

    #[test]
    fn test_write_interest_fires_immediately() {
        let port = Arc::new(CompletionPort::new());
        let poller = Poller::new(Arc::clone(&port)).unwrap();
        let (_a, b) = sys::socketpair_stream().unwrap();

        // An empty socket buffer is writable right away.
        poller.arm(b.as_raw_fd(), 21, Direction::Write);
        let p = port.dequeue(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(p.token(), 21);
    }

    #[test]
    fn test_forget_suppresses_events() {
        let port = Arc::new(CompletionPort::new());
        let poller = Poller::new(Arc::clone(&port)).unwrap();
        let (a, b) = sys::socketpair_stream().unwrap();

        poller.arm(b.as_raw_fd(), 31, Direction::Read);
        poller.forget(b.as_raw_fd());
        sys::write_nb(a.as_raw_fd(), b"x").unwrap();
        assert!(port.dequeue(Some(Duration::from_millis(100))).is_none());
    }
}
