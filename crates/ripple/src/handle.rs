//! Handle lifecycle: shared core state and the close protocol.
//!
//! Closing is a two-phase teardown:
//!
//! ```text
//!   close() ──▶ CLOSING, cancel outstanding work
//!                  │  (synthesized completions drain reqs_pending)
//!                  ▼
//!   reqs_pending == 0 ──▶ endgame queue ──▶ CLOSED, release, close_cb
//! ```
//!
//! The close callback runs on the loop thread, exactly once, strictly
//! after every other callback the handle will ever deliver. Requests
//! cancelled by the teardown complete through their normal dispatchers
//! with a broken-resource error.

use std::mem;
use std::os::fd::RawFd;

use cfg_if::cfg_if;

use ripple_core::handle::{HandleFlags, HandleKind};
use ripple_core::rtrace;

use crate::event_loop::EventLoop;
use crate::fs_event::FsEventHandle;
use crate::pipe::PipeHandle;
use crate::process::ProcessHandle;
use crate::tcp::TcpHandle;
use crate::timer::TimerHandle;
use crate::{fs_event, pipe, process, tcp};

pub type CloseCb = Box<dyn FnOnce()>;

/// State every handle kind embeds.
pub(crate) struct HandleCore {
    pub(crate) lp: EventLoop,
    pub(crate) kind: HandleKind,
    pub(crate) flags: HandleFlags,
    pub(crate) reqs_pending: u32,
    pub(crate) close_cb: Option<CloseCb>,
}

impl HandleCore {
    pub(crate) fn new(lp: &EventLoop, kind: HandleKind) -> Self {
        lp.add_ref();
        HandleCore {
            lp: lp.clone(),
            kind,
            flags: HandleFlags::new(),
            reqs_pending: 0,
            close_cb: None,
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        if self.flags.is_closing() {
            return false;
        }
        self.reqs_pending > 0
            || self
                .flags
                .has(HandleFlags::READING | HandleFlags::LISTENING)
    }
}

/// Internal discriminated handle, cloned into loop queues.
#[derive(Clone)]
pub(crate) enum Handle {
    Tcp(TcpHandle),
    Pipe(PipeHandle),
    Timer(TimerHandle),
    Process(ProcessHandle),
    FsEvent(FsEventHandle),
}

impl Handle {
    pub(crate) fn with_core<R>(&self, f: impl FnOnce(&mut HandleCore) -> R) -> R {
        match self {
            Handle::Tcp(h) => f(&mut h.inner.borrow_mut().core),
            Handle::Pipe(h) => f(&mut h.inner.borrow_mut().core),
            Handle::Timer(h) => f(&mut h.inner.borrow_mut().core),
            Handle::Process(h) => f(&mut h.inner.borrow_mut().core),
            Handle::FsEvent(h) => f(&mut h.inner.borrow_mut().core),
        }
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.with_core(|c| c.flags.is_closing())
    }

    pub(crate) fn loop_(&self) -> EventLoop {
        self.with_core(|c| c.lp.clone())
    }
}

/// One outstanding request joined the handle.
pub(crate) fn add_req(h: &Handle) {
    h.with_core(|c| c.reqs_pending += 1);
}

/// One outstanding request finished. The last one out while CLOSING
/// queues the endgame.
pub(crate) fn dec_req(h: &Handle) {
    let endgame_ready = h.with_core(|c| {
        debug_assert!(c.reqs_pending > 0, "reqs_pending underflow");
        c.reqs_pending -= 1;
        c.reqs_pending == 0
            && c.flags.has(HandleFlags::CLOSING)
            && !c.flags.has(HandleFlags::CLOSED)
    });
    if endgame_ready {
        queue_endgame(h);
    }
}

pub(crate) fn queue_endgame(h: &Handle) {
    let lp = h.loop_();
    lp.inner.endgame.borrow_mut().push_back(h.clone());
}

/// Begin teardown. Idempotent: the second and later calls are no-ops
/// and their callback is dropped.
pub(crate) fn close(h: Handle, cb: Option<CloseCb>) {
    let proceed = h.with_core(move |c| {
        if c.flags.is_closing() {
            return None;
        }
        c.flags.set(HandleFlags::CLOSING);
        c.close_cb = cb;
        Some(c.kind)
    });
    let Some(kind) = proceed else { return };
    rtrace!("close {:?}: cancelling outstanding work", kind);

    match &h {
        Handle::Tcp(t) => tcp::close_start(t),
        Handle::Pipe(p) => pipe::close_start(p),
        Handle::Timer(t) => t.close_start(),
        Handle::Process(p) => process::close_start(p),
        Handle::FsEvent(w) => fs_event::close_start(w),
    }

    let ready = h.with_core(|c| c.reqs_pending == 0);
    if ready {
        queue_endgame(&h);
    }
}

/// Endgame: final transition to CLOSED. Runs on the loop thread with no
/// outstanding requests left.
pub(crate) fn process_endgame(h: &Handle) {
    let done = h.with_core(|c| {
        debug_assert_eq!(c.reqs_pending, 0);
        if c.flags.has(HandleFlags::CLOSED) {
            return None;
        }
        c.flags.set(HandleFlags::CLOSED);
        Some((c.lp.clone(), c.close_cb.take(), c.kind))
    });
    let Some((lp, cb, kind)) = done else { return };
    rtrace!("endgame {:?}: handle closed", kind);

    // Kind-specific release: descriptors, watchers, stored callbacks.
    // Dropping callbacks here breaks Rc cycles through captured handles.
    match h {
        Handle::Tcp(t) => tcp::endgame_cleanup(t),
        Handle::Pipe(p) => pipe::endgame_cleanup(p),
        Handle::Timer(t) => t.endgame_cleanup(),
        Handle::Process(p) => process::endgame_cleanup(p),
        Handle::FsEvent(w) => fs_event::endgame_cleanup(w),
    }

    lp.unref();
    if let Some(cb) = cb {
        cb();
    }
}

/// Classify a raw descriptor the way stdio bridging needs: sockets are
/// split into TCP and pipe-alike by address family.
pub fn guess_handle(fd: RawFd) -> HandleKind {
    if fd < 0 {
        return HandleKind::Unknown;
    }
    let mut st: libc::stat = unsafe { mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut st) } == -1 {
        return HandleKind::Unknown;
    }
    match st.st_mode & libc::S_IFMT {
        libc::S_IFSOCK => {
            cfg_if! {
                if #[cfg(target_os = "linux")] {
                    let mut domain: libc::c_int = 0;
                    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
                    let rc = unsafe {
                        libc::getsockopt(
                            fd,
                            libc::SOL_SOCKET,
                            libc::SO_DOMAIN,
                            &mut domain as *mut _ as *mut libc::c_void,
                            &mut len,
                        )
                    };
                    if rc == -1 {
                        return HandleKind::Unknown;
                    }
                    match domain {
                        libc::AF_UNIX => HandleKind::NamedPipe,
                        libc::AF_INET | libc::AF_INET6 => HandleKind::Tcp,
                        _ => HandleKind::Unknown,
                    }
                } else {
                    HandleKind::NamedPipe
                }
            }
        }
        libc::S_IFIFO => HandleKind::NamedPipe,
        libc::S_IFCHR => {
            if unsafe { libc::isatty(fd) } == 1 {
                HandleKind::Tty
            } else {
                HandleKind::Unknown
            }
        }
        libc::S_IFREG => HandleKind::File,
        _ => HandleKind::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys;
    use std::os::fd::AsRawFd;

    #[test]
    fn test_guess_handle_kinds() {
        let (a, _b) = sys::socketpair_stream().unwrap();
        assert_eq!(guess_handle(a.as_raw_fd()), HandleKind::NamedPipe);
        assert_eq!(guess_handle(-1), HandleKind::Unknown);

        let f = std::fs::File::open("/proc/self/exe")
            .or_else(|_| std::fs::File::open("/bin/sh"))
            .unwrap();
        assert_eq!(guess_handle(f.as_raw_fd()), HandleKind::File);

        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        assert_eq!(guess_handle(l.as_raw_fd()), HandleKind::Tcp);
    }
}
