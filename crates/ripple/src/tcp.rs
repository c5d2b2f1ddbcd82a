//! TCP handles.
//!
//! A `TcpHandle` is a stream handle over an `AF_INET`/`AF_INET6`
//! socket. The socket is created lazily at the first `bind` or
//! `connect`, always non-blocking. Accepted connections are parked
//! FIFO until the user claims them with [`TcpHandle::accept`], one
//! connection callback per parked socket.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, IntoRawFd, RawFd};
use std::rc::Rc;
use std::time::Duration;

use socket2::{Domain, Protocol, SockAddr, Socket, TcpKeepalive, Type};

use ripple_core::error::{Code, Error, Result};
use ripple_core::handle::{HandleFlags, HandleKind};
use ripple_core::rdebug;

use crate::event_loop::{EventLoop, Inflight};
use crate::handle::{self, CloseCb, Handle, HandleCore};
use crate::poller::Direction;
use crate::stream::{self, AllocCb, ConnectCb, ConnectionCb, ReadCb, ReadSlot, Seg, ShutdownCb, StreamCore, WriteCb};
use crate::sys;

pub(crate) struct TcpInner {
    pub(crate) core: HandleCore,
    pub(crate) stream: StreamCore,
    pub(crate) sock: Option<Socket>,
    pending_accepts: VecDeque<Socket>,
}

#[derive(Clone)]
pub struct TcpHandle {
    pub(crate) inner: Rc<RefCell<TcpInner>>,
}

// the inner is callback-laden; the flag word is the useful part
impl std::fmt::Debug for TcpHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TcpHandle({:#x})", self.inner.borrow().core.flags.bits())
    }
}

impl TcpHandle {
    pub fn new(lp: &EventLoop) -> TcpHandle {
        TcpHandle {
            inner: Rc::new(RefCell::new(TcpInner {
                core: HandleCore::new(lp, HandleKind::Tcp),
                stream: StreamCore::new(),
                sock: None,
                pending_accepts: VecDeque::new(),
            })),
        }
    }

    /// Wrap an already-connected socket (an accepted or passed one).
    pub(crate) fn import(lp: &EventLoop, sock: Socket, adopted: bool) -> Result<TcpHandle> {
        sock.set_nonblocking(true).map_err(Error::from)?;
        let h = TcpHandle::new(lp);
        {
            let mut i = h.inner.borrow_mut();
            i.core.flags.set(
                HandleFlags::CONNECTED | HandleFlags::READABLE | HandleFlags::WRITABLE,
            );
            if adopted {
                i.core.flags.set(HandleFlags::ADOPTED);
            }
            i.sock = Some(sock);
        }
        Ok(h)
    }

    /// Adopt an existing connected socket. The descriptor is released
    /// rather than closed when the handle closes.
    pub fn open(lp: &EventLoop, fd: std::os::fd::OwnedFd) -> Result<TcpHandle> {
        TcpHandle::import(lp, Socket::from(fd), true).map_err(|e| lp.fail(e))
    }

    fn as_handle(&self) -> Handle {
        Handle::Tcp(self.clone())
    }

    fn lp(&self) -> EventLoop {
        self.inner.borrow().core.lp.clone()
    }

    fn ensure_socket(&self, domain: Domain) -> Result<()> {
        let mut i = self.inner.borrow_mut();
        if i.sock.is_some() {
            return Ok(());
        }
        let sock =
            Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).map_err(Error::from)?;
        sock.set_nonblocking(true).map_err(Error::from)?;
        i.sock = Some(sock);
        Ok(())
    }

    pub fn bind(&self, addr: SocketAddr) -> Result<()> {
        let lp = self.lp();
        let check = {
            let i = self.inner.borrow();
            if i.core.flags.is_closing() {
                Err(Error::new(Code::Ebadf))
            } else if i.core.flags.has(HandleFlags::BOUND) {
                Err(Error::new(Code::Einval))
            } else {
                Ok(())
            }
        };
        check.map_err(|e| lp.fail(e))?;
        self.ensure_socket(Domain::for_address(addr))
            .map_err(|e| lp.fail(e))?;
        let res = {
            let i = self.inner.borrow();
            let sock = i.sock.as_ref().ok_or(Error::new(Code::Ebadf))?;
            sock.set_reuse_address(true).map_err(Error::from)?;
            sock.bind(&SockAddr::from(addr)).map_err(Error::from)
        };
        res.map_err(|e| lp.fail(e))?;
        self.inner.borrow_mut().core.flags.set(HandleFlags::BOUND);
        Ok(())
    }

    pub fn listen(
        &self,
        backlog: i32,
        cb: impl FnMut(Result<()>) + 'static,
    ) -> Result<()> {
        let lp = self.lp();
        let fd = {
            let mut i = self.inner.borrow_mut();
            if i.core.flags.is_closing() {
                return Err(lp.fail(Error::new(Code::Ebadf)));
            }
            if !i.core.flags.has(HandleFlags::BOUND) {
                return Err(lp.fail(Error::new(Code::Einval)));
            }
            if i.core.flags.has(HandleFlags::LISTENING) {
                return Err(lp.fail(Error::new(Code::Ealready)));
            }
            let sock = match i.sock.as_ref() {
                Some(s) => s,
                None => return Err(lp.fail(Error::new(Code::Ebadf))),
            };
            sock.listen(backlog).map_err(|e| lp.fail(Error::from(e)))?;
            let fd = sock.as_raw_fd();
            i.core.flags.set(HandleFlags::LISTENING);
            let boxed: ConnectionCb = Box::new(cb);
            i.stream.connection_cb = Some(Rc::new(RefCell::new(boxed)));
            fd
        };
        arm_accept(&self.as_handle(), fd);
        Ok(())
    }

    /// Claim the oldest parked connection.
    pub fn accept(&self) -> Result<TcpHandle> {
        let lp = self.lp();
        let sock = self
            .inner
            .borrow_mut()
            .pending_accepts
            .pop_front()
            .ok_or(Error::new(Code::Eagain))
            .map_err(|e| lp.fail(e))?;
        TcpHandle::import(&lp, sock, false).map_err(|e| lp.fail(e))
    }

    pub fn connect(&self, addr: SocketAddr, cb: impl FnOnce(Result<()>) + 'static) -> Result<()> {
        let lp = self.lp();
        {
            let i = self.inner.borrow();
            if i.core.flags.is_closing() {
                return Err(lp.fail(Error::new(Code::Ebadf)));
            }
            if i.core.flags.has(HandleFlags::CONNECTED) {
                return Err(lp.fail(Error::new(Code::Eisconn)));
            }
            if i.stream.connect_cb.is_some() {
                return Err(lp.fail(Error::new(Code::Ealready)));
            }
        }
        self.ensure_socket(Domain::for_address(addr))
            .map_err(|e| lp.fail(e))?;

        let res = {
            let i = self.inner.borrow();
            let sock = i.sock.as_ref().ok_or(Error::new(Code::Ebadf))?;
            sock.connect(&SockAddr::from(addr))
                .map(|_| sock.as_raw_fd())
                .map_err(|e| (e, sock.as_raw_fd()))
        };
        let h = self.as_handle();
        let boxed: ConnectCb = Box::new(cb);
        match res {
            Ok(_) => {
                // loopback connects can finish synchronously; report
                // through the pending queue like everything else
                self.inner.borrow_mut().stream.connect_cb = Some(boxed);
                handle::add_req(&h);
                lp.push_pending(crate::event_loop::PendingReq::Connect(h));
            }
            Err((e, fd)) if sys::in_progress(&e) => {
                let token = lp.arm_io(fd, Direction::Write, Inflight::Connect(h.clone()));
                let mut i = self.inner.borrow_mut();
                i.stream.connect_cb = Some(boxed);
                i.stream.connect_token = Some(token);
                drop(i);
                handle::add_req(&h);
            }
            Err((e, _)) => return Err(lp.fail(Error::from(e))),
        }
        Ok(())
    }

    pub fn getsockname(&self) -> Result<SocketAddr> {
        let i = self.inner.borrow();
        let sock = i.sock.as_ref().ok_or(Error::new(Code::Ebadf))?;
        sock.local_addr()
            .map_err(Error::from)?
            .as_socket()
            .ok_or(Error::new(Code::Einval))
    }

    pub fn getpeername(&self) -> Result<SocketAddr> {
        let i = self.inner.borrow();
        let sock = i.sock.as_ref().ok_or(Error::new(Code::Ebadf))?;
        sock.peer_addr()
            .map_err(Error::from)?
            .as_socket()
            .ok_or(Error::new(Code::Enotconn))
    }

    pub fn set_nodelay(&self, enable: bool) -> Result<()> {
        let i = self.inner.borrow();
        let sock = i.sock.as_ref().ok_or(Error::new(Code::Ebadf))?;
        sock.set_nodelay(enable).map_err(Error::from)
    }

    /// Enable keepalive probes after `delay` seconds of idleness, or
    /// disable them.
    pub fn set_keepalive(&self, enable: bool, delay_secs: u64) -> Result<()> {
        let i = self.inner.borrow();
        let sock = i.sock.as_ref().ok_or(Error::new(Code::Ebadf))?;
        if enable {
            let ka = TcpKeepalive::new().with_time(Duration::from_secs(delay_secs));
            sock.set_tcp_keepalive(&ka).map_err(Error::from)
        } else {
            sock.set_keepalive(false).map_err(Error::from)
        }
    }

    pub fn read_start(
        &self,
        alloc: impl FnMut(usize) -> Vec<u8> + 'static,
        cb: impl FnMut(Result<usize>, Vec<u8>) + 'static,
    ) -> Result<()> {
        let boxed: ReadCb = Box::new(cb);
        stream::read_start(
            &self.as_handle(),
            Box::new(alloc) as AllocCb,
            ReadSlot::Plain(Rc::new(RefCell::new(boxed))),
        )
    }

    pub fn read_stop(&self) {
        stream::read_stop(&self.as_handle());
    }

    pub fn write(&self, data: &[u8], cb: impl FnOnce(Result<()>) + 'static) -> Result<()> {
        let mut segs = VecDeque::new();
        segs.push_back(Seg::bytes(data.to_vec()));
        stream::write_segs(&self.as_handle(), segs, Some(Box::new(cb) as WriteCb))
    }

    pub fn shutdown(&self, cb: impl FnOnce(Result<()>) + 'static) -> Result<()> {
        stream::shutdown(&self.as_handle(), Box::new(cb) as ShutdownCb)
    }

    pub fn close(&self, cb: impl FnOnce() + 'static) {
        handle::close(self.as_handle(), Some(Box::new(cb) as CloseCb));
    }

    pub fn close_silent(&self) {
        handle::close(self.as_handle(), None);
    }

    pub fn is_closing(&self) -> bool {
        self.inner.borrow().core.flags.is_closing()
    }

    /// Reading, listening, or carrying outstanding requests.
    pub fn is_active(&self) -> bool {
        self.inner.borrow().core.is_active()
    }

    pub fn is_readable(&self) -> bool {
        self.inner.borrow().core.flags.has(HandleFlags::READABLE)
    }

    pub fn is_writable(&self) -> bool {
        self.inner.borrow().core.flags.has(HandleFlags::WRITABLE)
    }

    pub fn write_queue_size(&self) -> usize {
        self.inner.borrow().stream.write_queue_size
    }

    /// Raw descriptor for passing over an IPC pipe.
    pub(crate) fn raw_fd(&self) -> Option<RawFd> {
        self.inner.borrow().sock.as_ref().map(|s| s.as_raw_fd())
    }
}

fn arm_accept(h: &Handle, fd: RawFd) {
    let lp = h.loop_();
    let token = lp.arm_io(fd, Direction::Read, Inflight::Accept(h.clone()));
    stream::with(h, |s, _| s.accept_token = Some(token));
    handle::add_req(h);
}

/// Accept-completion dispatcher: drain the backlog, one connection
/// callback per accepted socket, then re-arm.
pub(crate) fn process_accept(h: &Handle) {
    let Handle::Tcp(t) = h else { return };
    let live = {
        let i = t.inner.borrow();
        !i.core.flags.is_closing() && i.core.flags.has(HandleFlags::LISTENING)
    };
    if live {
        loop {
            let res = {
                let i = t.inner.borrow();
                match i.sock.as_ref() {
                    Some(sock) => sock.accept(),
                    None => break,
                }
            };
            match res {
                Ok((sock, _peer)) => {
                    if let Err(e) = sock.set_nonblocking(true) {
                        rdebug!("accept: set_nonblocking failed: {}", e);
                    }
                    t.inner.borrow_mut().pending_accepts.push_back(sock);
                    fire_connection_cb(h, Ok(()));
                }
                Err(e) if sys::would_block(&e) => break,
                Err(e) => {
                    fire_connection_cb(h, Err(Error::from(e)));
                    break;
                }
            }
            if h.is_closing() {
                break;
            }
        }
        let fd = {
            let i = t.inner.borrow();
            if i.core.flags.is_closing() || !i.core.flags.has(HandleFlags::LISTENING) {
                None
            } else {
                i.sock.as_ref().map(|s| s.as_raw_fd())
            }
        };
        if let Some(fd) = fd {
            arm_accept(h, fd);
        }
    }
    handle::dec_req(h);
}

fn fire_connection_cb(h: &Handle, status: Result<()>) {
    let cb = stream::with(h, |s, _| s.connection_cb.as_ref().map(Rc::clone));
    if let Some(cb) = cb {
        (cb.borrow_mut())(status);
    }
}

/// Connect-completion dispatcher.
pub(crate) fn process_connect(h: &Handle) {
    let Handle::Tcp(t) = h else {
        handle::dec_req(h);
        return;
    };
    let cb = t.inner.borrow_mut().stream.connect_cb.take();
    let status = if h.is_closing() {
        Err(Error::new(Code::Ebadf))
    } else {
        let res = {
            let i = t.inner.borrow();
            match i.sock.as_ref() {
                Some(sock) => sock.take_error(),
                None => Ok(Some(std::io::Error::from_raw_os_error(libc::EBADF))),
            }
        };
        match res {
            Ok(None) => {
                t.inner.borrow_mut().core.flags.set(
                    HandleFlags::CONNECTED | HandleFlags::READABLE | HandleFlags::WRITABLE,
                );
                Ok(())
            }
            Ok(Some(e)) => Err(Error::from(e)),
            Err(e) => Err(Error::from(e)),
        }
    };
    if let Some(cb) = cb {
        cb(status);
    }
    handle::dec_req(h);
}

pub(crate) fn close_start(t: &TcpHandle) {
    let h = Handle::Tcp(t.clone());
    let fds: Vec<RawFd> = t
        .inner
        .borrow()
        .sock
        .as_ref()
        .map(|s| s.as_raw_fd())
        .into_iter()
        .collect();
    stream::close_start_common(&h, &fds);
    let mut i = t.inner.borrow_mut();
    i.pending_accepts.clear();
    if i.core.flags.has(HandleFlags::ADOPTED) {
        // adopted descriptors are not ours to close
        if let Some(sock) = i.sock.take() {
            let _ = sock.into_raw_fd();
        }
    } else {
        i.sock = None;
    }
}

pub(crate) fn endgame_cleanup(t: &TcpHandle) {
    stream::endgame_common(&Handle::Tcp(t.clone()));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_and_getsockname() {
        let lp = EventLoop::new().unwrap();
        let t = TcpHandle::new(&lp);
        t.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = t.getsockname().unwrap();
        assert_eq!(addr.ip().to_string(), "127.0.0.1");
        assert_ne!(addr.port(), 0);
        t.close_silent();
        lp.run();
    }

    #[test]
    fn test_rebind_is_rejected() {
        let lp = EventLoop::new().unwrap();
        let t = TcpHandle::new(&lp);
        t.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let e = t.bind("127.0.0.1:0".parse().unwrap()).unwrap_err();
        assert_eq!(e.code(), Code::Einval);
        assert_eq!(lp.last_error().unwrap().code(), Code::Einval);
        t.close_silent();
        lp.run();
    }

    #[test]
    fn test_accept_with_empty_backlog() {
        let lp = EventLoop::new().unwrap();
        let t = TcpHandle::new(&lp);
        t.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        t.listen(8, |_| {}).unwrap();
        assert_eq!(t.accept().unwrap_err().code(), Code::Eagain);
        t.close_silent();
        lp.run();
    }
}
