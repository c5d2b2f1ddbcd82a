//! Named-pipe handles over Unix-domain sockets.
//!
//! A pipe is a stream handle bound to a filesystem path (or adopted
//! from an existing descriptor with [`PipeHandle::open`]). Pipes
//! created in IPC mode frame every write and can carry a stream handle
//! across the connection:
//!
//! ```text
//!   ┌──────── 16-byte header ────────┐
//!   │ opcode │  pad  │  u64 argument │ payload...
//!   └────────────────────────────────┘
//!   RAW_DATA: argument = payload length, payload follows inline
//!   STREAM:   argument = handle kind, the descriptor rides as
//!             ancillary rights on the header bytes
//! ```
//!
//! Connecting to a busy peer retries from a helper thread until the
//! listener accepts or the attempt times out, mirroring a bounded wait
//! on a busy pipe instance.
//!
//! After a shutdown completes the pipe arms a short EOF timer: if the
//! peer neither sends nor closes within it, the pipe forces EOF so a
//! request-response client is not left hanging.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::{Duration, Instant};

use socket2::{Domain, SockAddr, Socket, Type};

use ripple_core::constants::{PIPE_CONNECT_WAIT_MS, PIPE_EOF_TIMEOUT_MS};
use ripple_core::error::{Code, Error, Result};
use ripple_core::frame::Frame;
use ripple_core::handle::{HandleFlags, HandleKind};
use ripple_core::rdebug;

use crate::event_loop::{EventLoop, Inflight, PendingReq};
use crate::handle::{self, CloseCb, Handle, HandleCore};
use crate::poller::Direction;
use crate::port::Packet;
use crate::stream::{self, AllocCb, ConnectCb, ConnectionCb, Read2Cb, ReadCb, ReadSlot, Seg, ShutdownCb, StreamCore, WriteCb};
use crate::sys;
use crate::tcp::TcpHandle;
use crate::timer::TimerHandle;

pub(crate) struct PipeInner {
    pub(crate) core: HandleCore,
    pub(crate) stream: StreamCore,
    pub(crate) conn: Option<Socket>,
    pub(crate) listener: Option<Socket>,
    bound_path: Option<PathBuf>,
    pending_accepts: VecDeque<Socket>,
    /// Unconsumed payload bytes of the current RAW_DATA frame.
    remaining_ipc: u64,
    /// A passed descriptor waiting for `accept_tcp`.
    pending_stream: Option<(OwnedFd, HandleKind)>,
    eof_timer: Option<TimerHandle>,
}

#[derive(Clone)]
pub struct PipeHandle {
    pub(crate) inner: Rc<RefCell<PipeInner>>,
}

impl std::fmt::Debug for PipeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PipeHandle({:#x})", self.inner.borrow().core.flags.bits())
    }
}

impl PipeHandle {
    pub fn new(lp: &EventLoop, ipc: bool) -> PipeHandle {
        let mut core = HandleCore::new(lp, HandleKind::NamedPipe);
        if ipc {
            core.flags.set(HandleFlags::IPC);
        }
        PipeHandle {
            inner: Rc::new(RefCell::new(PipeInner {
                core,
                stream: StreamCore::new(),
                conn: None,
                listener: None,
                bound_path: None,
                pending_accepts: VecDeque::new(),
                remaining_ipc: 0,
                pending_stream: None,
                eof_timer: None,
            })),
        }
    }

    fn as_handle(&self) -> Handle {
        Handle::Pipe(self.clone())
    }

    fn lp(&self) -> EventLoop {
        self.inner.borrow().core.lp.clone()
    }

    fn is_ipc(&self) -> bool {
        self.inner.borrow().core.flags.has(HandleFlags::IPC)
    }

    /// Wrap an accepted or passed connection.
    pub(crate) fn import(lp: &EventLoop, sock: Socket, ipc: bool) -> Result<PipeHandle> {
        sock.set_nonblocking(true).map_err(Error::from)?;
        let h = PipeHandle::new(lp, ipc);
        {
            let mut i = h.inner.borrow_mut();
            i.core.flags.set(
                HandleFlags::CONNECTED | HandleFlags::READABLE | HandleFlags::WRITABLE,
            );
            i.conn = Some(sock);
        }
        Ok(h)
    }

    /// Adopt an existing descriptor, typically an inherited stdio end.
    pub fn open(&self, fd: OwnedFd) -> Result<()> {
        let lp = self.lp();
        let mut i = self.inner.borrow_mut();
        if i.core.flags.is_closing() {
            return Err(lp.fail(Error::new(Code::Ebadf)));
        }
        if i.conn.is_some() || i.listener.is_some() {
            return Err(lp.fail(Error::new(Code::Ebusy)));
        }
        let sock = Socket::from(fd);
        sock.set_nonblocking(true)
            .map_err(|e| lp.fail(Error::from(e)))?;
        i.core.flags.set(
            HandleFlags::CONNECTED
                | HandleFlags::READABLE
                | HandleFlags::WRITABLE
                | HandleFlags::ADOPTED,
        );
        i.conn = Some(sock);
        Ok(())
    }

    pub fn bind(&self, path: impl AsRef<Path>) -> Result<()> {
        let lp = self.lp();
        let path = path.as_ref();
        let mut i = self.inner.borrow_mut();
        if i.core.flags.is_closing() {
            return Err(lp.fail(Error::new(Code::Ebadf)));
        }
        if i.core.flags.has(HandleFlags::BOUND) {
            return Err(lp.fail(Error::new(Code::Einval)));
        }
        let addr = SockAddr::unix(path).map_err(|e| lp.fail(Error::from(e)))?;
        let sock = Socket::new(Domain::UNIX, Type::STREAM, None)
            .map_err(|e| lp.fail(Error::from(e)))?;
        sock.set_nonblocking(true)
            .map_err(|e| lp.fail(Error::from(e)))?;
        sock.bind(&addr).map_err(|e| lp.fail(Error::from(e)))?;
        i.core.flags.set(HandleFlags::BOUND);
        i.bound_path = Some(path.to_path_buf());
        i.listener = Some(sock);
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
            let sock = match i.listener.as_ref() {
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

    /// Claim the oldest parked connection. The new pipe inherits this
    /// listener's IPC mode.
    pub fn accept(&self) -> Result<PipeHandle> {
        let lp = self.lp();
        let ipc = self.is_ipc();
        let sock = self
            .inner
            .borrow_mut()
            .pending_accepts
            .pop_front()
            .ok_or(Error::new(Code::Eagain))
            .map_err(|e| lp.fail(e))?;
        PipeHandle::import(&lp, sock, ipc).map_err(|e| lp.fail(e))
    }

    /// Connect to a listening pipe. A busy listener (full backlog) is
    /// retried from a helper thread until it accepts or the bounded
    /// wait expires with `ETIMEDOUT`.
    pub fn connect(&self, path: impl AsRef<Path>, cb: impl FnOnce(Result<()>) + 'static) -> Result<()> {
        let lp = self.lp();
        let path = path.as_ref().to_path_buf();
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
        let boxed: ConnectCb = Box::new(cb);
        let h = self.as_handle();

        match try_pipe_connect(&path) {
            Ok(sock) => {
                self.inner.borrow_mut().stream.connect_cb = Some(boxed);
                handle::add_req(&h);
                lp.push_pending(PendingReq::PipeConnect { h, result: Ok(sock) });
            }
            Err(e) if e.code() == Code::Eagain || e.code() == Code::Ealready => {
                let token = lp.register(Inflight::PipeConnect(h.clone()));
                {
                    let mut i = self.inner.borrow_mut();
                    i.stream.connect_cb = Some(boxed);
                    i.stream.connect_token = Some(token);
                }
                handle::add_req(&h);
                spawn_connect_thread(&lp, token, path);
            }
            Err(e) => {
                self.inner.borrow_mut().stream.connect_cb = Some(boxed);
                handle::add_req(&h);
                lp.push_pending(PendingReq::PipeConnect { h, result: Err(e) });
            }
        }
        Ok(())
    }

    pub fn read_start(
        &self,
        alloc: impl FnMut(usize) -> Vec<u8> + 'static,
        cb: impl FnMut(Result<usize>, Vec<u8>) + 'static,
    ) -> Result<()> {
        if self.is_ipc() {
            return Err(self.lp().fail(Error::new(Code::Einval)));
        }
        let boxed: ReadCb = Box::new(cb);
        stream::read_start(
            &self.as_handle(),
            Box::new(alloc) as AllocCb,
            ReadSlot::Plain(Rc::new(RefCell::new(boxed))),
        )
    }

    /// IPC read: data chunks arrive with `None`, a passed stream
    /// arrives as an empty chunk with its handle kind, claimable with
    /// [`PipeHandle::accept_tcp`].
    pub fn read2_start(
        &self,
        alloc: impl FnMut(usize) -> Vec<u8> + 'static,
        cb: impl FnMut(Result<usize>, Vec<u8>, Option<HandleKind>) + 'static,
    ) -> Result<()> {
        if !self.is_ipc() {
            return Err(self.lp().fail(Error::new(Code::Einval)));
        }
        let boxed: Read2Cb = Box::new(cb);
        stream::read_start(
            &self.as_handle(),
            Box::new(alloc) as AllocCb,
            ReadSlot::Ipc(Rc::new(RefCell::new(boxed))),
        )
    }

    pub fn read_stop(&self) {
        stream::read_stop(&self.as_handle());
    }

    pub fn write(&self, data: &[u8], cb: impl FnOnce(Result<()>) + 'static) -> Result<()> {
        let mut segs = VecDeque::new();
        if self.is_ipc() {
            let frame = Frame::RawData { len: data.len() as u64 };
            segs.push_back(Seg::bytes(frame.encode().to_vec()));
        }
        segs.push_back(Seg::bytes(data.to_vec()));
        stream::write_segs(&self.as_handle(), segs, Some(Box::new(cb) as WriteCb))
    }

    /// Write over an IPC pipe, passing `pass` to the peer. The
    /// descriptor is duplicated at submission; the caller's handle
    /// stays valid.
    pub fn write2(
        &self,
        data: &[u8],
        pass: &TcpHandle,
        cb: impl FnOnce(Result<()>) + 'static,
    ) -> Result<()> {
        let lp = self.lp();
        if !self.is_ipc() {
            return Err(lp.fail(Error::new(Code::Einval)));
        }
        let fd = pass.raw_fd().ok_or(Error::new(Code::Ebadf)).map_err(|e| lp.fail(e))?;
        let dup = sys::dup_cloexec(fd).map_err(|e| lp.fail(Error::from(e)))?;

        let mut segs = VecDeque::new();
        let hdr = Frame::Stream { kind: HandleKind::Tcp };
        segs.push_back(Seg::with_fd(hdr.encode().to_vec(), dup));
        if !data.is_empty() {
            let raw = Frame::RawData { len: data.len() as u64 };
            segs.push_back(Seg::bytes(raw.encode().to_vec()));
            segs.push_back(Seg::bytes(data.to_vec()));
        }
        stream::write_segs(&self.as_handle(), segs, Some(Box::new(cb) as WriteCb))
    }

    /// Claim the stream most recently announced by the read callback.
    pub fn accept_tcp(&self) -> Result<TcpHandle> {
        let lp = self.lp();
        let stashed = self.inner.borrow_mut().pending_stream.take();
        let (fd, kind) = stashed.ok_or(Error::new(Code::Eagain)).map_err(|e| lp.fail(e))?;
        if kind != HandleKind::Tcp {
            self.inner.borrow_mut().pending_stream = Some((fd, kind));
            return Err(lp.fail(Error::new(Code::Einval)));
        }
        TcpHandle::import(&lp, Socket::from(fd), false).map_err(|e| lp.fail(e))
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
}

fn try_pipe_connect(path: &Path) -> Result<Socket> {
    let addr = SockAddr::unix(path).map_err(Error::from)?;
    let sock = Socket::new(Domain::UNIX, Type::STREAM, None).map_err(Error::from)?;
    sock.set_nonblocking(true).map_err(Error::from)?;
    match sock.connect(&addr) {
        Ok(()) => Ok(sock),
        Err(e) => Err(Error::from(e)),
    }
}

/// Bounded busy-wait: retry the connect off-loop until the listener
/// accepts or the window closes.
fn spawn_connect_thread(lp: &EventLoop, token: u64, path: PathBuf) {
    let port = std::sync::Arc::clone(&lp.inner.port);
    let spawned = std::thread::Builder::new()
        .name("ripple-pipe-connect".into())
        .spawn(move || {
            let deadline = Instant::now() + Duration::from_millis(PIPE_CONNECT_WAIT_MS);
            let result = loop {
                match try_pipe_connect(&path) {
                    Ok(sock) => break Ok(sock),
                    Err(e) if e.code() == Code::Eagain || e.code() == Code::Ealready => {
                        if Instant::now() >= deadline {
                            break Err(Error::new(Code::Etimedout));
                        }
                        std::thread::sleep(Duration::from_millis(1));
                    }
                    Err(e) => break Err(e),
                }
            };
            port.post(Packet::PipeConnect { token, result });
        });
    if let Err(e) = spawned {
        rdebug!("pipe connect: thread spawn failed: {}", e);
        lp.inner
            .port
            .post(Packet::PipeConnect { token, result: Err(Error::new(Code::Enomem)) });
    }
}

fn arm_accept(h: &Handle, fd: RawFd) {
    let lp = h.loop_();
    let token = lp.arm_io(fd, Direction::Read, Inflight::Accept(h.clone()));
    stream::with(h, |s, _| s.accept_token = Some(token));
    handle::add_req(h);
}

pub(crate) fn process_accept(h: &Handle) {
    let Handle::Pipe(p) = h else { return };
    let live = {
        let i = p.inner.borrow();
        !i.core.flags.is_closing() && i.core.flags.has(HandleFlags::LISTENING)
    };
    if live {
        loop {
            let res = {
                let i = p.inner.borrow();
                match i.listener.as_ref() {
                    Some(sock) => sock.accept(),
                    None => break,
                }
            };
            match res {
                Ok((sock, _peer)) => {
                    if let Err(e) = sock.set_nonblocking(true) {
                        rdebug!("pipe accept: set_nonblocking failed: {}", e);
                    }
                    p.inner.borrow_mut().pending_accepts.push_back(sock);
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
            let i = p.inner.borrow();
            if i.core.flags.is_closing() || !i.core.flags.has(HandleFlags::LISTENING) {
                None
            } else {
                i.listener.as_ref().map(|s| s.as_raw_fd())
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

/// Connect resolution, from the immediate path or the retry thread.
pub(crate) fn process_connect(h: &Handle, result: Result<Socket>) {
    let Handle::Pipe(p) = h else {
        handle::dec_req(h);
        return;
    };
    let cb = p.inner.borrow_mut().stream.connect_cb.take();
    let status = if h.is_closing() {
        Err(Error::new(Code::Ebadf))
    } else {
        match result {
            Ok(sock) => {
                let mut i = p.inner.borrow_mut();
                i.core.flags.set(
                    HandleFlags::CONNECTED | HandleFlags::READABLE | HandleFlags::WRITABLE,
                );
                i.conn = Some(sock);
                Ok(())
            }
            Err(e) => Err(e),
        }
    };
    if let Some(cb) = cb {
        cb(status);
    }
    handle::dec_req(h);
}

// ── IPC frame state (driven by the stream engine) ─────────────────────

pub(crate) fn ipc_remaining(p: &PipeHandle) -> u64 {
    p.inner.borrow().remaining_ipc
}

pub(crate) fn set_ipc_remaining(p: &PipeHandle, len: u64) {
    p.inner.borrow_mut().remaining_ipc = len;
}

pub(crate) fn dec_ipc_remaining(p: &PipeHandle, n: u64) {
    let mut i = p.inner.borrow_mut();
    i.remaining_ipc = i.remaining_ipc.saturating_sub(n);
}

pub(crate) fn stash_stream(p: &PipeHandle, fd: OwnedFd, kind: HandleKind) {
    let old = p.inner.borrow_mut().pending_stream.replace((fd, kind));
    if old.is_some() {
        rdebug!("ipc: unclaimed passed stream replaced");
    }
}

// ── EOF timer ─────────────────────────────────────────────────────────
//
// Created when a shutdown completes; from then on every armed read
// races it. If the read completion arrives first the timer is pushed
// back; if the timer fires with nothing readable the pipe forces EOF.

pub(crate) fn on_shutdown_complete(p: &PipeHandle) {
    let lp = p.lp();
    let read_armed = {
        let mut i = p.inner.borrow_mut();
        if i.eof_timer.is_none() {
            i.eof_timer = Some(TimerHandle::new(&lp));
        }
        i.core.flags.has(HandleFlags::READ_PENDING)
    };
    if read_armed {
        eof_timer_start(p);
    }
}

pub(crate) fn eof_timer_start(p: &PipeHandle) {
    let timer = p.inner.borrow().eof_timer.clone();
    let Some(timer) = timer else { return };
    let p2 = p.clone();
    let _ = timer.stop();
    if let Err(e) = timer.start(move || eof_timer_fire(&p2), PIPE_EOF_TIMEOUT_MS, 0) {
        rdebug!("eof timer start failed: {}", e);
    }
}

pub(crate) fn eof_timer_stop(p: &PipeHandle) {
    if let Some(t) = p.inner.borrow().eof_timer.clone() {
        let _ = t.stop();
    }
}

pub(crate) fn eof_timer_destroy(p: &PipeHandle) {
    let timer = p.inner.borrow_mut().eof_timer.take();
    if let Some(t) = timer {
        t.close_silent();
    }
}

fn eof_timer_fire(p: &PipeHandle) {
    let h = Handle::Pipe(p.clone());
    if h.is_closing() {
        return;
    }
    // A completed read is already queued; let it run and re-arm us.
    let ready = stream::with(&h, |s, _| s.read_ready);
    if ready {
        return;
    }
    let lp = p.lp();
    let fd = p.inner.borrow().conn.as_ref().map(|s| s.as_raw_fd());
    if let Some(fd) = fd {
        lp.inner.poller.forget(fd);
    }
    let read_token = stream::with(&h, |s, _| s.read_token.take());
    stream::deliver_eof(&h);
    if let Some(t) = read_token {
        // drain the cancelled read's request accounting
        lp.take_inflight(t);
        lp.push_pending(PendingReq::Read(h.clone()));
    }
}

// ── Teardown ──────────────────────────────────────────────────────────

pub(crate) fn close_start(p: &PipeHandle) {
    let h = Handle::Pipe(p.clone());
    let fds: Vec<RawFd> = {
        let i = p.inner.borrow();
        i.conn
            .iter()
            .chain(i.listener.iter())
            .map(|s| s.as_raw_fd())
            .collect()
    };
    stream::close_start_common(&h, &fds);
    eof_timer_destroy(p);
    let mut i = p.inner.borrow_mut();
    i.pending_accepts.clear();
    i.pending_stream = None;
    i.conn = None;
    i.listener = None;
}

pub(crate) fn endgame_cleanup(p: &PipeHandle) {
    stream::endgame_common(&Handle::Pipe(p.clone()));
    let path = p.inner.borrow_mut().bound_path.take();
    if let Some(path) = path {
        // the pipe name disappears with its last handle
        let _ = std::fs::remove_file(path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn temp_pipe_name(tag: &str) -> PathBuf {
        static SEQ: AtomicU32 = AtomicU32::new(0);
        let n = SEQ.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!(
            "ripple-{}-{}-{}.sock",
            tag,
            std::process::id(),
            n
        ))
    }

    #[test]
    fn test_bind_listen_accept_empty() {
        let lp = EventLoop::new().unwrap();
        let p = PipeHandle::new(&lp, false);
        let name = temp_pipe_name("bind");
        p.bind(&name).unwrap();
        p.listen(8, |_| {}).unwrap();
        assert_eq!(p.accept().unwrap_err().code(), Code::Eagain);
        p.close_silent();
        lp.run();
        assert!(!name.exists(), "bound path should be unlinked on close");
    }

    #[test]
    fn test_bind_collision() {
        let lp = EventLoop::new().unwrap();
        let name = temp_pipe_name("coll");
        let a = PipeHandle::new(&lp, false);
        a.bind(&name).unwrap();
        let b = PipeHandle::new(&lp, false);
        assert_eq!(b.bind(&name).unwrap_err().code(), Code::Eaddrinuse);
        a.close_silent();
        b.close_silent();
        lp.run();
    }

    #[test]
    fn test_connect_missing_name_reports_enoent() {
        let lp = EventLoop::new().unwrap();
        let p = PipeHandle::new(&lp, false);
        let status = Rc::new(RefCell::new(None));
        let s2 = Rc::clone(&status);
        let p2 = p.clone();
        p.connect(temp_pipe_name("missing"), move |r| {
            *s2.borrow_mut() = Some(r);
            p2.close_silent();
        })
        .unwrap();
        lp.run();
        let got = status.borrow_mut().take().unwrap();
        assert_eq!(got.unwrap_err().code(), Code::Enoent);
    }

    #[test]
    fn test_write2_requires_ipc_mode() {
        let lp = EventLoop::new().unwrap();
        let p = PipeHandle::new(&lp, false);
        let t = TcpHandle::new(&lp);
        let e = p.write2(b"x", &t, |_| {}).unwrap_err();
        assert_eq!(e.code(), Code::Einval);
        p.close_silent();
        t.close_silent();
        lp.run();
    }
}
