//! Shared stream engine for TCP and pipe handles.
//!
//! # Design
//!
//! Reads are completion-shaped: `read_start` arms a read interest and
//! nothing else. When the completion arrives the engine peeks the
//! readable byte count, asks the allocator for a buffer of that size,
//! does one non-blocking read per chunk and hands each chunk to the
//! read callback, then re-arms. The library never holds a user buffer
//! across callbacks.
//!
//! Writes try the descriptor immediately. A write that completes in
//! full becomes a synthetic completion through the pending queue, so
//! its callback ordering is identical to the queued case. A write that
//! hits `EAGAIN` parks its remainder on the write queue behind a single
//! armed write interest. Submission order is completion order.
//!
//! Shutdown is deferred until the write queue drains, then half-closes
//! the socket and reports through the pending queue. Pipes arm their
//! EOF timer at that point.
//!
//! Close cancels everything: armed interests are resolved by
//! synthesized completions, queued writes complete with a
//! broken-resource error, and the dispatchers see CLOSING and skip
//! user-visible work.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::rc::Rc;

use ripple_core::error::{Code, Error, Result};
use ripple_core::frame::{Frame, FRAME_HEADER_LEN};
use ripple_core::handle::{HandleFlags, HandleKind};
use ripple_core::{rfatal, rwarn};

use crate::event_loop::{Inflight, PendingReq};
use crate::handle::{self, Handle, HandleCore};
use crate::pipe;
use crate::poller::Direction;
use crate::sys;

// ── Callback types ────────────────────────────────────────────────────

/// Supplies a buffer for an incoming chunk; called with the readable
/// byte count.
pub type AllocCb = Box<dyn FnMut(usize) -> Vec<u8>>;
/// Receives each chunk (or EOF/error) together with the buffer.
pub type ReadCb = Box<dyn FnMut(Result<usize>, Vec<u8>)>;
/// IPC variant: the third argument is the kind of a pending passed
/// stream, to be claimed with `accept_tcp`.
pub type Read2Cb = Box<dyn FnMut(Result<usize>, Vec<u8>, Option<HandleKind>)>;
pub type WriteCb = Box<dyn FnOnce(Result<()>)>;
pub type ShutdownCb = Box<dyn FnOnce(Result<()>)>;
pub type ConnectCb = Box<dyn FnOnce(Result<()>)>;
pub type ConnectionCb = Box<dyn FnMut(Result<()>)>;

pub(crate) enum ReadSlot {
    Plain(Rc<RefCell<ReadCb>>),
    Ipc(Rc<RefCell<Read2Cb>>),
}

impl ReadSlot {
    fn clone_ref(&self) -> ReadSlot {
        match self {
            ReadSlot::Plain(cb) => ReadSlot::Plain(Rc::clone(cb)),
            ReadSlot::Ipc(cb) => ReadSlot::Ipc(Rc::clone(cb)),
        }
    }
}

// ── Write requests ────────────────────────────────────────────────────

pub(crate) struct Seg {
    data: Vec<u8>,
    off: usize,
    /// Descriptor passed with the first byte of this segment.
    fd: Option<OwnedFd>,
}

impl Seg {
    pub(crate) fn bytes(data: Vec<u8>) -> Seg {
        Seg { data, off: 0, fd: None }
    }

    pub(crate) fn with_fd(data: Vec<u8>, fd: OwnedFd) -> Seg {
        Seg { data, off: 0, fd: Some(fd) }
    }
}

pub(crate) struct WriteReq {
    segs: VecDeque<Seg>,
    cb: Option<WriteCb>,
}

impl WriteReq {
    fn new(segs: VecDeque<Seg>, cb: Option<WriteCb>) -> WriteReq {
        WriteReq { segs, cb }
    }

    fn remaining(&self) -> usize {
        self.segs.iter().map(|s| s.data.len() - s.off).sum()
    }
}

enum Flush {
    Done,
    Blocked,
    Error(std::io::Error),
}

fn flush_req(fd: RawFd, req: &mut WriteReq) -> Flush {
    while let Some(seg) = req.segs.front_mut() {
        if seg.off == seg.data.len() {
            req.segs.pop_front();
            continue;
        }
        let res = if seg.fd.is_some() && seg.off == 0 {
            let pass = seg.fd.as_ref().map(|f| f.as_fd());
            sys::sendmsg_fd(fd, &seg.data, pass)
        } else {
            sys::write_nb(fd, &seg.data[seg.off..])
        };
        match res {
            Ok(n) => {
                if seg.off == 0 && seg.fd.is_some() && n > 0 {
                    // rights were delivered with the first byte
                    seg.fd = None;
                }
                seg.off += n;
            }
            Err(e) if sys::would_block(&e) => return Flush::Blocked,
            Err(e) => return Flush::Error(e),
        }
    }
    Flush::Done
}

// ── Core state ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TokenSlot {
    Read,
    Write,
    Connect,
    Accept,
}

pub(crate) struct StreamCore {
    pub(crate) alloc_cb: Option<Rc<RefCell<AllocCb>>>,
    pub(crate) read_cb: Option<ReadSlot>,
    pub(crate) connect_cb: Option<ConnectCb>,
    pub(crate) connection_cb: Option<Rc<RefCell<ConnectionCb>>>,
    pub(crate) shutdown_cb: Option<ShutdownCb>,
    pub(crate) write_queue: VecDeque<WriteReq>,
    pub(crate) write_queue_size: usize,
    pub(crate) write_reqs_pending: u32,
    pub(crate) read_token: Option<u64>,
    pub(crate) write_token: Option<u64>,
    pub(crate) connect_token: Option<u64>,
    pub(crate) accept_token: Option<u64>,
    /// A read completion is sitting in the pending queue; the pipe EOF
    /// timer checks this before forcing the issue.
    pub(crate) read_ready: bool,
}

impl StreamCore {
    pub(crate) fn new() -> StreamCore {
        StreamCore {
            alloc_cb: None,
            read_cb: None,
            connect_cb: None,
            connection_cb: None,
            shutdown_cb: None,
            write_queue: VecDeque::new(),
            write_queue_size: 0,
            write_reqs_pending: 0,
            read_token: None,
            write_token: None,
            connect_token: None,
            accept_token: None,
            read_ready: false,
        }
    }
}

/// Borrow stream and handle core together. Only TCP and pipe handles
/// carry a stream core.
pub(crate) fn with<R>(h: &Handle, f: impl FnOnce(&mut StreamCore, &mut HandleCore) -> R) -> R {
    match h {
        Handle::Tcp(t) => {
            let mut i = t.inner.borrow_mut();
            let i = &mut *i;
            f(&mut i.stream, &mut i.core)
        }
        Handle::Pipe(p) => {
            let mut i = p.inner.borrow_mut();
            let i = &mut *i;
            f(&mut i.stream, &mut i.core)
        }
        _ => unreachable!("stream operation on a non-stream handle"),
    }
}

/// Descriptor the read/write engine works against.
pub(crate) fn stream_fd(h: &Handle) -> Option<RawFd> {
    match h {
        Handle::Tcp(t) => t.inner.borrow().sock.as_ref().map(|s| s.as_raw_fd()),
        Handle::Pipe(p) => {
            let i = p.inner.borrow();
            i.conn
                .as_ref()
                .or(i.listener.as_ref())
                .map(|s| s.as_raw_fd())
        }
        _ => None,
    }
}

fn is_ipc(h: &Handle) -> bool {
    with(h, |_, c| c.flags.has(HandleFlags::IPC))
}

/// Clear a token slot when its packet is resolved, so the close path
/// knows not to cancel it twice. A resolved read also marks
/// `read_ready` for the EOF timer.
pub(crate) fn clear_token(h: &Handle, slot: TokenSlot) {
    with(h, |s, _| {
        match slot {
            TokenSlot::Read => {
                s.read_token = None;
                s.read_ready = true;
            }
            TokenSlot::Write => s.write_token = None,
            TokenSlot::Connect => s.connect_token = None,
            TokenSlot::Accept => s.accept_token = None,
        };
    });
}

// ── Reading ───────────────────────────────────────────────────────────

pub(crate) fn read_start(h: &Handle, alloc: AllocCb, slot: ReadSlot) -> Result<()> {
    let lp = h.loop_();
    with(h, |s, c| {
        if c.flags.is_closing() {
            return Err(Error::new(Code::Ebadf));
        }
        if c.flags.has(HandleFlags::EOF) {
            return Err(Error::new(Code::Eof));
        }
        if !c.flags.has(HandleFlags::CONNECTED) {
            return Err(Error::new(Code::Enotconn));
        }
        if c.flags.has(HandleFlags::READING) {
            return Err(Error::new(Code::Ealready));
        }
        c.flags.set(HandleFlags::READING);
        s.alloc_cb = Some(Rc::new(RefCell::new(alloc)));
        s.read_cb = Some(slot);
        Ok(())
    })
    .map_err(|e| lp.fail(e))?;
    queue_read(h);
    Ok(())
}

pub(crate) fn read_stop(h: &Handle) {
    with(h, |_, c| c.flags.clear(HandleFlags::READING));
    if let Handle::Pipe(p) = h {
        pipe::eof_timer_stop(p);
    }
}

/// Arm the read interest (the zero-byte-read analogue). Idempotent
/// while a read completion is outstanding.
pub(crate) fn queue_read(h: &Handle) {
    let lp = h.loop_();
    let fd = match stream_fd(h) {
        Some(fd) => fd,
        None => return,
    };
    let arm = with(h, |_, c| {
        if c.flags.has(HandleFlags::READ_PENDING) {
            false
        } else {
            c.flags.set(HandleFlags::READ_PENDING);
            true
        }
    });
    if !arm {
        return;
    }
    let token = lp.arm_io(fd, Direction::Read, Inflight::Read(h.clone()));
    with(h, |s, _| s.read_token = Some(token));
    handle::add_req(h);
    if let Handle::Pipe(p) = h {
        pipe::eof_timer_start(p);
    }
}

fn read_cbs(h: &Handle) -> Option<(Rc<RefCell<AllocCb>>, ReadSlot)> {
    with(h, |s, _| {
        match (&s.alloc_cb, &s.read_cb) {
            (Some(a), Some(r)) => Some((Rc::clone(a), r.clone_ref())),
            _ => None,
        }
    })
}

fn deliver_data(h: &Handle, n: usize, buf: Vec<u8>) {
    if let Some((_, slot)) = read_cbs(h) {
        match slot {
            ReadSlot::Plain(cb) => (cb.borrow_mut())(Ok(n), buf),
            ReadSlot::Ipc(cb) => (cb.borrow_mut())(Ok(n), buf, None),
        }
    }
}

fn deliver_stream(h: &Handle, kind: HandleKind) {
    if let Some((_, slot)) = read_cbs(h) {
        match slot {
            ReadSlot::Ipc(cb) => (cb.borrow_mut())(Ok(0), Vec::new(), Some(kind)),
            ReadSlot::Plain(_) => {
                rwarn!("passed stream arrived on a pipe without an ipc reader")
            }
        }
    }
}

pub(crate) fn deliver_eof(h: &Handle) {
    with(h, |_, c| {
        c.flags.set(HandleFlags::EOF);
        c.flags.clear(HandleFlags::READING);
    });
    if let Handle::Pipe(p) = h {
        pipe::eof_timer_destroy(p);
    }
    if let Some((_, slot)) = read_cbs(h) {
        match slot {
            ReadSlot::Plain(cb) => (cb.borrow_mut())(Err(Error::EOF), Vec::new()),
            ReadSlot::Ipc(cb) => (cb.borrow_mut())(Err(Error::EOF), Vec::new(), None),
        }
    }
}

fn deliver_read_failure(h: &Handle, err: std::io::Error) {
    let e = Error::from(err);
    // A torn-down pipe peer reads as end-of-stream, like a closed one.
    let treat_as_eof = matches!(h, Handle::Pipe(_))
        && matches!(e.code(), Code::Econnreset | Code::Epipe);
    if treat_as_eof {
        deliver_eof(h);
        return;
    }
    with(h, |_, c| c.flags.clear(HandleFlags::READING));
    if let Handle::Pipe(p) = h {
        pipe::eof_timer_destroy(p);
    }
    if let Some((_, slot)) = read_cbs(h) {
        match slot {
            ReadSlot::Plain(cb) => (cb.borrow_mut())(Err(e), Vec::new()),
            ReadSlot::Ipc(cb) => (cb.borrow_mut())(Err(e), Vec::new(), None),
        }
    }
}

enum IpcStep {
    /// Frame header consumed; go around again.
    Continue,
    /// Not enough buffered bytes for a whole header; resume on the next
    /// completion.
    Stop,
    /// Deliver this many payload bytes of the current RAW_DATA frame.
    Deliver(usize),
}

fn ipc_step(h: &Handle, fd: RawFd, avail: usize) -> IpcStep {
    let Handle::Pipe(p) = h else {
        unreachable!("ipc framing on a non-pipe handle")
    };
    let remaining = pipe::ipc_remaining(p);
    if remaining > 0 {
        return IpcStep::Deliver(avail.min(remaining as usize));
    }
    if avail < FRAME_HEADER_LEN {
        return IpcStep::Stop;
    }
    let mut hdr = [0u8; FRAME_HEADER_LEN];
    let mut fds: Vec<OwnedFd> = Vec::new();
    match sys::recvmsg_fds(fd, &mut hdr, &mut fds) {
        Ok(0) => {
            deliver_eof(h);
            return IpcStep::Stop;
        }
        Ok(n) if n == FRAME_HEADER_LEN => {}
        Ok(n) => rfatal!("ipc: truncated frame header ({} of {} bytes)", n, FRAME_HEADER_LEN),
        Err(e) if sys::would_block(&e) => return IpcStep::Stop,
        Err(e) => {
            deliver_read_failure(h, e);
            return IpcStep::Stop;
        }
    }
    match Frame::decode(&hdr) {
        None => rfatal!("ipc: unknown frame opcode {}", hdr[0]),
        Some(Frame::RawData { len }) => {
            if !fds.is_empty() {
                rwarn!("ipc: dropping {} unexpected descriptors on a data frame", fds.len());
            }
            pipe::set_ipc_remaining(p, len);
            IpcStep::Continue
        }
        Some(Frame::Stream { kind }) => {
            let Some(passed) = fds.pop() else {
                rfatal!("ipc: stream frame arrived without a descriptor")
            };
            pipe::stash_stream(p, passed, kind);
            deliver_stream(h, kind);
            IpcStep::Continue
        }
    }
}

/// One chunk: allocate, read, deliver. Returns false when the loop
/// should stop.
fn read_chunk(h: &Handle, fd: RawFd, want: usize, ipc: bool) -> bool {
    let Some((alloc, _)) = read_cbs(h) else { return false };
    let mut buf = (alloc.borrow_mut())(want);
    if buf.is_empty() {
        with(h, |_, c| c.flags.clear(HandleFlags::READING));
        if let Some((_, slot)) = read_cbs(h) {
            let e = Error::new(Code::Enobufs);
            match slot {
                ReadSlot::Plain(cb) => (cb.borrow_mut())(Err(e), Vec::new()),
                ReadSlot::Ipc(cb) => (cb.borrow_mut())(Err(e), Vec::new(), None),
            }
        }
        return false;
    }
    if ipc && buf.len() > want {
        // never read across the frame boundary
        buf.truncate(want);
    }

    let res = if ipc {
        let mut fds: Vec<OwnedFd> = Vec::new();
        let r = sys::recvmsg_fds(fd, &mut buf, &mut fds);
        if !fds.is_empty() {
            rwarn!("ipc: dropping {} descriptors arriving mid-payload", fds.len());
        }
        r
    } else {
        sys::read_nb(fd, &mut buf)
    };

    match res {
        Ok(0) => {
            deliver_eof(h);
            false
        }
        Ok(n) => {
            buf.truncate(n);
            if ipc {
                if let Handle::Pipe(p) = h {
                    pipe::dec_ipc_remaining(p, n as u64);
                }
            }
            deliver_data(h, n, buf);
            true
        }
        Err(e) if sys::would_block(&e) => false,
        Err(e) => {
            deliver_read_failure(h, e);
            false
        }
    }
}

/// Read-completion dispatcher.
pub(crate) fn process_read(h: &Handle) {
    let live = with(h, |s, c| {
        c.flags.clear(HandleFlags::READ_PENDING);
        s.read_ready = false;
        !c.flags.is_closing() && c.flags.has(HandleFlags::READING)
    });
    if let Handle::Pipe(p) = h {
        pipe::eof_timer_stop(p);
    }
    if live {
        if let Some(fd) = stream_fd(h) {
            let ipc = is_ipc(h);
            loop {
                let go = with(h, |_, c| {
                    !c.flags.is_closing() && c.flags.has(HandleFlags::READING)
                });
                if !go {
                    break;
                }
                let avail = match sys::readable_bytes(fd) {
                    Ok(a) => a,
                    Err(e) => {
                        deliver_read_failure(h, e);
                        break;
                    }
                };
                let avail = if avail == 0 {
                    match sys::peek_probe(fd) {
                        Ok(sys::Probe::Eof) => {
                            deliver_eof(h);
                            break;
                        }
                        Ok(sys::Probe::WouldBlock) => break,
                        Ok(sys::Probe::Data) => 1,
                        Err(e) => {
                            deliver_read_failure(h, e);
                            break;
                        }
                    }
                } else {
                    avail
                };
                let cont = if ipc {
                    match ipc_step(h, fd, avail) {
                        IpcStep::Continue => true,
                        IpcStep::Stop => false,
                        IpcStep::Deliver(want) => read_chunk(h, fd, want, true),
                    }
                } else {
                    read_chunk(h, fd, avail, false)
                };
                if !cont {
                    break;
                }
            }
        }
    }

    let rearm = with(h, |_, c| {
        c.flags.has(HandleFlags::READING)
            && !c.flags.has(HandleFlags::READ_PENDING)
            && !c.flags.is_closing()
    });
    if rearm {
        queue_read(h);
    }
    handle::dec_req(h);
}

// ── Writing ───────────────────────────────────────────────────────────

pub(crate) fn write_segs(
    h: &Handle,
    segs: VecDeque<Seg>,
    cb: Option<WriteCb>,
) -> Result<()> {
    let lp = h.loop_();
    let fd = with(h, |_, c| {
        if c.flags.is_closing() {
            return Err(Error::new(Code::Ebadf));
        }
        if c.flags.has(HandleFlags::SHUTTING | HandleFlags::SHUT) {
            return Err(Error::new(Code::Eshutdown));
        }
        if !c.flags.has(HandleFlags::CONNECTED) || !c.flags.has(HandleFlags::WRITABLE) {
            return Err(Error::new(Code::Epipe));
        }
        Ok(())
    })
    .and(stream_fd(h).ok_or(Error::new(Code::Enotconn)))
    .map_err(|e| lp.fail(e))?;

    let mut req = WriteReq::new(segs, cb);
    let queue_empty = with(h, |s, _| s.write_queue.is_empty());
    if queue_empty {
        match flush_req(fd, &mut req) {
            Flush::Done => {
                with(h, |s, _| s.write_reqs_pending += 1);
                handle::add_req(h);
                lp.push_pending(PendingReq::WriteDone {
                    h: h.clone(),
                    req,
                    status: Ok(()),
                });
            }
            Flush::Blocked => park_write(h, req),
            Flush::Error(e) => return Err(lp.fail(Error::from(e))),
        }
    } else {
        park_write(h, req);
    }
    Ok(())
}

fn park_write(h: &Handle, req: WriteReq) {
    with(h, |s, _| {
        s.write_queue_size += req.remaining();
        s.write_queue.push_back(req);
        s.write_reqs_pending += 1;
    });
    handle::add_req(h);
    ensure_write_armed(h);
}

fn ensure_write_armed(h: &Handle) {
    let lp = h.loop_();
    let fd = match stream_fd(h) {
        Some(fd) => fd,
        None => return,
    };
    let needs = with(h, |s, _| s.write_token.is_none());
    if !needs {
        return;
    }
    let token = lp.arm_io(fd, Direction::Write, Inflight::Write(h.clone()));
    with(h, |s, _| s.write_token = Some(token));
    handle::add_req(h);
}

/// Synthetic or queued write finished; run its callback.
pub(crate) fn process_write_done(h: &Handle, mut req: WriteReq, status: Result<()>) {
    with(h, |s, _| {
        debug_assert!(s.write_reqs_pending > 0);
        s.write_reqs_pending -= 1;
    });
    if let Some(cb) = req.cb.take() {
        cb(status);
    }
    handle::dec_req(h);
    maybe_shutdown(h);
}

/// The armed write interest fired: drain as much of the queue as the
/// socket accepts.
pub(crate) fn process_writable(h: &Handle) {
    if h.is_closing() {
        handle::dec_req(h);
        return;
    }
    let fd = match stream_fd(h) {
        Some(fd) => fd,
        None => {
            handle::dec_req(h);
            return;
        }
    };

    let mut completed: Vec<(WriteReq, Result<()>)> = Vec::new();
    loop {
        let mut req = match with(h, |s, _| {
            s.write_queue.pop_front().map(|r| {
                s.write_queue_size -= r.remaining();
                r
            })
        }) {
            Some(r) => r,
            None => break,
        };
        match flush_req(fd, &mut req) {
            Flush::Done => completed.push((req, Ok(()))),
            Flush::Blocked => {
                with(h, |s, _| {
                    s.write_queue_size += req.remaining();
                    s.write_queue.push_front(req);
                });
                break;
            }
            Flush::Error(e) => completed.push((req, Err(Error::from(e)))),
        }
    }

    for (mut req, status) in completed {
        with(h, |s, _| s.write_reqs_pending -= 1);
        if let Some(cb) = req.cb.take() {
            cb(status);
        }
        handle::dec_req(h);
    }

    let rearm = with(h, |s, c| !s.write_queue.is_empty() && !c.flags.is_closing());
    if rearm {
        ensure_write_armed(h);
    }
    maybe_shutdown(h);
    handle::dec_req(h);
}

// ── Shutdown ──────────────────────────────────────────────────────────

pub(crate) fn shutdown(h: &Handle, cb: ShutdownCb) -> Result<()> {
    let lp = h.loop_();
    with(h, |s, c| {
        if c.flags.is_closing() {
            return Err(Error::new(Code::Ebadf));
        }
        if !c.flags.has(HandleFlags::CONNECTED) {
            return Err(Error::new(Code::Enotconn));
        }
        if c.flags.has(HandleFlags::SHUTTING) {
            return Err(Error::new(Code::Ealready));
        }
        c.flags.set(HandleFlags::SHUTTING);
        s.shutdown_cb = Some(cb);
        Ok(())
    })
    .map_err(|e| lp.fail(e))?;
    handle::add_req(h);
    maybe_shutdown(h);
    Ok(())
}

/// Promote a parked shutdown once the write side has drained.
pub(crate) fn maybe_shutdown(h: &Handle) {
    let lp = h.loop_();
    let ready = with(h, |s, c| {
        if s.shutdown_cb.is_some()
            && !c.flags.is_closing()
            && c.flags.has(HandleFlags::SHUTTING)
            && !c.flags.has(HandleFlags::SHUT)
            && s.write_reqs_pending == 0
            && s.write_queue.is_empty()
        {
            s.shutdown_cb.take()
        } else {
            None
        }
    });
    if let Some(cb) = ready {
        lp.push_pending(PendingReq::ShutdownDone {
            h: h.clone(),
            cb,
            status: Ok(()),
        });
    }
}

pub(crate) fn process_shutdown_done(h: &Handle, cb: ShutdownCb, status: Result<()>) {
    let mut status = status;
    if status.is_ok() {
        let fd = with(h, |_, c| !c.flags.is_closing())
            .then(|| stream_fd(h))
            .flatten();
        match fd {
            Some(fd) => {
                if let Err(e) = sys::shutdown_write(fd) {
                    status = Err(Error::from(e));
                } else {
                    with(h, |_, c| c.flags.set(HandleFlags::SHUT));
                    if let Handle::Pipe(p) = h {
                        pipe::on_shutdown_complete(p);
                    }
                }
            }
            None => status = Err(Error::new(Code::Ebadf)),
        }
    }
    cb(status);
    handle::dec_req(h);
}

// ── Close support ─────────────────────────────────────────────────────

/// Common teardown for stream handles: drop poller interest, resolve
/// armed tokens with synthesized completions, fail queued writes and a
/// parked shutdown.
pub(crate) fn close_start_common(h: &Handle, fds: &[RawFd]) {
    let lp = h.loop_();
    for fd in fds {
        lp.inner.poller.forget(*fd);
    }

    let (read_t, write_t, connect_t, accept_t, wreqs, shut_cb) = with(h, |s, c| {
        c.flags.clear(HandleFlags::READING);
        let wreqs: Vec<WriteReq> = s.write_queue.drain(..).collect();
        s.write_queue_size = 0;
        (
            s.read_token.take(),
            s.write_token.take(),
            s.connect_token.take(),
            s.accept_token.take(),
            wreqs,
            s.shutdown_cb.take(),
        )
    });

    if let Some(t) = read_t {
        lp.take_inflight(t);
        lp.push_pending(PendingReq::Read(h.clone()));
    }
    if let Some(t) = write_t {
        lp.take_inflight(t);
        lp.push_pending(PendingReq::Writable(h.clone()));
    }
    if let Some(t) = connect_t {
        lp.take_inflight(t);
        match h {
            Handle::Pipe(_) => lp.push_pending(PendingReq::PipeConnect {
                h: h.clone(),
                result: Err(Error::new(Code::Ebadf)),
            }),
            _ => lp.push_pending(PendingReq::Connect(h.clone())),
        }
    }
    if let Some(t) = accept_t {
        lp.take_inflight(t);
        lp.push_pending(PendingReq::Accept(h.clone()));
    }
    for req in wreqs {
        lp.push_pending(PendingReq::WriteDone {
            h: h.clone(),
            req,
            status: Err(Error::new(Code::Ebadf)),
        });
    }
    if let Some(cb) = shut_cb {
        lp.push_pending(PendingReq::ShutdownDone {
            h: h.clone(),
            cb,
            status: Err(Error::new(Code::Ebadf)),
        });
    }
}

/// Endgame: drop every stored callback, breaking reference cycles
/// through captured handles.
pub(crate) fn endgame_common(h: &Handle) {
    with(h, |s, _| {
        s.alloc_cb = None;
        s.read_cb = None;
        s.connect_cb = None;
        s.connection_cb = None;
        s.shutdown_cb = None;
        s.write_queue.clear();
        s.write_queue_size = 0;
    });
}
