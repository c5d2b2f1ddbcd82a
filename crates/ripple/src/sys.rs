//! Thin wrappers over the raw syscalls the stream engine needs.
//!
//! Everything here is non-blocking-aware: callers get `WouldBlock` back
//! as a distinct outcome instead of an error where that matters. All
//! descriptor-passing plumbing (`SCM_RIGHTS`) lives here so the cmsg
//! pointer arithmetic stays in one reviewed place.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

/// Bytes readable on `fd` right now.
pub(crate) fn readable_bytes(fd: RawFd) -> io::Result<usize> {
    let mut avail: libc::c_int = 0;
    let rc = unsafe { libc::ioctl(fd, libc::FIONREAD, &mut avail) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(avail.max(0) as usize)
}

/// Outcome of a 1-byte `MSG_PEEK` probe, used to tell EOF from a
/// spurious wakeup when `FIONREAD` reports zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Probe {
    Data,
    Eof,
    WouldBlock,
}

pub(crate) fn peek_probe(fd: RawFd) -> io::Result<Probe> {
    let mut byte = 0u8;
    loop {
        let n = unsafe {
            libc::recv(
                fd,
                &mut byte as *mut u8 as *mut libc::c_void,
                1,
                libc::MSG_PEEK | libc::MSG_DONTWAIT,
            )
        };
        if n == 0 {
            return Ok(Probe::Eof);
        }
        if n > 0 {
            return Ok(Probe::Data);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::EAGAIN) => return Ok(Probe::WouldBlock),
            _ => return Err(err),
        }
    }
}

/// Non-blocking read. `Ok(0)` is EOF.
pub(crate) fn read_nb(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINTR) {
            continue;
        }
        return Err(err);
    }
}

/// Non-blocking write. Uses `send(MSG_NOSIGNAL)` for sockets and falls
/// back to `write` for adopted non-socket descriptors.
pub(crate) fn write_nb(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    loop {
        let n = unsafe {
            libc::send(
                fd,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                libc::MSG_NOSIGNAL,
            )
        };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::ENOTSOCK) => {
                let n = unsafe {
                    libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len())
                };
                if n >= 0 {
                    return Ok(n as usize);
                }
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(err);
            }
            _ => return Err(err),
        }
    }
}

const CMSG_FDS: usize = 4;

/// Send `buf` with an optional descriptor riding as `SCM_RIGHTS`.
///
/// The descriptor is delivered with the first byte of `buf`, so callers
/// must never pass an empty buffer together with a descriptor.
pub(crate) fn sendmsg_fd(fd: RawFd, buf: &[u8], pass: Option<BorrowedFd<'_>>) -> io::Result<usize> {
    debug_assert!(pass.is_none() || !buf.is_empty());

    let mut iov = libc::iovec {
        iov_base: buf.as_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    // Aligned control buffer; CMSG_SPACE(4) fits comfortably.
    let mut cmsg_buf = [0u64; 8];
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;

    if let Some(pass) = pass {
        msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = unsafe { libc::CMSG_SPACE(mem::size_of::<RawFd>() as u32) } as _;
        unsafe {
            let c = libc::CMSG_FIRSTHDR(&msg);
            (*c).cmsg_level = libc::SOL_SOCKET;
            (*c).cmsg_type = libc::SCM_RIGHTS;
            (*c).cmsg_len = libc::CMSG_LEN(mem::size_of::<RawFd>() as u32) as _;
            let raw = pass.as_raw_fd();
            std::ptr::copy_nonoverlapping(
                &raw as *const RawFd as *const u8,
                libc::CMSG_DATA(c),
                mem::size_of::<RawFd>(),
            );
        }
    }

    loop {
        let n = unsafe { libc::sendmsg(fd, &msg, libc::MSG_NOSIGNAL) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINTR) {
            continue;
        }
        return Err(err);
    }
}

/// Receive into `buf`, appending any `SCM_RIGHTS` descriptors to `fds`.
/// `Ok(0)` is EOF.
pub(crate) fn recvmsg_fds(
    fd: RawFd,
    buf: &mut [u8],
    fds: &mut Vec<OwnedFd>,
) -> io::Result<usize> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let mut cmsg_buf = [0u64; 32];
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = unsafe {
        libc::CMSG_SPACE((CMSG_FDS * mem::size_of::<RawFd>()) as u32)
    } as _;

    let n = loop {
        let n = unsafe { libc::recvmsg(fd, &mut msg, libc::MSG_CMSG_CLOEXEC) };
        if n >= 0 {
            break n as usize;
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINTR) {
            continue;
        }
        return Err(err);
    };

    unsafe {
        let mut c = libc::CMSG_FIRSTHDR(&msg);
        while !c.is_null() {
            if (*c).cmsg_level == libc::SOL_SOCKET && (*c).cmsg_type == libc::SCM_RIGHTS {
                let payload = (*c).cmsg_len as usize
                    - (libc::CMSG_LEN(0) as usize);
                let count = payload / mem::size_of::<RawFd>();
                let data = libc::CMSG_DATA(c);
                for i in 0..count {
                    let mut raw: RawFd = 0;
                    std::ptr::copy_nonoverlapping(
                        data.add(i * mem::size_of::<RawFd>()),
                        &mut raw as *mut RawFd as *mut u8,
                        mem::size_of::<RawFd>(),
                    );
                    fds.push(OwnedFd::from_raw_fd(raw));
                }
            }
            c = libc::CMSG_NXTHDR(&msg, c);
        }
    }
    Ok(n)
}

/// Duplicate a descriptor with close-on-exec set.
pub(crate) fn dup_cloexec(fd: RawFd) -> io::Result<OwnedFd> {
    let rc = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(rc) })
}

/// Connected stream socketpair, both ends close-on-exec.
pub(crate) fn socketpair_stream() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as RawFd; 2];
    let rc = unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
            0,
            fds.as_mut_ptr(),
        )
    };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    unsafe { Ok((OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1]))) }
}

/// Half-close the write side.
pub(crate) fn shutdown_write(fd: RawFd) -> io::Result<()> {
    let rc = unsafe { libc::shutdown(fd, libc::SHUT_WR) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Completion-model requirement: a broken pipe must surface as a write
/// completion error, never as a process-killing signal.
pub(crate) fn ignore_sigpipe() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    });
}

pub(crate) fn would_block(err: &io::Error) -> bool {
    // EWOULDBLOCK aliases EAGAIN on Linux; compare instead of matching
    // so the duplicate value stays portable
    let os = err.raw_os_error();
    os == Some(libc::EAGAIN)
        || os == Some(libc::EWOULDBLOCK)
        || err.kind() == io::ErrorKind::WouldBlock
}

pub(crate) fn in_progress(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EINPROGRESS) || would_block(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsFd;

    #[test]
    fn test_would_block_recognizes_aliases() {
        assert!(would_block(&io::Error::from_raw_os_error(libc::EAGAIN)));
        assert!(would_block(&io::Error::from_raw_os_error(libc::EWOULDBLOCK)));
        assert!(!would_block(&io::Error::from_raw_os_error(libc::EPIPE)));
    }

    #[test]
    fn test_socketpair_round_trip() {
        let (a, b) = socketpair_stream().unwrap();
        assert_eq!(write_nb(a.as_raw_fd(), b"ping").unwrap(), 4);
        assert_eq!(readable_bytes(b.as_raw_fd()).unwrap(), 4);
        let mut buf = [0u8; 8];
        assert_eq!(read_nb(b.as_raw_fd(), &mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"ping");
    }

    #[test]
    fn test_peek_probe_states() {
        let (a, b) = socketpair_stream().unwrap();
        assert_eq!(peek_probe(b.as_raw_fd()).unwrap(), Probe::WouldBlock);
        write_nb(a.as_raw_fd(), b"x").unwrap();
        assert_eq!(peek_probe(b.as_raw_fd()).unwrap(), Probe::Data);
        drop(a);
        let mut buf = [0u8; 1];
        read_nb(b.as_raw_fd(), &mut buf).unwrap();
        assert_eq!(peek_probe(b.as_raw_fd()).unwrap(), Probe::Eof);
    }

    #[test]
    fn test_fd_passing() {
        let (a, b) = socketpair_stream().unwrap();
        let (x, y) = socketpair_stream().unwrap();
        sendmsg_fd(a.as_raw_fd(), b"F", Some(x.as_fd())).unwrap();

        let mut buf = [0u8; 4];
        let mut fds = Vec::new();
        let n = recvmsg_fds(b.as_raw_fd(), &mut buf, &mut fds).unwrap();
        assert_eq!(n, 1);
        assert_eq!(buf[0], b'F');
        assert_eq!(fds.len(), 1);

        // The received descriptor is the same socket: bytes written to it
        // come out of the peer end.
        write_nb(fds[0].as_raw_fd(), b"hello").unwrap();
        let mut out = [0u8; 8];
        assert_eq!(read_nb(y.as_raw_fd(), &mut out).unwrap(), 5);
        assert_eq!(&out[..5], b"hello");
    }
}
