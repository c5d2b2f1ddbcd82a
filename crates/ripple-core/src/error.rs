//! Error taxonomy for the ripple runtime.
//!
//! Every failure the runtime reports is translated into one of the
//! [`Code`] values below. The enumeration is closed and stable: values are
//! never reordered or renumbered, so a code can cross an IPC boundary or a
//! log line and still mean the same thing on the other side.
//!
//! An [`Error`] pairs the translated code with the raw OS errno that
//! produced it, so diagnostics keep the platform detail while callers
//! match on the portable code.

use std::fmt;
use std::io;

/// Stable, closed error-code enumeration.
///
/// `Ok` is 0 and only ever appears in a request's result slot; it is
/// never wrapped in an [`Error`].
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Code {
    Ok = 0,
    Eof,
    Eaddrinfo,
    Eacces,
    Eagain,
    Eaddrinuse,
    Eaddrnotavail,
    Eafnosupport,
    Ealready,
    Ebadf,
    Ebusy,
    Econnaborted,
    Econnrefused,
    Econnreset,
    Edestaddrreq,
    Efault,
    Ehostunreach,
    Eintr,
    Einval,
    Eisconn,
    Emfile,
    Emsgsize,
    Enetdown,
    Enetunreach,
    Enfile,
    Enobufs,
    Enomem,
    Enonet,
    Enoprotoopt,
    Enotconn,
    Enotsock,
    Enotsup,
    Enoent,
    Enosys,
    Epipe,
    Eproto,
    Eprotonosupport,
    Eprototype,
    Etimedout,
    Echarset,
    Eaifamnosupport,
    Eainoname,
    Eaiservice,
    Eaisocktype,
    Eshutdown,
    Eexist,
}

impl Code {
    /// Canonical upper-case name, e.g. `"ECONNRESET"`.
    pub fn name(self) -> &'static str {
        match self {
            Code::Ok => "OK",
            Code::Eof => "EOF",
            Code::Eaddrinfo => "EADDRINFO",
            Code::Eacces => "EACCES",
            Code::Eagain => "EAGAIN",
            Code::Eaddrinuse => "EADDRINUSE",
            Code::Eaddrnotavail => "EADDRNOTAVAIL",
            Code::Eafnosupport => "EAFNOSUPPORT",
            Code::Ealready => "EALREADY",
            Code::Ebadf => "EBADF",
            Code::Ebusy => "EBUSY",
            Code::Econnaborted => "ECONNABORTED",
            Code::Econnrefused => "ECONNREFUSED",
            Code::Econnreset => "ECONNRESET",
            Code::Edestaddrreq => "EDESTADDRREQ",
            Code::Efault => "EFAULT",
            Code::Ehostunreach => "EHOSTUNREACH",
            Code::Eintr => "EINTR",
            Code::Einval => "EINVAL",
            Code::Eisconn => "EISCONN",
            Code::Emfile => "EMFILE",
            Code::Emsgsize => "EMSGSIZE",
            Code::Enetdown => "ENETDOWN",
            Code::Enetunreach => "ENETUNREACH",
            Code::Enfile => "ENFILE",
            Code::Enobufs => "ENOBUFS",
            Code::Enomem => "ENOMEM",
            Code::Enonet => "ENONET",
            Code::Enoprotoopt => "ENOPROTOOPT",
            Code::Enotconn => "ENOTCONN",
            Code::Enotsock => "ENOTSOCK",
            Code::Enotsup => "ENOTSUP",
            Code::Enoent => "ENOENT",
            Code::Enosys => "ENOSYS",
            Code::Epipe => "EPIPE",
            Code::Eproto => "EPROTO",
            Code::Eprotonosupport => "EPROTONOSUPPORT",
            Code::Eprototype => "EPROTOTYPE",
            Code::Etimedout => "ETIMEDOUT",
            Code::Echarset => "ECHARSET",
            Code::Eaifamnosupport => "EAIFAMNOSUPPORT",
            Code::Eainoname => "EAINONAME",
            Code::Eaiservice => "EAISERVICE",
            Code::Eaisocktype => "EAISOCKTYPE",
            Code::Eshutdown => "ESHUTDOWN",
            Code::Eexist => "EEXIST",
        }
    }

    /// Short human-readable description.
    pub fn message(self) -> &'static str {
        match self {
            Code::Ok => "success",
            Code::Eof => "end of file",
            Code::Eaddrinfo => "getaddrinfo error",
            Code::Eacces => "permission denied",
            Code::Eagain => "resource temporarily unavailable",
            Code::Eaddrinuse => "address already in use",
            Code::Eaddrnotavail => "address not available",
            Code::Eafnosupport => "address family not supported",
            Code::Ealready => "connection already in progress",
            Code::Ebadf => "bad file descriptor",
            Code::Ebusy => "resource busy or locked",
            Code::Econnaborted => "software caused connection abort",
            Code::Econnrefused => "connection refused",
            Code::Econnreset => "connection reset by peer",
            Code::Edestaddrreq => "destination address required",
            Code::Efault => "bad address in system call argument",
            Code::Ehostunreach => "host is unreachable",
            Code::Eintr => "interrupted system call",
            Code::Einval => "invalid argument",
            Code::Eisconn => "socket is already connected",
            Code::Emfile => "too many open files",
            Code::Emsgsize => "message too long",
            Code::Enetdown => "network is down",
            Code::Enetunreach => "network is unreachable",
            Code::Enfile => "file table overflow",
            Code::Enobufs => "no buffer space available",
            Code::Enomem => "not enough memory",
            Code::Enonet => "machine is not on the network",
            Code::Enoprotoopt => "protocol not available",
            Code::Enotconn => "socket is not connected",
            Code::Enotsock => "socket operation on non-socket",
            Code::Enotsup => "operation not supported",
            Code::Enoent => "no such file or directory",
            Code::Enosys => "function not implemented",
            Code::Epipe => "broken pipe",
            Code::Eproto => "protocol error",
            Code::Eprotonosupport => "protocol not supported",
            Code::Eprototype => "protocol wrong type for socket",
            Code::Etimedout => "connection timed out",
            Code::Echarset => "invalid character encoding",
            Code::Eaifamnosupport => "address family not supported by resolver",
            Code::Eainoname => "name or service not known",
            Code::Eaiservice => "service not available for socket type",
            Code::Eaisocktype => "socket type not supported",
            Code::Eshutdown => "cannot send after shutdown",
            Code::Eexist => "file already exists",
        }
    }
}

/// Translate a raw errno into the portable [`Code`].
///
/// Unrecognized errnos collapse to `Einval`; the raw value survives in
/// [`Error::sys`] either way.
pub fn code_from_errno(errno: i32) -> Code {
    match errno {
        libc::EACCES | libc::EPERM => Code::Eacces,
        libc::EAGAIN => Code::Eagain,
        libc::EADDRINUSE => Code::Eaddrinuse,
        libc::EADDRNOTAVAIL => Code::Eaddrnotavail,
        libc::EAFNOSUPPORT => Code::Eafnosupport,
        libc::EALREADY | libc::EINPROGRESS => Code::Ealready,
        libc::EBADF => Code::Ebadf,
        libc::EBUSY | libc::ETXTBSY => Code::Ebusy,
        libc::ECONNABORTED => Code::Econnaborted,
        libc::ECONNREFUSED => Code::Econnrefused,
        libc::ECONNRESET => Code::Econnreset,
        libc::EDESTADDRREQ => Code::Edestaddrreq,
        libc::EFAULT => Code::Efault,
        libc::EHOSTUNREACH => Code::Ehostunreach,
        libc::EINTR => Code::Eintr,
        libc::EINVAL => Code::Einval,
        libc::EISCONN => Code::Eisconn,
        libc::EMFILE => Code::Emfile,
        libc::EMSGSIZE => Code::Emsgsize,
        libc::ENETDOWN => Code::Enetdown,
        libc::ENETUNREACH => Code::Enetunreach,
        libc::ENFILE => Code::Enfile,
        libc::ENOBUFS => Code::Enobufs,
        libc::ENOMEM => Code::Enomem,
        libc::ENONET => Code::Enonet,
        libc::ENOPROTOOPT => Code::Enoprotoopt,
        libc::ENOTCONN => Code::Enotconn,
        libc::ENOTSOCK => Code::Enotsock,
        // EOPNOTSUPP aliases ENOTSUP on Linux
        libc::ENOTSUP => Code::Enotsup,
        #[cfg(not(target_os = "linux"))]
        libc::EOPNOTSUPP => Code::Enotsup,
        libc::ENOENT => Code::Enoent,
        libc::ENOSYS => Code::Enosys,
        libc::EPIPE => Code::Epipe,
        libc::EPROTO => Code::Eproto,
        libc::EPROTONOSUPPORT => Code::Eprotonosupport,
        libc::EPROTOTYPE => Code::Eprototype,
        libc::ETIMEDOUT => Code::Etimedout,
        libc::ESHUTDOWN => Code::Eshutdown,
        libc::EEXIST => Code::Eexist,
        _ => Code::Einval,
    }
}

/// A runtime error: portable code plus the raw OS errno (0 when the error
/// did not originate from a syscall).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Error {
    code: Code,
    sys: i32,
}

impl Error {
    pub const EOF: Error = Error { code: Code::Eof, sys: 0 };

    pub fn new(code: Code) -> Self {
        Error { code, sys: 0 }
    }

    pub fn from_errno(errno: i32) -> Self {
        Error { code: code_from_errno(errno), sys: errno }
    }

    /// Capture the calling thread's current errno.
    pub fn last_os_error() -> Self {
        let errno = io::Error::last_os_error().raw_os_error().unwrap_or(0);
        Error::from_errno(errno)
    }

    pub fn code(&self) -> Code {
        self.code
    }

    /// Raw OS errno, 0 if none.
    pub fn sys(&self) -> i32 {
        self.sys
    }

    pub fn is_eof(&self) -> bool {
        self.code == Code::Eof
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.sys != 0 {
            write!(
                f,
                "{} ({}, os error {})",
                self.code.message(),
                self.code.name(),
                self.sys
            )
        } else {
            write!(f, "{} ({})", self.code.message(), self.code.name())
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.raw_os_error() {
            Some(errno) => Error::from_errno(errno),
            None => match e.kind() {
                io::ErrorKind::UnexpectedEof => Error::new(Code::Eof),
                io::ErrorKind::WouldBlock => Error::new(Code::Eagain),
                io::ErrorKind::InvalidData => Error::new(Code::Echarset),
                _ => Error::new(Code::Einval),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
