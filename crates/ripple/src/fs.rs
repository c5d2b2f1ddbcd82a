//! Filesystem requests.
//!
//! Every operation builds an [`FsRequest`], runs it on the blocking
//! pool and reports through a callback on the loop thread. Passing no
//! callback runs the request synchronously on the calling thread and
//! returns it directly; the two paths execute identical code.
//!
//! Results follow the syscall convention: `result()` is the syscall
//! return value (byte count, descriptor, zero) or -1 with `error()`
//! set. Typed payloads (read data, stat, directory entries, link
//! target) ride in dedicated slots.

use std::ffi::{CString, OsString};
use std::mem;
use std::os::fd::RawFd;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cfg_if::cfg_if;

use ripple_core::error::{Code, Error, Result};

use crate::event_loop::{EventLoop, Inflight};
use crate::port::Packet;

/// Completion callback; receives the finished request.
pub type FsCb = Box<dyn FnOnce(FsRequest)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsOp {
    Open,
    Close,
    Read,
    Write,
    Sendfile,
    Stat,
    Lstat,
    Fstat,
    Ftruncate,
    Utime,
    Futime,
    Chmod,
    Fchmod,
    Chown,
    Fchown,
    Link,
    Symlink,
    Readlink,
    Unlink,
    Rmdir,
    Mkdir,
    Rename,
    Readdir,
    Fsync,
    Fdatasync,
}

/// Portable stat payload, times in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileStat {
    pub dev: u64,
    pub mode: u32,
    pub nlink: u64,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub ino: u64,
    pub size: i64,
    pub blksize: i64,
    pub blocks: i64,
    pub atime_ms: i64,
    pub mtime_ms: i64,
    pub ctime_ms: i64,
}

impl FileStat {
    fn from_raw(st: &libc::stat) -> FileStat {
        FileStat {
            dev: st.st_dev as u64,
            mode: st.st_mode as u32,
            nlink: st.st_nlink as u64,
            uid: st.st_uid,
            gid: st.st_gid,
            rdev: st.st_rdev as u64,
            ino: st.st_ino as u64,
            size: st.st_size as i64,
            blksize: st.st_blksize as i64,
            blocks: st.st_blocks as i64,
            atime_ms: st.st_atime as i64 * 1000 + st.st_atime_nsec as i64 / 1_000_000,
            mtime_ms: st.st_mtime as i64 * 1000 + st.st_mtime_nsec as i64 / 1_000_000,
            ctime_ms: st.st_ctime as i64 * 1000 + st.st_ctime_nsec as i64 / 1_000_000,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }

    pub fn is_file(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFREG
    }
}

enum Args {
    Open { path: CString, flags: i32, mode: u32 },
    Fd { fd: RawFd },
    Read { fd: RawFd, len: usize, offset: i64 },
    Write { fd: RawFd, data: Vec<u8>, offset: i64 },
    Sendfile { out_fd: RawFd, in_fd: RawFd, offset: i64, len: usize },
    Path { path: CString },
    PathMode { path: CString, mode: u32 },
    FdMode { fd: RawFd, mode: u32 },
    Ftruncate { fd: RawFd, len: i64 },
    Utime { path: CString, atime: f64, mtime: f64 },
    Futime { fd: RawFd, atime: f64, mtime: f64 },
    Chown { path: CString, uid: u32, gid: u32 },
    Fchown { fd: RawFd, uid: u32, gid: u32 },
    TwoPaths { from: CString, to: CString },
}

pub struct FsRequest {
    op: FsOp,
    result: i64,
    error: Option<Error>,
    buf: Vec<u8>,
    stat: Option<FileStat>,
    entries: Vec<OsString>,
    link: Option<PathBuf>,
    args: Args,
}

impl std::fmt::Debug for FsRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsRequest")
            .field("op", &self.op)
            .field("result", &self.result)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

impl FsRequest {
    fn new(op: FsOp, args: Args) -> Box<FsRequest> {
        Box::new(FsRequest {
            op,
            result: 0,
            error: None,
            buf: Vec::new(),
            stat: None,
            entries: Vec::new(),
            link: None,
            args,
        })
    }

    pub fn op(&self) -> FsOp {
        self.op
    }

    /// Syscall-convention result: count/descriptor/zero, or -1 on
    /// failure.
    pub fn result(&self) -> i64 {
        self.result
    }

    pub fn error(&self) -> Option<Error> {
        self.error
    }

    /// Bytes produced by a read.
    pub fn data(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_data(self) -> Vec<u8> {
        self.buf
    }

    pub fn stat(&self) -> Option<&FileStat> {
        self.stat.as_ref()
    }

    /// Directory entry names from a readdir, `.` and `..` excluded.
    pub fn entries(&self) -> &[OsString] {
        &self.entries
    }

    /// Target of a readlink.
    pub fn link(&self) -> Option<&Path> {
        self.link.as_deref()
    }

    fn fail_errno(&mut self) {
        self.result = -1;
        self.error = Some(Error::last_os_error());
    }

    fn fail_io(&mut self, e: std::io::Error) {
        self.result = -1;
        self.error = Some(Error::from(e));
    }

    fn execute(&mut self) {
        match &mut self.args {
            Args::Open { path, flags, mode } => {
                let rc = unsafe {
                    libc::open(path.as_ptr(), *flags | libc::O_CLOEXEC, *mode as libc::c_uint)
                };
                if rc < 0 {
                    self.fail_errno();
                } else {
                    self.result = rc as i64;
                }
            }
            Args::Fd { fd } => {
                let rc = match self.op {
                    FsOp::Close => unsafe { libc::close(*fd) },
                    FsOp::Fsync => unsafe { libc::fsync(*fd) },
                    FsOp::Fdatasync => {
                        cfg_if! {
                            if #[cfg(target_os = "macos")] {
                                unsafe { libc::fcntl(*fd, libc::F_FULLFSYNC) }
                            } else {
                                unsafe { libc::fdatasync(*fd) }
                            }
                        }
                    }
                    FsOp::Fstat => {
                        let mut st: libc::stat = unsafe { mem::zeroed() };
                        let rc = unsafe { libc::fstat(*fd, &mut st) };
                        if rc == 0 {
                            self.stat = Some(FileStat::from_raw(&st));
                        }
                        rc
                    }
                    _ => {
                        self.error = Some(Error::new(Code::Einval));
                        self.result = -1;
                        return;
                    }
                };
                if rc < 0 {
                    self.fail_errno();
                }
            }
            Args::Read { fd, len, offset } => {
                let mut buf = vec![0u8; *len];
                let rc = if *offset < 0 {
                    unsafe { libc::read(*fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) }
                } else {
                    unsafe {
                        libc::pread(
                            *fd,
                            buf.as_mut_ptr() as *mut libc::c_void,
                            buf.len(),
                            *offset as libc::off_t,
                        )
                    }
                };
                if rc < 0 {
                    self.fail_errno();
                } else {
                    buf.truncate(rc as usize);
                    self.buf = buf;
                    self.result = rc as i64;
                }
            }
            Args::Write { fd, data, offset } => {
                let rc = if *offset < 0 {
                    unsafe { libc::write(*fd, data.as_ptr() as *const libc::c_void, data.len()) }
                } else {
                    unsafe {
                        libc::pwrite(
                            *fd,
                            data.as_ptr() as *const libc::c_void,
                            data.len(),
                            *offset as libc::off_t,
                        )
                    }
                };
                if rc < 0 {
                    self.fail_errno();
                } else {
                    self.result = rc as i64;
                }
            }
            Args::Sendfile { out_fd, in_fd, offset, len } => {
                cfg_if! {
                    if #[cfg(target_os = "linux")] {
                        let mut off = *offset as libc::off_t;
                        let rc = unsafe { libc::sendfile(*out_fd, *in_fd, &mut off, *len) };
                        if rc < 0 {
                            self.fail_errno();
                        } else {
                            self.result = rc as i64;
                        }
                    } else {
                        // chunked copy where the syscall is unavailable
                        let mut copied = 0i64;
                        let mut off = *offset;
                        let mut chunk = vec![0u8; (*len).min(64 * 1024)];
                        while (copied as usize) < *len {
                            let want = chunk.len().min(*len - copied as usize);
                            let n = unsafe {
                                libc::pread(
                                    *in_fd,
                                    chunk.as_mut_ptr() as *mut libc::c_void,
                                    want,
                                    off as libc::off_t,
                                )
                            };
                            if n < 0 {
                                self.fail_errno();
                                return;
                            }
                            if n == 0 {
                                break;
                            }
                            let w = unsafe {
                                libc::write(*out_fd, chunk.as_ptr() as *const libc::c_void, n as usize)
                            };
                            if w < 0 {
                                self.fail_errno();
                                return;
                            }
                            off += w as i64;
                            copied += w as i64;
                        }
                        self.result = copied;
                    }
                }
            }
            Args::Path { path } => match self.op {
                FsOp::Stat | FsOp::Lstat => {
                    let mut st: libc::stat = unsafe { mem::zeroed() };
                    let rc = if self.op == FsOp::Stat {
                        unsafe { libc::stat(path.as_ptr(), &mut st) }
                    } else {
                        unsafe { libc::lstat(path.as_ptr(), &mut st) }
                    };
                    if rc < 0 {
                        self.fail_errno();
                    } else {
                        self.stat = Some(FileStat::from_raw(&st));
                    }
                }
                FsOp::Unlink => {
                    if unsafe { libc::unlink(path.as_ptr()) } < 0 {
                        self.fail_errno();
                    }
                }
                FsOp::Rmdir => {
                    if unsafe { libc::rmdir(path.as_ptr()) } < 0 {
                        self.fail_errno();
                    }
                }
                FsOp::Readlink => {
                    let mut buf = vec![0u8; 4096];
                    let rc = unsafe {
                        libc::readlink(
                            path.as_ptr(),
                            buf.as_mut_ptr() as *mut libc::c_char,
                            buf.len(),
                        )
                    };
                    if rc < 0 {
                        self.fail_errno();
                    } else {
                        buf.truncate(rc as usize);
                        self.link = Some(PathBuf::from(OsString::from_vec(buf)));
                    }
                }
                FsOp::Readdir => {
                    let p = Path::new(std::ffi::OsStr::from_bytes(path.as_bytes()));
                    match std::fs::read_dir(p) {
                        Ok(iter) => {
                            let mut entries = Vec::new();
                            for entry in iter {
                                match entry {
                                    Ok(e) => entries.push(e.file_name()),
                                    Err(e) => {
                                        self.fail_io(e);
                                        return;
                                    }
                                }
                            }
                            self.result = entries.len() as i64;
                            self.entries = entries;
                        }
                        Err(e) => self.fail_io(e),
                    }
                }
                _ => {
                    self.error = Some(Error::new(Code::Einval));
                    self.result = -1;
                }
            },
            Args::PathMode { path, mode } => {
                let rc = match self.op {
                    FsOp::Mkdir => unsafe { libc::mkdir(path.as_ptr(), *mode as libc::mode_t) },
                    FsOp::Chmod => unsafe { libc::chmod(path.as_ptr(), *mode as libc::mode_t) },
                    _ => {
                        self.error = Some(Error::new(Code::Einval));
                        self.result = -1;
                        return;
                    }
                };
                if rc < 0 {
                    self.fail_errno();
                }
            }
            Args::FdMode { fd, mode } => {
                if unsafe { libc::fchmod(*fd, *mode as libc::mode_t) } < 0 {
                    self.fail_errno();
                }
            }
            Args::Ftruncate { fd, len } => {
                if unsafe { libc::ftruncate(*fd, *len as libc::off_t) } < 0 {
                    self.fail_errno();
                }
            }
            Args::Utime { path, atime, mtime } => {
                let times = to_timevals(*atime, *mtime);
                if unsafe { libc::utimes(path.as_ptr(), times.as_ptr()) } < 0 {
                    self.fail_errno();
                }
            }
            Args::Futime { fd, atime, mtime } => {
                let times = to_timevals(*atime, *mtime);
                if unsafe { libc::futimes(*fd, times.as_ptr()) } < 0 {
                    self.fail_errno();
                }
            }
            Args::Chown { path, uid, gid } => {
                if unsafe { libc::chown(path.as_ptr(), *uid, *gid) } < 0 {
                    self.fail_errno();
                }
            }
            Args::Fchown { fd, uid, gid } => {
                if unsafe { libc::fchown(*fd, *uid, *gid) } < 0 {
                    self.fail_errno();
                }
            }
            Args::TwoPaths { from, to } => {
                let rc = match self.op {
                    FsOp::Rename => unsafe { libc::rename(from.as_ptr(), to.as_ptr()) },
                    FsOp::Link => unsafe { libc::link(from.as_ptr(), to.as_ptr()) },
                    FsOp::Symlink => unsafe { libc::symlink(from.as_ptr(), to.as_ptr()) },
                    _ => {
                        self.error = Some(Error::new(Code::Einval));
                        self.result = -1;
                        return;
                    }
                };
                if rc < 0 {
                    self.fail_errno();
                }
            }
        }
    }
}

fn to_timevals(atime: f64, mtime: f64) -> [libc::timeval; 2] {
    let tv = |secs: f64| libc::timeval {
        tv_sec: secs as libc::time_t,
        tv_usec: ((secs.fract()) * 1_000_000.0) as libc::suseconds_t,
    };
    [tv(atime), tv(mtime)]
}

fn c_path(path: impl AsRef<Path>) -> Result<CString> {
    CString::new(path.as_ref().as_os_str().as_bytes()).map_err(|_| Error::new(Code::Einval))
}

/// Run or enqueue. With a callback the request goes to the pool and
/// `Ok(None)` comes back; without one it runs here and is returned.
fn submit(
    lp: &EventLoop,
    mut req: Box<FsRequest>,
    cb: Option<FsCb>,
) -> Result<Option<Box<FsRequest>>> {
    match cb {
        None => {
            req.execute();
            match req.error {
                Some(e) => Err(lp.fail(e)),
                None => Ok(Some(req)),
            }
        }
        Some(cb) => {
            lp.add_ref();
            let token = lp.register(Inflight::Fs(cb));
            let port = Arc::clone(&lp.inner.port);
            lp.fs_pool().submit(Box::new(move || {
                let mut req = req;
                req.execute();
                port.post(Packet::Fs { token, req });
            }));
            Ok(None)
        }
    }
}

/// Pool completion dispatcher.
pub(crate) fn process(lp: &EventLoop, req: FsRequest, cb: FsCb) {
    cb(req);
    lp.unref();
}

// ── Operations ────────────────────────────────────────────────────────

pub fn open(
    lp: &EventLoop,
    path: impl AsRef<Path>,
    flags: i32,
    mode: u32,
    cb: Option<FsCb>,
) -> Result<Option<Box<FsRequest>>> {
    let path = c_path(path).map_err(|e| lp.fail(e))?;
    submit(lp, FsRequest::new(FsOp::Open, Args::Open { path, flags, mode }), cb)
}

pub fn close(lp: &EventLoop, fd: RawFd, cb: Option<FsCb>) -> Result<Option<Box<FsRequest>>> {
    submit(lp, FsRequest::new(FsOp::Close, Args::Fd { fd }), cb)
}

/// Read `len` bytes at `offset`, or at the file position when `offset`
/// is negative.
pub fn read(
    lp: &EventLoop,
    fd: RawFd,
    len: usize,
    offset: i64,
    cb: Option<FsCb>,
) -> Result<Option<Box<FsRequest>>> {
    submit(lp, FsRequest::new(FsOp::Read, Args::Read { fd, len, offset }), cb)
}

pub fn write(
    lp: &EventLoop,
    fd: RawFd,
    data: &[u8],
    offset: i64,
    cb: Option<FsCb>,
) -> Result<Option<Box<FsRequest>>> {
    let data = data.to_vec();
    submit(lp, FsRequest::new(FsOp::Write, Args::Write { fd, data, offset }), cb)
}

pub fn sendfile(
    lp: &EventLoop,
    out_fd: RawFd,
    in_fd: RawFd,
    offset: i64,
    len: usize,
    cb: Option<FsCb>,
) -> Result<Option<Box<FsRequest>>> {
    submit(
        lp,
        FsRequest::new(FsOp::Sendfile, Args::Sendfile { out_fd, in_fd, offset, len }),
        cb,
    )
}

pub fn stat(lp: &EventLoop, path: impl AsRef<Path>, cb: Option<FsCb>) -> Result<Option<Box<FsRequest>>> {
    let path = c_path(path).map_err(|e| lp.fail(e))?;
    submit(lp, FsRequest::new(FsOp::Stat, Args::Path { path }), cb)
}

pub fn lstat(lp: &EventLoop, path: impl AsRef<Path>, cb: Option<FsCb>) -> Result<Option<Box<FsRequest>>> {
    let path = c_path(path).map_err(|e| lp.fail(e))?;
    submit(lp, FsRequest::new(FsOp::Lstat, Args::Path { path }), cb)
}

pub fn fstat(lp: &EventLoop, fd: RawFd, cb: Option<FsCb>) -> Result<Option<Box<FsRequest>>> {
    submit(lp, FsRequest::new(FsOp::Fstat, Args::Fd { fd }), cb)
}

pub fn ftruncate(
    lp: &EventLoop,
    fd: RawFd,
    len: i64,
    cb: Option<FsCb>,
) -> Result<Option<Box<FsRequest>>> {
    submit(lp, FsRequest::new(FsOp::Ftruncate, Args::Ftruncate { fd, len }), cb)
}

/// Times are seconds with fractional precision.
pub fn utime(
    lp: &EventLoop,
    path: impl AsRef<Path>,
    atime: f64,
    mtime: f64,
    cb: Option<FsCb>,
) -> Result<Option<Box<FsRequest>>> {
    let path = c_path(path).map_err(|e| lp.fail(e))?;
    submit(lp, FsRequest::new(FsOp::Utime, Args::Utime { path, atime, mtime }), cb)
}

pub fn futime(
    lp: &EventLoop,
    fd: RawFd,
    atime: f64,
    mtime: f64,
    cb: Option<FsCb>,
) -> Result<Option<Box<FsRequest>>> {
    submit(lp, FsRequest::new(FsOp::Futime, Args::Futime { fd, atime, mtime }), cb)
}

pub fn chmod(
    lp: &EventLoop,
    path: impl AsRef<Path>,
    mode: u32,
    cb: Option<FsCb>,
) -> Result<Option<Box<FsRequest>>> {
    let path = c_path(path).map_err(|e| lp.fail(e))?;
    submit(lp, FsRequest::new(FsOp::Chmod, Args::PathMode { path, mode }), cb)
}

pub fn fchmod(lp: &EventLoop, fd: RawFd, mode: u32, cb: Option<FsCb>) -> Result<Option<Box<FsRequest>>> {
    submit(lp, FsRequest::new(FsOp::Fchmod, Args::FdMode { fd, mode }), cb)
}

pub fn chown(
    lp: &EventLoop,
    path: impl AsRef<Path>,
    uid: u32,
    gid: u32,
    cb: Option<FsCb>,
) -> Result<Option<Box<FsRequest>>> {
    let path = c_path(path).map_err(|e| lp.fail(e))?;
    submit(lp, FsRequest::new(FsOp::Chown, Args::Chown { path, uid, gid }), cb)
}

pub fn fchown(
    lp: &EventLoop,
    fd: RawFd,
    uid: u32,
    gid: u32,
    cb: Option<FsCb>,
) -> Result<Option<Box<FsRequest>>> {
    submit(lp, FsRequest::new(FsOp::Fchown, Args::Fchown { fd, uid, gid }), cb)
}

pub fn link(
    lp: &EventLoop,
    from: impl AsRef<Path>,
    to: impl AsRef<Path>,
    cb: Option<FsCb>,
) -> Result<Option<Box<FsRequest>>> {
    let from = c_path(from).map_err(|e| lp.fail(e))?;
    let to = c_path(to).map_err(|e| lp.fail(e))?;
    submit(lp, FsRequest::new(FsOp::Link, Args::TwoPaths { from, to }), cb)
}

pub fn symlink(
    lp: &EventLoop,
    target: impl AsRef<Path>,
    linkpath: impl AsRef<Path>,
    cb: Option<FsCb>,
) -> Result<Option<Box<FsRequest>>> {
    let from = c_path(target).map_err(|e| lp.fail(e))?;
    let to = c_path(linkpath).map_err(|e| lp.fail(e))?;
    submit(lp, FsRequest::new(FsOp::Symlink, Args::TwoPaths { from, to }), cb)
}

pub fn readlink(lp: &EventLoop, path: impl AsRef<Path>, cb: Option<FsCb>) -> Result<Option<Box<FsRequest>>> {
    let path = c_path(path).map_err(|e| lp.fail(e))?;
    submit(lp, FsRequest::new(FsOp::Readlink, Args::Path { path }), cb)
}

pub fn unlink(lp: &EventLoop, path: impl AsRef<Path>, cb: Option<FsCb>) -> Result<Option<Box<FsRequest>>> {
    let path = c_path(path).map_err(|e| lp.fail(e))?;
    submit(lp, FsRequest::new(FsOp::Unlink, Args::Path { path }), cb)
}

pub fn rmdir(lp: &EventLoop, path: impl AsRef<Path>, cb: Option<FsCb>) -> Result<Option<Box<FsRequest>>> {
    let path = c_path(path).map_err(|e| lp.fail(e))?;
    submit(lp, FsRequest::new(FsOp::Rmdir, Args::Path { path }), cb)
}

pub fn mkdir(
    lp: &EventLoop,
    path: impl AsRef<Path>,
    mode: u32,
    cb: Option<FsCb>,
) -> Result<Option<Box<FsRequest>>> {
    let path = c_path(path).map_err(|e| lp.fail(e))?;
    submit(lp, FsRequest::new(FsOp::Mkdir, Args::PathMode { path, mode }), cb)
}

pub fn rename(
    lp: &EventLoop,
    from: impl AsRef<Path>,
    to: impl AsRef<Path>,
    cb: Option<FsCb>,
) -> Result<Option<Box<FsRequest>>> {
    let from = c_path(from).map_err(|e| lp.fail(e))?;
    let to = c_path(to).map_err(|e| lp.fail(e))?;
    submit(lp, FsRequest::new(FsOp::Rename, Args::TwoPaths { from, to }), cb)
}

pub fn readdir(lp: &EventLoop, path: impl AsRef<Path>, cb: Option<FsCb>) -> Result<Option<Box<FsRequest>>> {
    let path = c_path(path).map_err(|e| lp.fail(e))?;
    submit(lp, FsRequest::new(FsOp::Readdir, Args::Path { path }), cb)
}

pub fn fsync(lp: &EventLoop, fd: RawFd, cb: Option<FsCb>) -> Result<Option<Box<FsRequest>>> {
    submit(lp, FsRequest::new(FsOp::Fsync, Args::Fd { fd }), cb)
}

pub fn fdatasync(lp: &EventLoop, fd: RawFd, cb: Option<FsCb>) -> Result<Option<Box<FsRequest>>> {
    submit(lp, FsRequest::new(FsOp::Fdatasync, Args::Fd { fd }), cb)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("ripple-fs-{}-{}", tag, std::process::id()))
    }

    #[test]
    fn test_sync_write_read_round() {
        let lp = EventLoop::new().unwrap();
        let path = temp_path("round");
        let req = open(
            &lp,
            &path,
            libc::O_CREAT | libc::O_TRUNC | libc::O_RDWR,
            0o644,
            None,
        )
        .unwrap()
        .unwrap();
        let fd = req.result() as RawFd;
        assert!(fd >= 0);

        let w = write(&lp, fd, b"hello fs", 0, None).unwrap().unwrap();
        assert_eq!(w.result(), 8);

        let r = read(&lp, fd, 64, 0, None).unwrap().unwrap();
        assert_eq!(r.data(), b"hello fs");

        let st = fstat(&lp, fd, None).unwrap().unwrap();
        assert_eq!(st.stat().unwrap().size, 8);
        assert!(st.stat().unwrap().is_file());

        close(&lp, fd, None).unwrap();
        unlink(&lp, &path, None).unwrap();
        assert_eq!(
            stat(&lp, &path, None).unwrap_err().code(),
            Code::Enoent
        );
    }

    #[test]
    fn test_sync_mkdir_readdir_rmdir() {
        let lp = EventLoop::new().unwrap();
        let dir = temp_path("dir");
        mkdir(&lp, &dir, 0o755, None).unwrap();
        let file = dir.join("entry.txt");
        let req = open(
            &lp,
            &file,
            libc::O_CREAT | libc::O_WRONLY,
            0o644,
            None,
        )
        .unwrap()
        .unwrap();
        close(&lp, req.result() as RawFd, None).unwrap();

        let ls = readdir(&lp, &dir, None).unwrap().unwrap();
        assert_eq!(ls.result(), 1);
        assert_eq!(ls.entries()[0], OsString::from("entry.txt"));

        unlink(&lp, &file, None).unwrap();
        rmdir(&lp, &dir, None).unwrap();
    }

    #[test]
    fn test_sync_error_sets_last_error() {
        let lp = EventLoop::new().unwrap();
        let e = stat(&lp, "/nonexistent/ripple/path", None).unwrap_err();
        assert_eq!(e.code(), Code::Enoent);
        assert_eq!(lp.last_error().unwrap().code(), Code::Enoent);
    }
}
