//! Filesystem change watching.
//!
//! A watcher targets one path. Directories are watched directly
//! (non-recursive); a file target watches its parent directory and
//! filters events down to the one leaf name, so renames of the file
//! itself are still observed. The platform watcher runs on its own
//! thread and posts each event as a packet; the callback always runs
//! on the loop thread.

use std::cell::RefCell;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;

use notify::event::{EventKind, ModifyKind};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};

use ripple_core::error::{Code, Error, Result};
use ripple_core::handle::HandleKind;
use ripple_core::rdebug;

use crate::event_loop::{EventLoop, Inflight};
use crate::handle::{self, CloseCb, Handle, HandleCore};
use crate::port::Packet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsEventKind {
    /// A name came or went: create, remove, or rename.
    Rename,
    /// Contents or metadata changed.
    Change,
}

/// What the watcher thread posts for one platform event.
pub(crate) struct WatchEvent {
    pub(crate) paths: Vec<PathBuf>,
    pub(crate) kind: FsEventKind,
}

/// Filename (when known) plus the event kind, or a watcher failure.
pub type FsEventCb = Box<dyn FnMut(Option<&str>, Result<FsEventKind>)>;

pub(crate) struct FsEventInner {
    pub(crate) core: HandleCore,
    watcher: Option<RecommendedWatcher>,
    token: Option<u64>,
    /// Set when the target is a file: only events whose leaf matches
    /// are reported.
    leaf: Option<OsString>,
    cb: Option<Rc<RefCell<FsEventCb>>>,
}

#[derive(Clone)]
pub struct FsEventHandle {
    pub(crate) inner: Rc<RefCell<FsEventInner>>,
}

impl FsEventHandle {
    pub fn new(lp: &EventLoop) -> FsEventHandle {
        FsEventHandle {
            inner: Rc::new(RefCell::new(FsEventInner {
                core: HandleCore::new(lp, HandleKind::FsEvent),
                watcher: None,
                token: None,
                leaf: None,
                cb: None,
            })),
        }
    }

    fn as_handle(&self) -> Handle {
        Handle::FsEvent(self.clone())
    }

    fn lp(&self) -> EventLoop {
        self.inner.borrow().core.lp.clone()
    }

    /// Begin watching `path`. The callback fires once per observed
    /// event until the handle is closed.
    pub fn start(
        &self,
        path: impl AsRef<Path>,
        cb: impl FnMut(Option<&str>, Result<FsEventKind>) + 'static,
    ) -> Result<()> {
        let lp = self.lp();
        let path = path.as_ref();
        {
            let i = self.inner.borrow();
            if i.core.flags.is_closing() {
                return Err(lp.fail(Error::new(Code::Ebadf)));
            }
            if i.watcher.is_some() {
                return Err(lp.fail(Error::new(Code::Ealready)));
            }
        }

        let meta = std::fs::metadata(path).map_err(|e| lp.fail(Error::from(e)))?;
        let (root, leaf) = if meta.is_dir() {
            (path.to_path_buf(), None)
        } else {
            // watch the parent so renames of the file itself show up
            let root = match path.parent() {
                Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
                _ => PathBuf::from("."),
            };
            (root, path.file_name().map(OsString::from))
        };

        let h = self.as_handle();
        let token = lp.register(Inflight::Watch(h.clone()));
        let port = Arc::clone(&lp.inner.port);
        let watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if let Some(event) = translate(res) {
                port.post(Packet::Watch { token, event });
            }
        });
        let mut watcher = match watcher {
            Ok(w) => w,
            Err(e) => {
                lp.take_inflight(token);
                return Err(lp.fail(notify_error(e)));
            }
        };
        if let Err(e) = watcher.watch(&root, RecursiveMode::NonRecursive) {
            lp.take_inflight(token);
            return Err(lp.fail(notify_error(e)));
        }

        {
            let mut i = self.inner.borrow_mut();
            i.watcher = Some(watcher);
            i.token = Some(token);
            i.leaf = leaf;
            let boxed: FsEventCb = Box::new(cb);
            i.cb = Some(Rc::new(RefCell::new(boxed)));
        }
        // the watcher token is persistent: one request for its lifetime
        handle::add_req(&h);
        Ok(())
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

    /// True while a watch is in place.
    pub fn is_active(&self) -> bool {
        self.inner.borrow().core.is_active()
    }
}

/// Map a platform event to the two-kind model. `None` filters it out.
fn translate(res: notify::Result<notify::Event>) -> Option<Result<WatchEvent>> {
    match res {
        Ok(ev) => {
            let kind = match ev.kind {
                EventKind::Create(_) | EventKind::Remove(_) => FsEventKind::Rename,
                EventKind::Modify(ModifyKind::Name(_)) => FsEventKind::Rename,
                EventKind::Modify(_) => FsEventKind::Change,
                EventKind::Access(_) => return None,
                _ => FsEventKind::Change,
            };
            Some(Ok(WatchEvent { paths: ev.paths, kind }))
        }
        Err(e) => Some(Err(notify_error(e))),
    }
}

fn notify_error(e: notify::Error) -> Error {
    match e.kind {
        notify::ErrorKind::Io(io) => Error::from(io),
        notify::ErrorKind::PathNotFound => Error::new(Code::Enoent),
        notify::ErrorKind::MaxFilesWatch => Error::new(Code::Enfile),
        _ => Error::new(Code::Einval),
    }
}

/// Watch-packet dispatcher.
pub(crate) fn process_event(h: &Handle, event: Result<WatchEvent>) {
    let Handle::FsEvent(w) = h else { return };
    if h.is_closing() {
        return;
    }
    let (leaf, cb) = {
        let i = w.inner.borrow();
        (i.leaf.clone(), i.cb.as_ref().map(Rc::clone))
    };
    let Some(cb) = cb else { return };
    match event {
        Ok(ev) => {
            let matched: Vec<&PathBuf> = match &leaf {
                Some(leaf) => ev
                    .paths
                    .iter()
                    .filter(|p| p.file_name() == Some(leaf.as_os_str()))
                    .collect(),
                None => ev.paths.iter().collect(),
            };
            if leaf.is_some() && matched.is_empty() {
                return;
            }
            let name = matched
                .first()
                .and_then(|p| p.file_name())
                .and_then(|n| n.to_str())
                .map(str::to_owned);
            (cb.borrow_mut())(name.as_deref(), Ok(ev.kind));
        }
        Err(e) => {
            rdebug!("fs watcher reported {}", e);
            (cb.borrow_mut())(None, Err(e));
        }
    }
}

pub(crate) fn close_start(w: &FsEventHandle) {
    let lp = w.lp();
    let (watcher, token) = {
        let mut i = w.inner.borrow_mut();
        (i.watcher.take(), i.token.take())
    };
    drop(watcher); // stops the platform thread
    if let Some(token) = token {
        // retire the persistent request without re-entering close
        if lp.take_inflight(token).is_some() {
            w.inner.borrow_mut().core.reqs_pending -= 1;
        }
    }
}

pub(crate) fn endgame_cleanup(w: &FsEventHandle) {
    w.inner.borrow_mut().cb = None;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_missing_path() {
        let lp = EventLoop::new().unwrap();
        let w = FsEventHandle::new(&lp);
        let e = w.start("/nonexistent/ripple/watch", |_, _| {}).unwrap_err();
        assert_eq!(e.code(), Code::Enoent);
        w.close_silent();
        lp.run();
    }

    #[test]
    fn test_double_start_rejected() {
        let lp = EventLoop::new().unwrap();
        let w = FsEventHandle::new(&lp);
        w.start(std::env::temp_dir(), |_, _| {}).unwrap();
        let e = w.start(std::env::temp_dir(), |_, _| {}).unwrap_err();
        assert_eq!(e.code(), Code::Ealready);
        w.close_silent();
        lp.run();
    }
}
