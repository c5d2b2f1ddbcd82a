//! ripple: a completion-based event loop runtime.
//!
//! Everything funnels through one completion port per loop:
//!
//! ```text
//!   poller thread ──┐
//!   fs pool ────────┤
//!   pipe connect ───┼──▶ completion port ──▶ loop thread ──▶ callbacks
//!   child waiters ──┤
//!   fs watchers ────┘
//! ```
//!
//! Helper threads only produce packets; every user callback runs on
//! the loop thread, in deterministic order. Handles are cheap clones
//! of shared state and follow one lifecycle: init, active, `close`,
//! close callback last of all.
//!
//! Log output is controlled by `RIPPLE_LOG_LEVEL` (error, warn, info,
//! debug, trace) and `RIPPLE_FLUSH_EPRINT`.

mod event_loop;
mod handle;
mod pipe;
mod poller;
mod pool;
mod port;
mod process;
mod stream;
mod sys;
mod tcp;
mod timer;

pub mod fs;
pub mod fs_event;

pub use event_loop::EventLoop;
pub use fs_event::{FsEventHandle, FsEventKind};
pub use handle::guess_handle;
pub use pipe::PipeHandle;
pub use process::{ExitCb, ProcessHandle, ProcessOptions};
pub use tcp::TcpHandle;
pub use timer::TimerHandle;

pub use ripple_core::error::{Code, Error, Result};
pub use ripple_core::handle::HandleKind;
