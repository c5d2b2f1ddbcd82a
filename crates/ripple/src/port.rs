//! The completion port: the single funnel every helper thread posts
//! through.
//!
//! ```text
//!   poller thread ───┐
//!   fs pool workers ─┤
//!   connect retry  ──┼──▶ post() ──▶ [ VecDeque<Packet> ] ──▶ dequeue()
//!   wait threads   ──┤                                        (loop thread)
//!   fs watcher     ──┘
//! ```
//!
//! The loop thread is the only consumer. A packet carries a token that
//! the loop resolves against its in-flight registry; payload (when the
//! producing thread has one) travels inside the packet so helper threads
//! never touch handle state.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use ripple_core::error::Error;
use ripple_core::rfatal;

use crate::fs::FsRequest;
use crate::fs_event::WatchEvent;

/// One completed unit of work, posted by a helper thread.
pub(crate) enum Packet {
    /// An armed poller interest fired.
    Io { token: u64 },
    /// A filesystem request finished on the pool; the filled request
    /// rides along.
    Fs { token: u64, req: Box<FsRequest> },
    /// A pipe connect resolved (possibly after retrying on a worker
    /// thread).
    PipeConnect {
        token: u64,
        result: Result<socket2::Socket, Error>,
    },
    /// A child process exited; raw `waitpid` status.
    ProcessExit { token: u64, status: i32 },
    /// The filesystem watcher observed a change.
    Watch {
        token: u64,
        event: Result<WatchEvent, Error>,
    },
}

impl Packet {
    #[cfg(test)]
    pub(crate) fn token(&self) -> u64 {
        match self {
            Packet::Io { token }
            | Packet::Fs { token, .. }
            | Packet::PipeConnect { token, .. }
            | Packet::ProcessExit { token, .. }
            | Packet::Watch { token, .. } => *token,
        }
    }
}

pub(crate) struct CompletionPort {
    queue: Mutex<VecDeque<Packet>>,
    cond: Condvar,
}

impl CompletionPort {
    pub(crate) fn new() -> Self {
        CompletionPort {
            queue: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
        }
    }

    /// Post from any thread. A poisoned queue means a producer or the
    /// consumer panicked mid-push; no recovery is possible.
    pub(crate) fn post(&self, packet: Packet) {
        let mut q = match self.queue.lock() {
            Ok(q) => q,
            Err(_) => rfatal!("completion port poisoned on post"),
        };
        q.push_back(packet);
        self.cond.notify_one();
    }

    /// Dequeue one packet. `None` timeout blocks until a packet arrives;
    /// `Some(d)` waits at most `d` and returns `None` on expiry.
    pub(crate) fn dequeue(&self, timeout: Option<Duration>) -> Option<Packet> {
        let mut q = match self.queue.lock() {
            Ok(q) => q,
            Err(_) => rfatal!("completion port poisoned on dequeue"),
        };
        match timeout {
            None => loop {
                if let Some(p) = q.pop_front() {
                    return Some(p);
                }
                q = match self.cond.wait(q) {
                    Ok(q) => q,
                    Err(_) => rfatal!("completion port poisoned while waiting"),
                };
            },
            Some(mut left) => loop {
                if let Some(p) = q.pop_front() {
                    return Some(p);
                }
                if left.is_zero() {
                    return None;
                }
                let start = std::time::Instant::now();
                let (guard, res) = match self.cond.wait_timeout(q, left) {
                    Ok(r) => r,
                    Err(_) => rfatal!("completion port poisoned while waiting"),
                };
                q = guard;
                if res.timed_out() {
                    return q.pop_front();
                }
                left = left.saturating_sub(start.elapsed());
            },
        }
    }
}
