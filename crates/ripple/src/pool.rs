//! Blocking-work thread pool.
//!
//! Filesystem requests run here so the loop thread never blocks on
//! disk. Jobs are plain boxed closures; a finished job posts its
//! completion packet to the port itself, the pool knows nothing about
//! loops.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use ripple_core::{rdebug, rfatal};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Shared {
    queue: Mutex<VecDeque<Job>>,
    cond: Condvar,
    shutdown: AtomicBool,
}

pub(crate) struct WorkerPool {
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub(crate) fn new(size: usize) -> WorkerPool {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });
        let mut threads = Vec::with_capacity(size);
        for n in 0..size {
            let shared = Arc::clone(&shared);
            let t = std::thread::Builder::new()
                .name(format!("ripple-fs-{}", n))
                .spawn(move || worker_loop(shared));
            match t {
                Ok(t) => threads.push(t),
                Err(e) => rfatal!("worker pool: spawn failed: {}", e),
            }
        }
        rdebug!("worker pool started with {} threads", size);
        WorkerPool { shared, threads }
    }

    pub(crate) fn submit(&self, job: Job) {
        let mut q = match self.shared.queue.lock() {
            Ok(q) => q,
            Err(_) => rfatal!("worker pool: queue lock poisoned"),
        };
        q.push_back(job);
        drop(q);
        self.shared.cond.notify_one();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.cond.notify_all();
        for t in self.threads.drain(..) {
            let _ = t.join();
        }
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let job = {
            let mut q = match shared.queue.lock() {
                Ok(q) => q,
                Err(_) => return,
            };
            loop {
                if let Some(job) = q.pop_front() {
                    break job;
                }
                if shared.shutdown.load(Ordering::SeqCst) {
                    return;
                }
                q = match shared.cond.wait(q) {
                    Ok(q) => q,
                    Err(_) => return,
                };
            }
        };
        job();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    #[test]
    fn test_jobs_run() {
        let pool = WorkerPool::new(2);
        let counter = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();
        for _ in 0..8 {
            let counter = Arc::clone(&counter);
            let tx = tx.clone();
            pool.submit(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send(());
            }));
        }
        for _ in 0..8 {
            rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn test_drop_joins_threads() {
        let pool = WorkerPool::new(2);
        let ran = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&ran);
        pool.submit(Box::new(move || {
            r.fetch_add(1, Ordering::SeqCst);
        }));
        drop(pool);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
