//! Delayed-job scheduling.
//!
//! A single named timer thread owns a due-time ordered heap of jobs and
//! sleeps on its channel until the next job is due. Dropping the
//! scheduler disconnects the channel; pending jobs are discarded.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Mutex;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use tracing::warn;

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Entry {
    at: Instant,
    job: Job,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert so the earliest job is on top
        other.at.cmp(&self.at)
    }
}

/// Handle to the timer thread.
pub struct Scheduler {
    tx: Option<Sender<Entry>>,
    thread: Option<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        let thread = thread::Builder::new()
            .name("net-scheduler".to_string())
            .spawn(move || run(rx))
            .ok();
        if thread.is_none() {
            warn!("failed to spawn scheduler thread, delayed jobs are disabled");
        }
        Scheduler {
            tx: Some(tx),
            thread,
        }
    }

    /// Run `job` no earlier than `delay` from now.
    pub fn schedule_in(&self, delay: Duration, job: impl FnOnce() + Send + 'static) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(Entry {
                at: Instant::now() + delay,
                job: Box::new(job),
            });
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

fn run(rx: Receiver<Entry>) {
    let mut pending: BinaryHeap<Entry> = BinaryHeap::new();
    loop {
        let now = Instant::now();
        while pending.peek().is_some_and(|e| e.at <= now) {
            if let Some(entry) = pending.pop() {
                (entry.job)();
            }
        }
        match pending.peek() {
            Some(next) => {
                let wait = next.at.saturating_duration_since(Instant::now());
                match rx.recv_timeout(wait) {
                    Ok(entry) => pending.push(entry),
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            }
            None => match rx.recv() {
                Ok(entry) => pending.push(entry),
                Err(_) => return,
            },
        }
    }
}

/// Coalesces bursts of change signals into at most one job per window.
///
/// A signal schedules its job `delay` in the future and opens a window of
/// the same length; further signals inside the window are no-ops, so the
/// job that runs carries the arguments of the signal that opened the
/// window.
pub struct Debouncer {
    delay: Duration,
    last: Mutex<Option<Instant>>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Debouncer {
            delay,
            last: Mutex::new(None),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Schedule `job` unless a window is already open. Returns whether
    /// the job was scheduled.
    pub fn fire(&self, scheduler: &Scheduler, job: impl FnOnce() + Send + 'static) -> bool {
        let mut last = self.last.lock().unwrap();
        let now = Instant::now();
        if last.is_none_or(|l| now > l) {
            *last = Some(now + self.delay);
            scheduler.schedule_in(self.delay, job);
            true
        } else {
            false
        }
    }
}
