//! Registry of worker threads.
//!
//! The engine starts its dispatch thread and every host lookup through a
//! [`ThreadQueue`]. At shutdown the queue waits for all of them; threads that
//! do not finish in time are detached and logged, since Rust offers no safe
//! way to kill a thread.

use crate::error::Error;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::channel;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Identifies a thread started by a [`ThreadQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadKey(u64);

#[derive(Debug, Default)]
struct DoneFlag {
    finished: Mutex<bool>,
    cond: Condvar,
}

impl DoneFlag {
    fn is_set(&self) -> bool {
        *self.finished.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns whether the flag was set before `deadline`.
    fn wait_until(&self, deadline: Instant) -> bool {
        let mut finished = self.finished.lock().unwrap_or_else(PoisonError::into_inner);
        while !*finished {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            finished = self
                .cond
                .wait_timeout(finished, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }
}

/// Sets the done flag when the thread body returns or unwinds.
struct FinishGuard(Arc<DoneFlag>);

impl Drop for FinishGuard {
    fn drop(&mut self) {
        *self.0.finished.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.0.cond.notify_all();
    }
}

#[derive(Debug)]
struct Entry {
    key: ThreadKey,
    name: String,
    thread_id: ThreadId,
    handle: JoinHandle<()>,
    done: Arc<DoneFlag>,
}

#[derive(Debug)]
pub struct ThreadQueue {
    name: String,
    entries: Mutex<Vec<Entry>>,
    next_key: AtomicU64,
    started_total: AtomicUsize,
}

impl ThreadQueue {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: Mutex::new(Vec::new()),
            next_key: AtomicU64::new(1),
            started_total: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawns `body` on a named thread and returns once the thread is
    /// running. The body does not start before the thread is registered in
    /// the queue.
    pub fn start_thread<F>(&self, name: &str, body: F) -> Result<ThreadKey, Error>
    where
        F: FnOnce() + Send + 'static,
    {
        self.clear_finished();

        let done = Arc::new(DoneFlag::default());
        let guard = FinishGuard(Arc::clone(&done));
        let (go_tx, go_rx) = channel::<()>();
        let (running_tx, running_rx) = channel::<()>();

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let _guard = guard;
                if go_rx.recv().is_ok() {
                    let _ = running_tx.send(());
                    body();
                }
            })
            .map_err(|err| {
                error!(queue = %self.name, thread = name, %err, "Unable to spawn thread");
                Error::ThreadSpawn(name.to_string())
            })?;

        let key = ThreadKey(self.next_key.fetch_add(1, Ordering::Relaxed));
        self.lock().push(Entry {
            key,
            name: name.to_string(),
            thread_id: handle.thread().id(),
            handle,
            done,
        });
        self.started_total.fetch_add(1, Ordering::Relaxed);
        // Both ends only disappear if the thread died before starting.
        let _ = go_tx.send(());
        let _ = running_rx.recv();
        debug!(queue = %self.name, thread = name, ?key, "Thread started");
        Ok(key)
    }

    /// Whether the calling thread is the one registered under `key`.
    pub fn is_current(&self, key: ThreadKey) -> bool {
        let current = thread::current().id();
        self.lock()
            .iter()
            .any(|e| e.key == key && e.thread_id == current)
    }

    /// Waits up to `timeout` for the thread to finish and joins it. Unknown
    /// keys count as finished.
    pub fn wait_for_exit(&self, key: ThreadKey, timeout: Duration) -> bool {
        let done = match self.lock().iter().find(|e| e.key == key) {
            Some(entry) => Arc::clone(&entry.done),
            None => return true,
        };
        if !done.wait_until(Instant::now() + timeout) {
            return false;
        }
        self.clear_finished();
        true
    }

    /// Waits for every thread, then (with `force`) a further `force_wait`
    /// before detaching whatever is still running. Returns whether all
    /// threads finished.
    pub fn kill_all(&self, force: bool, wait: Duration, force_wait: Duration) -> bool {
        let current = thread::current().id();
        let pending: Vec<(ThreadKey, Arc<DoneFlag>)> = self
            .lock()
            .iter()
            .filter(|e| e.thread_id != current)
            .map(|e| (e.key, Arc::clone(&e.done)))
            .collect();

        let deadline = Instant::now() + wait;
        let mut all_done = pending.iter().all(|(_, done)| done.wait_until(deadline));

        if !all_done && force {
            let deadline = Instant::now() + force_wait;
            all_done = pending.iter().all(|(_, done)| done.wait_until(deadline));
            if !all_done {
                let stuck: Vec<ThreadKey> = pending
                    .iter()
                    .filter(|(_, done)| !done.is_set())
                    .map(|(key, _)| *key)
                    .collect();
                let mut entries = self.lock();
                entries.retain(|e| {
                    let detach = stuck.contains(&e.key);
                    if detach {
                        error!(queue = %self.name, thread = %e.name, "Thread did not finish, detaching it");
                    }
                    !detach
                });
            }
        }

        self.clear_finished();
        if !all_done && !force {
            warn!(queue = %self.name, live = self.live_count(), "Threads still running");
        }
        all_done
    }

    /// Joins and forgets threads that have finished.
    pub fn clear_finished(&self) {
        let finished: Vec<Entry> = {
            let mut entries = self.lock();
            let (finished, running) = entries.drain(..).partition(|e| e.done.is_set());
            *entries = running;
            finished
        };
        for entry in finished {
            if entry.handle.join().is_err() {
                warn!(queue = %self.name, thread = %entry.name, "Thread panicked");
            }
        }
    }

    /// Threads registered and not yet joined.
    pub fn live_count(&self) -> usize {
        self.lock().len()
    }

    pub fn started_total(&self) -> usize {
        self.started_total.load(Ordering::Relaxed)
    }
}

impl Drop for ThreadQueue {
    fn drop(&mut self) {
        self.clear_finished();
        let live = self.live_count();
        if live > 0 {
            warn!(queue = %self.name, live, "Thread queue dropped with running threads");
        }
    }
}
