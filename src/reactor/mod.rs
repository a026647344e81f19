//! Single-threaded cooperative event loop.
//!
//! The reactor dispatches timer expirations and file-descriptor activity on
//! the thread that calls `run_once`. Callbacks run to completion and are
//! never re-entered; they may freely register, re-arm, or drop timers and
//! watches from inside a dispatch.

mod fdwatch;
mod timer;

pub use fdwatch::{FdWatch, FdWatchDir};
pub use timer::Timer;

use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use fdwatch::WatchTable;
use timer::TimerTable;

pub(crate) struct ReactorCore {
    pub(crate) timers: RefCell<TimerTable>,
    pub(crate) watches: RefCell<WatchTable>,
}

/// Cheaply cloneable handle to the event loop. Not `Send`; everything the
/// reactor touches stays on its thread.
#[derive(Clone)]
pub struct Reactor {
    core: Rc<ReactorCore>,
}

impl Reactor {
    pub fn new() -> Self {
        Self {
            core: Rc::new(ReactorCore {
                timers: RefCell::new(TimerTable::new()),
                watches: RefCell::new(WatchTable::new()),
            }),
        }
    }

    /// Register a timer that fires `delay` after being armed. One-shot
    /// timers disable themselves before their callback runs, so the
    /// callback may re-arm with `set_timeout`. Dropping the returned handle
    /// unregisters the timer.
    pub fn add_timer(
        &self,
        delay: Duration,
        periodic: bool,
        cb: impl FnMut() + 'static,
    ) -> Timer {
        self.core
            .timers
            .borrow_mut()
            .add(Rc::downgrade(&self.core), delay, periodic, Box::new(cb))
    }

    /// Watch a file descriptor for readability or writability. The watch is
    /// level-triggered; the callback keeps firing while the condition
    /// holds. Dropping the handle unregisters the watch.
    pub fn add_fd_watch(
        &self,
        fd: RawFd,
        dir: FdWatchDir,
        cb: impl FnMut() + 'static,
    ) -> FdWatch {
        self.core
            .watches
            .borrow_mut()
            .add(Rc::downgrade(&self.core), fd, dir, Box::new(cb))
    }

    /// One poll/dispatch cycle: fire every due timer (deadline order,
    /// registration order on ties), then poll fds for at most `max_wait`
    /// (shortened to the next timer deadline) and dispatch activity.
    /// Returns true if anything was dispatched.
    pub fn run_once(&self, max_wait: Duration) -> bool {
        let fired = self.dispatch_timers();
        let wait = if fired > 0 {
            Duration::ZERO
        } else {
            match self.core.timers.borrow().next_deadline() {
                Some(deadline) => deadline
                    .saturating_duration_since(Instant::now())
                    .min(max_wait),
                None => max_wait,
            }
        };
        let ready = self.poll_watches(wait);
        fired > 0 || ready > 0
    }

    /// Drive the loop until `done()` or the timeout elapses. Returns
    /// whether the predicate was satisfied.
    pub fn run_until(&self, timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if done() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.run_once((deadline - now).min(Duration::from_millis(10)));
        }
    }

    fn dispatch_timers(&self) -> usize {
        let now = Instant::now();
        let due = self.core.timers.borrow().due(now);
        let mut fired = 0;
        for id in due {
            let taken = self.core.timers.borrow_mut().begin_dispatch(id, now);
            let Some(mut cb) = taken else { continue };
            fired += 1;
            cb();
            self.core.timers.borrow_mut().end_dispatch(id, cb);
        }
        fired
    }

    fn poll_watches(&self, wait: Duration) -> usize {
        let mut fds: Vec<(u64, libc::pollfd)> = self.core.watches.borrow().poll_set();
        let timeout_ms = wait.as_millis().min(i32::MAX as u128) as libc::c_int;
        let n = if fds.is_empty() {
            // Nothing to watch; poll still provides the sleep.
            unsafe { libc::poll(std::ptr::null_mut(), 0, timeout_ms) }
        } else {
            let mut raw: Vec<libc::pollfd> = fds.iter().map(|(_, p)| *p).collect();
            let n = unsafe { libc::poll(raw.as_mut_ptr(), raw.len() as libc::nfds_t, timeout_ms) };
            for ((_, slot), filled) in fds.iter_mut().zip(raw) {
                slot.revents = filled.revents;
            }
            n
        };
        if n <= 0 {
            return 0;
        }
        let mut dispatched = 0;
        for (id, pfd) in fds {
            if pfd.revents == 0 {
                continue;
            }
            let taken = self.core.watches.borrow_mut().begin_dispatch(id);
            let Some(mut cb) = taken else { continue };
            dispatched += 1;
            cb();
            self.core.watches.borrow_mut().end_dispatch(id, cb);
        }
        dispatched
    }
}

impl Default for Reactor {
    fn default() -> Self {
        Self::new()
    }
}
