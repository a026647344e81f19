//! Timer registry and the public `Timer` handle.

use std::collections::HashMap;
use std::rc::Weak;
use std::time::{Duration, Instant};

use super::ReactorCore;

struct TimerEntry {
    deadline: Option<Instant>,
    delay: Duration,
    periodic: bool,
    seq: u64,
    // Taken out while the callback runs so dispatch never holds the table
    // borrow across user code.
    cb: Option<Box<dyn FnMut()>>,
}

pub(crate) struct TimerTable {
    entries: HashMap<u64, TimerEntry>,
    next_id: u64,
}

impl TimerTable {
    pub(crate) fn new() -> Self {
        Self {
            entries: HashMap::new(),
            next_id: 1,
        }
    }

    pub(crate) fn add(
        &mut self,
        core: Weak<ReactorCore>,
        delay: Duration,
        periodic: bool,
        cb: Box<dyn FnMut()>,
    ) -> Timer {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(
            id,
            TimerEntry {
                deadline: Some(Instant::now() + delay),
                delay,
                periodic,
                seq: id,
                cb: Some(cb),
            },
        );
        Timer { core, id }
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().filter_map(|e| e.deadline).min()
    }

    /// Ids of timers due at `now`, in (deadline, registration) order.
    pub(crate) fn due(&self, now: Instant) -> Vec<u64> {
        let mut due: Vec<(Instant, u64, u64)> = self
            .entries
            .iter()
            .filter_map(|(&id, e)| {
                e.deadline
                    .filter(|&d| d <= now)
                    .map(|d| (d, e.seq, id))
            })
            .collect();
        due.sort();
        due.into_iter().map(|(_, _, id)| id).collect()
    }

    /// Re-check that `id` is still due, advance or disable its deadline,
    /// and hand out the callback for dispatch.
    pub(crate) fn begin_dispatch(&mut self, id: u64, now: Instant) -> Option<Box<dyn FnMut()>> {
        let entry = self.entries.get_mut(&id)?;
        match entry.deadline {
            Some(deadline) if deadline <= now => {}
            _ => return None,
        }
        entry.deadline = if entry.periodic {
            Some(now + entry.delay)
        } else {
            None
        };
        entry.cb.take()
    }

    /// Return the callback unless the timer was dropped while it ran.
    pub(crate) fn end_dispatch(&mut self, id: u64, cb: Box<dyn FnMut()>) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.cb = Some(cb);
        }
    }

    fn remove(&mut self, id: u64) {
        self.entries.remove(&id);
    }
}

/// Handle to a registered timer. Dropping it unregisters the timer.
pub struct Timer {
    core: Weak<ReactorCore>,
    id: u64,
}

impl Timer {
    /// Re-arm with a new delay measured from now, enabling the timer. The
    /// delay also becomes the period for periodic timers.
    pub fn set_timeout(&self, delay: Duration) {
        if let Some(core) = self.core.upgrade() {
            let mut timers = core.timers.borrow_mut();
            if let Some(entry) = timers.entries.get_mut(&self.id) {
                entry.delay = delay;
                entry.deadline = Some(Instant::now() + delay);
            }
        }
    }

    /// Enable re-arms from now with the stored delay; disable clears the
    /// pending expiration. Both are idempotent.
    pub fn set_enable(&self, enable: bool) {
        if let Some(core) = self.core.upgrade() {
            let mut timers = core.timers.borrow_mut();
            if let Some(entry) = timers.entries.get_mut(&self.id) {
                entry.deadline = if enable {
                    Some(Instant::now() + entry.delay)
                } else {
                    None
                };
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.core
            .upgrade()
            .map(|core| {
                core.timers
                    .borrow()
                    .entries
                    .get(&self.id)
                    .is_some_and(|e| e.deadline.is_some())
            })
            .unwrap_or(false)
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if let Some(core) = self.core.upgrade() {
            core.timers.borrow_mut().remove(self.id);
        }
    }
}
