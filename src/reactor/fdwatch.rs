//! File-descriptor watch registry and the public `FdWatch` handle.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::rc::Weak;

use super::ReactorCore;

/// Which readiness condition a watch waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdWatchDir {
    Read,
    Write,
}

struct WatchEntry {
    fd: RawFd,
    dir: FdWatchDir,
    enabled: bool,
    cb: Option<Box<dyn FnMut()>>,
}

pub(crate) struct WatchTable {
    entries: HashMap<u64, WatchEntry>,
    next_id: u64,
}

impl WatchTable {
    pub(crate) fn new() -> Self {
        Self {
            entries: HashMap::new(),
            next_id: 1,
        }
    }

    pub(crate) fn add(
        &mut self,
        core: Weak<ReactorCore>,
        fd: RawFd,
        dir: FdWatchDir,
        cb: Box<dyn FnMut()>,
    ) -> FdWatch {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(
            id,
            WatchEntry {
                fd,
                dir,
                enabled: true,
                cb: Some(cb),
            },
        );
        FdWatch { core, id }
    }

    /// The pollfd set for every enabled watch. Hangup and error conditions
    /// are reported through read watches so endpoints can observe EOF.
    pub(crate) fn poll_set(&self) -> Vec<(u64, libc::pollfd)> {
        self.entries
            .iter()
            .filter(|(_, e)| e.enabled)
            .map(|(&id, e)| {
                let events = match e.dir {
                    FdWatchDir::Read => libc::POLLIN,
                    FdWatchDir::Write => libc::POLLOUT,
                };
                (
                    id,
                    libc::pollfd {
                        fd: e.fd,
                        events,
                        revents: 0,
                    },
                )
            })
            .collect()
    }

    pub(crate) fn begin_dispatch(&mut self, id: u64) -> Option<Box<dyn FnMut()>> {
        let entry = self.entries.get_mut(&id)?;
        if !entry.enabled {
            return None;
        }
        entry.cb.take()
    }

    pub(crate) fn end_dispatch(&mut self, id: u64, cb: Box<dyn FnMut()>) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.cb = Some(cb);
        }
    }

    fn remove(&mut self, id: u64) {
        self.entries.remove(&id);
    }
}

/// Handle to a registered fd watch. Dropping it unregisters the watch.
pub struct FdWatch {
    core: Weak<ReactorCore>,
    id: u64,
}

impl FdWatch {
    pub fn set_enable(&self, enable: bool) {
        if let Some(core) = self.core.upgrade() {
            let mut watches = core.watches.borrow_mut();
            if let Some(entry) = watches.entries.get_mut(&self.id) {
                entry.enabled = enable;
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.core
            .upgrade()
            .map(|core| {
                core.watches
                    .borrow()
                    .entries
                    .get(&self.id)
                    .is_some_and(|e| e.enabled)
            })
            .unwrap_or(false)
    }
}

impl Drop for FdWatch {
    fn drop(&mut self) {
        if let Some(core) = self.core.upgrade() {
            core.watches.borrow_mut().remove(self.id);
        }
    }
}
