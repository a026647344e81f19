//! In-process signal/slot primitive for the cooperative reactor thread.
//!
//! A `Signal` owns a list of callbacks and invokes them in connect order on
//! every emit. Slots are identified by the `SlotId` returned from `connect`
//! so owners can deregister explicitly when they go away.

use std::cell::{Cell, RefCell};

/// Identifies a connected slot for later disconnection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotId(u64);

struct Slot<T: ?Sized> {
    id: u64,
    // Taken out while the callback runs so emit never holds the list borrow
    // across user code.
    cb: Option<Box<dyn FnMut(&T)>>,
}

/// A single-threaded signal with explicitly managed slots.
///
/// Re-entrancy rules: a slot may connect or disconnect slots (including
/// itself) while an emit is in progress. Slots connected during an emit are
/// not invoked until the next emit; a slot disconnected mid-emit never runs
/// again.
pub struct Signal<T: ?Sized> {
    slots: RefCell<Vec<Slot<T>>>,
    next_id: Cell<u64>,
}

impl<T: ?Sized> Signal<T> {
    pub fn new() -> Self {
        Self {
            slots: RefCell::new(Vec::new()),
            next_id: Cell::new(1),
        }
    }

    /// Attach a callback, returning its id for `disconnect`.
    pub fn connect(&self, cb: impl FnMut(&T) + 'static) -> SlotId {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        self.slots.borrow_mut().push(Slot {
            id,
            cb: Some(Box::new(cb)),
        });
        SlotId(id)
    }

    /// Detach a slot. Returns false if the id is unknown (already removed).
    pub fn disconnect(&self, id: SlotId) -> bool {
        let mut slots = self.slots.borrow_mut();
        match slots.iter().position(|s| s.id == id.0) {
            Some(pos) => {
                slots.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.slots.borrow().is_empty()
    }

    /// Invoke every slot that was connected before this emit started.
    pub fn emit(&self, arg: &T) {
        let cutoff = self.next_id.get();
        let mut last = 0u64;
        loop {
            let taken = {
                let mut slots = self.slots.borrow_mut();
                slots
                    .iter_mut()
                    .find(|s| s.id > last && s.id < cutoff && s.cb.is_some())
                    .map(|s| (s.id, s.cb.take().expect("slot checked non-empty")))
            };
            let Some((id, mut cb)) = taken else { break };
            last = id;
            cb(arg);
            let mut slots = self.slots.borrow_mut();
            if let Some(slot) = slots.iter_mut().find(|s| s.id == id) {
                slot.cb = Some(cb);
            }
        }
    }
}

impl<T: ?Sized> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}
