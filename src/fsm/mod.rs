//! Hierarchical finite state machines.
//!
//! States are the variants of a user enum implementing [`StateKind`]; the
//! tree shape comes from each variant's [`Lineage`], a root-first chain of
//! named levels with entry/exit hooks over the shared context. Transitions
//! are two-phase: the target's `init` runs first and may redirect to a
//! substate, then exit hooks walk bottom-up and entry hooks top-down across
//! the common-ancestor boundary. A single one-shot reactor timer per
//! machine delivers `timeout_event` to the active state.
//!
//! Event methods live on the enum: the active state handles an event with
//! its own `match` arm, and wildcard arms express ancestor defaults.


use std::cell::RefCell;
use std::mem::{self, Discriminant};
use std::rc::Rc;
use std::time::Duration;

use crate::reactor::{Reactor, Timer};

/// One level of a state's ancestry: a unique name plus entry/exit hooks.
///
/// Ancestor levels have no value of their own, so the hooks operate on the
/// shared context only. Hooks cannot reach the machine by construction,
/// which is exactly the "no transitions from entry/exit" rule.
pub struct Level<C> {
    name: &'static str,
    entry: fn(&mut C),
    exit: fn(&mut C),
}

impl<C> Level<C> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entry: |_| {},
            exit: |_| {},
        }
    }

    pub fn on_entry(mut self, hook: fn(&mut C)) -> Self {
        self.entry = hook;
        self
    }

    pub fn on_exit(mut self, hook: fn(&mut C)) -> Self {
        self.exit = hook;
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<C> Clone for Level<C> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<C> Copy for Level<C> {}

/// Root-first chain of levels, leaf last. Level names must be unique
/// within one state tree; they are the level identity used to find the
/// common ancestor of two states.
pub struct Lineage<C> {
    levels: Vec<Level<C>>,
}

impl<C> Lineage<C> {
    pub fn new() -> Self {
        Self { levels: Vec::new() }
    }

    pub fn level(mut self, level: Level<C>) -> Self {
        self.levels.push(level);
        self
    }

    pub fn leaf_name(&self) -> &'static str {
        self.levels.last().map_or("?", |l| l.name)
    }
}

impl<C> Default for Lineage<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// Implemented by the enum whose variants are the machine's states.
pub trait StateKind<C: 'static>: Sized + 'static {
    /// This state's position in the tree.
    fn lineage(&self) -> Lineage<C>;

    /// Runs on a transition target before any entry/exit hook. The only
    /// place a state may itself continue the transition: return a substate
    /// (or call `set_state` on the machine) to redirect; the machine then
    /// discards this candidate without entering it.
    fn init(&mut self, fsm: &StateMachine<C, Self>) -> Option<Self> {
        let _ = fsm;
        None
    }

    /// Delivered when a timeout armed with `set_timeout` expires. Leaving
    /// it unhandled in a state that arms timeouts is a programming error.
    fn timeout_event(&mut self, fsm: &StateMachine<C, Self>) {
        let _ = fsm;
        debug_assert!(
            false,
            "unhandled timeout event in state '{}'",
            self.lineage().leaf_name()
        );
    }
}

struct MachineInner<C: 'static, S: StateKind<C>> {
    state: Option<S>,
    current_id: Option<Discriminant<S>>,
    current_lineage: Vec<Level<C>>,
    /// Bumped on every install; lets an interrupted transition notice that
    /// a nested one took over.
    install_seq: u64,
    /// Bumped on every `set_timeout`; lets a transition tell a stale
    /// pending timeout from one armed by the incoming state's `init`.
    arm_seq: u64,
    ctx: Rc<RefCell<C>>,
    timer: Option<Timer>,
}

/// Cheaply cloneable handle to a hierarchical state machine.
///
/// The context is shared with the host and outlives the machine. The
/// machine exclusively owns the active state value.
pub struct StateMachine<C: 'static, S: StateKind<C>> {
    inner: Rc<RefCell<MachineInner<C, S>>>,
}

impl<C: 'static, S: StateKind<C>> Clone for StateMachine<C, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<C: 'static, S: StateKind<C>> StateMachine<C, S> {
    pub fn new(reactor: &Reactor, ctx: Rc<RefCell<C>>) -> Self {
        let inner = Rc::new(RefCell::new(MachineInner {
            state: None,
            current_id: None,
            current_lineage: Vec::new(),
            install_seq: 0,
            arm_seq: 0,
            ctx,
            timer: None,
        }));
        let weak = Rc::downgrade(&inner);
        let timer = reactor.add_timer(Duration::ZERO, false, move || {
            if let Some(inner) = weak.upgrade() {
                StateMachine { inner }.on_timer_expired();
            }
        });
        timer.set_enable(false);
        inner.borrow_mut().timer = Some(timer);
        Self { inner }
    }

    /// Enter the default state (the top of the tree) and run its `init`,
    /// cascading into substates until the chain settles on a leaf.
    pub fn start(&self)
    where
        S: Default,
    {
        debug_assert!(
            self.inner.borrow().state.is_none(),
            "state machine already started"
        );
        self.set_state(S::default());
    }

    pub fn is_started(&self) -> bool {
        self.inner.borrow().current_id.is_some()
    }

    /// True when the active state is the same variant as `probe`; any
    /// payload in `probe` is ignored.
    pub fn is_active(&self, probe: &S) -> bool {
        self.inner.borrow().current_id == Some(mem::discriminant(probe))
    }

    pub fn active_name(&self) -> Option<&'static str> {
        self.inner.borrow().current_lineage.last().map(|l| l.name)
    }

    pub fn ctx(&self) -> Rc<RefCell<C>> {
        Rc::clone(&self.inner.borrow().ctx)
    }

    pub fn with_ctx<R>(&self, f: impl FnOnce(&mut C) -> R) -> R {
        let ctx = self.ctx();
        let mut ctx = ctx.borrow_mut();
        f(&mut ctx)
    }

    /// Read access to the active state.
    pub fn with_state<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        let inner = self.inner.borrow();
        f(inner.state.as_ref().expect("state machine not started"))
    }

    /// Run an event handler on the active state. The handler may call
    /// `set_state`; the transition completes before the handler returns,
    /// and the displaced state value is destroyed only after the handler
    /// unwinds. Dispatch is serial: handlers must not dispatch recursively.
    pub fn dispatch<R>(&self, f: impl FnOnce(&mut S, &Self) -> R) -> R {
        let mut state = self
            .inner
            .borrow_mut()
            .state
            .take()
            .expect("state machine not started");
        let result = f(&mut state, self);
        let mut inner = self.inner.borrow_mut();
        if inner.state.is_none() {
            inner.state = Some(state);
        }
        result
    }

    /// Transition to `new`.
    ///
    /// Transitioning to the active variant is a no-op and discards `new`.
    /// Otherwise the candidate's `init` runs first and may redirect; then
    /// exit hooks run bottom-up from the old leaf to (excluding) the common
    /// ancestor, the candidate is installed, and entry hooks run top-down
    /// from below the common ancestor to the new leaf. Init chains are not
    /// checked for cycles; that is the caller's responsibility.
    pub fn set_state(&self, new: S) {
        let new_id = mem::discriminant(&new);
        let (seq_before, arm_before) = {
            let inner = self.inner.borrow();
            if inner.current_id == Some(new_id) {
                return;
            }
            (inner.install_seq, inner.arm_seq)
        };

        let mut cand = new;
        if let Some(redirect) = cand.init(self) {
            self.set_state(redirect);
        }
        if self.inner.borrow().install_seq != seq_before {
            // A nested transition reached the leaf first; drop the
            // candidate without entering it.
            return;
        }

        let new_lineage = cand.lineage();
        debug_assert!(!new_lineage.levels.is_empty(), "state without a lineage");
        let (from, old_levels, common) = {
            let inner = self.inner.borrow();
            let common = inner
                .current_lineage
                .iter()
                .zip(new_lineage.levels.iter())
                .take_while(|(a, b)| a.name == b.name)
                .count();
            let from = inner.current_lineage.last().map(|l| l.name).unwrap_or("-");
            (from, inner.current_lineage[common..].to_vec(), common)
        };
        tracing::trace!(from, to = new_lineage.leaf_name(), "state transition");

        if !old_levels.is_empty() {
            // A timeout still pending from the outgoing state dies with it;
            // one the incoming init just armed survives.
            if self.inner.borrow().arm_seq == arm_before {
                self.clear_timeout();
            }
            let ctx = self.ctx();
            for level in old_levels.iter().rev() {
                (level.exit)(&mut ctx.borrow_mut());
            }
        }

        let entry_levels = new_lineage.levels[common..].to_vec();
        let displaced = {
            let mut inner = self.inner.borrow_mut();
            inner.current_id = Some(new_id);
            inner.current_lineage = new_lineage.levels;
            inner.state.replace(cand)
        };
        {
            let ctx = self.ctx();
            for level in &entry_levels {
                (level.entry)(&mut ctx.borrow_mut());
            }
        }
        self.inner.borrow_mut().install_seq += 1;
        // The old state object outlives its successor's entry.
        drop(displaced);
    }

    /// Arm the machine's one-shot timer; `timeout_event` fires on the then
    /// active state after `timeout`. Re-arming replaces the pending value.
    pub fn set_timeout(&self, timeout: Duration) {
        let inner = self.inner.borrow();
        if let Some(timer) = &inner.timer {
            timer.set_timeout(timeout);
        }
        drop(inner);
        self.inner.borrow_mut().arm_seq += 1;
    }

    /// Cancel a pending timeout. Idempotent.
    pub fn clear_timeout(&self) {
        let inner = self.inner.borrow();
        if let Some(timer) = &inner.timer {
            timer.set_enable(false);
        }
    }

    fn on_timer_expired(&self) {
        if self.inner.borrow().state.is_none() {
            return;
        }
        self.dispatch(|state, fsm| state.timeout_event(fsm));
    }
}
