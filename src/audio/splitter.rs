//! One-to-many fan-out for the audio pipe.
//!
//! The splitter feeds every enabled branch the same sample sequence while
//! absorbing per-branch back-pressure, so one slow sink never blocks its
//! siblings. Samples a fast branch has already consumed stay buffered until
//! the slowest branch catches up; only then is the upstream resumed.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use super::{AudioSink, AudioSource, SinkHandle, SourceLink};

struct Branch {
    id: u64,
    sink: SinkHandle,
    enabled: bool,
    /// Short-wrote; no more deliveries until its `resume_output`.
    stalled: bool,
    /// Acked the flush currently in progress.
    flushed: bool,
    /// `flush_samples` has been forwarded for the flush in progress.
    flush_sent: bool,
    remove_pending: bool,
    /// Write position into the shared buffer.
    cursor: usize,
    /// Keeps the sink's upstream link alive for the branch lifetime.
    _source: Rc<RefCell<BranchSource>>,
}

struct Ctl {
    branches: Vec<Branch>,
    next_branch_id: u64,
    do_flush: bool,
    input_stopped: bool,
    /// Samples delivered to every enabled branch but reported unaccepted;
    /// the upstream re-presents them after `resume_output` and they are
    /// consumed without being buffered or delivered again.
    resend_credit: usize,
    upstream: SourceLink,
}

impl Ctl {
    fn branch_mut(&mut self, id: u64) -> Option<&mut Branch> {
        self.branches.iter_mut().find(|b| b.id == id)
    }
}

struct SplitterCore {
    ctl: RefCell<Ctl>,
    buf: RefCell<Vec<f32>>,
    /// Nesting depth of delivery passes; fixups run when it returns to 0.
    depth: Cell<u32>,
}

/// The upstream half seen by one branch sink: routes `resume_output` and
/// `all_samples_flushed` back to the owning splitter.
struct BranchSource {
    core: Weak<SplitterCore>,
    branch_id: u64,
}

impl AudioSource for BranchSource {
    fn resume_output(&mut self) {
        let Some(core) = self.core.upgrade() else { return };
        {
            let mut ctl = core.ctl.borrow_mut();
            match ctl.branch_mut(self.branch_id) {
                Some(branch) => branch.stalled = false,
                None => return,
            }
        }
        drive(&core);
    }

    fn all_samples_flushed(&mut self) {
        let Some(core) = self.core.upgrade() else { return };
        {
            let mut ctl = core.ctl.borrow_mut();
            if !ctl.do_flush {
                return;
            }
            match ctl.branch_mut(self.branch_id) {
                Some(branch) if branch.flush_sent => branch.flushed = true,
                _ => return,
            }
        }
        settle(&core);
    }
}

/// Splits one upstream audio stream into any number of downstream streams.
///
/// Cheaply cloneable handle; clones share the same splitter.
#[derive(Clone)]
pub struct AudioSplitter {
    core: Rc<SplitterCore>,
}

impl AudioSplitter {
    pub fn new() -> Self {
        Self {
            core: Rc::new(SplitterCore {
                ctl: RefCell::new(Ctl {
                    branches: Vec::new(),
                    next_branch_id: 1,
                    do_flush: false,
                    input_stopped: false,
                    resend_credit: 0,
                    upstream: SourceLink::default(),
                }),
                buf: RefCell::new(Vec::new()),
                depth: Cell::new(0),
            }),
        }
    }

    /// Attach a sink the caller keeps an owning handle to. The branch
    /// starts enabled; already-buffered samples are not replayed to it.
    pub fn add_sink(&self, sink: &SinkHandle) {
        self.attach(Rc::clone(sink));
    }

    /// Attach a sink whose ownership transfers to the splitter. The
    /// returned handle serves as identity for `remove_sink`/`enable_sink`;
    /// once the branch is removed the splitter drops its reference.
    pub fn add_managed_sink(&self, sink: impl AudioSink + 'static) -> SinkHandle {
        let handle: SinkHandle = Rc::new(RefCell::new(sink));
        self.attach(Rc::clone(&handle));
        handle
    }

    fn attach(&self, sink: SinkHandle) {
        let source = {
            let mut ctl = self.core.ctl.borrow_mut();
            let id = ctl.next_branch_id;
            ctl.next_branch_id += 1;
            let source = Rc::new(RefCell::new(BranchSource {
                core: Rc::downgrade(&self.core),
                branch_id: id,
            }));
            ctl.branches.push(Branch {
                id,
                sink: Rc::clone(&sink),
                enabled: true,
                stalled: false,
                flushed: false,
                flush_sent: false,
                remove_pending: false,
                cursor: self.core.buf.borrow().len(),
                _source: Rc::clone(&source),
            });
            source
        };
        sink.borrow_mut().register_source(SourceLink::new(&source));
        settle(&self.core);
    }

    /// Detach a sink. Removal is immediate when the graph is idle and
    /// deferred to the end of the current delivery pass otherwise.
    /// Removing a sink that was never added is a programming error.
    pub fn remove_sink(&self, sink: &SinkHandle) {
        let found = {
            let mut ctl = self.core.ctl.borrow_mut();
            match ctl.branches.iter_mut().find(|b| Rc::ptr_eq(&b.sink, sink)) {
                Some(branch) => {
                    branch.remove_pending = true;
                    true
                }
                None => false,
            }
        };
        debug_assert!(found, "remove_sink: sink is not attached");
        settle(&self.core);
    }

    pub fn remove_all_sinks(&self) {
        {
            let mut ctl = self.core.ctl.borrow_mut();
            for branch in &mut ctl.branches {
                branch.remove_pending = true;
            }
        }
        settle(&self.core);
    }

    /// Toggle a branch. A disabled branch counts as fully caught up; on
    /// re-enable its cursor jumps to the end of the buffer so history is
    /// never replayed, and a pending flush is forwarded to it anew.
    pub fn enable_sink(&self, sink: &SinkHandle, enable: bool) {
        let found = {
            let mut ctl = self.core.ctl.borrow_mut();
            let buf_len = self.core.buf.borrow().len();
            match ctl.branches.iter_mut().find(|b| Rc::ptr_eq(&b.sink, sink)) {
                Some(branch) => {
                    if enable && !branch.enabled {
                        branch.enabled = true;
                        branch.cursor = buf_len;
                        branch.stalled = false;
                        branch.flushed = false;
                        branch.flush_sent = false;
                    } else if !enable {
                        branch.enabled = false;
                    }
                    true
                }
                None => false,
            }
        };
        debug_assert!(found, "enable_sink: sink is not attached");
        settle(&self.core);
    }
}

impl Default for AudioSplitter {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioSink for AudioSplitter {
    fn write_samples(&mut self, samples: &[f32]) -> usize {
        let core = Rc::clone(&self.core);
        if samples.is_empty() {
            return 0;
        }
        let (skip, stopped) = {
            let mut ctl = core.ctl.borrow_mut();
            if ctl.do_flush {
                debug_assert!(false, "write_samples while a flush is outstanding");
                ctl.do_flush = false;
                for branch in &mut ctl.branches {
                    branch.flushed = false;
                    branch.flush_sent = false;
                }
            }
            if ctl.input_stopped {
                debug_assert!(false, "write_samples while back-pressured");
                (0, true)
            } else {
                let skip = ctl.resend_credit.min(samples.len());
                ctl.resend_credit -= skip;
                (skip, false)
            }
        };
        if stopped {
            return 0;
        }
        let fresh = &samples[skip..];
        if fresh.is_empty() {
            return skip;
        }
        {
            let mut buf = core.buf.borrow_mut();
            debug_assert!(buf.is_empty(), "buffer must be drained before new input");
            buf.extend_from_slice(fresh);
        }
        drive(&core);
        let mut ctl = core.ctl.borrow_mut();
        if !ctl.input_stopped {
            skip + fresh.len()
        } else {
            let buf_len = core.buf.borrow().len();
            let min_cursor = ctl
                .branches
                .iter()
                .filter(|b| b.enabled && !b.remove_pending)
                .map(|b| b.cursor)
                .min()
                .unwrap_or(buf_len);
            let absorbed = min_cursor.min(fresh.len());
            ctl.resend_credit += fresh.len() - absorbed;
            skip + absorbed
        }
    }

    fn flush_samples(&mut self) {
        let core = Rc::clone(&self.core);
        {
            let mut ctl = core.ctl.borrow_mut();
            if ctl.do_flush {
                return;
            }
            ctl.do_flush = true;
            for branch in &mut ctl.branches {
                branch.flushed = false;
                branch.flush_sent = false;
            }
        }
        settle(&core);
    }

    fn register_source(&mut self, source: SourceLink) {
        self.core.ctl.borrow_mut().upstream = source;
    }

    fn unregister_source(&mut self) {
        self.core.ctl.borrow_mut().upstream = SourceLink::default();
    }
}

/// Deliver buffered samples to every branch that can still make progress.
///
/// Control borrows are released around each downstream call, so a sink may
/// legally re-enter the splitter through its branch link (resume, flush
/// ack) or the public surface (add/remove/enable) while being written to.
fn drive(core: &Rc<SplitterCore>) {
    core.depth.set(core.depth.get() + 1);
    loop {
        let job = {
            let ctl = core.ctl.borrow();
            let buf_len = core.buf.borrow().len();
            ctl.branches
                .iter()
                .find(|b| {
                    b.enabled && !b.stalled && !b.remove_pending && b.cursor < buf_len
                })
                .map(|b| (b.id, Rc::clone(&b.sink), b.cursor))
        };
        let Some((id, sink, cursor)) = job else { break };
        let (offered, accepted) = {
            let buf = core.buf.borrow();
            let chunk = &buf[cursor..];
            let accepted = sink.borrow_mut().write_samples(chunk);
            (chunk.len(), accepted)
        };
        debug_assert!(accepted <= offered, "sink accepted more than offered");
        let accepted = accepted.min(offered);
        let mut ctl = core.ctl.borrow_mut();
        if let Some(branch) = ctl.branch_mut(id) {
            branch.cursor += accepted;
            if accepted < offered {
                branch.stalled = true;
            }
        }
    }
    core.depth.set(core.depth.get() - 1);
    if core.depth.get() == 0 {
        settle(core);
    }
}

enum Fixup {
    Unregister(SinkHandle),
    Resume(SourceLink),
    FlushBranch(SinkHandle),
    FlushDone(SourceLink),
}

/// Post-iteration fixups: branch removal, buffer compaction, upstream
/// resume, and flush propagation/completion. Runs only at the outermost
/// entry point; each pass decides one external call and performs it with no
/// internal borrows held, so downstream reactions re-enter cleanly.
fn settle(core: &Rc<SplitterCore>) {
    if core.depth.get() > 0 {
        return;
    }
    loop {
        let fixup = {
            let mut ctl = core.ctl.borrow_mut();
            if let Some(pos) = ctl.branches.iter().position(|b| b.remove_pending) {
                let branch = ctl.branches.remove(pos);
                Some(Fixup::Unregister(branch.sink))
            } else {
                let buf_len = core.buf.borrow().len();
                let mut draining = false;
                if buf_len > 0 {
                    if ctl.branches.iter().any(|b| b.enabled && b.cursor < buf_len) {
                        ctl.input_stopped = true;
                        draining = true;
                    } else {
                        core.buf.borrow_mut().clear();
                        for branch in &mut ctl.branches {
                            branch.cursor = 0;
                        }
                    }
                }
                if draining {
                    None
                } else if ctl.input_stopped {
                    ctl.input_stopped = false;
                    Some(Fixup::Resume(ctl.upstream.clone()))
                } else if ctl.do_flush {
                    if let Some(branch) = ctl
                        .branches
                        .iter_mut()
                        .find(|b| b.enabled && !b.flush_sent)
                    {
                        branch.flush_sent = true;
                        Some(Fixup::FlushBranch(Rc::clone(&branch.sink)))
                    } else if ctl.branches.iter().all(|b| !b.enabled || b.flushed) {
                        ctl.do_flush = false;
                        for branch in &mut ctl.branches {
                            branch.flushed = false;
                            branch.flush_sent = false;
                        }
                        Some(Fixup::FlushDone(ctl.upstream.clone()))
                    } else {
                        None
                    }
                } else {
                    None
                }
            }
        };
        match fixup {
            None => break,
            Some(Fixup::Unregister(sink)) => sink.borrow_mut().unregister_source(),
            Some(Fixup::Resume(upstream)) => upstream.resume_output(),
            Some(Fixup::FlushBranch(sink)) => sink.borrow_mut().flush_samples(),
            Some(Fixup::FlushDone(upstream)) => upstream.all_samples_flushed(),
        }
    }
}
