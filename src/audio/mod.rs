//! The audio pipe: mono f32 sample frames flowing through a graph of
//! sources and sinks with explicit back-pressure.
//!
//! A sink reports how many leading samples of a frame it accepted; a short
//! count tells the source to stop until the sink signals `resume_output`
//! through its [`SourceLink`]. `flush_samples` travels downstream and is
//! answered by `all_samples_flushed` once the far end has drained. Sample
//! amplitude is nominally [-1.0, +1.0]; the pipe never clips.

mod splitter;
#[cfg(test)]
mod tests;
mod tone;

pub use splitter::AudioSplitter;
pub use tone::{InputScaling, ToneDetector, ToneDetectorConfig};

use std::cell::RefCell;
use std::rc::{Rc, Weak};

/// Shared handle to a pipe sink, as stored by upstream nodes.
pub type SinkHandle = Rc<RefCell<dyn AudioSink>>;

/// A consumer of sample frames.
///
/// `write_samples` must not call back into the source; the only upstream
/// signals are `resume_output` and `all_samples_flushed`, delivered through
/// the [`SourceLink`] handed over in `register_source`.
pub trait AudioSink {
    /// Accept up to `samples.len()` leading samples, returning the count
    /// actually taken. Returning less declares back-pressure: the source
    /// must not present more until `resume_output`.
    fn write_samples(&mut self, samples: &[f32]) -> usize;

    /// No more samples follow the ones already written. Answered with
    /// `all_samples_flushed` upstream once everything downstream drained.
    fn flush_samples(&mut self);

    /// Called when the sink is attached below a source.
    fn register_source(&mut self, source: SourceLink) {
        let _ = source;
    }

    /// Called when the sink is detached from its source.
    fn unregister_source(&mut self) {}
}

/// The upstream half of a pipe edge: receives the sink-to-source signals.
pub trait AudioSource {
    /// A previously back-pressured sink is ready for more samples.
    fn resume_output(&mut self);

    /// The flush issued earlier has fully propagated downstream.
    fn all_samples_flushed(&mut self);
}

/// Weak back-reference from a sink to its source.
///
/// Weak on purpose: a sink must never keep its upstream alive, and signals
/// arriving after the source is gone are silently dropped.
#[derive(Clone, Default)]
pub struct SourceLink {
    target: Option<Weak<RefCell<dyn AudioSource>>>,
}

impl SourceLink {
    pub fn new<S: AudioSource + 'static>(source: &Rc<RefCell<S>>) -> Self {
        let target: Rc<RefCell<dyn AudioSource>> = source.clone();
        Self {
            target: Some(Rc::downgrade(&target)),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.target
            .as_ref()
            .is_some_and(|t| t.upgrade().is_some())
    }

    pub fn resume_output(&self) {
        if let Some(source) = self.target.as_ref().and_then(Weak::upgrade) {
            source.borrow_mut().resume_output();
        }
    }

    pub fn all_samples_flushed(&self) {
        if let Some(source) = self.target.as_ref().and_then(Weak::upgrade) {
            source.borrow_mut().all_samples_flushed();
        }
    }
}
