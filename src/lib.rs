//! Event-driven core for amateur-radio voice services.
//!
//! Everything runs on one cooperative reactor thread: audio flows through a
//! back-pressured pipe of sources and sinks, tone decisions come from a
//! Goertzel detector sitting at the end of a pipe branch, and link behavior
//! is modeled with hierarchical state machines driven by reactor timers.

pub mod audio;
pub mod fsm;
pub mod pty;
pub mod reactor;
pub mod signal;

pub use audio::{AudioSink, AudioSource, AudioSplitter, SinkHandle, SourceLink, ToneDetector};
pub use reactor::Reactor;
pub use signal::Signal;
