//! Goertzel single-tone detector with hysteretic on/off reporting.
//!
//! Consumes the pipe's f32 frames in blocks of `block_len` samples at the
//! fixed 8 kHz detector rate, evaluates the Goertzel recurrence at the
//! configured frequency once per block, and reports through two signals:
//! `value_changed` with the squared magnitude every block, `activated` on
//! on/off transitions only.

use super::{AudioSink, SourceLink};
use crate::signal::Signal;

/// Fixed sample rate of the detector input.
pub const SAMPLING_RATE: f64 = 8000.0;

/// Blocks a tone must stay below threshold before deactivation is reported.
const ACTIVATION_HOLD_BLOCKS: u8 = 3;

/// How incoming samples are quantized before entering the recurrence.
///
/// The detector's internal view is 16-bit signed linear PCM offset to an
/// unsigned code. `LegacyU8` additionally narrows the code to 8 bits
/// (`(pcm + 0x8000) >> 8`), trading 8 bits of dynamic range for a small
/// accumulator; it is the historical behavior and the default. `Pcm16`
/// keeps the full 16-bit code; squared magnitudes grow by 256², so an
/// equivalent detection threshold scales from 5.0e6 to roughly 3.28e11.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputScaling {
    LegacyU8,
    Pcm16,
}

#[derive(Debug, Clone)]
pub struct ToneDetectorConfig {
    pub tone_hz: f32,
    pub block_len: usize,
    pub threshold: f64,
    pub scaling: InputScaling,
}

impl Default for ToneDetectorConfig {
    fn default() -> Self {
        Self {
            // 1750 Hz repeater tone-burst, detected over 205-sample blocks
            // (~26 ms at 8 kHz).
            tone_hz: 1750.0,
            block_len: 205,
            threshold: 5.0e6,
            scaling: InputScaling::LegacyU8,
        }
    }
}

pub struct ToneDetector {
    tone_hz: f32,
    block_len: usize,
    threshold: f64,
    scaling: InputScaling,
    coeff: f64,
    sine: f64,
    cosine: f64,
    q1: f64,
    q2: f64,
    block_pos: usize,
    /// Release counter: nonzero while activated, reloaded on every block
    /// at or above threshold, counted down by blocks below it.
    release: u8,
    last_result: f64,
    source: SourceLink,
    /// Fires true/false on activation transitions only.
    pub activated: Signal<bool>,
    /// Fires once per block with the squared magnitude.
    pub value_changed: Signal<f64>,
}

impl ToneDetector {
    pub fn new(tone_hz: f32, block_len: usize) -> Self {
        Self::with_config(ToneDetectorConfig {
            tone_hz,
            block_len,
            ..ToneDetectorConfig::default()
        })
    }

    pub fn with_config(config: ToneDetectorConfig) -> Self {
        let n = config.block_len as f64;
        // The bin index is deliberately not rounded to an integer: this
        // keeps omega exactly on the requested frequency at the cost of a
        // fractional number of cycles per block.
        let k = n * f64::from(config.tone_hz) / SAMPLING_RATE;
        let omega = 2.0 * std::f64::consts::PI * k / n;
        Self {
            tone_hz: config.tone_hz,
            block_len: config.block_len,
            threshold: config.threshold,
            scaling: config.scaling,
            coeff: 2.0 * omega.cos(),
            sine: omega.sin(),
            cosine: omega.cos(),
            q1: 0.0,
            q2: 0.0,
            block_pos: 0,
            release: 0,
            last_result: 0.0,
            source: SourceLink::default(),
            activated: Signal::new(),
            value_changed: Signal::new(),
        }
    }

    pub fn tone_hz(&self) -> f32 {
        self.tone_hz
    }

    pub fn block_len(&self) -> usize {
        self.block_len
    }

    pub fn is_activated(&self) -> bool {
        self.release > 0
    }

    /// Squared magnitude of the most recently completed block.
    pub fn last_result(&self) -> f64 {
        self.last_result
    }

    /// (coeff, sine, cosine) of the configured bin.
    pub fn constants(&self) -> (f64, f64, f64) {
        (self.coeff, self.sine, self.cosine)
    }

    pub(crate) fn release_remaining(&self) -> u8 {
        self.release
    }

    /// Run every sample through the recurrence, evaluating the block
    /// decision each time `block_len` samples have accumulated. Never
    /// short-writes and never blocks; returns `samples.len()`.
    pub fn process_samples(&mut self, samples: &[f32]) -> usize {
        for &sample in samples {
            let code = self.quantize(sample);
            let q0 = self.coeff * self.q1 - self.q2 + code;
            self.q2 = self.q1;
            self.q1 = q0;
            self.block_pos += 1;
            if self.block_pos >= self.block_len {
                self.finish_block();
            }
        }
        samples.len()
    }

    fn quantize(&self, sample: f32) -> f64 {
        let pcm = (f64::from(sample.clamp(-1.0, 1.0)) * 32767.0) as i32;
        match self.scaling {
            InputScaling::LegacyU8 => ((pcm + 0x8000) >> 8) as f64,
            InputScaling::Pcm16 => (pcm + 0x8000) as f64,
        }
    }

    fn finish_block(&mut self) {
        let result = self.q1 * self.q1 + self.q2 * self.q2 - self.q1 * self.q2 * self.coeff;
        self.last_result = result;
        self.value_changed.emit(&result);
        if result >= self.threshold {
            if self.release == 0 {
                self.activated.emit(&true);
            }
            self.release = ACTIVATION_HOLD_BLOCKS;
        } else if self.release > 0 {
            self.release -= 1;
            if self.release == 0 {
                self.activated.emit(&false);
            }
        }
        self.q1 = 0.0;
        self.q2 = 0.0;
        self.block_pos = 0;
    }
}

impl AudioSink for ToneDetector {
    fn write_samples(&mut self, samples: &[f32]) -> usize {
        self.process_samples(samples)
    }

    fn flush_samples(&mut self) {
        // Nothing is buffered across calls beyond the running block, so the
        // flush completes immediately.
        self.source.all_samples_flushed();
    }

    fn register_source(&mut self, source: SourceLink) {
        self.source = source;
    }

    fn unregister_source(&mut self) {
        self.source = SourceLink::default();
    }
}
