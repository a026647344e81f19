use super::splitter::AudioSplitter;
use super::tone::{InputScaling, ToneDetector, ToneDetectorConfig};
use super::{AudioSink, AudioSource, SinkHandle, SourceLink};
use std::cell::RefCell;
use std::f32::consts::PI;
use std::rc::{Rc, Weak};

#[derive(Clone, Copy, PartialEq, Eq)]
enum AcceptMode {
    All,
    Half,
}

/// Downstream test double with a configurable acceptance policy and
/// manual or automatic flush acknowledgement.
struct RecordingSink {
    mode: AcceptMode,
    auto_ack_flush: bool,
    samples: Vec<f32>,
    flush_requests: usize,
    source: SourceLink,
}

impl RecordingSink {
    fn new(mode: AcceptMode, auto_ack_flush: bool) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self {
            mode,
            auto_ack_flush,
            samples: Vec::new(),
            flush_requests: 0,
            source: SourceLink::default(),
        }))
    }
}

impl AudioSink for RecordingSink {
    fn write_samples(&mut self, samples: &[f32]) -> usize {
        let take = match self.mode {
            AcceptMode::All => samples.len(),
            AcceptMode::Half => samples.len().div_ceil(2),
        };
        self.samples.extend_from_slice(&samples[..take]);
        take
    }

    fn flush_samples(&mut self) {
        self.flush_requests += 1;
        if self.auto_ack_flush {
            self.source.all_samples_flushed();
        }
    }

    fn register_source(&mut self, source: SourceLink) {
        self.source = source;
    }

    fn unregister_source(&mut self) {
        self.source = SourceLink::default();
    }
}

fn handle(sink: &Rc<RefCell<RecordingSink>>) -> SinkHandle {
    sink.clone()
}

fn resume(sink: &Rc<RefCell<RecordingSink>>) {
    let source = sink.borrow().source.clone();
    source.resume_output();
}

fn ack_flush(sink: &Rc<RefCell<RecordingSink>>) {
    let source = sink.borrow().source.clone();
    source.all_samples_flushed();
}

/// Upstream test double counting the sink-to-source signals.
#[derive(Default)]
struct UpstreamProbe {
    resumes: usize,
    flush_acks: usize,
}

impl AudioSource for UpstreamProbe {
    fn resume_output(&mut self) {
        self.resumes += 1;
    }

    fn all_samples_flushed(&mut self) {
        self.flush_acks += 1;
    }
}

fn splitter_with_probe() -> (AudioSplitter, Rc<RefCell<UpstreamProbe>>) {
    let mut splitter = AudioSplitter::new();
    let probe = Rc::new(RefCell::new(UpstreamProbe::default()));
    splitter.register_source(SourceLink::new(&probe));
    (splitter, probe)
}

fn ramp(len: usize, base: f32) -> Vec<f32> {
    (0..len).map(|i| base + i as f32).collect()
}

#[test]
fn two_branch_backpressure_reports_min_cursor() {
    let (mut splitter, probe) = splitter_with_probe();
    let b1 = RecordingSink::new(AcceptMode::All, true);
    let b2 = RecordingSink::new(AcceptMode::Half, true);
    splitter.add_sink(&handle(&b1));
    splitter.add_sink(&handle(&b2));

    let input = ramp(10, 0.0);
    let accepted = splitter.write_samples(&input);
    assert_eq!(accepted, 5, "only the slow branch's progress is reported");
    assert_eq!(b1.borrow().samples, input, "fast branch gets everything");
    assert_eq!(b2.borrow().samples, input[..5], "slow branch stops at its cursor");
    assert_eq!(probe.borrow().resumes, 0, "upstream stays stopped mid-drain");

    b2.borrow_mut().mode = AcceptMode::All;
    resume(&b2);
    assert_eq!(b2.borrow().samples, input, "resumed branch drains the backlog");
    assert_eq!(probe.borrow().resumes, 1, "upstream resumed exactly once");

    // The upstream re-presents the unaccepted tail; it was already
    // delivered everywhere, so it is swallowed without re-delivery.
    let accepted = splitter.write_samples(&input[5..]);
    assert_eq!(accepted, 5);
    assert_eq!(b1.borrow().samples, input);
    assert_eq!(b2.borrow().samples, input);
}

#[test]
fn slow_branch_sees_full_sequence_in_order() {
    let (mut splitter, probe) = splitter_with_probe();
    let slow = RecordingSink::new(AcceptMode::Half, true);
    splitter.add_sink(&handle(&slow));

    let input = ramp(16, 100.0);
    let mut offset = splitter.write_samples(&input);
    assert_eq!(offset, 8);
    // The branch drains its backlog in ever-smaller gulps; the upstream may
    // only write again once the splitter resumes it.
    while probe.borrow().resumes == 0 {
        resume(&slow);
    }
    offset += splitter.write_samples(&input[offset..]);
    assert_eq!(offset, input.len());
    assert_eq!(slow.borrow().samples, input);
    assert_eq!(probe.borrow().resumes, 1);
}

#[test]
fn freshly_attached_sink_never_sees_buffered_history() {
    let (mut splitter, _probe) = splitter_with_probe();
    let slow = RecordingSink::new(AcceptMode::Half, true);
    splitter.add_sink(&handle(&slow));

    let first = ramp(10, 0.0);
    splitter.write_samples(&first);
    let late = RecordingSink::new(AcceptMode::All, true);
    splitter.add_sink(&handle(&late));
    assert!(late.borrow().samples.is_empty());

    slow.borrow_mut().mode = AcceptMode::All;
    resume(&slow);
    splitter.write_samples(&first[5..]);
    assert_eq!(slow.borrow().samples, first);
    assert!(
        late.borrow().samples.is_empty(),
        "re-presented tail was already buffered before the sink attached"
    );

    let second = ramp(4, 50.0);
    splitter.write_samples(&second);
    assert_eq!(late.borrow().samples, second);
}

#[test]
fn flush_completes_only_after_every_enabled_branch_acks() {
    let (mut splitter, probe) = splitter_with_probe();
    let b1 = RecordingSink::new(AcceptMode::All, false);
    let b2 = RecordingSink::new(AcceptMode::All, false);
    splitter.add_sink(&handle(&b1));
    splitter.add_sink(&handle(&b2));

    splitter.flush_samples();
    assert_eq!(b1.borrow().flush_requests, 1);
    assert_eq!(b2.borrow().flush_requests, 1);
    assert_eq!(probe.borrow().flush_acks, 0);

    ack_flush(&b1);
    assert_eq!(probe.borrow().flush_acks, 0, "one branch is still draining");
    ack_flush(&b2);
    assert_eq!(probe.borrow().flush_acks, 1);
}

#[test]
fn removal_during_flush_completes_with_the_survivors() {
    let (mut splitter, probe) = splitter_with_probe();
    let b1 = RecordingSink::new(AcceptMode::All, false);
    let b2 = RecordingSink::new(AcceptMode::All, false);
    splitter.add_sink(&handle(&b1));
    splitter.add_sink(&handle(&b2));

    splitter.flush_samples();
    splitter.remove_sink(&handle(&b2));
    assert_eq!(probe.borrow().flush_acks, 0, "survivor has not acked yet");

    ack_flush(&b1);
    assert_eq!(probe.borrow().flush_acks, 1);
    assert!(
        !b2.borrow().source.is_connected(),
        "removed branch was detached from the splitter"
    );
}

#[test]
fn removing_last_branch_finishes_pending_flush() {
    let (mut splitter, probe) = splitter_with_probe();
    let b1 = RecordingSink::new(AcceptMode::All, false);
    splitter.add_sink(&handle(&b1));
    splitter.flush_samples();
    assert_eq!(probe.borrow().flush_acks, 0);

    splitter.remove_sink(&handle(&b1));
    assert_eq!(probe.borrow().flush_acks, 1);
}

#[test]
fn remove_all_sinks_detaches_everything_and_finishes_a_flush() {
    let (mut splitter, probe) = splitter_with_probe();
    let b1 = RecordingSink::new(AcceptMode::All, false);
    let b2 = RecordingSink::new(AcceptMode::All, false);
    splitter.add_sink(&handle(&b1));
    splitter.add_sink(&handle(&b2));
    splitter.flush_samples();

    splitter.remove_all_sinks();
    assert_eq!(probe.borrow().flush_acks, 1, "no branch left to wait for");
    assert!(!b1.borrow().source.is_connected());
    assert!(!b2.borrow().source.is_connected());

    let accepted = splitter.write_samples(&ramp(4, 0.0));
    assert_eq!(accepted, 4, "a splitter without branches swallows input");
    assert!(b1.borrow().samples.is_empty());
}

#[test]
fn flush_with_no_branches_acks_immediately() {
    let (mut splitter, probe) = splitter_with_probe();
    splitter.flush_samples();
    assert_eq!(probe.borrow().flush_acks, 1);
}

#[test]
fn sink_attached_mid_flush_must_ack_too() {
    let (mut splitter, probe) = splitter_with_probe();
    let b1 = RecordingSink::new(AcceptMode::All, false);
    splitter.add_sink(&handle(&b1));
    splitter.flush_samples();

    let b2 = RecordingSink::new(AcceptMode::All, false);
    splitter.add_sink(&handle(&b2));
    assert_eq!(b2.borrow().flush_requests, 1, "late sink joins the flush");

    ack_flush(&b1);
    assert_eq!(probe.borrow().flush_acks, 0);
    ack_flush(&b2);
    assert_eq!(probe.borrow().flush_acks, 1);
}

#[test]
fn disabled_branch_is_skipped_and_counts_as_caught_up() {
    let (mut splitter, probe) = splitter_with_probe();
    let b1 = RecordingSink::new(AcceptMode::All, true);
    let b2 = RecordingSink::new(AcceptMode::Half, true);
    splitter.add_sink(&handle(&b1));
    splitter.add_sink(&handle(&b2));
    splitter.enable_sink(&handle(&b2), false);

    let input = ramp(8, 0.0);
    let accepted = splitter.write_samples(&input);
    assert_eq!(accepted, 8, "disabled branch cannot hold input back");
    assert_eq!(b1.borrow().samples, input);
    assert!(b2.borrow().samples.is_empty());
    assert_eq!(probe.borrow().resumes, 0);
}

#[test]
fn disabling_the_stalled_branch_releases_backpressure() {
    let (mut splitter, probe) = splitter_with_probe();
    let b1 = RecordingSink::new(AcceptMode::All, true);
    let b2 = RecordingSink::new(AcceptMode::Half, true);
    splitter.add_sink(&handle(&b1));
    splitter.add_sink(&handle(&b2));

    let input = ramp(10, 0.0);
    assert_eq!(splitter.write_samples(&input), 5);

    splitter.enable_sink(&handle(&b2), false);
    assert_eq!(probe.borrow().resumes, 1, "drain completed by disabling");

    // Re-presented tail is swallowed; the re-enabled branch sees no replay.
    splitter.enable_sink(&handle(&b2), true);
    assert_eq!(splitter.write_samples(&input[5..]), 5);
    assert_eq!(b2.borrow().samples, input[..5]);
    assert_eq!(b1.borrow().samples, input);
}

#[test]
fn enabling_during_flush_resends_the_flush() {
    let (mut splitter, probe) = splitter_with_probe();
    let b1 = RecordingSink::new(AcceptMode::All, false);
    let b2 = RecordingSink::new(AcceptMode::All, false);
    splitter.add_sink(&handle(&b1));
    splitter.add_sink(&handle(&b2));
    splitter.enable_sink(&handle(&b2), false);

    splitter.flush_samples();
    assert_eq!(b2.borrow().flush_requests, 0);

    splitter.enable_sink(&handle(&b2), true);
    assert_eq!(b2.borrow().flush_requests, 1);
    ack_flush(&b1);
    ack_flush(&b2);
    assert_eq!(probe.borrow().flush_acks, 1);
}

/// Removes itself from the splitter while a write is being delivered to it.
struct SelfRemovingSink {
    splitter: AudioSplitter,
    me: Weak<RefCell<SelfRemovingSink>>,
    received: usize,
}

impl AudioSink for SelfRemovingSink {
    fn write_samples(&mut self, samples: &[f32]) -> usize {
        self.received += samples.len();
        if let Some(me) = self.me.upgrade() {
            let me: SinkHandle = me;
            self.splitter.remove_sink(&me);
        }
        samples.len()
    }

    fn flush_samples(&mut self) {}
}

#[test]
fn removal_from_inside_a_write_is_deferred_and_clean() {
    let (mut splitter, _probe) = splitter_with_probe();
    let keeper = RecordingSink::new(AcceptMode::All, true);
    splitter.add_sink(&handle(&keeper));
    let leaver = Rc::new_cyclic(|me| {
        RefCell::new(SelfRemovingSink {
            splitter: splitter.clone(),
            me: me.clone(),
            received: 0,
        })
    });
    let leaver_handle: SinkHandle = leaver.clone();
    splitter.add_sink(&leaver_handle);

    let first = ramp(6, 0.0);
    assert_eq!(splitter.write_samples(&first), 6);
    assert_eq!(leaver.borrow().received, 6);

    let second = ramp(4, 10.0);
    assert_eq!(splitter.write_samples(&second), 4);
    assert_eq!(leaver.borrow().received, 6, "removed branch gets nothing more");
    assert_eq!(keeper.borrow().samples.len(), 10);
}

#[test]
fn managed_sink_is_destroyed_when_branch_and_caller_let_go() {
    let splitter = AudioSplitter::new();
    let handle = splitter.add_managed_sink(ToneDetector::new(1750.0, 205));
    let weak = Rc::downgrade(&handle);
    splitter.remove_sink(&handle);
    drop(handle);
    assert!(weak.upgrade().is_none(), "splitter kept no hidden reference");
}

fn tone(freq: f32, amplitude: f32, len: usize) -> Vec<f32> {
    (0..len)
        .map(|i| amplitude * (2.0 * PI * freq * i as f32 / 8000.0).sin())
        .collect()
}

fn watched_detector(config: ToneDetectorConfig) -> (ToneDetector, Rc<RefCell<Vec<bool>>>, Rc<RefCell<Vec<f64>>>) {
    let detector = ToneDetector::with_config(config);
    let transitions = Rc::new(RefCell::new(Vec::new()));
    let values = Rc::new(RefCell::new(Vec::new()));
    let t = Rc::clone(&transitions);
    detector.activated.connect(move |on| t.borrow_mut().push(*on));
    let v = Rc::clone(&values);
    detector.value_changed.connect(move |r| v.borrow_mut().push(*r));
    (detector, transitions, values)
}

#[test]
fn reference_bin_constants_for_1000_hz() {
    let detector = ToneDetector::new(1000.0, 205);
    let (coeff, sine, cosine) = detector.constants();
    // omega is pi/4 exactly: the fractional bin keeps it on frequency.
    assert!((coeff - 2.0f64.sqrt()).abs() < 1e-9);
    assert!((sine - (0.5f64).sqrt()).abs() < 1e-9);
    assert!((cosine - (0.5f64).sqrt()).abs() < 1e-9);
    assert_eq!(detector.block_len(), 205);
}

#[test]
fn steady_tone_activates_once_and_stays_on() {
    let cfg = ToneDetectorConfig {
        tone_hz: 1000.0,
        block_len: 205,
        ..ToneDetectorConfig::default()
    };
    let threshold = cfg.threshold;
    let (mut detector, transitions, values) = watched_detector(cfg);
    let input = tone(1000.0, 0.5, 3 * 205);
    assert_eq!(detector.process_samples(&input), input.len());

    assert_eq!(*transitions.borrow(), vec![true], "one activation, no drop");
    let values = values.borrow();
    assert_eq!(values.len(), 3, "one value per block");
    for (i, &v) in values.iter().enumerate() {
        assert!(v >= threshold, "block {i} result {v} under threshold");
    }
    let spread = values.iter().cloned().fold(f64::MIN, f64::max)
        / values.iter().cloned().fold(f64::MAX, f64::min);
    assert!(spread < 2.0, "steady tone must yield similar magnitudes");
}

#[test]
fn silence_emits_values_but_never_activates() {
    let (mut detector, transitions, values) = watched_detector(ToneDetectorConfig {
        tone_hz: 1000.0,
        block_len: 205,
        ..ToneDetectorConfig::default()
    });
    let threshold = 5.0e6;
    detector.process_samples(&vec![0.0; 4 * 205]);
    assert!(transitions.borrow().is_empty());
    let values = values.borrow();
    assert_eq!(values.len(), 4);
    for &v in values.iter() {
        // The offset code leaves a small DC residue; it must stay far
        // below the detection threshold.
        assert!(v < threshold / 10.0, "silence residue {v} too large");
    }
}

#[test]
fn partial_block_emits_nothing() {
    let (mut detector, transitions, values) = watched_detector(ToneDetectorConfig::default());
    detector.process_samples(&tone(1750.0, 0.5, 100));
    assert!(transitions.borrow().is_empty());
    assert!(values.borrow().is_empty());
}

#[test]
fn release_hysteresis_survives_a_two_block_dropout() {
    let (mut detector, transitions, _values) = watched_detector(ToneDetectorConfig {
        tone_hz: 1000.0,
        block_len: 205,
        ..ToneDetectorConfig::default()
    });
    let high = tone(1000.0, 0.5, 205);
    let low = vec![0.0f32; 205];

    detector.process_samples(&high);
    assert!(detector.is_activated());
    assert_eq!(detector.release_remaining(), 3);

    detector.process_samples(&low);
    detector.process_samples(&low);
    assert_eq!(detector.release_remaining(), 1, "two low blocks counted down");
    assert!(detector.is_activated(), "dropout shorter than the hold survives");

    detector.process_samples(&high);
    assert_eq!(detector.release_remaining(), 3, "hold reloads on a good block");
    assert_eq!(*transitions.borrow(), vec![true], "no deactivation was reported");
}

#[test]
fn sustained_silence_deactivates_exactly_once() {
    let (mut detector, transitions, _values) = watched_detector(ToneDetectorConfig {
        tone_hz: 1000.0,
        block_len: 205,
        ..ToneDetectorConfig::default()
    });
    detector.process_samples(&tone(1000.0, 0.5, 205));
    detector.process_samples(&vec![0.0f32; 5 * 205]);
    assert_eq!(*transitions.borrow(), vec![true, false]);
    assert!(!detector.is_activated());
}

#[test]
fn pcm16_scaling_detects_with_scaled_threshold() {
    let (mut detector, transitions, _values) = watched_detector(ToneDetectorConfig {
        tone_hz: 1000.0,
        block_len: 205,
        threshold: 3.28e11,
        scaling: InputScaling::Pcm16,
    });
    detector.process_samples(&tone(1000.0, 0.5, 2 * 205));
    assert_eq!(*transitions.borrow(), vec![true]);
}

#[test]
fn detector_rides_a_splitter_branch() {
    let (mut splitter, probe) = splitter_with_probe();
    let detector = splitter.add_managed_sink(ToneDetector::new(1000.0, 205));

    let input = tone(1000.0, 0.5, 205);
    assert_eq!(splitter.write_samples(&input), input.len());

    splitter.flush_samples();
    assert_eq!(
        probe.borrow().flush_acks,
        1,
        "detector buffers nothing and acks the flush straight away"
    );
    drop(detector);
}
