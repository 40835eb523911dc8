//! Steady-state polling loop.
//!
//! Owns the only active thread of execution for the run: device polling,
//! decode and sink dispatch all happen in-line. The caller provides a
//! cancellation flag that is read once per iteration and never written here.

use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::RunConfig;
use crate::device::{DeviceError, Digitizer};
use crate::metadata::RunMetadata;
use crate::session::DeviceSession;
use crate::sink::Dispatcher;
use crate::trigger::TriggerMode;
use crate::utils::Counter;

/// At most one "waiting for triggers" notice per this interval.
pub const QUIET_LOG_INTERVAL: Duration = Duration::from_secs(5);
/// Pause between empty polls.
const EMPTY_POLL_BACKOFF: Duration = Duration::from_millis(1);
/// Wait after a forced trigger before polling.
const SW_TRIGGER_SETTLE: Duration = Duration::from_millis(2);
/// Wait between clearing stale data and starting acquisition.
const START_SETTLE: Duration = Duration::from_millis(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Armed,
    Running,
    Draining,
    Stopped,
}

#[derive(Debug, Clone, Copy)]
pub struct RunStats {
    /// Events dispatched to the sinks.
    pub acquired: u32,
    /// Decoded events, including ones empty on the target channel.
    pub tried: u32,
    pub cancelled: bool,
}

fn advance(state: &mut RunState, to: RunState) {
    debug!("run state {:?} -> {:?}", *state, to);
    *state = to;
}

/// Drive the run to completion: poll, decode, dispatch, until `num_events`
/// are acquired or `cancel` is raised.
///
/// Empty buffers and per-cycle decode failures are quiet-interval conditions,
/// not errors; only driver failures on the start/stop path abort.
pub fn run<D: Digitizer>(
    session: &mut DeviceSession<D>,
    config: &RunConfig,
    meta: &mut RunMetadata,
    dispatcher: &mut Dispatcher,
    cancel: &AtomicBool,
) -> Result<RunStats, DeviceError> {
    let mut state = RunState::Idle;

    session.clear_data()?;
    thread::sleep(START_SETTLE);
    advance(&mut state, RunState::Armed);

    session.start_acquisition()?;
    dispatcher.on_run_start(meta);
    advance(&mut state, RunState::Running);

    let mut counter = Counter::new();
    let mut acquired: u32 = 0;
    let mut tried: u32 = 0;
    let mut cancelled = false;
    let mut last_note = Instant::now();
    let mut last_status = Instant::now();

    while acquired < config.num_events {
        // sole cancellation point; in-flight device calls are never cut short
        if cancel.load(Ordering::Relaxed) {
            info!("cancellation requested, stopping after {acquired} events");
            cancelled = true;
            break;
        }

        if config.trigger == TriggerMode::Software {
            session.send_sw_trigger()?;
            thread::sleep(SW_TRIGGER_SETTLE);
        }

        let buffer = match session.read_data() {
            Ok(b) => b,
            Err(e) => {
                if last_note.elapsed() > QUIET_LOG_INTERVAL {
                    warn!("readout failed ({e}); retrying");
                    last_note = Instant::now();
                }
                thread::sleep(EMPTY_POLL_BACKOFF);
                continue;
            }
        };
        if buffer.is_empty() {
            if last_note.elapsed() > QUIET_LOG_INTERVAL {
                info!("no data yet (waiting for triggers)...");
                last_note = Instant::now();
            }
            thread::sleep(EMPTY_POLL_BACKOFF);
            continue;
        }

        let n_events = match session.num_events(&buffer) {
            Ok(n) => n,
            Err(e) => {
                warn!("bad readout buffer ({e}); dropping this block");
                thread::sleep(EMPTY_POLL_BACKOFF);
                continue;
            }
        };

        for i in 0..n_events {
            if acquired >= config.num_events {
                break;
            }
            let mut event = match session.decode_event(&buffer, i) {
                Ok(ev) => ev,
                Err(e) => {
                    warn!("decode failed for event {i} ({e}); skipping rest of block");
                    break;
                }
            };
            tried += 1;
            if !event.has_samples(config.channel as usize) {
                debug!("event {} empty on channel {}, not counted", tried, config.channel);
                continue;
            }
            event.seq = acquired;
            debug!(
                "evt #{} size={} mask={:#010x} cnt={} ttag={}",
                event.seq,
                event.sample_bytes(),
                event.channel_mask,
                event.event_counter,
                event.trigger_time_tag
            );
            dispatcher.on_event(&event);
            counter.increment(event.sample_bytes());
            acquired += 1;

            if last_status.elapsed() > QUIET_LOG_INTERVAL {
                info!(
                    "acquired {acquired}/{} events ({:.1} ev/s, {:.2} MB/s)",
                    config.num_events,
                    counter.event_rate(),
                    counter.rate()
                );
                last_status = Instant::now();
            }
        }
    }

    advance(&mut state, RunState::Draining);
    session.stop_acquisition()?;
    meta.set_end_temperatures(session.read_temperatures());

    advance(&mut state, RunState::Stopped);
    dispatcher.on_run_end(meta);

    info!(
        "run finished: {acquired} acquired, {tried} decoded, {} sink failures, {:.2} MB/s average",
        dispatcher.failures(),
        counter.average_rate()
    );

    Ok(RunStats {
        acquired,
        tried,
        cancelled,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::measure_pedestal;
    use crate::config::{RunConfig, SinkConfig};
    use crate::event::WaveformEvent;
    use crate::sim::SimDigitizer;
    use crate::sink::EventSink;
    use crate::trigger;
    use anyhow::anyhow;
    use std::sync::atomic::AtomicU32;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Captured {
        seqs: Vec<u32>,
        sample_lens: Vec<usize>,
        run_starts: u32,
        run_ends: u32,
        start_channel: Option<u8>,
        end_record_len: Option<u32>,
    }

    struct RecordingSink {
        channel: usize,
        captured: Arc<Mutex<Captured>>,
    }

    impl EventSink for RecordingSink {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn on_run_start(&mut self, meta: &RunMetadata) -> anyhow::Result<()> {
            let mut c = self.captured.lock().unwrap();
            c.run_starts += 1;
            c.start_channel = Some(meta.config.channel);
            Ok(())
        }

        fn on_event(&mut self, event: &WaveformEvent) -> anyhow::Result<()> {
            let mut c = self.captured.lock().unwrap();
            c.seqs.push(event.seq);
            c.sample_lens.push(event.samples(self.channel).len());
            Ok(())
        }

        fn on_run_end(&mut self, meta: &RunMetadata) -> anyhow::Result<()> {
            let mut c = self.captured.lock().unwrap();
            c.run_ends += 1;
            c.end_record_len = Some(meta.config.record_len);
            Ok(())
        }
    }

    struct FailingSink;

    impl EventSink for FailingSink {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn on_event(&mut self, _event: &WaveformEvent) -> anyhow::Result<()> {
            Err(anyhow!("unwritable path"))
        }
    }

    fn run_config(num_events: u32, mode: TriggerMode, channel: u8) -> RunConfig {
        RunConfig::new(
            num_events,
            mode,
            0,
            channel,
            1024,
            50,
            120,
            None,
            SinkConfig::default(),
        )
        .unwrap()
    }

    fn board() -> crate::config::BoardParams {
        crate::config::BoardConf {
            dc_offset: 0x3333,
            pulse_polarity: "negative".into(),
            trigger_edge: "falling".into(),
            max_events_blt: 1023,
        }
        .resolve()
        .unwrap()
    }

    fn prepared_run(
        device: SimDigitizer,
        config: &RunConfig,
    ) -> (DeviceSession<SimDigitizer>, RunMetadata) {
        let mut session = DeviceSession::from_device(device).unwrap();
        session.configure(config, &board()).unwrap();
        let cal = measure_pedestal(&mut session, config.channel).unwrap();
        let plan = trigger::plan(config.trigger, config.channel, cal.pedestal, config.delta);
        trigger::configure(&mut session, config.trigger, &plan).unwrap();
        let temps = session.read_temperatures();
        let meta = RunMetadata::new(config.clone(), cal, plan, temps);
        (session, meta)
    }

    #[test]
    fn software_run_acquires_exactly_the_target() {
        let config = run_config(5, TriggerMode::Software, 0);
        let (mut session, mut meta) = prepared_run(SimDigitizer::open(0).unwrap(), &config);

        let captured = Arc::new(Mutex::new(Captured::default()));
        let mut dispatcher = Dispatcher::new();
        dispatcher.register(Box::new(RecordingSink {
            channel: 0,
            captured: Arc::clone(&captured),
        }));

        let cancel = AtomicBool::new(false);
        let stats = run(&mut session, &config, &mut meta, &mut dispatcher, &cancel).unwrap();

        assert_eq!(stats.acquired, 5);
        assert!(!stats.cancelled);

        let c = captured.lock().unwrap();
        assert_eq!(c.seqs, vec![0, 1, 2, 3, 4]);
        assert!(c.sample_lens.iter().all(|&n| n == 1024));
        assert_eq!(c.run_starts, 1);
        assert_eq!(c.run_ends, 1);
        assert_eq!(c.start_channel, Some(0));
        assert_eq!(c.end_record_len, Some(1024));
        assert!(meta.temp_end.iter().any(Option::is_some));
    }

    #[test]
    fn self_mode_run_arms_the_pair_and_reaches_target() {
        let config = run_config(3, TriggerMode::SelfThreshold, 3);
        let device = SimDigitizer::open(0).unwrap().with_baseline(33000);
        let (mut session, mut meta) = prepared_run(device, &config);

        assert_eq!(meta.calibration.pedestal, 33000);
        assert_eq!(meta.plan.threshold, 32880);
        assert_eq!(meta.plan.armed_mask, 0b0000_1100);

        let mut dispatcher = Dispatcher::new();
        let cancel = AtomicBool::new(false);
        let stats = run(&mut session, &config, &mut meta, &mut dispatcher, &cancel).unwrap();
        assert_eq!(stats.acquired, 3);
    }

    #[test]
    fn empty_channel_events_count_as_tried_only() {
        let config = run_config(3, TriggerMode::Software, 0);
        // the calibration burst consumes the first blank event; the run then
        // sees two more before real data starts flowing
        let device = SimDigitizer::open(0).unwrap().with_blank_leading(3);
        let (mut session, mut meta) = prepared_run(device, &config);

        let mut dispatcher = Dispatcher::new();
        let cancel = AtomicBool::new(false);
        let stats = run(&mut session, &config, &mut meta, &mut dispatcher, &cancel).unwrap();

        assert_eq!(stats.acquired, 3);
        assert_eq!(stats.tried, 5);
    }

    #[test]
    fn pre_raised_cancel_stops_before_any_event() {
        let config = run_config(100, TriggerMode::Software, 0);
        let (mut session, mut meta) = prepared_run(SimDigitizer::open(0).unwrap(), &config);

        let captured = Arc::new(Mutex::new(Captured::default()));
        let mut dispatcher = Dispatcher::new();
        dispatcher.register(Box::new(RecordingSink {
            channel: 0,
            captured: Arc::clone(&captured),
        }));

        let cancel = AtomicBool::new(true);
        let stats = run(&mut session, &config, &mut meta, &mut dispatcher, &cancel).unwrap();

        assert_eq!(stats.acquired, 0);
        assert!(stats.cancelled);
        // metadata still delivered on both edges
        let c = captured.lock().unwrap();
        assert_eq!(c.run_starts, 1);
        assert_eq!(c.run_ends, 1);
    }

    #[test]
    fn failing_sink_does_not_reduce_the_acquired_count() {
        let config = run_config(4, TriggerMode::Software, 0);
        let (mut session, mut meta) = prepared_run(SimDigitizer::open(0).unwrap(), &config);

        let captured = Arc::new(Mutex::new(Captured::default()));
        let mut dispatcher = Dispatcher::new();
        dispatcher.register(Box::new(FailingSink));
        dispatcher.register(Box::new(RecordingSink {
            channel: 0,
            captured: Arc::clone(&captured),
        }));

        let cancel = AtomicBool::new(false);
        let stats = run(&mut session, &config, &mut meta, &mut dispatcher, &cancel).unwrap();

        assert_eq!(stats.acquired, 4);
        assert_eq!(dispatcher.failures(), 1);
        assert_eq!(captured.lock().unwrap().seqs, vec![0, 1, 2, 3]);
    }

    #[test]
    fn cancel_mid_run_is_seen_at_the_next_iteration() {
        let config = run_config(1_000_000, TriggerMode::Software, 0);
        let (mut session, mut meta) = prepared_run(SimDigitizer::open(0).unwrap(), &config);

        let cancel = Arc::new(AtomicBool::new(false));
        let seen = Arc::new(AtomicU32::new(0));

        struct CancelAfter {
            cancel: Arc<AtomicBool>,
            seen: Arc<AtomicU32>,
            after: u32,
        }
        impl EventSink for CancelAfter {
            fn name(&self) -> &'static str {
                "cancel-after"
            }
            fn on_event(&mut self, _event: &WaveformEvent) -> anyhow::Result<()> {
                if self.seen.fetch_add(1, Ordering::Relaxed) + 1 >= self.after {
                    self.cancel.store(true, Ordering::Relaxed);
                }
                Ok(())
            }
        }

        let mut dispatcher = Dispatcher::new();
        dispatcher.register(Box::new(CancelAfter {
            cancel: Arc::clone(&cancel),
            seen: Arc::clone(&seen),
            after: 3,
        }));

        let stats = run(&mut session, &config, &mut meta, &mut dispatcher, &cancel).unwrap();
        assert!(stats.cancelled);
        assert_eq!(stats.acquired, 3);
    }
}
