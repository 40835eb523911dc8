//! Pedestal estimation.
//!
//! A single forced-trigger burst with all hardware triggering disabled, the
//! first decoded event averaged over a bounded number of leading samples.
//! A burst that yields nothing falls back to midscale with a warning; the
//! run proceeds either way.

use log::{debug, warn};
use std::thread;
use std::time::Duration;

use crate::device::{DeviceError, Digitizer, TriggerIoMode};
use crate::session::DeviceSession;

/// Upper bound on samples averaged, independent of record length.
pub const PEDESTAL_SAMPLE_CAP: usize = 200;

/// Fallback when the calibration burst produces no usable samples.
pub const MIDSCALE_PEDESTAL: u32 = 0x8000;

const TRIGGER_SETTLE: Duration = Duration::from_millis(2);

#[derive(Debug, Clone, Copy)]
pub struct CalibrationResult {
    pub channel: u8,
    /// Estimated resting baseline in ADC counts.
    pub pedestal: u32,
    /// Samples that went into the average; 0 when the fallback was used.
    pub samples_used: usize,
}

impl CalibrationResult {
    fn fallback(channel: u8) -> Self {
        Self {
            channel,
            pedestal: MIDSCALE_PEDESTAL,
            samples_used: 0,
        }
    }
}

/// Run the forced-acquisition burst and reduce it to a baseline estimate.
///
/// Driver failures are fatal like any other configuration call; an empty
/// burst is not.
pub fn measure_pedestal<D: Digitizer>(
    session: &mut DeviceSession<D>,
    channel: u8,
) -> Result<CalibrationResult, DeviceError> {
    session.set_self_trigger(TriggerIoMode::Disabled, 0xff)?;
    session.set_external_trigger(TriggerIoMode::Disabled)?;
    session.set_software_trigger(TriggerIoMode::AcqOnly)?;

    session.start_acquisition()?;
    session.send_sw_trigger()?;
    thread::sleep(TRIGGER_SETTLE);
    let buffer = session.read_data()?;
    session.stop_acquisition()?;

    let n_events = session.num_events(&buffer)?;
    if buffer.is_empty() || n_events == 0 {
        warn!("pedestal: no data from forced trigger, using midscale");
        return Ok(CalibrationResult::fallback(channel));
    }

    let event = session.decode_event(&buffer, 0)?;
    let samples = event.samples(channel as usize);
    if samples.is_empty() {
        warn!("pedestal: channel {channel} empty, using midscale");
        return Ok(CalibrationResult::fallback(channel));
    }

    let n = samples.len().min(PEDESTAL_SAMPLE_CAP);
    let sum: u64 = samples[..n].iter().map(|&s| s as u64).sum();
    let pedestal = (sum / n as u64) as u32;
    debug!("pedestal(ch{channel})={pedestal} over {n} samples");
    Ok(CalibrationResult {
        channel,
        pedestal,
        samples_used: n,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimDigitizer;

    fn session_for(device: SimDigitizer) -> DeviceSession<SimDigitizer> {
        DeviceSession::from_device(device).unwrap()
    }

    #[test]
    fn pedestal_matches_a_flat_baseline() {
        let device = SimDigitizer::open(0).unwrap().with_baseline(33000);
        let mut session = session_for(device);
        let cal = measure_pedestal(&mut session, 0).unwrap();
        assert_eq!(cal.pedestal, 33000);
        assert_eq!(cal.samples_used, PEDESTAL_SAMPLE_CAP);
    }

    #[test]
    fn sample_average_is_capped() {
        let device = SimDigitizer::open(0).unwrap();
        let mut session = session_for(device);
        session.configure(
            &crate::config::RunConfig::new(
                1,
                crate::trigger::TriggerMode::Software,
                0,
                0,
                100_000,
                50,
                0,
                None,
                Default::default(),
            )
            .unwrap(),
            &crate::config::BoardConf {
                dc_offset: 0x3333,
                pulse_polarity: "negative".into(),
                trigger_edge: "falling".into(),
                max_events_blt: 1023,
            }
            .resolve()
            .unwrap(),
        )
        .unwrap();

        let cal = measure_pedestal(&mut session, 0).unwrap();
        assert_eq!(cal.samples_used, PEDESTAL_SAMPLE_CAP);
    }

    #[test]
    fn silent_burst_falls_back_to_midscale() {
        let device = SimDigitizer::open(0).unwrap().muted();
        let mut session = session_for(device);
        let cal = measure_pedestal(&mut session, 0).unwrap();
        assert_eq!(cal.pedestal, MIDSCALE_PEDESTAL);
        assert_eq!(cal.samples_used, 0);
    }

    #[test]
    fn empty_channel_falls_back_to_midscale() {
        let device = SimDigitizer::open(0).unwrap().with_blank_leading(1);
        let mut session = session_for(device);
        let cal = measure_pedestal(&mut session, 0).unwrap();
        assert_eq!(cal.pedestal, MIDSCALE_PEDESTAL);
    }
}
