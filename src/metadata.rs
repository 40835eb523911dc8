use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::calibration::CalibrationResult;
use crate::config::RunConfig;
use crate::device::NUM_CHANNELS;
use crate::trigger::ThresholdPlan;

/// Sentinel stored for a sensor that could not be read.
pub const TEMP_UNAVAILABLE: u32 = u32::MAX;

/// Everything a run is, minus the waveforms: configuration, calibration,
/// trigger plan and the board temperatures at both ends of the run.
///
/// Handed to the sinks exactly twice — once when the loop arms (start
/// temperatures filled in) and once after it stops (end temperatures added).
#[derive(Debug, Clone)]
pub struct RunMetadata {
    pub config: RunConfig,
    pub calibration: CalibrationResult,
    pub plan: ThresholdPlan,
    pub temp_start: Vec<Option<u32>>,
    pub temp_end: Vec<Option<u32>>,
    pub started: OffsetDateTime,
}

impl RunMetadata {
    pub fn new(
        config: RunConfig,
        calibration: CalibrationResult,
        plan: ThresholdPlan,
        temp_start: Vec<Option<u32>>,
    ) -> Self {
        Self {
            config,
            calibration,
            plan,
            temp_start,
            temp_end: vec![None; NUM_CHANNELS],
            started: OffsetDateTime::now_utc(),
        }
    }

    pub fn set_end_temperatures(&mut self, temps: Vec<Option<u32>>) {
        self.temp_end = temps;
    }

    pub fn started_rfc3339(&self) -> String {
        self.started
            .format(&Rfc3339)
            .unwrap_or_else(|_| self.started.unix_timestamp().to_string())
    }
}

/// Flatten sensor readings for persistence, substituting the sentinel.
pub fn temps_as_raw(temps: &[Option<u32>]) -> [u32; NUM_CHANNELS] {
    let mut raw = [TEMP_UNAVAILABLE; NUM_CHANNELS];
    for (slot, t) in raw.iter_mut().zip(temps) {
        if let Some(v) = t {
            *slot = *v;
        }
    }
    raw
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_temps_substitute_the_sentinel() {
        let raw = temps_as_raw(&[Some(40), None, Some(42)]);
        assert_eq!(raw[0], 40);
        assert_eq!(raw[1], TEMP_UNAVAILABLE);
        assert_eq!(raw[2], 42);
        assert_eq!(raw[7], TEMP_UNAVAILABLE);
    }
}
