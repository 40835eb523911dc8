//! Software-simulated digitizer backend.
//!
//! Stands in for the vendor driver behind the [`Digitizer`] trait: register
//! writes are latched into plain fields, software triggers queue synthetic
//! events, and self/external triggering produces one event per poll while
//! armed. Used by the binaries when no hardware is attached and by the test
//! suite.

use rand::Rng;

use crate::device::{
    pack_events, unpack_count, unpack_event, AcqMode, BoardInfo, DeviceError, Digitizer,
    PulsePolarity, ReadoutBuffer, TriggerIoMode, TriggerPolarity, NUM_CHANNELS,
};
use crate::event::WaveformEvent;

const SIM_MODEL: &str = "SIM730";

// Latches every programmable register even where synthesis ignores it, so
// readback paths stay faithful.
#[allow(dead_code)]
pub struct SimDigitizer {
    link: u8,
    acq_mode: AcqMode,
    enabled_mask: u8,
    record_len: u32,
    post_trigger: u32,
    max_events_blt: u32,
    dc_offset: [u16; NUM_CHANNELS],
    pulse_polarity: [PulsePolarity; NUM_CHANNELS],
    trigger_polarity: [TriggerPolarity; NUM_CHANNELS],
    thresholds: [u32; NUM_CHANNELS],
    self_trigger_mode: TriggerIoMode,
    self_trigger_mask: u8,
    ext_trigger_mode: TriggerIoMode,
    sw_trigger_mode: TriggerIoMode,
    running: bool,
    pending_sw: u32,
    event_counter: u32,
    // waveform synthesis
    baseline: u16,
    noise: u16,
    // test knobs
    mute_triggers: bool,
    blank_leading: u32,
    dead_sensors: u8,
    temps: [u32; NUM_CHANNELS],
}

impl SimDigitizer {
    /// Resting sample level produced on every enabled channel. Matches a
    /// board with the DC offset programmed near 80% of a 16-bit range.
    pub const DEFAULT_BASELINE: u16 = 33000;

    fn new(link: u8) -> Self {
        Self {
            link,
            acq_mode: AcqMode::SwControlled,
            enabled_mask: 0xff,
            record_len: 1024,
            post_trigger: 50,
            max_events_blt: 1023,
            dc_offset: [0x3333; NUM_CHANNELS],
            pulse_polarity: [PulsePolarity::Negative; NUM_CHANNELS],
            trigger_polarity: [TriggerPolarity::Falling; NUM_CHANNELS],
            thresholds: [0; NUM_CHANNELS],
            self_trigger_mode: TriggerIoMode::Disabled,
            self_trigger_mask: 0,
            ext_trigger_mode: TriggerIoMode::Disabled,
            sw_trigger_mode: TriggerIoMode::Disabled,
            running: false,
            pending_sw: 0,
            event_counter: 0,
            baseline: Self::DEFAULT_BASELINE,
            noise: 0,
            mute_triggers: false,
            blank_leading: 0,
            dead_sensors: 0,
            temps: [38, 39, 40, 41, 40, 39, 38, 37],
        }
    }

    pub fn with_baseline(mut self, baseline: u16) -> Self {
        self.baseline = baseline;
        self
    }

    pub fn with_noise(mut self, noise: u16) -> Self {
        self.noise = noise;
        self
    }

    /// Swallow all triggers; every readout stays empty.
    pub fn muted(mut self) -> Self {
        self.mute_triggers = true;
        self
    }

    /// The first `n` generated events carry no samples on any channel.
    pub fn with_blank_leading(mut self, n: u32) -> Self {
        self.blank_leading = n;
        self
    }

    /// Mark sensors in `mask` as unsupported.
    pub fn with_dead_sensors(mut self, mask: u8) -> Self {
        self.dead_sensors = mask;
        self
    }

    pub fn with_temperatures(mut self, temps: [u32; NUM_CHANNELS]) -> Self {
        self.temps = temps;
        self
    }

    fn hw_triggers_armed(&self) -> bool {
        let self_armed =
            self.self_trigger_mode == TriggerIoMode::AcqOnly && self.self_trigger_mask != 0;
        let ext_armed = self.ext_trigger_mode == TriggerIoMode::AcqOnly;
        self_armed || ext_armed
    }

    fn synth_event(&mut self) -> WaveformEvent {
        self.event_counter += 1;
        let blank = if self.blank_leading > 0 {
            self.blank_leading -= 1;
            true
        } else {
            false
        };
        let mut rng = rand::rng();
        let mut channels = Vec::with_capacity(NUM_CHANNELS);
        for ch in 0..NUM_CHANNELS {
            if blank || self.enabled_mask & (1 << ch) == 0 {
                channels.push(Vec::new());
                continue;
            }
            let mut samples = Vec::with_capacity(self.record_len as usize);
            for _ in 0..self.record_len {
                let s = if self.noise == 0 {
                    self.baseline
                } else {
                    let jitter = rng.random_range(-(self.noise as i32)..=self.noise as i32);
                    (self.baseline as i32 + jitter).clamp(0, u16::MAX as i32) as u16
                };
                samples.push(s);
            }
            channels.push(samples);
        }
        let mask = if blank { 0 } else { self.enabled_mask as u32 };
        WaveformEvent::from_channels(self.event_counter, self.event_counter.wrapping_mul(2048), mask, channels)
    }
}

impl Digitizer for SimDigitizer {
    fn open(link: u8) -> Result<Self, DeviceError> {
        // only link 0 is populated
        if link != 0 {
            return Err(DeviceError::NotFound(link));
        }
        Ok(Self::new(link))
    }

    fn reset(&mut self) -> Result<(), DeviceError> {
        // registers go back to power-on defaults; synthesis knobs survive
        let mut fresh = Self::new(self.link);
        fresh.baseline = self.baseline;
        fresh.noise = self.noise;
        fresh.mute_triggers = self.mute_triggers;
        fresh.blank_leading = self.blank_leading;
        fresh.dead_sensors = self.dead_sensors;
        fresh.temps = self.temps;
        *self = fresh;
        Ok(())
    }

    fn board_info(&self) -> Result<BoardInfo, DeviceError> {
        Ok(BoardInfo {
            model: SIM_MODEL.to_string(),
            roc_firmware: "4.25".to_string(),
            amc_firmware: "4.18".to_string(),
            serial: 25_380,
            channels: NUM_CHANNELS as u8,
        })
    }

    fn set_acquisition_mode(&mut self, mode: AcqMode) -> Result<(), DeviceError> {
        self.acq_mode = mode;
        Ok(())
    }

    fn set_channel_enable_mask(&mut self, mask: u8) -> Result<(), DeviceError> {
        self.enabled_mask = mask;
        Ok(())
    }

    fn set_record_length(&mut self, samples: u32) -> Result<(), DeviceError> {
        if samples == 0 {
            return Err(DeviceError::Command {
                op: "set_record_length",
                code: -2,
            });
        }
        self.record_len = samples;
        Ok(())
    }

    fn set_post_trigger(&mut self, percent: u32) -> Result<(), DeviceError> {
        self.post_trigger = percent;
        Ok(())
    }

    fn set_max_events_blt(&mut self, n: u32) -> Result<(), DeviceError> {
        self.max_events_blt = n.max(1);
        Ok(())
    }

    fn set_pulse_polarity(&mut self, ch: u8, polarity: PulsePolarity) -> Result<(), DeviceError> {
        let slot = self
            .pulse_polarity
            .get_mut(ch as usize)
            .ok_or(DeviceError::InvalidChannel(ch))?;
        *slot = polarity;
        Ok(())
    }

    fn set_trigger_polarity(&mut self, ch: u8, edge: TriggerPolarity) -> Result<(), DeviceError> {
        let slot = self
            .trigger_polarity
            .get_mut(ch as usize)
            .ok_or(DeviceError::InvalidChannel(ch))?;
        *slot = edge;
        Ok(())
    }

    fn set_dc_offset(&mut self, ch: u8, offset: u16) -> Result<(), DeviceError> {
        let slot = self
            .dc_offset
            .get_mut(ch as usize)
            .ok_or(DeviceError::InvalidChannel(ch))?;
        *slot = offset;
        Ok(())
    }

    fn set_trigger_threshold(&mut self, ch: u8, threshold: u32) -> Result<(), DeviceError> {
        let slot = self
            .thresholds
            .get_mut(ch as usize)
            .ok_or(DeviceError::InvalidChannel(ch))?;
        *slot = threshold;
        Ok(())
    }

    fn get_trigger_threshold(&self, ch: u8) -> Result<u32, DeviceError> {
        self.thresholds
            .get(ch as usize)
            .copied()
            .ok_or(DeviceError::InvalidChannel(ch))
    }

    fn set_self_trigger(&mut self, mode: TriggerIoMode, mask: u8) -> Result<(), DeviceError> {
        self.self_trigger_mode = mode;
        self.self_trigger_mask = mask;
        Ok(())
    }

    fn set_external_trigger(&mut self, mode: TriggerIoMode) -> Result<(), DeviceError> {
        self.ext_trigger_mode = mode;
        Ok(())
    }

    fn set_software_trigger(&mut self, mode: TriggerIoMode) -> Result<(), DeviceError> {
        self.sw_trigger_mode = mode;
        Ok(())
    }

    fn send_sw_trigger(&mut self) -> Result<(), DeviceError> {
        if self.running
            && self.sw_trigger_mode == TriggerIoMode::AcqOnly
            && !self.mute_triggers
        {
            self.pending_sw += 1;
        }
        Ok(())
    }

    fn start_acquisition(&mut self) -> Result<(), DeviceError> {
        self.running = true;
        Ok(())
    }

    fn stop_acquisition(&mut self) -> Result<(), DeviceError> {
        self.running = false;
        Ok(())
    }

    fn clear_data(&mut self) -> Result<(), DeviceError> {
        self.pending_sw = 0;
        Ok(())
    }

    fn read_data(&mut self) -> Result<ReadoutBuffer, DeviceError> {
        if !self.running {
            return Ok(ReadoutBuffer::default());
        }
        let mut due = self.pending_sw;
        self.pending_sw = 0;
        if self.hw_triggers_armed() && !self.mute_triggers {
            // steady trigger supply: one hardware event per poll
            due += 1;
        }
        let due = due.min(self.max_events_blt);
        if due == 0 {
            return Ok(ReadoutBuffer::default());
        }
        let events: Vec<WaveformEvent> = (0..due).map(|_| self.synth_event()).collect();
        Ok(ReadoutBuffer::from_bytes(pack_events(&events)))
    }

    fn num_events(&self, buffer: &ReadoutBuffer) -> Result<u32, DeviceError> {
        unpack_count(buffer.as_bytes())
    }

    fn decode_event(
        &self,
        buffer: &ReadoutBuffer,
        index: u32,
    ) -> Result<WaveformEvent, DeviceError> {
        unpack_event(buffer.as_bytes(), index)
    }

    fn read_temperature(&self, sensor: u8) -> Result<u32, DeviceError> {
        if sensor as usize >= NUM_CHANNELS {
            return Err(DeviceError::InvalidChannel(sensor));
        }
        if self.dead_sensors & (1 << sensor) != 0 {
            return Err(DeviceError::Unsupported(sensor));
        }
        Ok(self.temps[sensor as usize])
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        self.running = false;
        Ok(())
    }
}
