//! Open/configure/close lifecycle around a [`Digitizer`].

use log::{debug, info};
use std::thread;
use std::time::Duration;

use crate::config::{BoardParams, RunConfig};
use crate::device::{
    AcqMode, BoardInfo, DeviceError, Digitizer, ReadoutBuffer, TriggerIoMode, NUM_CHANNELS,
};
use crate::event::WaveformEvent;

/// Settle time after reprogramming the DC offsets.
const OFFSET_SETTLE: Duration = Duration::from_millis(80);

pub struct DeviceSession<D: Digitizer> {
    device: D,
    info: BoardInfo,
}

impl<D: Digitizer> DeviceSession<D> {
    /// Open the board on `link`, reset it and read its identification block.
    pub fn open(link: u8) -> Result<Self, DeviceError> {
        let mut device = D::open(link)?;
        device.reset()?;
        let info = device.board_info()?;
        info!(
            "board: model={} roc={} amc={} channels={}",
            info.model, info.roc_firmware, info.amc_firmware, info.channels
        );
        Ok(Self { device, info })
    }

    /// Wrap an already-open device (simulated backends with non-default
    /// behavior). Resets it like [`DeviceSession::open`] does.
    pub fn from_device(mut device: D) -> Result<Self, DeviceError> {
        device.reset()?;
        let info = device.board_info()?;
        Ok(Self { device, info })
    }

    pub fn board_info(&self) -> &BoardInfo {
        &self.info
    }

    /// Program the common acquisition registers. Every write is fatal on
    /// failure; the caller aborts the run.
    pub fn configure(&mut self, config: &RunConfig, board: &BoardParams) -> Result<(), DeviceError> {
        self.device.set_acquisition_mode(AcqMode::SwControlled)?;
        self.device.set_channel_enable_mask(0xff)?;
        self.device.set_record_length(config.record_len)?;
        self.device.set_post_trigger(config.post_trigger)?;
        self.device.set_max_events_blt(board.max_events_blt)?;
        for ch in 0..NUM_CHANNELS as u8 {
            self.device.set_pulse_polarity(ch, board.pulse_polarity)?;
            self.device.set_trigger_polarity(ch, board.trigger_edge)?;
            self.device.set_dc_offset(ch, board.dc_offset)?;
        }
        thread::sleep(OFFSET_SETTLE);
        debug!(
            "configured: rec_len={} post={}% dc_offset={:#06x}",
            config.record_len, config.post_trigger, board.dc_offset
        );
        Ok(())
    }

    pub fn set_self_trigger(&mut self, mode: TriggerIoMode, mask: u8) -> Result<(), DeviceError> {
        self.device.set_self_trigger(mode, mask)
    }

    pub fn set_external_trigger(&mut self, mode: TriggerIoMode) -> Result<(), DeviceError> {
        self.device.set_external_trigger(mode)
    }

    pub fn set_software_trigger(&mut self, mode: TriggerIoMode) -> Result<(), DeviceError> {
        self.device.set_software_trigger(mode)
    }

    pub fn set_trigger_threshold(&mut self, ch: u8, threshold: u32) -> Result<(), DeviceError> {
        self.device.set_trigger_threshold(ch, threshold)
    }

    pub fn get_trigger_threshold(&self, ch: u8) -> Result<u32, DeviceError> {
        self.device.get_trigger_threshold(ch)
    }

    pub fn send_sw_trigger(&mut self) -> Result<(), DeviceError> {
        self.device.send_sw_trigger()
    }

    pub fn start_acquisition(&mut self) -> Result<(), DeviceError> {
        self.device.start_acquisition()
    }

    pub fn stop_acquisition(&mut self) -> Result<(), DeviceError> {
        self.device.stop_acquisition()
    }

    pub fn clear_data(&mut self) -> Result<(), DeviceError> {
        self.device.clear_data()
    }

    /// Poll for queued readout; returns an empty buffer when none.
    pub fn read_data(&mut self) -> Result<ReadoutBuffer, DeviceError> {
        self.device.read_data()
    }

    pub fn num_events(&self, buffer: &ReadoutBuffer) -> Result<u32, DeviceError> {
        self.device.num_events(buffer)
    }

    pub fn decode_event(
        &self,
        buffer: &ReadoutBuffer,
        index: u32,
    ) -> Result<WaveformEvent, DeviceError> {
        self.device.decode_event(buffer, index)
    }

    /// Read every sensor; `None` where the board has no sensor or the read
    /// fails.
    pub fn read_temperatures(&self) -> Vec<Option<u32>> {
        (0..NUM_CHANNELS as u8)
            .map(|ch| self.device.read_temperature(ch).ok())
            .collect()
    }

    pub fn close(mut self) -> Result<(), DeviceError> {
        self.device.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimDigitizer;

    #[test]
    fn open_reports_board_identity() {
        let session = DeviceSession::<SimDigitizer>::open(0).unwrap();
        assert_eq!(session.board_info().channels as usize, NUM_CHANNELS);
    }

    #[test]
    fn unsupported_sensors_come_back_as_none() {
        let device = SimDigitizer::open(0).unwrap().with_dead_sensors(0b1111_0000);
        let session = DeviceSession::from_device(device).unwrap();

        let temps = session.read_temperatures();
        assert_eq!(temps.len(), NUM_CHANNELS);
        assert!(temps[..4].iter().all(Option::is_some));
        assert!(temps[4..].iter().all(Option::is_none));
    }
}
