//! Digitizer register-level boundary.
//!
//! The external driver is modelled as the [`Digitizer`] trait: one method per
//! driver call, every call fallible. Readout is a two-step poll/decode pair —
//! [`Digitizer::read_data`] returns a raw (possibly empty) block-transfer
//! buffer and [`Digitizer::decode_event`] unpacks one event out of it.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};
use thiserror::Error;

use crate::event::WaveformEvent;

/// Channels on the supported board family.
pub const NUM_CHANNELS: usize = 8;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("no device on link {0}")]
    NotFound(u8),
    #[error("{op} failed (code={code})")]
    Command { op: &'static str, code: i32 },
    #[error("channel {0} out of range")]
    InvalidChannel(u8),
    #[error("temperature sensor {0} not supported")]
    Unsupported(u8),
    #[error("readout decode: {0}")]
    Decode(String),
}

/// Identification block reported by the board after open/reset.
#[derive(Debug, Clone)]
pub struct BoardInfo {
    pub model: String,
    pub roc_firmware: String,
    pub amc_firmware: String,
    pub serial: u32,
    pub channels: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcqMode {
    SwControlled,
    SInControlled,
    FirstTrgControlled,
}

/// Routing of a trigger source into the acquisition logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerIoMode {
    Disabled,
    ExtOutOnly,
    AcqOnly,
    AcqAndExtOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PulsePolarity {
    Positive,
    Negative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerPolarity {
    Rising,
    Falling,
}

/// One block transfer worth of raw readout data. Zero-length means the board
/// had nothing queued.
#[derive(Debug, Default)]
pub struct ReadoutBuffer {
    bytes: Vec<u8>,
}

impl ReadoutBuffer {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Register-level digitizer command set.
///
/// Blocking calls into the driver; `read_data` polls and returns immediately
/// with an empty buffer when no data is queued.
pub trait Digitizer {
    fn open(link: u8) -> Result<Self, DeviceError>
    where
        Self: Sized;
    fn reset(&mut self) -> Result<(), DeviceError>;
    fn board_info(&self) -> Result<BoardInfo, DeviceError>;

    fn set_acquisition_mode(&mut self, mode: AcqMode) -> Result<(), DeviceError>;
    fn set_channel_enable_mask(&mut self, mask: u8) -> Result<(), DeviceError>;
    fn set_record_length(&mut self, samples: u32) -> Result<(), DeviceError>;
    fn set_post_trigger(&mut self, percent: u32) -> Result<(), DeviceError>;
    fn set_max_events_blt(&mut self, n: u32) -> Result<(), DeviceError>;
    fn set_pulse_polarity(&mut self, ch: u8, polarity: PulsePolarity) -> Result<(), DeviceError>;
    fn set_trigger_polarity(&mut self, ch: u8, edge: TriggerPolarity) -> Result<(), DeviceError>;
    fn set_dc_offset(&mut self, ch: u8, offset: u16) -> Result<(), DeviceError>;

    fn set_trigger_threshold(&mut self, ch: u8, threshold: u32) -> Result<(), DeviceError>;
    fn get_trigger_threshold(&self, ch: u8) -> Result<u32, DeviceError>;
    fn set_self_trigger(&mut self, mode: TriggerIoMode, mask: u8) -> Result<(), DeviceError>;
    fn set_external_trigger(&mut self, mode: TriggerIoMode) -> Result<(), DeviceError>;
    fn set_software_trigger(&mut self, mode: TriggerIoMode) -> Result<(), DeviceError>;
    fn send_sw_trigger(&mut self) -> Result<(), DeviceError>;

    fn start_acquisition(&mut self) -> Result<(), DeviceError>;
    fn stop_acquisition(&mut self) -> Result<(), DeviceError>;
    fn clear_data(&mut self) -> Result<(), DeviceError>;
    fn read_data(&mut self) -> Result<ReadoutBuffer, DeviceError>;
    fn num_events(&self, buffer: &ReadoutBuffer) -> Result<u32, DeviceError>;
    fn decode_event(&self, buffer: &ReadoutBuffer, index: u32)
        -> Result<WaveformEvent, DeviceError>;

    fn read_temperature(&self, sensor: u8) -> Result<u32, DeviceError>;
    fn close(&mut self) -> Result<(), DeviceError>;
}

// Block-transfer wire layout, little endian:
//   u32 n_events, then per event:
//     u32 counter, u32 trigger_time_tag, u32 channel_mask,
//     NUM_CHANNELS x { u32 n_samples, n_samples x u16 }

pub fn pack_events(events: &[WaveformEvent]) -> Vec<u8> {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&(events.len() as u32).to_le_bytes());
    for ev in events {
        bytes.extend_from_slice(&ev.event_counter.to_le_bytes());
        bytes.extend_from_slice(&ev.trigger_time_tag.to_le_bytes());
        bytes.extend_from_slice(&ev.channel_mask.to_le_bytes());
        for ch in 0..NUM_CHANNELS {
            let samples = ev.samples(ch);
            bytes.extend_from_slice(&(samples.len() as u32).to_le_bytes());
            for &s in samples {
                bytes.extend_from_slice(&s.to_le_bytes());
            }
        }
    }
    bytes
}

pub fn unpack_count(bytes: &[u8]) -> Result<u32, DeviceError> {
    if bytes.is_empty() {
        return Ok(0);
    }
    Cursor::new(bytes)
        .read_u32::<LittleEndian>()
        .map_err(|_| DeviceError::Decode("buffer shorter than event count header".into()))
}

pub fn unpack_event(bytes: &[u8], index: u32) -> Result<WaveformEvent, DeviceError> {
    let truncated = |_| DeviceError::Decode("truncated readout buffer".into());
    let mut cur = Cursor::new(bytes);
    let n_events = cur.read_u32::<LittleEndian>().map_err(truncated)?;
    if index >= n_events {
        return Err(DeviceError::Decode(format!(
            "event index {index} out of range (buffer holds {n_events})"
        )));
    }
    for skip in 0..=index {
        let counter = cur.read_u32::<LittleEndian>().map_err(truncated)?;
        let ttag = cur.read_u32::<LittleEndian>().map_err(truncated)?;
        let mask = cur.read_u32::<LittleEndian>().map_err(truncated)?;
        let mut channels = Vec::with_capacity(NUM_CHANNELS);
        for _ in 0..NUM_CHANNELS {
            let ns = cur.read_u32::<LittleEndian>().map_err(truncated)? as usize;
            if skip < index {
                // not the requested event, skip the sample block
                let pos = cur.position() + 2 * ns as u64;
                if pos > bytes.len() as u64 {
                    return Err(DeviceError::Decode("truncated readout buffer".into()));
                }
                cur.set_position(pos);
                channels.push(Vec::new());
            } else {
                let mut samples = Vec::with_capacity(ns);
                for _ in 0..ns {
                    samples.push(cur.read_u16::<LittleEndian>().map_err(truncated)?);
                }
                channels.push(samples);
            }
        }
        if skip == index {
            return Ok(WaveformEvent::from_channels(counter, ttag, mask, channels));
        }
    }
    unreachable!("loop returns at the requested index")
}
