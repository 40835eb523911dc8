//! Acquisition controller for a waveform digitizer: pedestal calibration,
//! trigger planning, a polling readout loop and multi-sink event fan-out.

pub mod acquisition;
pub mod calibration;
pub mod config;
pub mod device;
pub mod event;
pub mod metadata;
pub mod session;
pub mod sim;
pub mod sink;
pub mod telemetry;
pub mod textout;
pub mod trigger;
pub mod utils;
pub mod writer;

pub use acquisition::{RunState, RunStats};
pub use calibration::{measure_pedestal, CalibrationResult};
pub use config::{load_conf, BoardParams, Conf, ConfigError, RunConfig, SinkConfig, TelemetryConf};
pub use device::{BoardInfo, DeviceError, Digitizer, ReadoutBuffer, NUM_CHANNELS};
pub use event::WaveformEvent;
pub use metadata::RunMetadata;
pub use session::DeviceSession;
pub use sim::SimDigitizer;
pub use sink::{Dispatcher, EventSink};
pub use telemetry::{find_temp_channel, InfluxClient, TelemetrySink};
pub use textout::{AggregateTextSink, PerEventTextSink};
pub use trigger::{ThresholdPlan, TriggerMode};
pub use utils::Counter;
pub use writer::Hdf5Sink;
