use confique::Config;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::device::{PulsePolarity, TriggerPolarity, NUM_CHANNELS};
use crate::trigger::TriggerMode;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown trigger mode '{0}' (expected sw, self or ext)")]
    UnknownTriggerMode(String),
    #[error("channel {0} out of range (device has {NUM_CHANNELS} channels)")]
    ChannelOutOfRange(u8),
    #[error("record length must be nonzero")]
    ZeroRecordLength,
    #[error("post-trigger percentage {0} exceeds 100")]
    PostTriggerOutOfRange(u32),
    #[error("unknown pulse polarity '{0}' (expected positive or negative)")]
    UnknownPolarity(String),
    #[error("unknown trigger edge '{0}' (expected rising or falling)")]
    UnknownEdge(String),
}

/// Optional TOML settings with no CLI flags: board programming defaults and
/// the telemetry endpoint.
#[derive(Config, Debug, Clone)]
pub struct Conf {
    #[config(nested)]
    pub board: BoardConf,
    #[config(nested)]
    pub telemetry: TelemetryConf,
}

#[derive(Config, Debug, Clone)]
pub struct BoardConf {
    /// DC offset DAC value written to every channel. The default parks the
    /// baseline near 80% of range, leaving headroom for negative pulses.
    #[config(default = 13107)]
    pub dc_offset: u16,
    #[config(default = "negative")]
    pub pulse_polarity: String,
    #[config(default = "falling")]
    pub trigger_edge: String,
    #[config(default = 1023)]
    pub max_events_blt: u32,
}

#[derive(Config, Debug, Clone)]
pub struct TelemetryConf {
    #[config(default = false)]
    pub enabled: bool,
    #[config(default = "127.0.0.1")]
    pub host: String,
    #[config(default = 8086)]
    pub port: u16,
    #[config(default = "testdb")]
    pub database: String,
    #[config(default = "digitizer")]
    pub measurement: String,
    #[config(default = 5)]
    pub interval_sec: u64,
}

/// Board settings resolved into device types.
#[derive(Debug, Clone, Copy)]
pub struct BoardParams {
    pub dc_offset: u16,
    pub pulse_polarity: PulsePolarity,
    pub trigger_edge: TriggerPolarity,
    pub max_events_blt: u32,
}

impl BoardConf {
    pub fn resolve(&self) -> Result<BoardParams, ConfigError> {
        let pulse_polarity = match self.pulse_polarity.as_str() {
            "positive" => PulsePolarity::Positive,
            "negative" => PulsePolarity::Negative,
            other => return Err(ConfigError::UnknownPolarity(other.to_string())),
        };
        let trigger_edge = match self.trigger_edge.as_str() {
            "rising" => TriggerPolarity::Rising,
            "falling" => TriggerPolarity::Falling,
            other => return Err(ConfigError::UnknownEdge(other.to_string())),
        };
        Ok(BoardParams {
            dc_offset: self.dc_offset,
            pulse_polarity,
            trigger_edge,
            max_events_blt: self.max_events_blt,
        })
    }
}

/// Load the layered config. A missing default file is fine; a missing file
/// the user asked for by path is not.
pub fn load_conf(path: Option<&Path>) -> anyhow::Result<Conf> {
    if let Some(p) = path {
        if !p.exists() {
            anyhow::bail!("config file '{}' not found", p.display());
        }
    }
    let file = path.unwrap_or_else(|| Path::new("wavedaq.toml"));
    Ok(Conf::builder().file(file).load()?)
}

/// Destinations for the event stream. All optional; an empty set means the
/// run only reports counts.
#[derive(Debug, Clone, Default)]
pub struct SinkConfig {
    pub hdf5: Option<PathBuf>,
    pub txt: Option<PathBuf>,
    pub txt_dir: Option<PathBuf>,
    pub telemetry: bool,
}

/// Per-run acquisition parameters. Immutable once the run starts; validated
/// here so no device I/O happens on bad values.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub num_events: u32,
    pub trigger: TriggerMode,
    pub link: u8,
    pub channel: u8,
    pub record_len: u32,
    pub post_trigger: u32,
    /// Threshold delta below the pedestal, in ADC counts.
    pub delta: u32,
    pub tag: String,
    pub sinks: SinkConfig,
}

impl RunConfig {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        num_events: u32,
        trigger: TriggerMode,
        link: u8,
        channel: u8,
        record_len: u32,
        post_trigger: u32,
        delta: u32,
        tag: Option<String>,
        sinks: SinkConfig,
    ) -> Result<Self, ConfigError> {
        if channel as usize >= NUM_CHANNELS {
            return Err(ConfigError::ChannelOutOfRange(channel));
        }
        if record_len == 0 {
            return Err(ConfigError::ZeroRecordLength);
        }
        if post_trigger > 100 {
            return Err(ConfigError::PostTriggerOutOfRange(post_trigger));
        }
        let tag = match tag {
            Some(t) if !t.is_empty() => t,
            _ => trigger.to_string(),
        };
        Ok(Self {
            num_events,
            trigger,
            link,
            channel,
            record_len,
            post_trigger,
            delta,
            tag,
            sinks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base(channel: u8, record_len: u32, post: u32) -> Result<RunConfig, ConfigError> {
        RunConfig::new(
            10,
            TriggerMode::SelfThreshold,
            0,
            channel,
            record_len,
            post,
            120,
            None,
            SinkConfig::default(),
        )
    }

    #[test]
    fn valid_config_is_accepted() {
        let cfg = base(3, 1024, 50).unwrap();
        assert_eq!(cfg.channel, 3);
        assert_eq!(cfg.tag, "self");
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        assert!(matches!(
            base(8, 1024, 50),
            Err(ConfigError::ChannelOutOfRange(8))
        ));
        assert!(matches!(base(0, 0, 50), Err(ConfigError::ZeroRecordLength)));
        assert!(matches!(
            base(0, 1024, 101),
            Err(ConfigError::PostTriggerOutOfRange(101))
        ));
    }

    #[test]
    fn explicit_tag_wins_over_mode_name() {
        let cfg = RunConfig::new(
            1,
            TriggerMode::Software,
            0,
            0,
            16,
            50,
            0,
            Some("dark".to_string()),
            SinkConfig::default(),
        )
        .unwrap();
        assert_eq!(cfg.tag, "dark");
    }

    #[test]
    fn board_conf_rejects_unknown_words() {
        let conf = BoardConf {
            dc_offset: 0x3333,
            pulse_polarity: "sideways".into(),
            trigger_edge: "falling".into(),
            max_events_blt: 1023,
        };
        assert!(matches!(
            conf.resolve(),
            Err(ConfigError::UnknownPolarity(_))
        ));
    }
}
