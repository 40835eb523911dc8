//! Trigger-mode state machine.
//!
//! [`plan`] is pure: it maps the requested mode, channel and relative delta
//! onto an absolute threshold and the channel-pair arming mask. [`configure`]
//! then writes the corresponding register sequence in one shot, so no
//! mode-dependent branching leaks into the acquisition loop.

use clap::ValueEnum;
use log::{info, warn};
use std::fmt;
use std::str::FromStr;

use crate::config::ConfigError;
use crate::device::{Digitizer, TriggerIoMode};
use crate::session::DeviceSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TriggerMode {
    /// Forced triggers issued by the acquisition loop.
    #[value(name = "sw")]
    Software,
    /// Front-panel trigger input.
    #[value(name = "ext")]
    External,
    /// Per-channel threshold crossing.
    #[value(name = "self")]
    SelfThreshold,
}

impl fmt::Display for TriggerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TriggerMode::Software => "sw",
            TriggerMode::External => "ext",
            TriggerMode::SelfThreshold => "self",
        };
        f.write_str(name)
    }
}

impl FromStr for TriggerMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sw" => Ok(TriggerMode::Software),
            "ext" => Ok(TriggerMode::External),
            "self" => Ok(TriggerMode::SelfThreshold),
            other => Err(ConfigError::UnknownTriggerMode(other.to_string())),
        }
    }
}

/// Deterministic product of pedestal + run config. In software/external mode
/// the threshold is diagnostic only and nothing is armed.
#[derive(Debug, Clone, Copy)]
pub struct ThresholdPlan {
    /// Absolute trigger level in ADC counts.
    pub threshold: u32,
    /// Channels to arm for self-triggering.
    pub armed_mask: u8,
    /// Even base of the channel pair containing the requested channel.
    pub pair_base: u8,
}

/// Trigger logic is wired per even/odd channel pair, so arming always covers
/// both partners.
pub fn plan(mode: TriggerMode, channel: u8, pedestal: u32, delta: u32) -> ThresholdPlan {
    let pair_base = channel & !1;
    let armed_mask = (1u8 << pair_base) | (1u8 << (pair_base + 1));
    let threshold = match mode {
        // diagnostic readback level for modes that never arm it
        TriggerMode::Software | TriggerMode::External => pedestal,
        TriggerMode::SelfThreshold => pedestal.saturating_sub(delta),
    };
    ThresholdPlan {
        threshold,
        armed_mask,
        pair_base,
    }
}

/// Write the register sequence for `mode`. Any driver failure aborts the run.
pub fn configure<D: Digitizer>(
    session: &mut DeviceSession<D>,
    mode: TriggerMode,
    plan: &ThresholdPlan,
) -> Result<(), crate::device::DeviceError> {
    match mode {
        TriggerMode::Software => {
            session.set_self_trigger(TriggerIoMode::Disabled, 0xff)?;
            session.set_external_trigger(TriggerIoMode::Disabled)?;
            session.set_software_trigger(TriggerIoMode::AcqOnly)?;
            info!("software trigger mode (diagnostic level {})", plan.threshold);
        }
        TriggerMode::External => {
            session.set_self_trigger(TriggerIoMode::Disabled, 0xff)?;
            session.set_software_trigger(TriggerIoMode::Disabled)?;
            session.set_external_trigger(TriggerIoMode::AcqOnly)?;
            info!("external trigger mode (diagnostic level {})", plan.threshold);
        }
        TriggerMode::SelfThreshold => {
            session.set_software_trigger(TriggerIoMode::Disabled)?;
            session.set_external_trigger(TriggerIoMode::Disabled)?;
            session.set_trigger_threshold(plan.pair_base, plan.threshold)?;
            session.set_trigger_threshold(plan.pair_base + 1, plan.threshold)?;
            session.set_self_trigger(TriggerIoMode::AcqOnly, plan.armed_mask)?;

            let rd0 = session.get_trigger_threshold(plan.pair_base)?;
            let rd1 = session.get_trigger_threshold(plan.pair_base + 1)?;
            // drift between programmed and effective level is expected
            if rd0 != plan.threshold || rd1 != plan.threshold {
                warn!(
                    "threshold readback {{{rd0},{rd1}}} differs from programmed {}",
                    plan.threshold
                );
            }
            info!(
                "self trigger: thr_abs={} pair_mask={:#04x}",
                plan.threshold, plan.armed_mask
            );
        }
    }
    Ok(())
}
