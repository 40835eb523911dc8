//! Structured-file sink: one HDF5 file shared by any number of runs.
//!
//! Layout:
//!   /runinfo/run_NNNN   one group per run, metadata as attributes plus the
//!                       start/end temperature datasets
//!   /<tag>/wave_evNNNNNN_chC   one dataset per acquired event
//!
//! The file is opened in append mode so records from earlier runs survive.

use anyhow::{anyhow, Context, Result};
use hdf5::types::VarLenUnicode;
use hdf5::{File, Group};
use std::path::Path;

use crate::event::WaveformEvent;
use crate::metadata::{temps_as_raw, RunMetadata};
use crate::sink::EventSink;

pub struct Hdf5Sink {
    file: File,
    channel: u8,
    run_group: Option<Group>,
    tag_group: Option<Group>,
}

impl Hdf5Sink {
    /// Open (or create) the target file for appending.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::append(path)
            .with_context(|| format!("cannot open '{}' for append", path.display()))?;
        Ok(Self {
            file,
            channel: 0,
            run_group: None,
            tag_group: None,
        })
    }

    fn ensure_group(&self, name: &str) -> Result<Group> {
        match self.file.group(name) {
            Ok(g) => Ok(g),
            Err(_) => Ok(self.file.create_group(name)?),
        }
    }
}

fn write_str_attr(group: &Group, name: &str, value: &str) -> Result<()> {
    let value: VarLenUnicode = value
        .parse()
        .map_err(|_| anyhow!("attribute '{name}' is not valid unicode"))?;
    group
        .new_attr::<VarLenUnicode>()
        .create(name)?
        .write_scalar(&value)?;
    Ok(())
}

fn write_u32_attr(group: &Group, name: &str, value: u32) -> Result<()> {
    group.new_attr::<u32>().create(name)?.write_scalar(&value)?;
    Ok(())
}

impl EventSink for Hdf5Sink {
    fn name(&self) -> &'static str {
        "hdf5"
    }

    fn on_run_start(&mut self, meta: &RunMetadata) -> Result<()> {
        self.channel = meta.config.channel;

        let runinfo = self.ensure_group("runinfo")?;
        let index = runinfo.member_names()?.len();
        let run_group = runinfo.create_group(&format!("run_{index:04}"))?;

        write_u32_attr(&run_group, "n", meta.config.num_events)?;
        write_u32_attr(&run_group, "ch", meta.config.channel as u32)?;
        write_u32_attr(&run_group, "rec_len", meta.config.record_len)?;
        write_u32_attr(&run_group, "post", meta.config.post_trigger)?;
        write_u32_attr(&run_group, "delta", meta.config.delta)?;
        write_u32_attr(&run_group, "ped", meta.calibration.pedestal)?;
        write_u32_attr(&run_group, "thr_abs", meta.plan.threshold)?;
        write_u32_attr(&run_group, "pair_mask", meta.plan.armed_mask as u32)?;
        write_str_attr(&run_group, "trig_mode", &meta.config.trigger.to_string())?;
        write_str_attr(&run_group, "tag", &meta.config.tag)?;
        write_str_attr(&run_group, "started", &meta.started_rfc3339())?;

        let start = temps_as_raw(&meta.temp_start);
        run_group
            .new_dataset_builder()
            .with_data(&start[..])
            .create("temp_start")?;

        self.tag_group = Some(self.ensure_group(&meta.config.tag)?);
        self.run_group = Some(run_group);
        Ok(())
    }

    fn on_event(&mut self, event: &WaveformEvent) -> Result<()> {
        let tag_group = self
            .tag_group
            .as_ref()
            .ok_or_else(|| anyhow!("event delivered before run start"))?;
        let name = format!("wave_ev{:06}_ch{}", event.seq, self.channel);
        let ds = tag_group
            .new_dataset_builder()
            .with_data(event.samples(self.channel as usize))
            .create(name.as_str())?;
        ds.new_attr::<u32>()
            .create("cnt")?
            .write_scalar(&event.event_counter)?;
        ds.new_attr::<u32>()
            .create("ttag")?
            .write_scalar(&event.trigger_time_tag)?;
        Ok(())
    }

    fn on_run_end(&mut self, meta: &RunMetadata) -> Result<()> {
        let run_group = self
            .run_group
            .take()
            .ok_or_else(|| anyhow!("run end without run start"))?;
        let end = temps_as_raw(&meta.temp_end);
        run_group
            .new_dataset_builder()
            .with_data(&end[..])
            .create("temp_end")?;
        self.tag_group = None;
        self.file.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::CalibrationResult;
    use crate::config::{RunConfig, SinkConfig};
    use crate::device::NUM_CHANNELS;
    use crate::metadata::TEMP_UNAVAILABLE;
    use crate::trigger::{self, TriggerMode};

    fn meta_for(tag: &str, channel: u8) -> RunMetadata {
        let config = RunConfig::new(
            2,
            TriggerMode::SelfThreshold,
            0,
            channel,
            8,
            50,
            120,
            Some(tag.to_string()),
            SinkConfig::default(),
        )
        .unwrap();
        let cal = CalibrationResult {
            channel,
            pedestal: 33000,
            samples_used: 200,
        };
        let plan = trigger::plan(TriggerMode::SelfThreshold, channel, 33000, 120);
        let mut meta = RunMetadata::new(config, cal, plan, vec![Some(40); NUM_CHANNELS]);
        meta.set_end_temperatures(vec![None; NUM_CHANNELS]);
        meta
    }

    fn event_on(channel: u8, seq: u32, samples: Vec<u16>) -> WaveformEvent {
        let mut channels = vec![Vec::new(); NUM_CHANNELS];
        channels[channel as usize] = samples;
        let mut ev = WaveformEvent::from_channels(seq + 1, 1000 * seq, 1 << channel, channels);
        ev.seq = seq;
        ev
    }

    fn write_run(sink: &mut Hdf5Sink, tag: &str, channel: u8, n: u32) {
        let meta = meta_for(tag, channel);
        sink.on_run_start(&meta).unwrap();
        for seq in 0..n {
            sink.on_event(&event_on(channel, seq, vec![seq as u16; 8]))
                .unwrap();
        }
        sink.on_run_end(&meta).unwrap();
    }

    #[test]
    fn events_and_metadata_land_under_the_tag() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.h5");

        let mut sink = Hdf5Sink::open(&path).unwrap();
        write_run(&mut sink, "dark", 3, 2);
        drop(sink);

        let file = File::open(&path).unwrap();
        let tag = file.group("dark").unwrap();
        let ds = tag.dataset("wave_ev000001_ch3").unwrap();
        let samples: Vec<u16> = ds.read_raw().unwrap();
        assert_eq!(samples, vec![1; 8]);

        let runinfo = file.group("runinfo").unwrap();
        let run = runinfo.group("run_0000").unwrap();
        let ped: u32 = run.attr("ped").unwrap().read_scalar().unwrap();
        assert_eq!(ped, 33000);
        let thr: u32 = run.attr("thr_abs").unwrap().read_scalar().unwrap();
        assert_eq!(thr, 32880);
        let end: Vec<u32> = run.dataset("temp_end").unwrap().read_raw().unwrap();
        assert!(end.iter().all(|&t| t == TEMP_UNAVAILABLE));
    }

    #[test]
    fn second_run_under_a_new_tag_leaves_the_first_intact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.h5");

        let mut sink = Hdf5Sink::open(&path).unwrap();
        write_run(&mut sink, "sw", 0, 2);
        drop(sink);

        // separate process appending to the same file
        let mut sink = Hdf5Sink::open(&path).unwrap();
        write_run(&mut sink, "dark", 0, 1);
        drop(sink);

        let file = File::open(&path).unwrap();
        let first = file.group("sw").unwrap();
        assert_eq!(first.member_names().unwrap().len(), 2);
        let second = file.group("dark").unwrap();
        assert_eq!(second.member_names().unwrap().len(), 1);

        let runinfo = file.group("runinfo").unwrap();
        let mut runs = runinfo.member_names().unwrap();
        runs.sort();
        assert_eq!(runs, vec!["run_0000", "run_0001"]);
    }
}
