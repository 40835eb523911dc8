//! Plain-text sinks: one growing file, or one file per event.
//!
//! Block format, both variants:
//!   # Event N  tag=..  trig=..  ch=..  size=..  cnt=..  ttag=..
//!   <one sample per line>
//!   <blank line>

use anyhow::{anyhow, Context, Result};
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use crate::event::WaveformEvent;
use crate::metadata::RunMetadata;
use crate::sink::EventSink;
use crate::trigger::TriggerMode;

/// Run facts repeated in every block header.
#[derive(Debug, Clone)]
struct RunHeader {
    tag: String,
    trigger: TriggerMode,
    channel: u8,
}

impl RunHeader {
    fn from_meta(meta: &RunMetadata) -> Self {
        Self {
            tag: meta.config.tag.clone(),
            trigger: meta.config.trigger,
            channel: meta.config.channel,
        }
    }

    fn write_block<W: Write>(&self, out: &mut W, event: &WaveformEvent) -> std::io::Result<()> {
        let samples = event.samples(self.channel as usize);
        writeln!(
            out,
            "# Event {}  tag={}  trig={}  ch={}  size={}  cnt={}  ttag={}",
            event.seq,
            self.tag,
            self.trigger,
            self.channel,
            samples.len(),
            event.event_counter,
            event.trigger_time_tag
        )?;
        for s in samples {
            writeln!(out, "{s}")?;
        }
        writeln!(out)
    }
}

/// Appends every event to a single text file.
pub struct AggregateTextSink {
    path: PathBuf,
    out: Option<BufWriter<std::fs::File>>,
    header: Option<RunHeader>,
}

impl AggregateTextSink {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            out: None,
            header: None,
        }
    }
}

impl EventSink for AggregateTextSink {
    fn name(&self) -> &'static str {
        "txt"
    }

    fn on_run_start(&mut self, meta: &RunMetadata) -> Result<()> {
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)
            .with_context(|| format!("cannot open '{}' for append", self.path.display()))?;
        self.out = Some(BufWriter::new(file));
        self.header = Some(RunHeader::from_meta(meta));
        Ok(())
    }

    fn on_event(&mut self, event: &WaveformEvent) -> Result<()> {
        let header = self
            .header
            .as_ref()
            .ok_or_else(|| anyhow!("event delivered before run start"))?;
        let out = self
            .out
            .as_mut()
            .ok_or_else(|| anyhow!("event delivered before run start"))?;
        header.write_block(out, event)?;
        Ok(())
    }

    fn on_run_end(&mut self, _meta: &RunMetadata) -> Result<()> {
        if let Some(mut out) = self.out.take() {
            out.flush()?;
        }
        Ok(())
    }
}

/// Writes each event to its own `waveform_<seq>.txt` inside a directory.
pub struct PerEventTextSink {
    dir: PathBuf,
    header: Option<RunHeader>,
}

impl PerEventTextSink {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir, header: None }
    }
}

impl EventSink for PerEventTextSink {
    fn name(&self) -> &'static str {
        "txtdir"
    }

    fn on_run_start(&mut self, meta: &RunMetadata) -> Result<()> {
        self.header = Some(RunHeader::from_meta(meta));
        Ok(())
    }

    fn on_event(&mut self, event: &WaveformEvent) -> Result<()> {
        let header = self
            .header
            .as_ref()
            .ok_or_else(|| anyhow!("event delivered before run start"))?;
        let path = self.dir.join(format!("waveform_{}.txt", event.seq));
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .with_context(|| format!("cannot write '{}'", path.display()))?;
        let mut out = BufWriter::new(file);
        header.write_block(&mut out, event)?;
        out.flush()?;
        Ok(())
    }
}
