//! Event fan-out.
//!
//! The acquisition loop hands every accepted event (and the run metadata,
//! twice) to a [`Dispatcher`], which broadcasts to the registered sinks in
//! registration order. A failing sink is logged, counted and dropped for the
//! remainder of the run; nothing a sink does can abort acquisition.

use anyhow::Result;
use log::warn;

use crate::event::WaveformEvent;
use crate::metadata::RunMetadata;

/// A destination for the event stream. Implement only the callbacks the
/// sink cares about; the rest default to no-ops.
pub trait EventSink {
    fn name(&self) -> &'static str;

    fn on_run_start(&mut self, _meta: &RunMetadata) -> Result<()> {
        Ok(())
    }

    fn on_event(&mut self, _event: &WaveformEvent) -> Result<()> {
        Ok(())
    }

    fn on_run_end(&mut self, _meta: &RunMetadata) -> Result<()> {
        Ok(())
    }
}

struct Slot {
    sink: Box<dyn EventSink>,
    disabled: bool,
    failures: u32,
}

#[derive(Default)]
pub struct Dispatcher {
    slots: Vec<Slot>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, sink: Box<dyn EventSink>) {
        self.slots.push(Slot {
            sink,
            disabled: false,
            failures: 0,
        });
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Total write failures across all sinks.
    pub fn failures(&self) -> u32 {
        self.slots.iter().map(|s| s.failures).sum()
    }

    pub fn on_run_start(&mut self, meta: &RunMetadata) {
        self.broadcast(|sink| sink.on_run_start(meta));
    }

    pub fn on_event(&mut self, event: &WaveformEvent) {
        self.broadcast(|sink| sink.on_event(event));
    }

    pub fn on_run_end(&mut self, meta: &RunMetadata) {
        self.broadcast(|sink| sink.on_run_end(meta));
    }

    fn broadcast<F>(&mut self, mut deliver: F)
    where
        F: FnMut(&mut dyn EventSink) -> Result<()>,
    {
        for slot in &mut self.slots {
            if slot.disabled {
                continue;
            }
            if let Err(e) = deliver(slot.sink.as_mut()) {
                warn!(
                    "{} sink failed ({e:#}); disabling it for the rest of the run",
                    slot.sink.name()
                );
                slot.failures += 1;
                slot.disabled = true;
            }
        }
    }
}
