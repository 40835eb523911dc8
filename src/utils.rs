use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

/// Acquisition statistics with *all-time* counters and a *sliding 1 s
/// window* rate.
#[derive(Debug)]
pub struct Counter {
    /// All-time total payload bytes
    pub total_bytes: usize,
    /// All-time number of events
    pub n_events: usize,
    /// Time when this counter was created or last reset
    pub t_begin: Instant,

    // --- sliding window fields ---
    window: Duration,
    events: VecDeque<(Instant, usize)>,
    bytes_in_window: usize,
}

impl Default for Counter {
    fn default() -> Self {
        Counter {
            total_bytes: 0,
            n_events: 0,
            t_begin: Instant::now(),
            window: Duration::from_secs(1),
            events: VecDeque::new(),
            bytes_in_window: 0,
        }
    }
}

impl Counter {
    pub fn new() -> Self {
        Default::default()
    }

    /// Long-term average rate since t_begin, in MB/s
    pub fn average_rate(&self) -> f64 {
        let secs = self.t_begin.elapsed().as_secs_f64().max(1e-6);
        (self.total_bytes as f64 / secs) / (1024.0 * 1024.0)
    }

    /// Sliding-window readout rate over the last second, in MB/s
    pub fn rate(&self) -> f64 {
        let secs = self.window.as_secs_f64().max(1e-6);
        (self.bytes_in_window as f64 / secs) / (1024.0 * 1024.0)
    }

    /// Sliding-window event rate over the last second, in events/s
    pub fn event_rate(&self) -> f64 {
        let secs = self.window.as_secs_f64().max(1e-6);
        self.events.len() as f64 / secs
    }

    /// Record an event of `size` bytes.
    pub fn increment(&mut self, size: usize) {
        let now = Instant::now();

        self.total_bytes += size;
        self.n_events += 1;

        self.events.push_back((now, size));
        self.bytes_in_window += size;

        // Evict entries older than the window
        while let Some(&(ts, sz)) = self.events.front() {
            if now.duration_since(ts) > self.window {
                self.events.pop_front();
                self.bytes_in_window -= sz;
            } else {
                break;
            }
        }
    }

    pub fn reset(&mut self) {
        self.total_bytes = 0;
        self.n_events = 0;
        self.t_begin = Instant::now();
        self.events.clear();
        self.bytes_in_window = 0;
    }
}
