use ndarray::Array2;

/// One decoded digitizer event.
///
/// Waveform data is stored as a 2D contiguous array (channel x sample); a
/// channel that reported fewer samples than the widest one only exposes its
/// own prefix through [`WaveformEvent::samples`]. The sequence number is
/// assigned by the acquisition loop when the event is accepted, not by the
/// device.
#[derive(Debug)]
pub struct WaveformEvent {
    pub seq: u32,
    /// Event counter as reported by the board.
    pub event_counter: u32,
    /// Trigger time tag as reported by the board.
    pub trigger_time_tag: u32,
    pub channel_mask: u32,
    ch_size: Vec<usize>,
    waveforms: Array2<u16>,
}

impl WaveformEvent {
    /// Build an event from per-channel sample vectors (decode path).
    pub fn from_channels(
        event_counter: u32,
        trigger_time_tag: u32,
        channel_mask: u32,
        channels: Vec<Vec<u16>>,
    ) -> Self {
        let n_channels = channels.len();
        let widest = channels.iter().map(Vec::len).max().unwrap_or(0);
        let mut waveforms = Array2::<u16>::zeros((n_channels, widest));
        let mut ch_size = Vec::with_capacity(n_channels);
        for (ch, samples) in channels.iter().enumerate() {
            ch_size.push(samples.len());
            for (i, &s) in samples.iter().enumerate() {
                waveforms[[ch, i]] = s;
            }
        }
        Self {
            seq: 0,
            event_counter,
            trigger_time_tag,
            channel_mask,
            ch_size,
            waveforms,
        }
    }

    pub fn n_channels(&self) -> usize {
        self.ch_size.len()
    }

    /// Samples recorded on `ch`; empty when the channel was absent from the
    /// readout.
    pub fn samples(&self, ch: usize) -> &[u16] {
        if ch >= self.n_channels() {
            return &[];
        }
        let n = self.ch_size[ch];
        match self.waveforms.row(ch).to_slice() {
            Some(s) => &s[..n],
            None => &[],
        }
    }

    pub fn has_samples(&self, ch: usize) -> bool {
        self.ch_size.get(ch).copied().unwrap_or(0) > 0
    }

    /// Payload size in bytes, summed over channels.
    pub fn sample_bytes(&self) -> usize {
        self.ch_size.iter().sum::<usize>() * std::mem::size_of::<u16>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_prefixes_are_exposed() {
        let mut channels = vec![Vec::new(); 4];
        channels[1] = vec![5, 6, 7];
        channels[2] = vec![1];
        let ev = WaveformEvent::from_channels(42, 99, 0b0110, channels);

        assert_eq!(ev.samples(1), &[5, 6, 7]);
        assert_eq!(ev.samples(2), &[1]);
        assert!(ev.samples(0).is_empty());
        assert!(!ev.has_samples(3));
        assert!(ev.samples(17).is_empty());
        assert_eq!(ev.sample_bytes(), 8);
    }
}
