use std::collections::BTreeSet;

use super::channel_map::ChannelKey;

/// One readout frame from the event builder.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Event {
    pub module_ids: Vec<u32>,
    pub channels: Vec<u32>,
    // positional with the hits; None where the offset was null in the file
    pub waveform_offsets: Vec<Option<i64>>,
    // interleaved ADC / TDC samples of every channel in the frame
    pub samples: Vec<i32>,
    // length of the per-event data_length list, used as the completeness check
    pub channel_count: usize,
    pub trigger_time: Option<i64>,
    pub trigger_number: Option<i64>,
    // hits whose MID or ch was null or not a valid u32
    pub malformed_hits: BTreeSet<usize>,
}

impl Event {
    pub fn is_complete(&self, expected_channel_count: usize) -> bool {
        self.channel_count == expected_channel_count
    }

    pub fn is_malformed(&self, index: usize) -> bool {
        self.malformed_hits.contains(&index)
    }

    pub fn channel_keys(&self) -> impl Iterator<Item = (usize, ChannelKey)> + '_ {
        self.module_ids
            .iter()
            .zip(self.channels.iter())
            .enumerate()
            .map(|(index, (&module_id, &channel))| (index, ChannelKey::new(module_id, channel)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_keys_follow_hit_order() {
        let event = Event {
            module_ids: vec![41, 42, 41],
            channels: vec![6, 5, 22],
            channel_count: 92,
            ..Default::default()
        };
        let keys: Vec<_> = event.channel_keys().collect();
        assert_eq!(keys[1], (1, ChannelKey::new(42, 5)));
        assert!(!event.is_malformed(1));
        assert!(event.is_complete(92));
        assert!(!event.is_complete(91));
    }
}
