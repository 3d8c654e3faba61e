use serde::{Deserialize, Serialize};

/// Which slice of the flattened waveform belongs to a channel.
/// Written in YAML as `{kind: FixedOffset, offset: 100, length: 100}` or `{kind: InterChannelGap}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum WindowStrategy {
    /// `[offset[j] + offset, offset[j] + offset + length)`
    FixedOffset { offset: i64, length: i64 },
    /// `[offset[j], offset[j + 1])`, the last channel runs to the end of the samples
    InterChannelGap,
}

impl Default for WindowStrategy {
    fn default() -> Self {
        WindowStrategy::FixedOffset {
            offset: 100,
            length: 100,
        }
    }
}

impl WindowStrategy {
    /// Start and length of the window for channel `index`, or None if the event
    /// carries no waveform offset for that channel. A gap window also needs the
    /// next channel's offset unless `index` is the last channel.
    pub fn window(&self, offsets: &[Option<i64>], index: usize, sample_count: usize) -> Option<(i64, i64)> {
        let start = (*offsets.get(index)?)?;
        match self {
            WindowStrategy::FixedOffset { offset, length } => Some((start + offset, *length)),
            WindowStrategy::InterChannelGap => {
                let end = match offsets.get(index + 1) {
                    Some(next) => (*next)?,
                    None => sample_count as i64,
                };
                Some((start, (end - start).max(0)))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegrationParams {
    pub window: WindowStrategy,
    // 2 when ADC and TDC samples are interleaved
    pub stride: usize,
    pub threshold: f64,
}

impl Default for IntegrationParams {
    fn default() -> Self {
        IntegrationParams {
            window: WindowStrategy::default(),
            stride: 2,
            threshold: 0.0,
        }
    }
}

impl IntegrationParams {
    /// Integrated charge of channel `index`. The outer None means the offset was
    /// missing, the inner None means the sum fell below threshold.
    pub fn integrate_channel<T>(&self, samples: &[T], offsets: &[Option<i64>], index: usize) -> Option<Option<f64>>
    where
        T: Copy + Into<f64>,
    {
        let (start, length) = self.window.window(offsets, index, samples.len())?;
        Some(integrate(samples, start, length, self.stride, self.threshold))
    }
}

/// Sums every `stride`-th sample of `[start, start + length)`. Indices outside the
/// sample buffer are skipped. Returns None when the sum is strictly below `threshold`.
pub fn integrate<T>(samples: &[T], start: i64, length: i64, stride: usize, threshold: f64) -> Option<f64>
where
    T: Copy + Into<f64>,
{
    let stride = stride.max(1);
    let end = start.saturating_add(length.max(0));

    // clip to the buffer, keeping the stride phase anchored at `start`
    let first = if start < 0 {
        let behind = start.unsigned_abs();
        let steps = behind.div_ceil(stride as u64);
        start + (steps * stride as u64) as i64
    } else {
        start
    };
    let last = end.min(samples.len() as i64);

    let mut sum = 0.0;
    if first < last {
        sum = samples[first as usize..last as usize]
            .iter()
            .step_by(stride)
            .map(|&s| Into::<f64>::into(s))
            .sum();
    }

    if sum < threshold { None } else { Some(sum) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stride_two_skips_timing_samples() {
        let samples: [i16; 6] = [1, 100, 2, 200, 3, 300];
        assert_eq!(integrate(&samples, 0, 6, 2, 0.0), Some(6.0));
    }

    #[test]
    fn test_stride_one_sums_everything() {
        let samples: [i16; 4] = [1, 2, 3, 4];
        assert_eq!(integrate(&samples, 0, 4, 1, 0.0), Some(10.0));
    }

    #[test]
    fn test_empty_window_is_zero() {
        let samples: [i16; 4] = [1, 2, 3, 4];
        assert_eq!(integrate(&samples, 2, 0, 2, 0.0), Some(0.0));
        assert_eq!(integrate(&samples, 10, 50, 2, 0.0), Some(0.0));
        assert_eq!(integrate::<i16>(&[], 0, 10, 1, 0.0), Some(0.0));
        // below any positive threshold
        assert_eq!(integrate(&samples, 10, 50, 2, 1.0), None);
    }

    #[test]
    fn test_negative_start_keeps_phase() {
        let samples: [i16; 6] = [1, 100, 2, 200, 3, 300];
        // -2, 0, 2, 4 -> only 0, 2, 4 are in range
        assert_eq!(integrate(&samples, -2, 8, 2, 0.0), Some(6.0));
        // -1, 1, 3, 5 -> timing samples
        assert_eq!(integrate(&samples, -1, 8, 2, 0.0), Some(600.0));
    }

    #[test]
    fn test_truncated_window() {
        let samples: [i16; 5] = [1, 0, 2, 0, 3];
        assert_eq!(integrate(&samples, 2, 100, 2, 0.0), Some(5.0));
    }

    #[test]
    fn test_threshold_gate() {
        let samples: [i16; 4] = [5, 0, 5, 0];
        assert_eq!(integrate(&samples, 0, 4, 2, 10.0), Some(10.0));
        assert_eq!(integrate(&samples, 0, 4, 2, 10.5), None);
    }

    #[test]
    fn test_fixed_offset_window() {
        let strategy = WindowStrategy::default();
        assert_eq!(strategy.window(&[Some(0), Some(400)], 1, 1000), Some((500, 100)));
        assert_eq!(strategy.window(&[Some(0), Some(400)], 2, 1000), None);
        assert_eq!(strategy.window(&[None, Some(400)], 0, 1000), None);
    }

    #[test]
    fn test_gap_window() {
        let strategy = WindowStrategy::InterChannelGap;
        let offsets = [Some(0), Some(10), Some(25)];
        assert_eq!(strategy.window(&offsets, 0, 40), Some((0, 10)));
        assert_eq!(strategy.window(&offsets, 2, 40), Some((25, 15)));
        // offsets going backwards give an empty window
        assert_eq!(strategy.window(&[Some(10), Some(5)], 0, 40), Some((10, 0)));
        // the window cannot be closed without the next offset
        assert_eq!(strategy.window(&[Some(0), None, Some(25)], 0, 40), None);
    }

    #[test]
    fn test_integrate_channel() {
        let params = IntegrationParams {
            window: WindowStrategy::InterChannelGap,
            stride: 1,
            threshold: 0.0,
        };
        let samples: [i16; 6] = [1, 1, 2, 2, 2, 3];
        let offsets = [Some(0), Some(2), Some(5)];
        assert_eq!(params.integrate_channel(&samples, &offsets, 1), Some(Some(6.0)));
        assert_eq!(params.integrate_channel(&samples, &offsets, 2), Some(Some(3.0)));
        assert_eq!(params.integrate_channel(&samples, &offsets, 3), None);
    }
}
