use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Binning {
    pub bins: usize,
    pub range: (f64, f64),
}

impl Binning {
    pub const fn new(bins: usize, range: (f64, f64)) -> Self {
        Binning { bins, range }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Histogram {
    pub name: String,
    pub bins: Vec<u64>,
    pub range: (f64, f64),
    #[serde(default)]
    pub overflow: u64,
    #[serde(default)]
    pub underflow: u64,
}

impl Histogram {
    // Create a new Histogram with specified min, max, and number of bins
    pub fn new(name: &str, number_of_bins: usize, range: (f64, f64)) -> Self {
        Histogram {
            name: name.to_owned(),
            bins: vec![0; number_of_bins],
            range,
            overflow: 0,
            underflow: 0,
        }
    }

    pub fn with_binning(name: &str, binning: &Binning) -> Self {
        Self::new(name, binning.bins, binning.range)
    }

    pub fn bin_width(&self) -> f64 {
        if self.bins.is_empty() {
            0.0
        } else {
            (self.range.1 - self.range.0) / self.bins.len() as f64
        }
    }

    // Add a value to the histogram
    pub fn fill(&mut self, value: f64) {
        if value >= self.range.0 && value < self.range.1 {
            let index = ((value - self.range.0) / self.bin_width()) as usize;
            if index < self.bins.len() {
                self.bins[index] += 1;
            }
        } else if value >= self.range.1 {
            self.overflow += 1;
        } else {
            self.underflow += 1;
        }
    }

    pub fn bin_center(&self, index: usize) -> f64 {
        self.range.0 + (index as f64 * self.bin_width()) + self.bin_width() * 0.5
    }

    pub fn get_bin_centers(&self) -> Vec<f64> {
        (0..self.bins.len()).map(|i| self.bin_center(i)).collect()
    }

    /// Entries inside the range.
    pub fn integral(&self) -> u64 {
        self.bins.iter().sum()
    }

    pub fn entries(&self) -> u64 {
        self.integral() + self.overflow + self.underflow
    }

    /// Mean and standard deviation over the in-range bin centres.
    pub fn get_statistics(&self) -> (u64, f64, f64) {
        let total_count = self.integral();
        if total_count == 0 {
            return (0, 0.0, 0.0);
        }

        let sum_product: f64 = self
            .bins
            .iter()
            .enumerate()
            .map(|(bin, &count)| count as f64 * self.bin_center(bin))
            .sum();
        let mean = sum_product / total_count as f64;

        let sum_squared_diff: f64 = self
            .bins
            .iter()
            .enumerate()
            .map(|(bin, &count)| {
                let diff = self.bin_center(bin) - mean;
                count as f64 * diff * diff
            })
            .sum();

        let stdev = (sum_squared_diff / total_count as f64).sqrt();

        (total_count, mean, stdev)
    }

    pub fn mean(&self) -> f64 {
        self.get_statistics().1
    }

    /// Bin-wise sum. Histograms with a different binning are rejected.
    pub fn add(&mut self, other: &Histogram) -> bool {
        if other.bins.len() != self.bins.len() || other.range != self.range {
            log::error!(
                "Cannot add histogram '{}' to '{}': binning differs",
                other.name,
                self.name
            );
            return false;
        }
        for (a, b) in self.bins.iter_mut().zip(other.bins.iter()) {
            *a += b;
        }
        self.overflow += other.overflow;
        self.underflow += other.underflow;
        true
    }
}
