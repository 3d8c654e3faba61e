use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

use super::histogram::Histogram;

/// Histograms with this many entries or fewer are not fitted.
pub const MIN_FIT_ENTRIES: u64 = 10;

// half width of the fit region around the tallest bin, in units of the sigma
// estimated from the peak's FWHM
const FIT_WINDOW: f64 = 2.0;
const FWHM_TO_SIGMA: f64 = 2.354_820_045;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GaussianFit {
    pub amplitude: f64,
    pub mean: f64,
    pub sigma: f64,
}

/// Fits a single Gaussian to the peak of a histogram.
///
/// The log of the bin contents is fitted with a parabola, weighting each bin by its
/// squared content, over the non-empty bins near the tallest bin. Returns None for
/// sparse histograms, fewer than three usable bins, or a parabola that does not
/// open downwards.
pub fn fit_peak(histogram: &Histogram) -> Option<GaussianFit> {
    if histogram.integral() <= MIN_FIT_ENTRIES {
        return None;
    }

    let (peak_index, &peak_count) = histogram
        .bins
        .iter()
        .enumerate()
        .max_by_key(|(_, count)| **count)?;
    let centers = histogram.get_bin_centers();
    let peak = centers[peak_index];

    // width of the run of bins at or above half maximum
    let half = peak_count as f64 / 2.0;
    let above_half = |index: usize| histogram.bins[index] as f64 >= half;
    let mut low = peak_index;
    while low > 0 && above_half(low - 1) {
        low -= 1;
    }
    let mut high = peak_index;
    while high + 1 < histogram.bins.len() && above_half(high + 1) {
        high += 1;
    }
    let scale = (high - low + 1) as f64 * histogram.bin_width() / FWHM_TO_SIGMA;
    if scale <= 0.0 {
        return None;
    }

    let mut normal = Matrix3::<f64>::zeros();
    let mut rhs = Vector3::<f64>::zeros();
    let mut points = 0;
    for (&x, &count) in centers.iter().zip(histogram.bins.iter()) {
        let u = (x - peak) / scale;
        if count == 0 || u.abs() > FIT_WINDOW {
            continue;
        }
        let y = count as f64;
        let basis = Vector3::new(1.0, u, u * u);
        let weight = y * y;
        normal += weight * basis * basis.transpose();
        rhs += weight * y.ln() * basis;
        points += 1;
    }
    if points < 3 {
        log::debug!("{}: only {points} bins around the peak, no fit", histogram.name);
        return None;
    }

    let solved = normal.lu().solve(&rhs)?;
    let (a, b, c) = (solved[0], solved[1], solved[2]);
    if !c.is_finite() || c >= 0.0 {
        return None;
    }

    let fit = GaussianFit {
        amplitude: (a - b * b / (4.0 * c)).exp(),
        mean: peak - scale * b / (2.0 * c),
        sigma: scale * (-0.5 / c).sqrt(),
    };
    (fit.mean.is_finite() && fit.sigma.is_finite()).then_some(fit)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill_gaussian(hist: &mut Histogram, height: f64, mean: f64, sigma: f64) {
        for x in hist.get_bin_centers() {
            let count = (height * (-(x - mean).powi(2) / (2.0 * sigma * sigma)).exp()).round();
            for _ in 0..count as u64 {
                hist.fill(x);
            }
        }
    }

    #[test]
    fn test_fit_recovers_peak() {
        let mut hist = Histogram::new("hCal_G13", 100, (0.0, 100.0));
        fill_gaussian(&mut hist, 1000.0, 50.5, 5.0);
        let fit = fit_peak(&hist).unwrap();
        assert!((fit.mean - 50.5).abs() < 0.1, "mean {}", fit.mean);
        assert!((fit.sigma - 5.0).abs() < 0.1, "sigma {}", fit.sigma);
        assert!((fit.amplitude - 1000.0).abs() < 10.0, "amplitude {}", fit.amplitude);
    }

    #[test]
    fn test_fit_ignores_far_tail() {
        let mut hist = Histogram::new("hCal_G10", 100, (0.0, 100.0));
        fill_gaussian(&mut hist, 1000.0, 40.5, 4.0);
        for x in 80..100 {
            for _ in 0..150 {
                hist.fill(f64::from(x) + 0.5);
            }
        }
        let fit = fit_peak(&hist).unwrap();
        assert!(hist.mean() > 48.0, "bin mean {}", hist.mean());
        assert!((fit.mean - 40.5).abs() < 0.2, "mean {}", fit.mean);
    }

    #[test]
    fn test_sparse_histograms_are_not_fitted() {
        let mut hist = Histogram::new("h", 10, (0.0, 10.0));
        for _ in 0..MIN_FIT_ENTRIES {
            hist.fill(4.5);
        }
        assert!(fit_peak(&hist).is_none());
        // one populated bin cannot constrain a parabola
        hist.fill(4.5);
        assert!(fit_peak(&hist).is_none());
    }
}
