//! Gaussian kernel density estimate for completion-time distributions.

use serde::Serialize;

/// Density curve sampled on an evenly spaced grid.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct KdeCurve {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
}

impl KdeCurve {
    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    pub fn points(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.x.iter().copied().zip(self.y.iter().copied())
    }
}

/// Silverman's rule of thumb, `std * n^-0.2`, with the population standard
/// deviation. `None` when there are no samples or no spread.
pub fn silverman_bandwidth(samples: &[f64]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    let n = samples.len() as f64;
    let mean = samples.iter().sum::<f64>() / n;
    let variance = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;
    let bandwidth = variance.sqrt() * n.powf(-0.2);
    (bandwidth.is_finite() && bandwidth > 0.0).then_some(bandwidth)
}

/// Evaluates the density at `resolution + 1` points spanning the sample
/// range. Empty, non-finite or zero-spread input yields an empty curve.
pub fn compute_kde(samples: &[f64], resolution: usize) -> KdeCurve {
    let samples: Vec<f64> = samples.iter().copied().filter(|s| s.is_finite()).collect();
    let Some(bandwidth) = silverman_bandwidth(&samples) else {
        return KdeCurve::default();
    };
    let resolution = resolution.max(1);

    let min = samples.iter().copied().fold(f64::INFINITY, f64::min);
    let max = samples.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let norm = samples.len() as f64 * bandwidth * (2.0 * std::f64::consts::PI).sqrt();

    let x: Vec<f64> = (0..=resolution)
        .map(|i| min + (max - min) * i as f64 / resolution as f64)
        .collect();
    let y = x
        .iter()
        .map(|xi| {
            samples
                .iter()
                .map(|s| (-((xi - s) / bandwidth).powi(2) / 2.0).exp())
                .sum::<f64>()
                / norm
        })
        .collect();

    KdeCurve { x, y }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_spans_sample_range() {
        let curve = compute_kde(&[10.0, 12.0, 15.0, 20.0], 150);
        assert_eq!(curve.x.len(), 151);
        assert_eq!(curve.y.len(), 151);
        assert_eq!(curve.x[0], 10.0);
        assert!((curve.x[150] - 20.0).abs() < 1e-9);
        assert!(curve.y.iter().all(|y| *y > 0.0));
    }

    #[test]
    fn bandwidth_follows_silverman() {
        // mean 5, population std 2, n = 8
        let samples = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        let expected = 2.0 * 8f64.powf(-0.2);
        assert!((silverman_bandwidth(&samples).unwrap() - expected).abs() < 1e-12);
    }

    #[test]
    fn density_peaks_near_cluster() {
        let curve = compute_kde(&[10.0, 10.5, 11.0, 30.0], 100);
        let (peak_x, _) = curve
            .points()
            .fold((0.0, f64::MIN), |best, p| if p.1 > best.1 { p } else { best });
        assert!(peak_x < 15.0);
    }

    #[test]
    fn degenerate_input_gives_empty_curve() {
        assert!(compute_kde(&[], 150).is_empty());
        assert!(compute_kde(&[12.0], 150).is_empty());
        assert!(compute_kde(&[7.0, 7.0, 7.0], 150).is_empty());
    }
}
