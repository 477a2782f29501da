//! Mutual information between fixed samples and the floating volume.
//!
//! MI(F, M) = H(F) + H(M) - H(F, M), estimated from a joint histogram in
//! which every sample is splatted bilinearly onto its four neighbouring bins
//! (partial-volume estimation) so the value changes smoothly with the
//! transform.
use nalgebra::{Matrix4, Point3};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;

use crate::resample::{FloatingSource, Interpolation};

/// A fixed-volume sample: position in fixed patient space and intensity.
#[derive(Debug, Clone, Copy)]
pub struct FixedSample {
    pub point: Point3<f64>,
    pub value: f32,
}

/// Picks `fraction` of `total` indices (at most `max`, at least one),
/// deterministically for a given seed. Sorted ascending.
pub fn choose_indices(total: usize, fraction: f64, max: usize, seed: u64) -> Vec<usize> {
    if total == 0 {
        return Vec::new();
    }
    let wanted = ((total as f64 * fraction).round() as usize).clamp(1, max.max(1));
    if wanted >= total {
        return (0..total).collect();
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let mut picked = rand::seq::index::sample(&mut rng, total, wanted).into_vec();
    picked.sort_unstable();
    picked
}

#[derive(Debug, Clone)]
pub struct JointHistogram {
    bins: usize,
    counts: Vec<f64>,
    total: f64,
}

impl JointHistogram {
    pub fn new(bins: usize) -> Self {
        Self {
            bins,
            counts: vec![0.0; bins * bins],
            total: 0.0,
        }
    }

    /// Adds a pair of intensities already scaled to `[0, bins - 1]`.
    pub fn add(&mut self, fixed_bin: f64, floating_bin: f64) {
        let last = (self.bins - 1) as f64;
        let f = fixed_bin.clamp(0.0, last);
        let m = floating_bin.clamp(0.0, last);
        let (f0, m0) = (f.floor() as usize, m.floor() as usize);
        let (f1, m1) = ((f0 + 1).min(self.bins - 1), (m0 + 1).min(self.bins - 1));
        let (tf, tm) = (f - f0 as f64, m - m0 as f64);
        self.counts[f0 * self.bins + m0] += (1.0 - tf) * (1.0 - tm);
        self.counts[f0 * self.bins + m1] += (1.0 - tf) * tm;
        self.counts[f1 * self.bins + m0] += tf * (1.0 - tm);
        self.counts[f1 * self.bins + m1] += tf * tm;
        self.total += 1.0;
    }

    /// Mutual information in nats.
    pub fn mutual_information(&self) -> f64 {
        if self.total <= 0.0 {
            return 0.0;
        }
        let n = self.bins;
        let mut fixed_marginal = vec![0.0; n];
        let mut floating_marginal = vec![0.0; n];
        for i in 0..n {
            for j in 0..n {
                let p = self.counts[i * n + j] / self.total;
                fixed_marginal[i] += p;
                floating_marginal[j] += p;
            }
        }
        let mut mi = 0.0;
        for i in 0..n {
            for j in 0..n {
                let p = self.counts[i * n + j] / self.total;
                if p > 1e-12 {
                    mi += p * (p / (fixed_marginal[i] * floating_marginal[j])).ln();
                }
            }
        }
        mi.max(0.0)
    }
}

/// Maps an intensity range onto histogram bin coordinates.
#[derive(Debug, Clone, Copy)]
struct BinScale {
    min: f64,
    scale: f64,
}

impl BinScale {
    fn new(min: f32, max: f32, bins: usize) -> Self {
        let range = (max - min) as f64;
        let scale = if range > 0.0 {
            (bins - 1) as f64 / range
        } else {
            0.0
        };
        Self {
            min: min as f64,
            scale,
        }
    }

    fn bin(&self, value: f32) -> f64 {
        (value as f64 - self.min) * self.scale
    }
}

/// Why a candidate could not be scored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalError {
    NoOverlap,
    Singular,
}

/// Scores candidate fixed -> floating matrices against a fixed sample set.
pub struct MutualInformationMetric<'a> {
    samples: Vec<FixedSample>,
    source: FloatingSource<'a>,
    bins: usize,
    fixed_scale: BinScale,
    floating_scale: BinScale,
    min_overlap: usize,
}

impl<'a> MutualInformationMetric<'a> {
    pub fn new(
        samples: Vec<FixedSample>,
        source: FloatingSource<'a>,
        floating_range: (f32, f32),
        bins: usize,
        min_overlap_fraction: f64,
    ) -> Self {
        let bins = bins.max(2);
        let (fixed_min, fixed_max) = samples
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), s| {
                (lo.min(s.value), hi.max(s.value))
            });
        let min_overlap = ((samples.len() as f64 * min_overlap_fraction).ceil() as usize).max(1);
        Self {
            fixed_scale: BinScale::new(fixed_min, fixed_max, bins),
            floating_scale: BinScale::new(floating_range.0, floating_range.1, bins),
            samples,
            source,
            bins,
            min_overlap,
        }
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Number of samples that land inside the floating volume.
    pub fn overlap(&self, to_floating: &Matrix4<f64>) -> usize {
        self.samples
            .par_iter()
            .filter(|s| {
                self.source
                    .sample(&to_floating.transform_point(&s.point), Interpolation::Linear)
                    .is_some()
            })
            .count()
    }

    pub fn mutual_information(&self, to_floating: &Matrix4<f64>) -> Result<f64, EvalError> {
        if !to_floating.iter().all(|v| v.is_finite()) {
            return Err(EvalError::Singular);
        }
        let pairs: Vec<(f64, f64)> = self
            .samples
            .par_iter()
            .filter_map(|s| {
                let q = to_floating.transform_point(&s.point);
                self.source
                    .sample(&q, Interpolation::Linear)
                    .map(|v| (self.fixed_scale.bin(s.value), self.floating_scale.bin(v)))
            })
            .collect();
        if pairs.len() < self.min_overlap {
            return Err(EvalError::NoOverlap);
        }
        let mut histogram = JointHistogram::new(self.bins);
        for (f, m) in pairs {
            histogram.add(f, m);
        }
        Ok(histogram.mutual_information())
    }

    /// Cost for the optimiser (lower is better).
    pub fn cost(&self, to_floating: &Matrix4<f64>) -> Result<f64, EvalError> {
        self.mutual_information(to_floating).map(|mi| -mi)
    }
}

#[cfg(test)]
mod metric_tests {
    use super::*;
    use crate::utils::test_utils::blob_volume;
    use approx::assert_relative_eq;

    #[test]
    fn test_choose_indices_is_deterministic() {
        let a = choose_indices(1000, 0.1, 10_000, 42);
        let b = choose_indices(1000, 0.1, 10_000, 42);
        assert_eq!(a.len(), 100);
        assert_eq!(a, b);
        assert!(a.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(choose_indices(10, 1.0, 100, 0), (0..10).collect::<Vec<_>>());
        assert_eq!(choose_indices(1000, 0.5, 20, 0).len(), 20);
    }

    #[test]
    fn test_mi_of_independent_and_dependent_pairs() {
        // perfectly dependent: f == m across 4 bins
        let mut dependent = JointHistogram::new(4);
        for i in 0..400 {
            let b = (i % 4) as f64;
            dependent.add(b, b);
        }
        assert_relative_eq!(dependent.mutual_information(), 4.0f64.ln(), epsilon = 1e-9);

        // independent: every combination equally likely
        let mut independent = JointHistogram::new(4);
        for i in 0..4 {
            for j in 0..4 {
                independent.add(i as f64, j as f64);
            }
        }
        assert_relative_eq!(independent.mutual_information(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_mi_peaks_at_alignment_for_inverted_contrast() {
        let fixed = blob_volume("a", 20, 2.0, Point3::new(0.0, 0.0, 0.0), 100.0, 0.0);
        // same object with inverted intensities
        let floating = blob_volume("b", 20, 2.0, Point3::new(0.0, 0.0, 0.0), -30.0, 50.0);
        let fixed_grid = fixed.grid().unwrap();
        let floating_grid = floating.grid().unwrap();
        let samples: Vec<FixedSample> = choose_indices(fixed_grid.voxels().len(), 0.3, 50_000, 1)
            .into_iter()
            .map(|i| {
                let (nc, nr, _) = fixed_grid.dims();
                let (c, r, k) = (i % nc, (i / nc) % nr, i / (nc * nr));
                FixedSample {
                    point: fixed_grid.geometry.pixel_to_patient(c as f64, r as f64, k as f64),
                    value: fixed_grid.value(c, r, k),
                }
            })
            .collect();
        let metric = MutualInformationMetric::new(
            samples,
            FloatingSource::Grid(&floating_grid),
            floating_grid.min_max(),
            32,
            0.2,
        );
        let aligned = metric.mutual_information(&Matrix4::identity()).unwrap();
        let shifted = metric
            .mutual_information(&Matrix4::new_translation(&nalgebra::Vector3::new(6.0, 0.0, 0.0)))
            .unwrap();
        assert!(aligned > shifted, "aligned {} vs shifted {}", aligned, shifted);

        let far = Matrix4::new_translation(&nalgebra::Vector3::new(1000.0, 0.0, 0.0));
        assert_eq!(metric.mutual_information(&far), Err(EvalError::NoOverlap));
        assert_eq!(metric.overlap(&far), 0);
    }
}
