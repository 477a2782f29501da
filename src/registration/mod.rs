//! Intensity-based registration of a floating volume onto a fixed volume.
//!
//! Mutual information is maximised by regular-step gradient descent over a
//! coarse-to-fine pyramid. The result is the fixed -> floating sampling
//! transform consumed by the resampler.
pub mod metric;
pub mod optimizer;
pub mod pyramid;

use nalgebra::{Point3, Vector3};
use serde::Deserialize;

use crate::error::{FailureReason, FusionError, Result};
use crate::task::CancellationToken;
use crate::transform::{sampling_matrix, RegistrationTransform, TransformKind};
use crate::volume::{Volume, VolumeGrid};
use crate::resample::FloatingSource;

use metric::{choose_indices, EvalError, FixedSample, MutualInformationMetric};
use optimizer::{minimize, OptimizerSettings, StopReason};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RegistrationMode {
    /// Rigid, coarsest level only, floating volume sampled per frame.
    Fast,
    /// Configured transform kind over every pyramid level, 3D grids.
    #[default]
    Accurate,
}

/// How the optimiser's starting translation is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InitialAlignment {
    /// Match intensity-weighted centroids.
    #[default]
    Centroid,
    /// Match the centres of the two fields of view.
    GeometricCenter,
    None,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RegistrationConfig {
    pub default_mode: RegistrationMode,
    pub transform: TransformKind,
    pub levels: usize,
    pub max_iterations: usize,
    pub histogram_bins: usize,
    pub sampling_fraction: f64,
    pub max_samples: usize,
    pub min_overlap_fraction: f64,
    pub convergence_window: usize,
    pub min_improvement: f64,
    pub initial_step: f64,
    pub min_step: f64,
    pub relaxation: f64,
    pub fd_step: f64,
    pub initial_alignment: InitialAlignment,
    pub seed: u64,
}

/// Deepest pyramid accepted; the coarsest level is shrunk by `2^(levels-1)`.
pub const MAX_LEVELS: usize = 8;

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            default_mode: RegistrationMode::Accurate,
            transform: TransformKind::Rigid,
            levels: 3,
            max_iterations: 100,
            histogram_bins: 32,
            sampling_fraction: 0.2,
            max_samples: 20_000,
            min_overlap_fraction: 0.25,
            convergence_window: 8,
            min_improvement: 1e-5,
            initial_step: 2.0,
            min_step: 0.01,
            relaxation: 0.5,
            fd_step: 0.5,
            initial_alignment: InitialAlignment::Centroid,
            seed: 0x5eed,
        }
    }
}

impl RegistrationConfig {
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(FusionError::Config(msg.to_string()));
        if self.levels == 0 || self.levels > MAX_LEVELS {
            return fail("registration.levels must be between 1 and 8");
        }
        if self.histogram_bins < 2 {
            return fail("registration.histogram_bins must be at least 2");
        }
        if !(self.sampling_fraction > 0.0 && self.sampling_fraction <= 1.0) {
            return fail("registration.sampling_fraction must be in (0, 1]");
        }
        if !(0.0..=1.0).contains(&self.min_overlap_fraction) {
            return fail("registration.min_overlap_fraction must be in [0, 1]");
        }
        if !(self.relaxation > 0.0 && self.relaxation < 1.0) {
            return fail("registration.relaxation must be in (0, 1)");
        }
        if !(self.initial_step > 0.0 && self.min_step > 0.0 && self.fd_step > 0.0) {
            return fail("registration step lengths must be positive");
        }
        Ok(())
    }

    /// Optimiser settings for a level with the given shrink factor. Step
    /// lengths grow with the voxel size of the level.
    fn optimizer_settings(&self, factor: usize) -> OptimizerSettings {
        let factor = factor.max(1) as f64;
        OptimizerSettings {
            initial_step: self.initial_step * factor,
            min_step: self.min_step,
            relaxation: self.relaxation,
            max_iterations: self.max_iterations,
            convergence_window: self.convergence_window,
            min_improvement: self.min_improvement,
            fd_step: self.fd_step * factor,
        }
    }
}

/// Progress of one pyramid level.
#[derive(Debug, Clone, PartialEq)]
pub struct LevelLog {
    pub level: usize,
    pub shrink_factor: usize,
    pub samples: usize,
    pub iterations: usize,
    pub metric: f64,
    pub stop: StopReason,
}

#[derive(Debug, Clone)]
pub struct RegistrationOutcome {
    pub transform: RegistrationTransform,
    /// Mutual information (nats) at the final parameters, finest level.
    pub metric: f64,
    pub levels: Vec<LevelLog>,
    pub mode: RegistrationMode,
}

fn intensity_range(volume: &Volume) -> (f32, f32) {
    volume
        .frames()
        .iter()
        .flat_map(|f| f.pixels.iter().copied())
        .filter(|v| v.is_finite())
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| {
            (lo.min(v), hi.max(v))
        })
}

fn grid_samples(grid: &VolumeGrid, fraction: f64, max: usize, seed: u64) -> Vec<FixedSample> {
    let (nc, nr, _) = grid.dims();
    choose_indices(grid.voxels().len(), fraction, max, seed)
        .into_iter()
        .map(|i| {
            let (c, r, k) = (i % nc, (i / nc) % nr, i / (nc * nr));
            FixedSample {
                point: grid.geometry.pixel_to_patient(c as f64, r as f64, k as f64),
                value: grid.voxels()[i],
            }
        })
        .collect()
}

/// In-plane strided samples from every frame; frames need not be regular.
fn frame_samples(
    volume: &Volume,
    stride: usize,
    fraction: f64,
    max: usize,
    seed: u64,
) -> Vec<FixedSample> {
    let stride = stride.max(1);
    let candidates: Vec<FixedSample> = volume
        .frames()
        .iter()
        .flat_map(|frame| {
            let g = &frame.geometry;
            (0..g.rows).step_by(stride).flat_map(move |r| {
                (0..g.columns).step_by(stride).map(move |c| FixedSample {
                    point: g.pixel_to_patient(c as f64, r as f64, 0.0),
                    value: frame.value(c, r),
                })
            })
        })
        .collect();
    choose_indices(candidates.len(), fraction, max, seed)
        .into_iter()
        .map(|i| candidates[i])
        .collect()
}

/// Starting translation in the sampling direction (fixed -> floating).
fn initial_translation(
    fixed: &Volume,
    floating: &Volume,
    alignment: InitialAlignment,
) -> Vector3<f64> {
    match alignment {
        InitialAlignment::None => Vector3::zeros(),
        InitialAlignment::GeometricCenter => floating.center() - fixed.center(),
        InitialAlignment::Centroid => {
            match (fixed.intensity_centroid(), floating.intensity_centroid()) {
                (Some(a), Some(b)) => b - a,
                _ => {
                    tracing::debug!("flat volume, falling back to geometric centre alignment");
                    floating.center() - fixed.center()
                }
            }
        }
    }
}

fn initial_parameters(kind: TransformKind, translation: &Vector3<f64>) -> Vec<f64> {
    let mut params = vec![0.0; kind.parameter_count()];
    let n = params.len();
    if n >= 3 {
        params[n - 3..].copy_from_slice(translation.as_slice());
    }
    params
}

/// Rotation and matrix parameters move points by about `radius` mm per unit;
/// translations are already in mm.
fn parameter_scales(kind: TransformKind, radius: f64) -> Vec<f64> {
    let n = kind.parameter_count();
    let radius = radius.max(1.0);
    (0..n)
        .map(|i| if i + 3 < n { radius } else { 1.0 })
        .collect()
}

fn cost(
    metric: &MutualInformationMetric<'_>,
    kind: TransformKind,
    center: &Point3<f64>,
    params: &[f64],
) -> std::result::Result<f64, EvalError> {
    let matrix = sampling_matrix(kind, params, center).map_err(|_| EvalError::Singular)?;
    metric.cost(&matrix)
}

/// Registers `floating` onto `fixed`.
///
/// Both volumes are only read; callers snapshot them before starting.
/// `cancel` is checked between levels and between optimiser iterations.
pub fn register(
    fixed: &Volume,
    floating: &Volume,
    mode: RegistrationMode,
    config: &RegistrationConfig,
    cancel: &CancellationToken,
) -> Result<RegistrationOutcome> {
    config.validate()?;
    cancel.check()?;

    let kind = match mode {
        RegistrationMode::Fast => TransformKind::Rigid,
        RegistrationMode::Accurate => config.transform,
    };
    let center = fixed.center();
    let scales = parameter_scales(kind, fixed.radius());
    let translation = initial_translation(fixed, floating, config.initial_alignment);
    let mut params = initial_parameters(kind, &translation);
    tracing::info!(
        "registration ({:?}, {:?}) starting, initial translation ({:.2}, {:.2}, {:.2}) mm",
        mode,
        kind,
        translation.x,
        translation.y,
        translation.z
    );

    let factors = pyramid::shrink_factors(config.levels);
    let mut levels = Vec::new();
    let mut final_metric = 0.0;

    match mode {
        RegistrationMode::Fast => {
            let factor = factors[0];
            let samples = frame_samples(
                fixed,
                factor,
                config.sampling_fraction,
                config.max_samples,
                config.seed,
            );
            let metric = MutualInformationMetric::new(
                samples,
                FloatingSource::Frames(floating),
                intensity_range(floating),
                config.histogram_bins,
                config.min_overlap_fraction,
            );
            let optimum = minimize(
                |p: &[f64]| cost(&metric, kind, &center, p),
                &params,
                &scales,
                &config.optimizer_settings(factor),
                cancel,
            )?;
            params = optimum.params;
            final_metric = -optimum.value;
            levels.push(LevelLog {
                level: 0,
                shrink_factor: factor,
                samples: metric.sample_count(),
                iterations: optimum.iterations,
                metric: final_metric,
                stop: optimum.stop,
            });
        }
        RegistrationMode::Accurate => {
            let incompatible = |e: FusionError| {
                tracing::warn!("accurate registration needs regular volumes: {}", e);
                FusionError::registration(FailureReason::IncompatibleVolume)
            };
            let fixed_grid = fixed.grid().map_err(incompatible)?;
            let floating_grid = floating.grid().map_err(incompatible)?;
            let fixed_levels = pyramid::build_pyramid(&fixed_grid, config.levels);
            let floating_levels = pyramid::build_pyramid(&floating_grid, config.levels);

            for (level, factor) in factors.iter().copied().enumerate() {
                cancel.check()?;
                let fixed_level = &fixed_levels[level];
                let floating_level = &floating_levels[level];
                let samples = grid_samples(
                    fixed_level,
                    config.sampling_fraction,
                    config.max_samples,
                    config.seed.wrapping_add(level as u64),
                );
                let metric = MutualInformationMetric::new(
                    samples,
                    FloatingSource::Grid(floating_level),
                    floating_level.min_max(),
                    config.histogram_bins,
                    config.min_overlap_fraction,
                );
                let optimum = minimize(
                    |p: &[f64]| cost(&metric, kind, &center, p),
                    &params,
                    &scales,
                    &config.optimizer_settings(factor),
                    cancel,
                )?;
                params = optimum.params;
                final_metric = -optimum.value;
                tracing::debug!(
                    "level {} (x{}) finished after {} iterations: MI {:.4} ({})",
                    level,
                    factor,
                    optimum.iterations,
                    final_metric,
                    optimum.stop
                );
                levels.push(LevelLog {
                    level,
                    shrink_factor: factor,
                    samples: metric.sample_count(),
                    iterations: optimum.iterations,
                    metric: final_metric,
                    stop: optimum.stop,
                });
            }
        }
    }

    cancel.check()?;
    let transform = RegistrationTransform::from_parameters(kind, &params, &center)
        .map_err(|_| FusionError::registration(FailureReason::SingularStep))?;
    tracing::info!("registration finished\n{}", level_table(&levels));

    Ok(RegistrationOutcome {
        transform,
        metric: final_metric,
        levels,
        mode,
    })
}

/// Mutual information of the pair under `transform`, sampled the way the
/// finest accurate level samples it.
pub fn evaluate_mutual_information(
    fixed: &Volume,
    floating: &Volume,
    transform: &RegistrationTransform,
    config: &RegistrationConfig,
) -> Result<f64> {
    let fixed_grid = fixed.grid()?;
    let floating_grid = floating.grid()?;
    let samples = grid_samples(
        &fixed_grid,
        config.sampling_fraction,
        config.max_samples,
        config.seed.wrapping_add(config.levels.saturating_sub(1) as u64),
    );
    let metric = MutualInformationMetric::new(
        samples,
        FloatingSource::Grid(&floating_grid),
        floating_grid.min_max(),
        config.histogram_bins,
        config.min_overlap_fraction,
    );
    metric
        .mutual_information(transform.to_floating_matrix())
        .map_err(|e| match e {
            EvalError::NoOverlap => FusionError::registration(FailureReason::InsufficientOverlap),
            EvalError::Singular => FusionError::registration(FailureReason::SingularStep),
        })
}

/// Renders the per-level log as a fixed-width table.
pub fn level_table(levels: &[LevelLog]) -> String {
    let headers = ["Level", "Shrink", "Samples", "Iterations", "MI", "Stop"];
    let rows: Vec<[String; 6]> = levels
        .iter()
        .map(|l| {
            [
                l.level.to_string(),
                format!("x{}", l.shrink_factor),
                l.samples.to_string(),
                l.iterations.to_string(),
                format!("{:.4}", l.metric),
                l.stop.to_string(),
            ]
        })
        .collect();

    let mut widths = headers.map(str::len);
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            widths[i] = widths[i].max(cell.len());
        }
    }

    let line = |cells: &[String]| {
        let inner: Vec<String> = cells
            .iter()
            .zip(widths.iter())
            .map(|(c, w)| format!(" {:<width$} ", c, width = w))
            .collect();
        format!("|{}|", inner.join("|"))
    };
    let separator = format!(
        "+{}+",
        widths
            .iter()
            .map(|w| "-".repeat(w + 2))
            .collect::<Vec<_>>()
            .join("+")
    );

    let mut out = vec![
        separator.clone(),
        line(&headers.map(String::from)[..]),
        separator.clone(),
    ];
    out.extend(rows.iter().map(|r| line(&r[..])));
    out.push(separator);
    out.join("\n")
}
