//! Projects floating intensities onto a fixed sampling plane.
//!
//! Every output pixel goes fixed index -> fixed patient space -> floating
//! patient space -> floating index, then is interpolated. Samples that leave
//! the floating volume get the configured fill value.
pub mod cache;
pub mod interpolation;

use rayon::prelude::*;
use serde::Deserialize;

use crate::error::Result;
use crate::fusion::FusionMode;
use crate::geometry::FrameGeometry;
use crate::task::CancellationToken;
use crate::transform::RegistrationTransform;
use crate::volume::{Volume, VolumeGrid};

pub use cache::{ResampleEngine, ResampleKey};
pub use interpolation::Interpolation;

/// Value used for samples outside the floating volume.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FillPolicy {
    /// The floating volume's minimum intensity.
    #[default]
    Minimum,
    Zero,
    Constant(f32),
}

impl FillPolicy {
    /// `minimum` is the floating volume's minimum intensity, computed once
    /// per pair by the caller.
    pub fn value(&self, minimum: f32) -> f32 {
        match self {
            FillPolicy::Minimum if minimum.is_finite() => minimum,
            FillPolicy::Minimum | FillPolicy::Zero => 0.0,
            FillPolicy::Constant(v) => *v,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ResampleConfig {
    pub interpolation: Interpolation,
    pub fill: FillPolicy,
    /// Sampling mode a new session starts in.
    pub mode: FusionMode,
}

impl Default for ResampleConfig {
    fn default() -> Self {
        Self {
            interpolation: Interpolation::Linear,
            fill: FillPolicy::Minimum,
            mode: FusionMode::ThreeD,
        }
    }
}

/// A 2D intensity array, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct Slice2D {
    pub rows: usize,
    pub columns: usize,
    pub data: Vec<f32>,
}

impl Slice2D {
    pub fn new(rows: usize, columns: usize, data: Vec<f32>) -> Self {
        assert_eq!(data.len(), rows * columns, "slice buffer does not match {}x{}", rows, columns);
        Self { rows, columns, data }
    }

    pub fn filled(rows: usize, columns: usize, value: f32) -> Self {
        Self::new(rows, columns, vec![value; rows * columns])
    }

    pub fn value(&self, column: usize, row: usize) -> f32 {
        self.data[row * self.columns + column]
    }
}

/// Where floating intensities are read from.
#[derive(Debug, Clone, Copy)]
pub enum FloatingSource<'a> {
    /// Regular grid, trilinear (3D mode).
    Grid(&'a VolumeGrid),
    /// Nearest frame, bilinear in-plane (2D mode).
    Frames(&'a Volume),
}

impl FloatingSource<'_> {
    pub fn sample(
        &self,
        point: &nalgebra::Point3<f64>,
        interpolation: Interpolation,
    ) -> Option<f32> {
        match self {
            FloatingSource::Grid(grid) => grid.sample(point, interpolation),
            FloatingSource::Frames(volume) => volume.sample_2d(point, interpolation),
        }
    }
}

/// Resamples `source` onto `plane` (shape `plane.rows × plane.columns`).
pub fn resample_slice(
    plane: &FrameGeometry,
    source: FloatingSource<'_>,
    transform: &RegistrationTransform,
    interpolation: Interpolation,
    fill: f32,
) -> Slice2D {
    let columns = plane.columns;
    let mut data = vec![fill; plane.pixel_count()];
    data.par_chunks_mut(columns.max(1))
        .enumerate()
        .for_each(|(row, out)| {
            for (column, value) in out.iter_mut().enumerate() {
                let fixed_point = plane.pixel_to_patient(column as f64, row as f64, 0.0);
                let floating_point = transform.map_to_floating(&fixed_point);
                if let Some(v) = source.sample(&floating_point, interpolation) {
                    *value = v;
                }
            }
        });
    Slice2D::new(plane.rows, columns, data)
}

/// Resamples the floating volume onto every axial plane of `fixed`.
///
/// Checks `cancel` before each plane; a cancelled run returns
/// `Err(Cancelled)` and nothing else.
pub fn resample_volume(
    fixed: &VolumeGrid,
    source: FloatingSource<'_>,
    transform: &RegistrationTransform,
    interpolation: Interpolation,
    fill: f32,
    cancel: &CancellationToken,
) -> Result<Vec<Slice2D>> {
    (0..fixed.slices)
        .into_par_iter()
        .map(|k| {
            cancel.check()?;
            let plane = fixed.plane_geometry(crate::volume::ViewOrientation::Axial, k)?;
            Ok(resample_slice(&plane, source, transform, interpolation, fill))
        })
        .collect()
}
