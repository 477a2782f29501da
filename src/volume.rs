use nalgebra::{Point3, Vector3};
use serde::Deserialize;

use crate::error::{FusionError, Result};
use crate::geometry::{derive_geometry, FrameGeometry, FrameTags};
use crate::resample::interpolation::{linear_axis, nearest_axis, sample_plane, Interpolation};

/// Minimum cosine between two frame normals for them to count as parallel.
const NORMAL_TOLERANCE: f64 = 1e-3;
/// Relative and absolute slack on inter-slice gaps.
const GAP_RELATIVE_TOLERANCE: f64 = 0.01;
const GAP_ABSOLUTE_TOLERANCE: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ViewOrientation {
    /// The native acquisition plane.
    #[default]
    Axial,
    Coronal,
    Sagittal,
}

/// One image frame: its geometry and row-major intensities.
#[derive(Debug, Clone)]
pub struct Frame {
    pub geometry: FrameGeometry,
    pub pixels: Vec<f32>,
}

impl Frame {
    pub fn new(geometry: FrameGeometry, pixels: Vec<f32>) -> Self {
        assert_eq!(
            pixels.len(),
            geometry.pixel_count(),
            "pixel buffer does not match {}x{} frame",
            geometry.rows,
            geometry.columns
        );
        Self { geometry, pixels }
    }

    pub fn value(&self, column: usize, row: usize) -> f32 {
        self.pixels[row * self.geometry.columns + column]
    }

    pub fn sample(&self, column: f64, row: f64, interpolation: Interpolation) -> Option<f32> {
        sample_plane(
            &self.pixels,
            self.geometry.columns,
            self.geometry.rows,
            column,
            row,
            interpolation,
        )
    }
}

/// Frames of one series sharing a frame-of-reference identifier, ordered
/// along the slice normal of the first frame.
#[derive(Debug, Clone)]
pub struct Volume {
    reference_frame_uid: String,
    frames: Vec<Frame>,
}

impl Volume {
    pub fn new(reference_frame_uid: impl Into<String>, mut frames: Vec<Frame>) -> Result<Self> {
        if frames.is_empty() {
            return Err(FusionError::invalid_geometry("volume has no frames"));
        }
        let normal = frames[0].geometry.slice_normal();
        let origin = frames[0].geometry.origin;
        frames.sort_by(|a, b| {
            let da = (a.geometry.origin - origin).dot(&normal);
            let db = (b.geometry.origin - origin).dot(&normal);
            da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(Self {
            reference_frame_uid: reference_frame_uid.into(),
            frames,
        })
    }

    /// Builds a volume from tagged frames. Every frame must carry a valid
    /// geometry and the same frame-of-reference identifier.
    pub fn from_tagged_frames(frames: Vec<(FrameTags, Vec<f32>)>) -> Result<Self> {
        let mut uid: Option<String> = None;
        let mut built = Vec::with_capacity(frames.len());
        for (tags, pixels) in frames {
            let frame_uid = tags.frame_of_reference_uid.clone().unwrap_or_default();
            match &uid {
                None => uid = Some(frame_uid),
                Some(existing) if *existing != frame_uid => {
                    return Err(FusionError::invalid_geometry(format!(
                        "mixed frame of reference identifiers ({} vs {})",
                        existing, frame_uid
                    )));
                }
                Some(_) => {}
            }
            let geometry = derive_geometry(&tags)?;
            if pixels.len() != geometry.pixel_count() {
                return Err(FusionError::invalid_geometry(format!(
                    "frame has {} pixels, geometry expects {}",
                    pixels.len(),
                    geometry.pixel_count()
                )));
            }
            built.push(Frame::new(geometry, pixels));
        }
        Self::new(uid.unwrap_or_default(), built)
    }

    pub fn reference_frame_uid(&self) -> &str {
        &self.reference_frame_uid
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn min_value(&self) -> f32 {
        self.frames
            .iter()
            .flat_map(|f| f.pixels.iter().copied())
            .filter(|v| v.is_finite())
            .fold(f32::INFINITY, f32::min)
    }

    /// Half the typical gap between neighbouring frames, used as the
    /// capture distance of a frame in 2D mode.
    pub fn slab_half_thickness(&self) -> f64 {
        let mut gaps = self.gaps();
        if !gaps.is_empty() {
            gaps.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            let median = gaps[gaps.len() / 2];
            if median > 0.0 {
                return median / 2.0;
            }
        }
        let spacing = self.frames[0].geometry.slice_spacing;
        if spacing > 0.0 {
            spacing / 2.0
        } else {
            0.5
        }
    }

    fn gaps(&self) -> Vec<f64> {
        let normal = self.frames[0].geometry.slice_normal();
        self.frames
            .windows(2)
            .map(|w| (w[1].geometry.origin - w[0].geometry.origin).dot(&normal))
            .collect()
    }

    /// Per-frame (2D) sampling: picks the frame whose plane is closest to
    /// `point` and interpolates in-plane. `None` outside every slab.
    pub fn sample_2d(&self, point: &Point3<f64>, interpolation: Interpolation) -> Option<f32> {
        let capture = self.slab_half_thickness() + 1e-6;
        let (frame, distance) = self
            .frames
            .iter()
            .map(|f| (f, f.geometry.plane_distance(point).abs()))
            .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))?;
        if distance > capture {
            return None;
        }
        let idx = frame.geometry.patient_to_pixel(point).ok()?;
        frame.sample(idx.column, idx.row, interpolation)
    }

    /// Mean of the frame centres.
    pub fn center(&self) -> Point3<f64> {
        let sum = self
            .frames
            .iter()
            .fold(Vector3::zeros(), |acc, f| acc + f.geometry.center().coords);
        Point3::from(sum / self.frames.len() as f64)
    }

    /// Half the diagonal of the covered extent (mm).
    pub fn radius(&self) -> f64 {
        let g = &self.frames[0].geometry;
        let span = self.gaps().iter().sum::<f64>().abs() + 2.0 * self.slab_half_thickness();
        Vector3::new(
            g.columns as f64 * g.col_spacing,
            g.rows as f64 * g.row_spacing,
            span,
        )
        .norm()
            / 2.0
    }

    /// Intensity-weighted centroid in patient space, weights taken above the
    /// volume minimum. `None` for a flat volume.
    pub fn intensity_centroid(&self) -> Option<Point3<f64>> {
        let lo = self.min_value();
        let mut sum = Vector3::zeros();
        let mut total = 0.0;
        for frame in &self.frames {
            let g = &frame.geometry;
            for r in 0..g.rows {
                for c in 0..g.columns {
                    let w = (frame.value(c, r) - lo) as f64;
                    if w > 0.0 && w.is_finite() {
                        sum += g.pixel_to_patient(c as f64, r as f64, 0.0).coords * w;
                        total += w;
                    }
                }
            }
        }
        if total <= 0.0 {
            return None;
        }
        Some(Point3::from(sum / total))
    }

    /// Regular 3D view of the volume, if the frames allow one.
    pub fn grid(&self) -> Result<VolumeGrid> {
        let first = &self.frames[0].geometry;
        let normal = first.slice_normal();
        let in_plane_tolerance = 0.05 * first.row_spacing.min(first.col_spacing);

        for frame in &self.frames[1..] {
            let g = &frame.geometry;
            if g.rows != first.rows || g.columns != first.columns {
                return Err(FusionError::incompatible("frames differ in matrix size"));
            }
            if (g.row_spacing - first.row_spacing).abs() > GAP_ABSOLUTE_TOLERANCE
                || (g.col_spacing - first.col_spacing).abs() > GAP_ABSOLUTE_TOLERANCE
            {
                return Err(FusionError::incompatible("frames differ in pixel spacing"));
            }
            if g.slice_normal().dot(&normal) < 1.0 - NORMAL_TOLERANCE
                || g.row_cosine.dot(&first.row_cosine) < 1.0 - NORMAL_TOLERANCE
            {
                return Err(FusionError::incompatible("frames are not parallel"));
            }
            let offset = g.origin - first.origin;
            let lateral = offset - normal * offset.dot(&normal);
            if lateral.norm() > in_plane_tolerance {
                return Err(FusionError::incompatible(
                    "frame origins are not stacked along the normal",
                ));
            }
        }

        let gaps = self.gaps();
        let spacing = if gaps.is_empty() {
            first.slice_spacing
        } else {
            gaps.iter().sum::<f64>() / gaps.len() as f64
        };
        if !(spacing > 0.0) {
            return Err(FusionError::incompatible("slice spacing is unknown or zero"));
        }
        let slack = (spacing * GAP_RELATIVE_TOLERANCE).max(GAP_ABSOLUTE_TOLERANCE);
        if gaps.iter().any(|g| (g - spacing).abs() > slack) {
            return Err(FusionError::incompatible("inconsistent slice spacing"));
        }

        let mut voxels = Vec::with_capacity(first.pixel_count() * self.frames.len());
        for frame in &self.frames {
            voxels.extend_from_slice(&frame.pixels);
        }
        let geometry = FrameGeometry {
            slice_spacing: spacing,
            ..first.clone()
        };
        Ok(VolumeGrid::new(geometry, self.frames.len(), voxels))
    }
}

/// A volume on a regular grid. Voxel `(c, r, k)` lives at
/// `geometry.pixel_to_patient(c, r, k)`.
#[derive(Debug, Clone)]
pub struct VolumeGrid {
    pub geometry: FrameGeometry,
    pub slices: usize,
    voxels: Vec<f32>,
}

impl VolumeGrid {
    pub fn new(geometry: FrameGeometry, slices: usize, voxels: Vec<f32>) -> Self {
        assert_eq!(voxels.len(), geometry.pixel_count() * slices);
        Self {
            geometry,
            slices,
            voxels,
        }
    }

    /// (columns, rows, slices)
    pub fn dims(&self) -> (usize, usize, usize) {
        (self.geometry.columns, self.geometry.rows, self.slices)
    }

    pub fn voxels(&self) -> &[f32] {
        &self.voxels
    }

    #[inline]
    pub fn index(&self, column: usize, row: usize, slice: usize) -> usize {
        (slice * self.geometry.rows + row) * self.geometry.columns + column
    }

    pub fn value(&self, column: usize, row: usize, slice: usize) -> f32 {
        self.voxels[self.index(column, row, slice)]
    }

    pub fn sample_index(
        &self,
        column: f64,
        row: f64,
        slice: f64,
        interpolation: Interpolation,
    ) -> Option<f32> {
        let (nc, nr, ns) = self.dims();
        match interpolation {
            Interpolation::Nearest => {
                let c = nearest_axis(column, nc)?;
                let r = nearest_axis(row, nr)?;
                let k = nearest_axis(slice, ns)?;
                Some(self.value(c, r, k))
            }
            Interpolation::Linear => {
                let (c0, c1, tc) = linear_axis(column, nc)?;
                let (r0, r1, tr) = linear_axis(row, nr)?;
                let (k0, k1, tk) = linear_axis(slice, ns)?;
                let plane = |k: usize| {
                    let at = |r: usize, c: usize| self.value(c, r, k) as f64;
                    let top = at(r0, c0) * (1.0 - tc) + at(r0, c1) * tc;
                    let bottom = at(r1, c0) * (1.0 - tc) + at(r1, c1) * tc;
                    top * (1.0 - tr) + bottom * tr
                };
                Some((plane(k0) * (1.0 - tk) + plane(k1) * tk) as f32)
            }
        }
    }

    pub fn sample(&self, point: &Point3<f64>, interpolation: Interpolation) -> Option<f32> {
        let idx = self.geometry.patient_to_pixel(point).ok()?;
        self.sample_index(idx.column, idx.row, idx.slice, interpolation)
    }

    pub fn min_max(&self) -> (f32, f32) {
        self.voxels
            .iter()
            .filter(|v| v.is_finite())
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            })
    }

    pub fn plane_count(&self, orientation: ViewOrientation) -> usize {
        let (nc, nr, ns) = self.dims();
        match orientation {
            ViewOrientation::Axial => ns,
            ViewOrientation::Coronal => nr,
            ViewOrientation::Sagittal => nc,
        }
    }

    /// Geometry of a reformatted plane through the grid. Coronal and sagittal
    /// planes put the last slice on the top row.
    pub fn plane_geometry(&self, orientation: ViewOrientation, index: usize) -> Result<FrameGeometry> {
        let count = self.plane_count(orientation);
        if index >= count {
            return Err(FusionError::invalid_geometry(format!(
                "{:?} index {} outside 0..{}",
                orientation, index, count
            )));
        }
        let g = &self.geometry;
        let normal = g.slice_normal();
        let top = (self.slices - 1) as f64;
        let plane = match orientation {
            ViewOrientation::Axial => FrameGeometry {
                origin: g.pixel_to_patient(0.0, 0.0, index as f64),
                ..g.clone()
            },
            ViewOrientation::Coronal => FrameGeometry {
                origin: g.pixel_to_patient(0.0, index as f64, top),
                row_cosine: g.row_cosine,
                col_cosine: -normal,
                row_spacing: g.slice_spacing,
                col_spacing: g.col_spacing,
                slice_spacing: g.row_spacing,
                rows: self.slices,
                columns: g.columns,
                spacing_source: g.spacing_source,
            },
            ViewOrientation::Sagittal => FrameGeometry {
                origin: g.pixel_to_patient(index as f64, 0.0, top),
                row_cosine: g.col_cosine,
                col_cosine: -normal,
                row_spacing: g.slice_spacing,
                col_spacing: g.row_spacing,
                slice_spacing: g.col_spacing,
                rows: self.slices,
                columns: g.rows,
                spacing_source: g.spacing_source,
            },
        };
        Ok(plane)
    }
}
