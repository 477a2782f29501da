//! Per-frame affine mapping between image indices and patient space.
//!
//! Index convention (DICOM PS3.3 C.7.6.2.1.1):
//!
//! * `row_cosine` is the direction in which the **column** index grows,
//!   i.e. it points along a row. Steps along it are `col_spacing` long.
//! * `col_cosine` is the direction in which the **row** index grows,
//!   i.e. it points down a column. Steps along it are `row_spacing` long.
//! * `slice_normal = row_cosine × col_cosine`.
//!
//! ```text
//! P = origin + column·col_spacing·row_cosine
//!            + row·row_spacing·col_cosine
//!            + slice·slice_spacing·slice_normal
//! ```
pub mod tags;

use nalgebra::{Point3, Vector3};

use crate::error::{FusionError, Result};

pub use tags::{derive_geometry, FrameTags};

/// Allowed deviation of |cosine| from 1 and of `row·col` from 0.
pub const ORTHOGONALITY_TOLERANCE: f64 = 1e-3;
/// Relative Gram determinant below which the in-plane system is singular.
const SINGULAR_EPSILON: f64 = 1e-9;

/// Where the in-plane spacing of a geometry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpacingSource {
    PixelSpacing,
    ImagerPixelSpacing,
    /// No spacing tag present, 1 mm assumed.
    Assumed,
}

/// Continuous image index, in pixels and slices.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PixelCoord {
    pub column: f64,
    pub row: f64,
    pub slice: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FrameGeometry {
    pub origin: Point3<f64>,
    pub row_cosine: Vector3<f64>,
    pub col_cosine: Vector3<f64>,
    /// Distance between adjacent rows (mm).
    pub row_spacing: f64,
    /// Distance between adjacent columns (mm).
    pub col_spacing: f64,
    /// Distance between slices (mm), 0 when unknown.
    pub slice_spacing: f64,
    pub rows: usize,
    pub columns: usize,
    pub spacing_source: SpacingSource,
}

impl FrameGeometry {
    /// Builds a geometry, normalising the direction cosines after checking
    /// them.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        origin: Point3<f64>,
        row_cosine: Vector3<f64>,
        col_cosine: Vector3<f64>,
        row_spacing: f64,
        col_spacing: f64,
        slice_spacing: f64,
        rows: usize,
        columns: usize,
    ) -> Result<Self> {
        let (row_cosine, col_cosine) = check_cosines(&row_cosine, &col_cosine)?;
        let geometry = Self {
            origin,
            row_cosine,
            col_cosine,
            row_spacing,
            col_spacing,
            slice_spacing,
            rows,
            columns,
            spacing_source: SpacingSource::PixelSpacing,
        };
        geometry.validate()?;
        Ok(geometry)
    }

    pub fn validate(&self) -> Result<()> {
        check_cosines(&self.row_cosine, &self.col_cosine)?;
        if !(self.row_spacing > 0.0 && self.col_spacing > 0.0) {
            return Err(FusionError::invalid_geometry(format!(
                "non-positive pixel spacing ({}, {})",
                self.row_spacing, self.col_spacing
            )));
        }
        if !(self.slice_spacing >= 0.0) {
            return Err(FusionError::invalid_geometry("negative slice spacing"));
        }
        Ok(())
    }

    pub fn slice_normal(&self) -> Vector3<f64> {
        self.row_cosine.cross(&self.col_cosine)
    }

    pub fn pixel_to_patient(&self, column: f64, row: f64, slice: f64) -> Point3<f64> {
        self.origin
            + self.row_cosine * (column * self.col_spacing)
            + self.col_cosine * (row * self.row_spacing)
            + self.slice_normal() * (slice * self.slice_spacing)
    }

    /// Inverse of [`pixel_to_patient`](Self::pixel_to_patient).
    ///
    /// When `slice_spacing` is unknown (0) the slice component is reported as 0.
    pub fn patient_to_pixel(&self, point: &Point3<f64>) -> Result<PixelCoord> {
        let a = self.row_cosine * self.col_spacing;
        let b = self.col_cosine * self.row_spacing;
        let d = point - self.origin;

        let aa = a.dot(&a);
        let bb = b.dot(&b);
        let ab = a.dot(&b);
        let det = aa * bb - ab * ab;
        if !(aa > 0.0 && bb > 0.0) || det.abs() <= SINGULAR_EPSILON * aa * bb {
            return Err(FusionError::singular(format!(
                "in-plane determinant {:.3e} is not invertible",
                det
            )));
        }

        let ad = a.dot(&d);
        let bd = b.dot(&d);
        let column = (bb * ad - ab * bd) / det;
        let row = (aa * bd - ab * ad) / det;

        let slice = if self.slice_spacing > f64::EPSILON {
            let residual = d - a * column - b * row;
            residual.dot(&self.slice_normal()) / self.slice_spacing
        } else {
            0.0
        };

        Ok(PixelCoord { column, row, slice })
    }

    /// Signed distance (mm) of `point` from the image plane, along the normal.
    pub fn plane_distance(&self, point: &Point3<f64>) -> f64 {
        (point - self.origin).dot(&self.slice_normal())
    }

    /// True if the continuous index lies within the pixel grid (pixel centres
    /// at integer indices, half a pixel of margin is not included).
    pub fn contains(&self, column: f64, row: f64) -> bool {
        column >= 0.0
            && row >= 0.0
            && column <= (self.columns.saturating_sub(1)) as f64
            && row <= (self.rows.saturating_sub(1)) as f64
    }

    pub fn pixel_count(&self) -> usize {
        self.rows * self.columns
    }

    /// Patient-space centre of the pixel grid.
    pub fn center(&self) -> Point3<f64> {
        self.pixel_to_patient(
            (self.columns.saturating_sub(1)) as f64 / 2.0,
            (self.rows.saturating_sub(1)) as f64 / 2.0,
            0.0,
        )
    }

    /// Same plane orientation and spacing, shifted origin.
    pub fn with_origin(&self, origin: Point3<f64>) -> Self {
        Self {
            origin,
            ..self.clone()
        }
    }
}

/// Validates (and returns normalised) direction cosines.
pub(crate) fn check_cosines(
    row_cosine: &Vector3<f64>,
    col_cosine: &Vector3<f64>,
) -> Result<(Vector3<f64>, Vector3<f64>)> {
    let cross = row_cosine.cross(col_cosine);
    if cross.norm() < ORTHOGONALITY_TOLERANCE {
        return Err(FusionError::invalid_geometry(
            "degenerate direction cosines (parallel or zero)",
        ));
    }
    let row_norm = row_cosine.norm();
    let col_norm = col_cosine.norm();
    if (row_norm - 1.0).abs() > ORTHOGONALITY_TOLERANCE
        || (col_norm - 1.0).abs() > ORTHOGONALITY_TOLERANCE
    {
        return Err(FusionError::invalid_geometry(format!(
            "direction cosines are not unit length ({:.4}, {:.4})",
            row_norm, col_norm
        )));
    }
    let dot = row_cosine.dot(col_cosine);
    if dot.abs() > ORTHOGONALITY_TOLERANCE {
        return Err(FusionError::invalid_geometry(format!(
            "direction cosines are not orthogonal (dot = {:.4})",
            dot
        )));
    }
    Ok((row_cosine / row_norm, col_cosine / col_norm))
}

#[cfg(test)]
mod geometry_tests {
    use super::*;
    use crate::utils::test_utils::axial_geometry;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    #[test]
    fn test_known_geometry_column_row_convention() {
        let geometry = FrameGeometry::new(
            Point3::origin(),
            Vector3::x(),
            Vector3::y(),
            1.0,
            1.0,
            5.0,
            64,
            64,
        )
        .unwrap();
        assert_relative_eq!(geometry.slice_normal(), Vector3::z());

        let p = geometry.pixel_to_patient(10.0, 20.0, 2.0);
        // column walks along row_cosine (x), row walks along col_cosine (y)
        assert_relative_eq!(p.x, 10.0);
        assert_relative_eq!(p.y, 20.0);
        assert_relative_eq!(p.z, 10.0);
    }

    #[test]
    fn test_anisotropic_spacing_pairs_with_correct_axis() {
        // row_spacing 2 mm, col_spacing 0.5 mm
        let geometry = FrameGeometry::new(
            Point3::new(-10.0, 5.0, 3.0),
            Vector3::x(),
            Vector3::y(),
            2.0,
            0.5,
            1.0,
            16,
            32,
        )
        .unwrap();
        let p = geometry.pixel_to_patient(4.0, 3.0, 0.0);
        assert_relative_eq!(p.x, -10.0 + 4.0 * 0.5);
        assert_relative_eq!(p.y, 5.0 + 3.0 * 2.0);
        assert_relative_eq!(p.z, 3.0);
    }

    #[test]
    fn test_patient_to_pixel_inverts_known_point() {
        let geometry = axial_geometry(32, 32, 0.8, 3.0, 0.0);
        let p = geometry.pixel_to_patient(7.0, 11.0, 4.0);
        let idx = geometry.patient_to_pixel(&p).unwrap();
        assert_relative_eq!(idx.column, 7.0, epsilon = 1e-9);
        assert_relative_eq!(idx.row, 11.0, epsilon = 1e-9);
        assert_relative_eq!(idx.slice, 4.0, epsilon = 1e-9);
    }

    #[test]
    fn test_zero_slice_spacing_reports_in_plane_only() {
        let geometry = axial_geometry(8, 8, 1.0, 0.0, 0.0);
        let idx = geometry
            .patient_to_pixel(&Point3::new(2.0, 3.0, 40.0))
            .unwrap();
        assert_relative_eq!(idx.column, 2.0);
        assert_relative_eq!(idx.row, 3.0);
        assert_relative_eq!(idx.slice, 0.0);
    }

    #[test]
    fn test_singular_in_plane_system() {
        // bypass validation to emulate a corrupted geometry
        let geometry = FrameGeometry {
            origin: Point3::origin(),
            row_cosine: Vector3::x(),
            col_cosine: Vector3::x(),
            row_spacing: 1.0,
            col_spacing: 1.0,
            slice_spacing: 1.0,
            rows: 4,
            columns: 4,
            spacing_source: SpacingSource::PixelSpacing,
        };
        let err = geometry.patient_to_pixel(&Point3::origin()).unwrap_err();
        assert!(matches!(err, FusionError::SingularGeometry(_)));
    }

    #[test]
    fn test_new_normalises_near_unit_cosines() {
        let geometry = FrameGeometry::new(
            Point3::origin(),
            Vector3::new(1.0005, 0.0, 0.0),
            Vector3::new(0.0, 0.9995, 0.0),
            1.0,
            1.0,
            5.0,
            8,
            8,
        )
        .unwrap();
        assert_relative_eq!(geometry.row_cosine.norm(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(geometry.col_cosine.norm(), 1.0, epsilon = 1e-12);
        let p = geometry.pixel_to_patient(0.0, 0.0, 100.0);
        assert_relative_eq!(p.z, 500.0, epsilon = 1e-9);
    }

    #[test]
    fn test_non_orthogonal_cosines_rejected() {
        let result = FrameGeometry::new(
            Point3::origin(),
            Vector3::x(),
            Vector3::new(0.1, 0.995, 0.0),
            1.0,
            1.0,
            1.0,
            4,
            4,
        );
        assert!(matches!(result, Err(FusionError::InvalidGeometry(_))));
    }

    fn rotation_cosines(ax: f64, ay: f64, az: f64) -> (Vector3<f64>, Vector3<f64>) {
        let rotation = nalgebra::Rotation3::from_euler_angles(ax, ay, az);
        (rotation * Vector3::x(), rotation * Vector3::y())
    }

    proptest! {
        #[test]
        fn test_coordinate_roundtrip(
            ox in -200.0f64..200.0, oy in -200.0f64..200.0, oz in -200.0f64..200.0,
            rs in 0.1f64..5.0, cs in 0.1f64..5.0, ss in 0.1f64..8.0,
            ax in -3.14f64..3.14, ay in -1.5f64..1.5, az in -3.14f64..3.14,
            c in 0.0f64..511.0, r in 0.0f64..511.0, s in 0.0f64..200.0,
        ) {
            let (row_cosine, col_cosine) = rotation_cosines(ax, ay, az);
            let geometry = FrameGeometry::new(
                Point3::new(ox, oy, oz), row_cosine, col_cosine, rs, cs, ss, 512, 512,
            ).unwrap();

            // orthonormality holds for every accepted geometry
            prop_assert!((geometry.row_cosine.norm() - 1.0).abs() < 1e-9);
            prop_assert!((geometry.col_cosine.norm() - 1.0).abs() < 1e-9);
            prop_assert!(geometry.row_cosine.dot(&geometry.col_cosine).abs() < 1e-9);

            let p = geometry.pixel_to_patient(c, r, s);
            let idx = geometry.patient_to_pixel(&p).unwrap();
            prop_assert!((idx.column - c).abs() < 1e-6, "column {} vs {}", idx.column, c);
            prop_assert!((idx.row - r).abs() < 1e-6, "row {} vs {}", idx.row, r);
            prop_assert!((idx.slice - s).abs() < 1e-6, "slice {} vs {}", idx.slice, s);
        }
    }
}
