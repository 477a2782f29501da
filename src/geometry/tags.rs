use nalgebra::{Point3, Vector3};
use serde::Deserialize;

use super::{check_cosines, FrameGeometry, SpacingSource};
use crate::error::{FusionError, Result};

/// Spatial attributes of one frame, as supplied by the file-loading layer.
///
/// Every field is optional; [`derive_geometry`] decides which absences are
/// fatal and which have fallbacks.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct FrameTags {
    /// ImagePositionPatient (0020,0032)
    pub image_position: Option<[f64; 3]>,
    /// ImageOrientationPatient (0020,0037): row cosine then column cosine.
    pub image_orientation: Option<[f64; 6]>,
    /// PixelSpacing (0028,0030): row spacing then column spacing.
    pub pixel_spacing: Option<[f64; 2]>,
    /// ImagerPixelSpacing (0018,1164)
    pub imager_pixel_spacing: Option<[f64; 2]>,
    /// SpacingBetweenSlices (0018,0088)
    pub spacing_between_slices: Option<f64>,
    /// SliceThickness (0018,0050)
    pub slice_thickness: Option<f64>,
    pub rows: Option<usize>,
    pub columns: Option<usize>,
    /// FrameOfReferenceUID (0020,0052)
    pub frame_of_reference_uid: Option<String>,
}

impl FrameTags {
    /// Patient coordinate under the pointer, or `None` when the frame has no
    /// usable geometry.
    pub fn patient_coordinate(&self, column: f64, row: f64) -> Option<Point3<f64>> {
        derive_geometry(self)
            .ok()
            .map(|g| g.pixel_to_patient(column, row, 0.0))
    }
}

/// Builds the frame geometry from its tags.
///
/// Fallbacks: PixelSpacing → ImagerPixelSpacing → 1 mm, and
/// SpacingBetweenSlices → SliceThickness → 0.
pub fn derive_geometry(tags: &FrameTags) -> Result<FrameGeometry> {
    let position = tags
        .image_position
        .ok_or_else(|| FusionError::invalid_geometry("missing image position"))?;
    let orientation = tags
        .image_orientation
        .ok_or_else(|| FusionError::invalid_geometry("missing image orientation"))?;
    let rows = tags
        .rows
        .filter(|&r| r > 0)
        .ok_or_else(|| FusionError::invalid_geometry("missing or zero rows"))?;
    let columns = tags
        .columns
        .filter(|&c| c > 0)
        .ok_or_else(|| FusionError::invalid_geometry("missing or zero columns"))?;

    if position.iter().chain(orientation.iter()).any(|v| !v.is_finite()) {
        return Err(FusionError::invalid_geometry("non-finite spatial tag"));
    }

    let row_cosine = Vector3::new(orientation[0], orientation[1], orientation[2]);
    let col_cosine = Vector3::new(orientation[3], orientation[4], orientation[5]);
    let (row_cosine, col_cosine) = check_cosines(&row_cosine, &col_cosine)?;

    let valid_pair = |s: &[f64; 2]| s.iter().all(|v| v.is_finite() && *v > 0.0);
    let (spacing, spacing_source) = match (tags.pixel_spacing, tags.imager_pixel_spacing) {
        (Some(s), _) if valid_pair(&s) => (s, SpacingSource::PixelSpacing),
        (_, Some(s)) if valid_pair(&s) => (s, SpacingSource::ImagerPixelSpacing),
        _ => ([1.0, 1.0], SpacingSource::Assumed),
    };

    let slice_spacing = tags
        .spacing_between_slices
        .filter(|s| s.is_finite() && *s > 0.0)
        .or_else(|| tags.slice_thickness.filter(|s| s.is_finite() && *s > 0.0))
        .unwrap_or(0.0);

    Ok(FrameGeometry {
        origin: Point3::new(position[0], position[1], position[2]),
        row_cosine,
        col_cosine,
        row_spacing: spacing[0],
        col_spacing: spacing[1],
        slice_spacing,
        rows,
        columns,
        spacing_source,
    })
}

#[cfg(test)]
mod tags_tests {
    use super::*;
    use approx::assert_relative_eq;

    fn axial_tags() -> FrameTags {
        FrameTags {
            image_position: Some([-100.0, -120.0, 35.0]),
            image_orientation: Some([1.0, 0.0, 0.0, 0.0, 1.0, 0.0]),
            pixel_spacing: Some([0.7, 0.6]),
            imager_pixel_spacing: None,
            spacing_between_slices: None,
            slice_thickness: Some(2.5),
            rows: Some(256),
            columns: Some(320),
            frame_of_reference_uid: Some("1.2.3".to_string()),
        }
    }

    #[test]
    fn test_derive_geometry_reads_all_tags() {
        let geometry = derive_geometry(&axial_tags()).unwrap();
        assert_relative_eq!(geometry.origin, Point3::new(-100.0, -120.0, 35.0));
        assert_relative_eq!(geometry.row_spacing, 0.7);
        assert_relative_eq!(geometry.col_spacing, 0.6);
        assert_relative_eq!(geometry.slice_spacing, 2.5);
        assert_eq!(geometry.rows, 256);
        assert_eq!(geometry.columns, 320);
        assert_eq!(geometry.spacing_source, SpacingSource::PixelSpacing);
    }

    #[test]
    fn test_spacing_between_slices_wins_over_thickness() {
        let mut tags = axial_tags();
        tags.spacing_between_slices = Some(3.0);
        let geometry = derive_geometry(&tags).unwrap();
        assert_relative_eq!(geometry.slice_spacing, 3.0);
    }

    #[test]
    fn test_spacing_fallbacks() {
        let mut tags = axial_tags();
        tags.pixel_spacing = None;
        tags.imager_pixel_spacing = Some([0.2, 0.2]);
        let geometry = derive_geometry(&tags).unwrap();
        assert_eq!(geometry.spacing_source, SpacingSource::ImagerPixelSpacing);
        assert_relative_eq!(geometry.row_spacing, 0.2);

        tags.imager_pixel_spacing = None;
        tags.slice_thickness = None;
        let geometry = derive_geometry(&tags).unwrap();
        assert_eq!(geometry.spacing_source, SpacingSource::Assumed);
        assert_relative_eq!(geometry.col_spacing, 1.0);
        assert_relative_eq!(geometry.slice_spacing, 0.0);
    }

    #[test]
    fn test_missing_position_is_invalid() {
        let mut tags = axial_tags();
        tags.image_position = None;
        assert!(matches!(
            derive_geometry(&tags),
            Err(FusionError::InvalidGeometry(_))
        ));
        assert!(tags.patient_coordinate(1.0, 1.0).is_none());
    }

    #[test]
    fn test_degenerate_cosines_are_invalid() {
        let mut tags = axial_tags();
        tags.image_orientation = Some([1.0, 0.0, 0.0, 1.0, 0.0, 0.0]);
        assert!(derive_geometry(&tags).is_err());

        tags.image_orientation = Some([1.0, 0.0, 0.0, 0.05, 1.0, 0.0]);
        assert!(derive_geometry(&tags).is_err());
    }

    #[test]
    fn test_slightly_off_unit_cosines_are_normalised() {
        let mut tags = axial_tags();
        tags.image_orientation = Some([1.0004, 0.0, 0.0, 0.0, 0.9996, 0.0]);
        let geometry = derive_geometry(&tags).unwrap();
        assert_relative_eq!(geometry.row_cosine.norm(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(geometry.col_cosine.norm(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_patient_coordinate_for_pointer() {
        let p = axial_tags().patient_coordinate(10.0, 20.0).unwrap();
        assert_relative_eq!(p.x, -100.0 + 10.0 * 0.6);
        assert_relative_eq!(p.y, -120.0 + 20.0 * 0.7);
        assert_relative_eq!(p.z, 35.0);
    }
}
