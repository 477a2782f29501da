//! Spatial mapping between the floating and the fixed patient space.
//!
//! A [`RegistrationTransform`] is immutable. The resolver replaces it as a
//! whole and bumps a version counter, so readers only ever hold snapshots.
use nalgebra::{Matrix3, Matrix4, Point3, Rotation3, Vector3};
use serde::Deserialize;

use crate::error::{FusionError, Result};

/// Below this |det| an affine matrix is treated as non-invertible.
const DETERMINANT_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransformKind {
    Identity,
    /// 3 rotations + 3 translations.
    #[default]
    Rigid,
    /// Full 3x3 matrix + translation.
    Affine,
}

impl TransformKind {
    /// Number of optimisable parameters.
    pub fn parameter_count(&self) -> usize {
        match self {
            TransformKind::Identity => 0,
            TransformKind::Rigid => 6,
            TransformKind::Affine => 12,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationTransform {
    kind: TransformKind,
    /// floating patient space -> fixed patient space
    to_fixed: Matrix4<f64>,
    /// fixed patient space -> floating patient space
    to_floating: Matrix4<f64>,
}

impl Default for RegistrationTransform {
    fn default() -> Self {
        Self::identity()
    }
}

impl RegistrationTransform {
    pub fn identity() -> Self {
        Self {
            kind: TransformKind::Identity,
            to_fixed: Matrix4::identity(),
            to_floating: Matrix4::identity(),
        }
    }

    /// Wraps a homogeneous fixed -> floating matrix.
    pub fn from_sampling_matrix(kind: TransformKind, to_floating: Matrix4<f64>) -> Result<Self> {
        let linear: Matrix3<f64> = to_floating.fixed_view::<3, 3>(0, 0).into_owned();
        if !linear.iter().all(|v| v.is_finite()) || linear.determinant().abs() < DETERMINANT_EPSILON
        {
            return Err(FusionError::singular("transform matrix is not invertible"));
        }
        let to_fixed = to_floating
            .try_inverse()
            .ok_or_else(|| FusionError::singular("transform matrix is not invertible"))?;
        Ok(Self {
            kind,
            to_fixed,
            to_floating,
        })
    }

    /// Rigid transform from `[rx, ry, rz, tx, ty, tz]` (radians, mm).
    ///
    /// The parameters describe the sampling direction: a fixed point `p`
    /// lands at `R (p - centre) + centre + t` in floating space.
    pub fn rigid(params: &[f64], center: &Point3<f64>) -> Result<Self> {
        Self::from_parameters(TransformKind::Rigid, params, center)
    }

    /// Affine transform from 9 row-major deltas to the identity matrix
    /// followed by a translation, rotating about `center`.
    pub fn affine(params: &[f64], center: &Point3<f64>) -> Result<Self> {
        Self::from_parameters(TransformKind::Affine, params, center)
    }

    pub fn from_parameters(kind: TransformKind, params: &[f64], center: &Point3<f64>) -> Result<Self> {
        let matrix = sampling_matrix(kind, params, center)?;
        Self::from_sampling_matrix(kind, matrix)
    }

    pub fn kind(&self) -> TransformKind {
        self.kind
    }

    pub fn is_identity(&self) -> bool {
        self.kind == TransformKind::Identity
    }

    pub fn map_to_fixed(&self, point: &Point3<f64>) -> Point3<f64> {
        self.to_fixed.transform_point(point)
    }

    pub fn map_to_floating(&self, point: &Point3<f64>) -> Point3<f64> {
        self.to_floating.transform_point(point)
    }

    pub fn to_fixed_matrix(&self) -> &Matrix4<f64> {
        &self.to_fixed
    }

    pub fn to_floating_matrix(&self) -> &Matrix4<f64> {
        &self.to_floating
    }
}

/// Homogeneous fixed -> floating matrix for a parameter vector.
pub(crate) fn sampling_matrix(
    kind: TransformKind,
    params: &[f64],
    center: &Point3<f64>,
) -> Result<Matrix4<f64>> {
    if params.len() != kind.parameter_count() {
        return Err(FusionError::Config(format!(
            "{:?} transform expects {} parameters, got {}",
            kind,
            kind.parameter_count(),
            params.len()
        )));
    }
    let (linear, translation) = match kind {
        TransformKind::Identity => return Ok(Matrix4::identity()),
        TransformKind::Rigid => {
            let rotation = Rotation3::from_euler_angles(params[0], params[1], params[2]);
            (
                *rotation.matrix(),
                Vector3::new(params[3], params[4], params[5]),
            )
        }
        TransformKind::Affine => (
            Matrix3::identity() + Matrix3::from_row_slice(&params[..9]),
            Vector3::new(params[9], params[10], params[11]),
        ),
    };
    let c = center.coords;
    Ok(Matrix4::new_translation(&(c + translation))
        * linear.to_homogeneous()
        * Matrix4::new_translation(&-c))
}

#[cfg(test)]
mod transform_tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::FRAC_PI_2;

    #[test]
    fn test_identity_maps_points_unchanged() {
        let t = RegistrationTransform::identity();
        let p = Point3::new(1.0, -2.0, 3.5);
        assert_eq!(t.map_to_fixed(&p), p);
        assert_eq!(t.map_to_floating(&p), p);
        assert!(t.is_identity());
    }

    #[test]
    fn test_rigid_translation_direction() {
        let t = RegistrationTransform::rigid(&[0.0, 0.0, 0.0, 4.0, -3.0, 2.0], &Point3::origin())
            .unwrap();
        let p = Point3::new(10.0, 10.0, 10.0);
        assert_relative_eq!(t.map_to_floating(&p), Point3::new(14.0, 7.0, 12.0));
        assert_relative_eq!(t.map_to_fixed(&Point3::new(14.0, 7.0, 12.0)), p, epsilon = 1e-12);
    }

    #[test]
    fn test_rigid_rotation_about_center() {
        let center = Point3::new(5.0, 5.0, 0.0);
        let t = RegistrationTransform::rigid(&[0.0, 0.0, FRAC_PI_2, 0.0, 0.0, 0.0], &center).unwrap();
        // the centre is a fixed point of the rotation
        assert_relative_eq!(t.map_to_floating(&center), center, epsilon = 1e-12);
        let q = t.map_to_floating(&Point3::new(6.0, 5.0, 0.0));
        assert_relative_eq!(q, Point3::new(5.0, 6.0, 0.0), epsilon = 1e-12);
    }

    #[test]
    fn test_affine_round_trip() {
        let params = [0.1, 0.02, 0.0, -0.03, -0.05, 0.01, 0.0, 0.04, 0.2, 1.0, 2.0, 3.0];
        let t = RegistrationTransform::affine(&params, &Point3::new(1.0, 2.0, 3.0)).unwrap();
        let p = Point3::new(-7.0, 3.0, 12.0);
        let q = t.map_to_floating(&p);
        assert_relative_eq!(t.map_to_fixed(&q), p, epsilon = 1e-9);
        assert_eq!(t.kind(), TransformKind::Affine);
    }

    #[test]
    fn test_collapsed_affine_is_singular() {
        let mut params = [0.0; 12];
        params[8] = -1.0; // zero out the z column
        let result = RegistrationTransform::affine(&params, &Point3::origin());
        assert!(matches!(result, Err(FusionError::SingularGeometry(_))));
    }

    #[test]
    fn test_wrong_parameter_count() {
        assert!(RegistrationTransform::rigid(&[0.0; 5], &Point3::origin()).is_err());
    }
}
