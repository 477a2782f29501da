use nalgebra::{Point3, Vector3};

use crate::geometry::FrameGeometry;
use crate::volume::{Frame, Volume};

/// Axial geometry at height `z`: rows run along +y, columns along +x.
pub fn axial_geometry(
    columns: usize,
    rows: usize,
    pixel_spacing: f64,
    slice_spacing: f64,
    z: f64,
) -> FrameGeometry {
    FrameGeometry::new(
        Point3::new(0.0, 0.0, z),
        Vector3::x(),
        Vector3::y(),
        pixel_spacing,
        pixel_spacing,
        slice_spacing,
        rows,
        columns,
    )
    .unwrap()
}

/// Axial frames at the given heights; `value(c, r, k)` fills frame `k` in
/// the order given (before sorting). Slice spacing is left unknown.
pub fn stacked_volume<F>(
    uid: &str,
    columns: usize,
    rows: usize,
    pixel_spacing: f64,
    z_positions: &[f64],
    value: F,
) -> Volume
where
    F: Fn(usize, usize, usize) -> f32,
{
    let frames = z_positions
        .iter()
        .enumerate()
        .map(|(k, &z)| {
            let geometry = axial_geometry(columns, rows, pixel_spacing, 0.0, z);
            let pixels = (0..rows)
                .flat_map(|r| (0..columns).map(move |c| (c, r)))
                .map(|(c, r)| value(c, r, k))
                .collect();
            Frame::new(geometry, pixels)
        })
        .collect();
    Volume::new(uid, frames).unwrap()
}

/// Regular axial volume with origin 0 and value `c + 10 r + 100 k`.
pub fn gradient_volume(
    uid: &str,
    columns: usize,
    rows: usize,
    slices: usize,
    pixel_spacing: f64,
    slice_spacing: f64,
) -> Volume {
    let frames = (0..slices)
        .map(|k| {
            let geometry =
                axial_geometry(columns, rows, pixel_spacing, slice_spacing, k as f64 * slice_spacing);
            let pixels = (0..rows)
                .flat_map(|r| (0..columns).map(move |c| (c + 10 * r + 100 * k) as f32))
                .collect();
            Frame::new(geometry, pixels)
        })
        .collect();
    Volume::new(uid, frames).unwrap()
}

/// Cube of `n³` voxels centred on the patient origin.
fn centred_cube<F>(uid: &str, n: usize, spacing: f64, value: F) -> Volume
where
    F: Fn(&Point3<f64>) -> f32,
{
    let half = (n as f64 - 1.0) * spacing / 2.0;
    let frames = (0..n)
        .map(|k| {
            let mut geometry = axial_geometry(n, n, spacing, spacing, k as f64 * spacing - half);
            geometry.origin.x = -half;
            geometry.origin.y = -half;
            let pixels = (0..n)
                .flat_map(|r| (0..n).map(move |c| (c, r)))
                .map(|(c, r)| value(&geometry.pixel_to_patient(c as f64, r as f64, 0.0)))
                .collect();
            Frame::new(geometry, pixels)
        })
        .collect();
    Volume::new(uid, frames).unwrap()
}

/// Soft-edged ellipsoid (semi-axes 12, 8, 10 mm) plus an off-centre blob,
/// so both translation and rotation are observable.
pub fn phantom_value(p: &Point3<f64>) -> f32 {
    let r = ((p.x / 12.0).powi(2) + (p.y / 8.0).powi(2) + (p.z / 10.0).powi(2)).sqrt();
    let body = 100.0 / (1.0 + (-(1.0 - r) * 8.0).exp());
    let d2 = (p - Point3::new(5.0, 3.0, -3.0)).norm_squared();
    let blob = 100.0 * (-d2 / (2.0 * 9.0)).exp();
    (body + blob) as f32
}

/// Phantom cube whose content is moved by `offset` and whose intensities
/// are remapped with `map` (e.g. to mimic another modality).
pub fn phantom_volume<M>(uid: &str, n: usize, spacing: f64, offset: Vector3<f64>, map: M) -> Volume
where
    M: Fn(f32) -> f32,
{
    centred_cube(uid, n, spacing, |p| map(phantom_value(&(p - offset))))
}

/// Gaussian blob (sigma a sixth of the field) on a constant background.
pub fn blob_volume(
    uid: &str,
    n: usize,
    spacing: f64,
    center: Point3<f64>,
    amplitude: f32,
    background: f32,
) -> Volume {
    let sigma = n as f64 * spacing / 6.0;
    centred_cube(uid, n, spacing, |p| {
        let d2 = (p - center).norm_squared();
        background + amplitude * (-d2 / (2.0 * sigma * sigma)).exp() as f32
    })
}

/// Same frames with every origin shifted by `offset`.
pub fn translated(volume: &Volume, offset: Vector3<f64>) -> Volume {
    let frames = volume
        .frames()
        .iter()
        .map(|f| Frame::new(f.geometry.with_origin(f.geometry.origin + offset), f.pixels.clone()))
        .collect();
    Volume::new(volume.reference_frame_uid(), frames).unwrap()
}
