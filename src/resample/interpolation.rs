use serde::Deserialize;

/// How a continuous index is turned into an intensity.
///
/// `Linear` is bilinear on a single frame and trilinear on a regular grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Interpolation {
    Nearest,
    #[default]
    Linear,
}

/// Tolerance for indices that sit on the last sample.
const EDGE_EPSILON: f64 = 1e-6;

/// Lower/upper neighbour and blend weight along one axis of length `n`.
pub(crate) fn linear_axis(x: f64, n: usize) -> Option<(usize, usize, f64)> {
    if n == 0 || !x.is_finite() {
        return None;
    }
    let last = (n - 1) as f64;
    if x < -EDGE_EPSILON || x > last + EDGE_EPSILON {
        return None;
    }
    let x = x.clamp(0.0, last);
    let i0 = (x.floor() as usize).min(n.saturating_sub(2));
    let i1 = (i0 + 1).min(n - 1);
    Some((i0, i1, x - i0 as f64))
}

pub(crate) fn nearest_axis(x: f64, n: usize) -> Option<usize> {
    if n == 0 || !x.is_finite() {
        return None;
    }
    let i = x.round();
    if i < 0.0 || i > (n - 1) as f64 {
        return None;
    }
    Some(i as usize)
}

/// Samples a row-major `rows × columns` plane.
pub(crate) fn sample_plane(
    pixels: &[f32],
    columns: usize,
    rows: usize,
    column: f64,
    row: f64,
    interpolation: Interpolation,
) -> Option<f32> {
    match interpolation {
        Interpolation::Nearest => {
            let c = nearest_axis(column, columns)?;
            let r = nearest_axis(row, rows)?;
            Some(pixels[r * columns + c])
        }
        Interpolation::Linear => {
            let (c0, c1, tc) = linear_axis(column, columns)?;
            let (r0, r1, tr) = linear_axis(row, rows)?;
            let at = |r: usize, c: usize| pixels[r * columns + c] as f64;
            let top = at(r0, c0) * (1.0 - tc) + at(r0, c1) * tc;
            let bottom = at(r1, c0) * (1.0 - tc) + at(r1, c1) * tc;
            Some((top * (1.0 - tr) + bottom * tr) as f32)
        }
    }
}
