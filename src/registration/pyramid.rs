use rayon::prelude::*;

use crate::geometry::FrameGeometry;
use crate::volume::VolumeGrid;

/// Shrink factors for `levels` levels, coarsest first: `[.., 4, 2, 1]`.
pub fn shrink_factors(levels: usize) -> Vec<usize> {
    (0..levels.max(1))
        .map(|i| 1usize << (levels.max(1) - 1 - i))
        .collect()
}

/// Smoothing sigma (voxels) paired with a shrink factor.
pub fn smoothing_sigma(factor: usize) -> f64 {
    if factor > 1 {
        0.5 * factor as f64
    } else {
        0.0
    }
}

fn gaussian_kernel(sigma: f64) -> Vec<f32> {
    let radius = (3.0 * sigma).ceil().max(1.0) as usize;
    let mut kernel: Vec<f32> = (0..=2 * radius)
        .map(|i| {
            let x = i as f64 - radius as f64;
            (-0.5 * x * x / (sigma * sigma)).exp() as f32
        })
        .collect();
    let sum: f32 = kernel.iter().sum();
    kernel.iter_mut().for_each(|w| *w /= sum);
    kernel
}

/// One separable pass along `axis` (0 = column, 1 = row, 2 = slice),
/// clamping at the borders.
fn smooth_axis(data: &[f32], dims: (usize, usize, usize), axis: usize, kernel: &[f32]) -> Vec<f32> {
    let (nc, nr, ns) = dims;
    let radius = (kernel.len() / 2) as isize;
    let clamp = |i: isize, n: usize| i.clamp(0, n as isize - 1) as usize;
    let mut out = vec![0.0f32; data.len()];
    out.par_chunks_mut(nc * nr)
        .enumerate()
        .for_each(|(k, plane)| {
            for r in 0..nr {
                for c in 0..nc {
                    let mut acc = 0.0f32;
                    for (j, w) in kernel.iter().enumerate() {
                        let offset = j as isize - radius;
                        let (cc, rr, kk) = match axis {
                            0 => (clamp(c as isize + offset, nc), r, k),
                            1 => (c, clamp(r as isize + offset, nr), k),
                            _ => (c, r, clamp(k as isize + offset, ns)),
                        };
                        acc += w * data[(kk * nr + rr) * nc + cc];
                    }
                    plane[r * nc + c] = acc;
                }
            }
        });
    out
}

/// Gaussian-smoothed copy of the grid (sigma in voxels, all axes).
pub fn smooth(grid: &VolumeGrid, sigma: f64) -> VolumeGrid {
    if sigma <= 1e-6 {
        return grid.clone();
    }
    let kernel = gaussian_kernel(sigma);
    let dims = grid.dims();
    let mut data = grid.voxels().to_vec();
    for axis in 0..3 {
        let n = [dims.0, dims.1, dims.2][axis];
        if n > 1 {
            data = smooth_axis(&data, dims, axis, &kernel);
        }
    }
    VolumeGrid::new(grid.geometry.clone(), grid.slices, data)
}

/// Keeps every `factor`-th voxel along each axis. Voxel 0 stays in place;
/// spacings grow by `factor`.
pub fn downsample(grid: &VolumeGrid, factor: usize) -> VolumeGrid {
    if factor <= 1 {
        return grid.clone();
    }
    let (nc, nr, ns) = grid.dims();
    let shrink = |n: usize| n.div_ceil(factor);
    let (mc, mr, ms) = (shrink(nc), shrink(nr), shrink(ns));
    let mut data = Vec::with_capacity(mc * mr * ms);
    for k in 0..ms {
        for r in 0..mr {
            for c in 0..mc {
                data.push(grid.value(c * factor, r * factor, k * factor));
            }
        }
    }
    let g = &grid.geometry;
    let geometry = FrameGeometry {
        row_spacing: g.row_spacing * factor as f64,
        col_spacing: g.col_spacing * factor as f64,
        slice_spacing: g.slice_spacing * factor as f64,
        rows: mr,
        columns: mc,
        ..g.clone()
    };
    VolumeGrid::new(geometry, ms, data)
}

/// Smoothed and downsampled levels, coarsest first.
pub fn build_pyramid(grid: &VolumeGrid, levels: usize) -> Vec<VolumeGrid> {
    shrink_factors(levels)
        .into_iter()
        .map(|factor| downsample(&smooth(grid, smoothing_sigma(factor)), factor))
        .collect()
}
