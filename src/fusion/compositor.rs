//! Blends an anatomical and a functional slice into an RGB image.
//!
//! Pure function of its inputs: blend settings are passed in, never read
//! from shared state.
use std::str::FromStr;

use image::{Rgb, RgbImage};
use serde::Deserialize;

use crate::error::{FusionError, Result};
use crate::resample::Slice2D;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BlendMode {
    /// Constant opacity everywhere.
    #[default]
    Alpha,
    /// Opacity ramps up above a fraction of the functional maximum.
    Threshold,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Colormap {
    Gray,
    #[default]
    Hot,
    Jet,
    Cool,
}

impl Colormap {
    /// Colour for a normalised value in `[0, 1]`.
    pub fn color(&self, t: f32) -> [f32; 3] {
        let t = if t.is_finite() { t.clamp(0.0, 1.0) } else { 0.0 };
        let c = |v: f32| v.clamp(0.0, 1.0);
        match self {
            Colormap::Gray => [t, t, t],
            Colormap::Hot => [c(3.0 * t), c(3.0 * t - 1.0), c(3.0 * t - 2.0)],
            Colormap::Jet => [
                c(1.5 - (4.0 * t - 3.0).abs()),
                c(1.5 - (4.0 * t - 2.0).abs()),
                c(1.5 - (4.0 * t - 1.0).abs()),
            ],
            Colormap::Cool => [t, 1.0 - t, 1.0],
        }
    }
}

impl FromStr for Colormap {
    type Err = FusionError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "gray" | "grey" => Ok(Colormap::Gray),
            "hot" => Ok(Colormap::Hot),
            "jet" => Ok(Colormap::Jet),
            "cool" => Ok(Colormap::Cool),
            other => Err(FusionError::Config(format!("unknown colormap '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct BlendParams {
    pub mode: BlendMode,
    /// Opacity of the functional layer in alpha mode.
    pub alpha: f32,
    pub colormap: Colormap,
    /// Percentage of the functional maximum below which nothing is drawn.
    pub threshold_percent: f32,
    /// Opacity reached at the functional maximum in threshold mode.
    pub max_alpha: f32,
}

impl Default for BlendParams {
    fn default() -> Self {
        Self {
            mode: BlendMode::Alpha,
            alpha: 0.5,
            colormap: Colormap::Hot,
            threshold_percent: 20.0,
            max_alpha: 0.7,
        }
    }
}

impl BlendParams {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.alpha) || !(0.0..=1.0).contains(&self.max_alpha) {
            return Err(FusionError::Config(
                "blend opacities must lie in [0, 1]".to_string(),
            ));
        }
        if !(0.0..=100.0).contains(&self.threshold_percent) {
            return Err(FusionError::Config(
                "blend.threshold_percent must lie in [0, 100]".to_string(),
            ));
        }
        Ok(())
    }
}

/// Min-max normalisation to `[0, 1]`. `None` when the data is flat (or has
/// no finite values); non-finite samples map to 0.
pub fn normalize(data: &[f32]) -> Option<Vec<f32>> {
    let (lo, hi) = data
        .iter()
        .filter(|v| v.is_finite())
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
    if !(hi > lo) {
        return None;
    }
    let range = hi - lo;
    Some(
        data.iter()
            .map(|&v| if v.is_finite() { (v - lo) / range } else { 0.0 })
            .collect(),
    )
}

/// Per-pixel opacity of the functional layer. All zero for a flat
/// functional slice.
fn opacities(functional: &Slice2D, params: &BlendParams) -> Vec<f32> {
    let n = functional.data.len();
    let max = functional
        .data
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .fold(f32::NEG_INFINITY, f32::max);
    let min = functional
        .data
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .fold(f32::INFINITY, f32::min);
    if !(max > min) {
        return vec![0.0; n];
    }
    match params.mode {
        BlendMode::Alpha => vec![params.alpha; n],
        BlendMode::Threshold => {
            let fraction = params.threshold_percent / 100.0;
            // a fraction of a non-positive maximum would sit above it
            let threshold = if max > 0.0 {
                fraction * max
            } else {
                min + fraction * (max - min)
            };
            let span = max - threshold;
            functional
                .data
                .iter()
                .map(|&v| {
                    if !v.is_finite() || v < threshold || span <= f32::EPSILON {
                        0.0
                    } else {
                        params.max_alpha * ((v - threshold) / span).min(1.0)
                    }
                })
                .collect()
        }
    }
}

/// `out = (1 - a) * gray(anatomical) + a * colormap(functional)`, with `a`
/// from the blend mode. Output has the anatomical slice's dimensions.
///
/// # Panics
/// If the two slices differ in size.
pub fn composite(anatomical: &Slice2D, functional: &Slice2D, params: &BlendParams) -> RgbImage {
    assert_eq!(
        (anatomical.rows, anatomical.columns),
        (functional.rows, functional.columns),
        "anatomical and functional slices must have the same shape"
    );
    let gray = normalize(&anatomical.data).unwrap_or_else(|| vec![0.0; anatomical.data.len()]);
    let color = normalize(&functional.data).unwrap_or_else(|| vec![0.0; functional.data.len()]);
    let alpha = opacities(functional, params);

    let columns = anatomical.columns;
    RgbImage::from_fn(columns as u32, anatomical.rows as u32, |x, y| {
        let i = y as usize * columns + x as usize;
        let a = alpha[i];
        let g = gray[i];
        let c = params.colormap.color(color[i]);
        let mix = |channel: f32| {
            let v = (1.0 - a) * g + a * channel;
            (v * 255.0).round().clamp(0.0, 255.0) as u8
        };
        Rgb([mix(c[0]), mix(c[1]), mix(c[2])])
    })
}

#[cfg(test)]
mod compositor_tests {
    use super::*;
    use approx::assert_relative_eq;

    fn ramp(rows: usize, columns: usize) -> Slice2D {
        Slice2D::new(rows, columns, (0..rows * columns).map(|i| i as f32).collect())
    }

    #[test]
    fn test_normalize_flat_and_ramp() {
        assert!(normalize(&[3.0, 3.0, 3.0]).is_none());
        assert!(normalize(&[]).is_none());
        let n = normalize(&[2.0, 4.0, f32::NAN, 6.0]).unwrap();
        assert_eq!(n, vec![0.0, 0.5, 0.0, 1.0]);
    }

    #[test]
    fn test_constant_functional_gives_anatomical_only() {
        let anatomical = ramp(3, 4);
        let functional = Slice2D::filled(3, 4, 7.5);
        for mode in [BlendMode::Alpha, BlendMode::Threshold] {
            let params = BlendParams {
                mode,
                ..BlendParams::default()
            };
            let fused = composite(&anatomical, &functional, &params);
            let plain = composite(
                &anatomical,
                &functional,
                &BlendParams {
                    alpha: 0.0,
                    max_alpha: 0.0,
                    ..params
                },
            );
            assert_eq!(fused, plain);
            // gray ramp, last pixel white
            assert_eq!(fused.get_pixel(3, 2), &Rgb([255, 255, 255]));
            assert_eq!(fused.get_pixel(0, 0), &Rgb([0, 0, 0]));
        }
    }

    #[test]
    fn test_output_matches_anatomical_shape() {
        let fused = composite(&ramp(5, 7), &ramp(5, 7), &BlendParams::default());
        assert_eq!(fused.dimensions(), (7, 5));
    }

    #[test]
    fn test_alpha_blend_formula() {
        let anatomical = Slice2D::new(1, 2, vec![0.0, 10.0]);
        let functional = Slice2D::new(1, 2, vec![0.0, 1.0]);
        let params = BlendParams {
            alpha: 0.5,
            colormap: Colormap::Gray,
            ..BlendParams::default()
        };
        let fused = composite(&anatomical, &functional, &params);
        assert_eq!(fused.get_pixel(0, 0), &Rgb([0, 0, 0]));
        assert_eq!(fused.get_pixel(1, 0), &Rgb([255, 255, 255]));

        let hot = composite(&anatomical, &functional, &BlendParams::default());
        // 0.5 * white + 0.5 * hot(1) = white
        assert_eq!(hot.get_pixel(1, 0), &Rgb([255, 255, 255]));
        // 0.5 * black + 0.5 * hot(0) = black
        assert_eq!(hot.get_pixel(0, 0), &Rgb([0, 0, 0]));
    }

    #[test]
    fn test_threshold_excludes_low_values() {
        let functional = Slice2D::new(1, 5, vec![0.0, 10.0, 20.0, 60.0, 100.0]);
        let params = BlendParams {
            mode: BlendMode::Threshold,
            threshold_percent: 20.0,
            max_alpha: 0.8,
            ..BlendParams::default()
        };
        let alpha = opacities(&functional, &params);
        assert_relative_eq!(alpha[0], 0.0);
        assert_relative_eq!(alpha[1], 0.0);
        assert_relative_eq!(alpha[2], 0.0);
        assert_relative_eq!(alpha[3], 0.4, epsilon = 1e-6);
        assert_relative_eq!(alpha[4], 0.8, epsilon = 1e-6);

        let anatomical = Slice2D::filled(1, 5, 0.0);
        let fused = composite(&anatomical, &functional, &params);
        assert_eq!(fused.get_pixel(1, 0), &Rgb([0, 0, 0]));
        assert_ne!(fused.get_pixel(4, 0), &Rgb([0, 0, 0]));
    }

    #[test]
    fn test_threshold_on_negative_functional_uses_range() {
        let functional = Slice2D::new(1, 3, vec![-100.0, -50.0, -10.0]);
        let params = BlendParams {
            mode: BlendMode::Threshold,
            threshold_percent: 50.0,
            max_alpha: 0.6,
            ..BlendParams::default()
        };
        // threshold -55, span 45
        let alpha = opacities(&functional, &params);
        assert_relative_eq!(alpha[0], 0.0);
        assert_relative_eq!(alpha[1], 0.6 * 5.0 / 45.0, epsilon = 1e-6);
        assert_relative_eq!(alpha[2], 0.6, epsilon = 1e-6);
    }

    #[test]
    fn test_colormap_parsing_and_endpoints() {
        assert_eq!("Jet".parse::<Colormap>().unwrap(), Colormap::Jet);
        assert_eq!("grey".parse::<Colormap>().unwrap(), Colormap::Gray);
        assert!("viridis".parse::<Colormap>().is_err());
        assert_eq!(Colormap::Hot.color(1.0), [1.0, 1.0, 1.0]);
        assert_eq!(Colormap::Hot.color(0.0), [0.0, 0.0, 0.0]);
        assert_eq!(Colormap::Cool.color(f32::NAN), [0.0, 1.0, 1.0]);
    }

    #[test]
    #[should_panic]
    fn test_mismatched_shapes_panic() {
        composite(&ramp(2, 2), &ramp(3, 2), &BlendParams::default());
    }
}
