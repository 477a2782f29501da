//! Session configuration, read from TOML.
//!
//! ```toml
//! [blend]
//! mode = "threshold"
//! colormap = "jet"
//! threshold_percent = 30.0
//!
//! [registration]
//! transform = "affine"
//! levels = 4
//!
//! [resample]
//! interpolation = "nearest"
//! fill = { constant = -1000.0 }
//! mode = "2d"
//! ```
//!
//! Every field is optional.
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::fusion::BlendParams;
use crate::registration::RegistrationConfig;
use crate::resample::ResampleConfig;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    pub blend: BlendParams,
    pub registration: RegistrationConfig,
    pub resample: ResampleConfig,
}

impl FusionConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).context("failed to parse fusion config")?;
        config.validate().context("invalid fusion config")?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("in config {}", path.display()))
    }

    pub fn validate(&self) -> crate::error::Result<()> {
        self.blend.validate()?;
        self.registration.validate()
    }
}

#[cfg(test)]
mod config_tests {
    use super::*;
    use crate::fusion::{BlendMode, Colormap, FusionMode};
    use crate::registration::RegistrationMode;
    use crate::resample::{FillPolicy, Interpolation};
    use crate::transform::TransformKind;

    #[test]
    fn test_empty_config_is_default() {
        assert_eq!(FusionConfig::from_toml_str("").unwrap(), FusionConfig::default());
    }

    #[test]
    fn test_partial_config_overrides_fields() {
        let config = FusionConfig::from_toml_str(
            r#"
            [blend]
            mode = "threshold"
            colormap = "jet"
            threshold_percent = 30.0

            [registration]
            default_mode = "fast"
            transform = "affine"
            levels = 4
            initial_alignment = "geometric_center"

            [resample]
            interpolation = "nearest"
            fill = { constant = -1000.0 }
            mode = "2d"
            "#,
        )
        .unwrap();
        assert_eq!(config.blend.mode, BlendMode::Threshold);
        assert_eq!(config.blend.colormap, Colormap::Jet);
        assert_eq!(config.blend.alpha, 0.5);
        assert_eq!(config.registration.default_mode, RegistrationMode::Fast);
        assert_eq!(config.registration.transform, TransformKind::Affine);
        assert_eq!(config.registration.levels, 4);
        assert_eq!(config.registration.histogram_bins, 32);
        assert_eq!(config.resample.interpolation, Interpolation::Nearest);
        assert_eq!(config.resample.fill, FillPolicy::Constant(-1000.0));
        assert_eq!(config.resample.mode, FusionMode::TwoD);
    }

    #[test]
    fn test_out_of_range_values_are_rejected() {
        let err = FusionConfig::from_toml_str("[blend]\nalpha = 1.5\n").unwrap_err();
        assert!(format!("{:#}", err).contains("opacities"));
        assert!(FusionConfig::from_toml_str("[registration]\nlevels = 0\n").is_err());
        assert!(FusionConfig::from_toml_str("[blend]\ncolormap = \"plasma\"\n").is_err());
    }

    #[test]
    fn test_missing_file_names_the_path() {
        let err = FusionConfig::load("/nonexistent/fusion.toml").unwrap_err();
        assert!(format!("{:#}", err).contains("/nonexistent/fusion.toml"));
    }
}
