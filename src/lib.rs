//! CT/PET style image fusion core.
//!
//! Pixel indices are mapped to patient space per frame ([`geometry`]), the
//! floating volume is aligned to the fixed one by frame of reference or by
//! mutual-information registration ([`alignment`], [`registration`]),
//! resampled onto the fixed planes ([`resample`]) and blended into an RGB
//! image ([`fusion`]).
pub mod alignment;
pub mod config;
pub mod entry;
pub mod error;
pub mod fusion;
pub mod geometry;
pub mod registration;
pub mod resample;
pub mod task;
pub mod transform;
pub mod volume;

mod utils;

#[cfg(feature = "python")]
mod python_bind;

pub use alignment::{AlignmentResolver, AlignmentState, FusionWarning, TransformSnapshot};
pub use config::FusionConfig;
pub use entry::{open_session, prepare_pair, TaggedSeries};
pub use error::{FailureReason, FusionError};
pub use fusion::{BlendMode, BlendParams, Colormap, FusedSlice, FusionMode, FusionSession};
pub use geometry::{derive_geometry, FrameGeometry, FrameTags, PixelCoord};
pub use registration::{register, RegistrationConfig, RegistrationMode, RegistrationOutcome};
pub use resample::{FillPolicy, Interpolation, ResampleConfig, Slice2D};
pub use task::{CancellationToken, TaskHandle};
pub use transform::{RegistrationTransform, TransformKind};
pub use volume::{Frame, ViewOrientation, Volume};

#[cfg(feature = "python")]
use pyo3::prelude::*;

/// This is the module importable from Python:
///
/// ```python
/// import fusionrs
/// g = fusionrs.derive_geometry_py((0, 0, 0), (1, 0, 0, 0, 1, 0), 512, 512, (0.7, 0.7), 5.0)
/// g.pixel_to_patient(10, 20, 2)
/// ```
#[cfg(feature = "python")]
#[pymodule]
fn fusionrs(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add("__version__", env!("CARGO_PKG_VERSION"))?;
    m.add_function(wrap_pyfunction!(python_bind::derive_geometry_py, m)?)?;
    m.add_function(wrap_pyfunction!(python_bind::composite_py, m)?)?;
    m.add_class::<python_bind::PyFrameGeometry>()?;
    Ok(())
}
