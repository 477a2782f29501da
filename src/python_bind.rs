// File: src/python_bind.rs
use nalgebra::{Point3, Vector3};
use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;

use crate::fusion::{composite, BlendMode, BlendParams, Colormap};
use crate::geometry::{derive_geometry, FrameGeometry, FrameTags, SpacingSource};
use crate::resample::Slice2D;

#[pyclass]
#[derive(Debug, Clone)]
pub struct PyFrameGeometry {
    #[pyo3(get, set)]
    pub origin: (f64, f64, f64),
    #[pyo3(get, set)]
    pub row_cosine: (f64, f64, f64),
    #[pyo3(get, set)]
    pub col_cosine: (f64, f64, f64),
    #[pyo3(get, set)]
    pub row_spacing: f64,
    #[pyo3(get, set)]
    pub col_spacing: f64,
    #[pyo3(get, set)]
    pub slice_spacing: f64,
    #[pyo3(get, set)]
    pub rows: usize,
    #[pyo3(get, set)]
    pub columns: usize,
}

fn to_runtime(e: crate::error::FusionError) -> PyErr {
    PyRuntimeError::new_err(e.to_string())
}

#[pymethods]
impl PyFrameGeometry {
    /// Patient coordinate (mm) of a continuous pixel index.
    fn pixel_to_patient(&self, column: f64, row: f64, slice: f64) -> PyResult<(f64, f64, f64)> {
        let geometry = FrameGeometry::try_from(self).map_err(to_runtime)?;
        let p = geometry.pixel_to_patient(column, row, slice);
        Ok((p.x, p.y, p.z))
    }

    /// `(column, row, slice)` of a patient coordinate, or `None` when the
    /// in-plane mapping is singular.
    fn patient_to_pixel(&self, x: f64, y: f64, z: f64) -> PyResult<Option<(f64, f64, f64)>> {
        let geometry = FrameGeometry::try_from(self).map_err(to_runtime)?;
        Ok(geometry
            .patient_to_pixel(&Point3::new(x, y, z))
            .ok()
            .map(|i| (i.column, i.row, i.slice)))
    }

    fn slice_normal(&self) -> PyResult<(f64, f64, f64)> {
        let geometry = FrameGeometry::try_from(self).map_err(to_runtime)?;
        let n = geometry.slice_normal();
        Ok((n.x, n.y, n.z))
    }

    fn __repr__(&self) -> String {
        format!(
            "FrameGeometry(origin=({:.2}, {:.2}, {:.2}), {}x{}, spacing=({:.3}, {:.3}, {:.3}))",
            self.origin.0,
            self.origin.1,
            self.origin.2,
            self.rows,
            self.columns,
            self.row_spacing,
            self.col_spacing,
            self.slice_spacing
        )
    }

    fn __str__(&self) -> String {
        self.__repr__()
    }
}

impl From<&FrameGeometry> for PyFrameGeometry {
    fn from(g: &FrameGeometry) -> Self {
        Self {
            origin: (g.origin.x, g.origin.y, g.origin.z),
            row_cosine: (g.row_cosine.x, g.row_cosine.y, g.row_cosine.z),
            col_cosine: (g.col_cosine.x, g.col_cosine.y, g.col_cosine.z),
            row_spacing: g.row_spacing,
            col_spacing: g.col_spacing,
            slice_spacing: g.slice_spacing,
            rows: g.rows,
            columns: g.columns,
        }
    }
}

// Python-side edits are validated again on the way back.
impl TryFrom<&PyFrameGeometry> for FrameGeometry {
    type Error = crate::error::FusionError;

    fn try_from(g: &PyFrameGeometry) -> Result<Self, Self::Error> {
        let geometry = FrameGeometry {
            origin: Point3::new(g.origin.0, g.origin.1, g.origin.2),
            row_cosine: Vector3::new(g.row_cosine.0, g.row_cosine.1, g.row_cosine.2),
            col_cosine: Vector3::new(g.col_cosine.0, g.col_cosine.1, g.col_cosine.2),
            row_spacing: g.row_spacing,
            col_spacing: g.col_spacing,
            slice_spacing: g.slice_spacing,
            rows: g.rows,
            columns: g.columns,
            spacing_source: SpacingSource::PixelSpacing,
        };
        geometry.validate()?;
        Ok(geometry)
    }
}

/// Derives a frame geometry from raw tag values.
#[pyfunction]
#[pyo3(
    signature = (
        image_position,
        image_orientation,
        rows,
        columns,
        pixel_spacing = None,
        slice_thickness = None,
        spacing_between_slices = None
    )
)]
pub fn derive_geometry_py(
    image_position: [f64; 3],
    image_orientation: [f64; 6],
    rows: usize,
    columns: usize,
    pixel_spacing: Option<[f64; 2]>,
    slice_thickness: Option<f64>,
    spacing_between_slices: Option<f64>,
) -> PyResult<PyFrameGeometry> {
    let tags = FrameTags {
        image_position: Some(image_position),
        image_orientation: Some(image_orientation),
        pixel_spacing,
        slice_thickness,
        spacing_between_slices,
        rows: Some(rows),
        columns: Some(columns),
        ..Default::default()
    };
    let geometry = derive_geometry(&tags).map_err(|e| PyValueError::new_err(e.to_string()))?;
    Ok((&geometry).into())
}

/// Composites two row-major slices and returns packed RGB bytes.
#[pyfunction]
#[pyo3(
    signature = (
        anatomical,
        functional,
        rows,
        columns,
        mode = "alpha",
        alpha = 0.5f32,
        colormap = "hot",
        threshold_percent = 20.0f32,
        max_alpha = 0.7f32
    )
)]
#[allow(clippy::too_many_arguments)]
pub fn composite_py(
    anatomical: Vec<f32>,
    functional: Vec<f32>,
    rows: usize,
    columns: usize,
    mode: &str,
    alpha: f32,
    colormap: &str,
    threshold_percent: f32,
    max_alpha: f32,
) -> PyResult<Vec<u8>> {
    if anatomical.len() != rows * columns || functional.len() != rows * columns {
        return Err(PyValueError::new_err(format!(
            "both slices must hold {}x{} values",
            rows, columns
        )));
    }
    let mode = match mode {
        "alpha" => BlendMode::Alpha,
        "threshold" => BlendMode::Threshold,
        other => return Err(PyValueError::new_err(format!("unknown blend mode '{}'", other))),
    };
    let params = BlendParams {
        mode,
        alpha,
        colormap: colormap
            .parse::<Colormap>()
            .map_err(|e| PyValueError::new_err(e.to_string()))?,
        threshold_percent,
        max_alpha,
    };
    params
        .validate()
        .map_err(|e| PyValueError::new_err(e.to_string()))?;
    let image = composite(
        &Slice2D::new(rows, columns, anatomical),
        &Slice2D::new(rows, columns, functional),
        &params,
    );
    Ok(image.into_raw())
}
