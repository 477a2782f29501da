//! Interactive fusion of one fixed/floating pair.
//!
//! [`FusionSession::fused_slice`] runs on the caller's thread and only does
//! slice-sized work. Registration and whole-volume resampling run as
//! background tasks; closing the session cancels them.
use std::collections::HashMap;
use std::sync::Arc;

use crossbeam::channel::{unbounded, Receiver, Sender};
use image::RgbImage;
use rayon::prelude::*;
use serde::Deserialize;

use crate::alignment::{emit, AlignmentResolver, AlignmentState, FusionWarning, TransformSnapshot};
use crate::config::FusionConfig;
use crate::error::{FusionError, Result};
use crate::geometry::FrameGeometry;
use crate::registration::RegistrationMode;
use crate::resample::{
    resample_slice, FillPolicy, FloatingSource, Interpolation, ResampleConfig, ResampleEngine,
    ResampleKey, Slice2D,
};
use crate::task::{CancellationToken, TaskHandle};
use crate::transform::RegistrationTransform;
use crate::volume::{ViewOrientation, Volume, VolumeGrid};

use super::compositor::{composite, BlendParams};

/// How the floating volume is brought onto the fixed planes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Default)]
pub enum FusionMode {
    /// Patient coordinates only, no registration transform.
    #[serde(rename = "native")]
    Native,
    /// Registered, floating volume read frame by frame.
    #[serde(rename = "2d")]
    TwoD,
    /// Registered, floating volume read as a regular 3D grid.
    #[default]
    #[serde(rename = "3d")]
    ThreeD,
}

/// One composited view plus the data it was made from.
#[derive(Debug, Clone)]
pub struct FusedSlice {
    pub image: RgbImage,
    pub anatomical: Arc<Slice2D>,
    pub functional: Arc<Slice2D>,
    pub mode: FusionMode,
    pub transform_version: u64,
    /// The overlay is shown without a valid registration.
    pub degraded: bool,
}

/// Immutable view of both volumes shared with background tasks.
#[derive(Debug)]
struct PairData {
    fixed: Arc<Volume>,
    floating: Arc<Volume>,
    fixed_grid: Option<VolumeGrid>,
    floating_grid: Option<VolumeGrid>,
    /// Minimum intensities, scanned once since both volumes are immutable.
    fixed_min: f32,
    floating_min: f32,
}

impl PairData {
    fn new(fixed: Arc<Volume>, floating: Arc<Volume>) -> Self {
        let fixed_grid = fixed.grid().ok();
        let floating_grid = match floating.grid() {
            Ok(grid) => Some(grid),
            Err(e) => {
                tracing::info!("floating volume is 2D-only: {}", e);
                None
            }
        };
        let fixed_min = fixed.min_value();
        let floating_min = floating.min_value();
        Self {
            fixed,
            floating,
            fixed_grid,
            floating_grid,
            fixed_min,
            floating_min,
        }
    }

    fn plane_count(&self, orientation: ViewOrientation) -> usize {
        match (orientation, &self.fixed_grid) {
            (ViewOrientation::Axial, _) => self.fixed.len(),
            (_, Some(grid)) => grid.plane_count(orientation),
            (_, None) => 0,
        }
    }

    /// Fixed sampling plane. Axial planes come straight from the frames so
    /// irregular fixed volumes still display.
    fn plane(&self, orientation: ViewOrientation, index: usize) -> Result<FrameGeometry> {
        match orientation {
            ViewOrientation::Axial => self
                .fixed
                .frames()
                .get(index)
                .map(|f| f.geometry.clone())
                .ok_or_else(|| {
                    FusionError::invalid_geometry(format!(
                        "axial index {} outside 0..{}",
                        index,
                        self.fixed.len()
                    ))
                }),
            _ => self
                .fixed_grid
                .as_ref()
                .ok_or_else(|| FusionError::incompatible("fixed volume cannot be reformatted"))?
                .plane_geometry(orientation, index),
        }
    }

    fn anatomical(
        &self,
        orientation: ViewOrientation,
        index: usize,
        plane: &FrameGeometry,
        interpolation: Interpolation,
    ) -> Result<Slice2D> {
        if orientation == ViewOrientation::Axial {
            let frame = &self.fixed.frames()[index];
            return Ok(Slice2D::new(
                frame.geometry.rows,
                frame.geometry.columns,
                frame.pixels.clone(),
            ));
        }
        let grid = self
            .fixed_grid
            .as_ref()
            .ok_or_else(|| FusionError::incompatible("fixed volume cannot be reformatted"))?;
        Ok(resample_slice(
            plane,
            FloatingSource::Grid(grid),
            &RegistrationTransform::identity(),
            interpolation,
            FillPolicy::Minimum.value(self.fixed_min),
        ))
    }

    fn functional(
        &self,
        plane: &FrameGeometry,
        mode: FusionMode,
        transform: &RegistrationTransform,
        interpolation: Interpolation,
        fill: f32,
    ) -> Result<Slice2D> {
        let source = match mode {
            FusionMode::ThreeD => FloatingSource::Grid(
                self.floating_grid
                    .as_ref()
                    .ok_or_else(|| FusionError::incompatible("floating volume is not a regular grid"))?,
            ),
            FusionMode::TwoD | FusionMode::Native => FloatingSource::Frames(&self.floating),
        };
        let identity = RegistrationTransform::identity();
        let transform = if mode == FusionMode::Native {
            &identity
        } else {
            transform
        };
        Ok(resample_slice(plane, source, transform, interpolation, fill))
    }
}

pub struct FusionSession {
    pair: Arc<PairData>,
    resolver: AlignmentResolver,
    cache: Arc<ResampleEngine>,
    /// Fixed planes already extracted; reformats are volume-sized work.
    anatomical: HashMap<(ViewOrientation, usize, Interpolation), Arc<Slice2D>>,
    mode: FusionMode,
    blend: BlendParams,
    resample: ResampleConfig,
    warnings: Sender<FusionWarning>,
    background: Vec<TaskHandle<usize>>,
    closed: bool,
}

impl FusionSession {
    /// Opens a session and returns it with the warning stream for the
    /// status collaborator.
    pub fn new(
        fixed: Arc<Volume>,
        floating: Arc<Volume>,
        config: &FusionConfig,
    ) -> Result<(Self, Receiver<FusionWarning>)> {
        config.validate()?;
        let (tx, rx) = unbounded();
        let pair = Arc::new(PairData::new(Arc::clone(&fixed), Arc::clone(&floating)));
        let resolver =
            AlignmentResolver::new(fixed, floating, config.registration.clone(), tx.clone());
        tracing::info!(
            "fusion session opened in {:?} mode ({} fixed, {} floating frames)",
            config.resample.mode,
            pair.fixed.len(),
            pair.floating.len()
        );
        Ok((
            Self {
                pair,
                resolver,
                cache: Arc::new(ResampleEngine::new()),
                anatomical: HashMap::new(),
                mode: config.resample.mode,
                blend: config.blend,
                resample: config.resample.clone(),
                warnings: tx,
                background: Vec::new(),
                closed: false,
            },
            rx,
        ))
    }

    pub fn mode(&self) -> FusionMode {
        self.mode
    }

    pub fn blend(&self) -> &BlendParams {
        &self.blend
    }

    pub fn interpolation(&self) -> Interpolation {
        self.resample.interpolation
    }

    pub fn alignment_state(&self) -> AlignmentState {
        self.resolver.state()
    }

    pub fn transform(&self) -> Arc<TransformSnapshot> {
        self.resolver.current()
    }

    pub fn cache(&self) -> &ResampleEngine {
        &self.cache
    }

    pub fn slice_count(&self, orientation: ViewOrientation) -> usize {
        self.pair.plane_count(orientation)
    }

    /// Switches sampling mode. In-flight registration and resampling for
    /// this pair are cancelled.
    pub fn set_mode(&mut self, mode: FusionMode) {
        if mode == self.mode {
            return;
        }
        tracing::info!("fusion mode {:?} -> {:?}", self.mode, mode);
        self.cancel_background();
        self.resolver.cancel();
        self.mode = mode;
    }

    pub fn set_blend(&mut self, blend: BlendParams) -> Result<()> {
        blend.validate()?;
        self.blend = blend;
        Ok(())
    }

    pub fn set_interpolation(&mut self, interpolation: Interpolation) {
        self.resample.interpolation = interpolation;
    }

    /// Resolves the pair's alignment (see [`AlignmentResolver::resolve`]).
    pub fn align(&self) -> Arc<TransformSnapshot> {
        self.resolver.resolve()
    }

    pub fn request_registration(&self, mode: RegistrationMode) -> TaskHandle<Arc<TransformSnapshot>> {
        self.resolver.request_registration(mode)
    }

    /// Handle of the registration started last, if any.
    pub fn pending_registration(&self) -> Option<TaskHandle<Arc<TransformSnapshot>>> {
        self.resolver.pending_task()
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            Err(FusionError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn functional_cached(
        &self,
        orientation: ViewOrientation,
        index: usize,
        plane: &FrameGeometry,
        mode: FusionMode,
        snapshot: &TransformSnapshot,
    ) -> Result<Arc<Slice2D>> {
        let interpolation = self.resample.interpolation;
        let key = ResampleKey {
            slice_index: index,
            orientation,
            transform_version: snapshot.version,
            interpolation,
            mode,
        };
        let fill = self.resample.fill.value(self.pair.floating_min);
        self.cache.get_or_compute(key, || {
            self.pair
                .functional(plane, mode, &snapshot.transform, interpolation, fill)
        })
    }

    fn anatomical_cached(
        &mut self,
        orientation: ViewOrientation,
        index: usize,
        plane: &FrameGeometry,
    ) -> Result<Arc<Slice2D>> {
        let interpolation = self.resample.interpolation;
        let key = (orientation, index, interpolation);
        if let Some(slice) = self.anatomical.get(&key) {
            return Ok(Arc::clone(slice));
        }
        let slice = Arc::new(self.pair.anatomical(orientation, index, plane, interpolation)?);
        self.anatomical.insert(key, Arc::clone(&slice));
        Ok(slice)
    }

    /// Fused view of fixed plane `index` in `orientation`.
    ///
    /// A 3D resampling failure switches the session to 2D mode, emits a
    /// warning and answers in 2D instead of failing.
    pub fn fused_slice(&mut self, index: usize, orientation: ViewOrientation) -> Result<FusedSlice> {
        self.check_open()?;
        let plane = self.pair.plane(orientation, index)?;
        let anatomical = self.anatomical_cached(orientation, index, &plane)?;

        let mut snapshot = self.resolver.current();
        let functional = loop {
            match self.functional_cached(orientation, index, &plane, self.mode, &snapshot) {
                Ok(slice) => break slice,
                Err(FusionError::StaleTransform { .. }) => {
                    // a newer transform was committed meanwhile
                    snapshot = self.resolver.current();
                }
                Err(e) if self.mode == FusionMode::ThreeD => {
                    emit(
                        &self.warnings,
                        FusionWarning::ResampleFallback {
                            reason: e.to_string(),
                        },
                    );
                    self.cancel_background();
                    self.mode = FusionMode::TwoD;
                }
                Err(e) => return Err(e),
            }
        };

        let image = composite(&anatomical, &functional, &self.blend);
        Ok(FusedSlice {
            image,
            anatomical,
            functional,
            mode: self.mode,
            transform_version: snapshot.version,
            degraded: snapshot.degraded,
        })
    }

    /// Resamples every plane of `orientation` in the background and fills
    /// the cache. A cancelled or superseded run stores nothing.
    pub fn spawn_volume_resample(&mut self, orientation: ViewOrientation) -> Result<TaskHandle<usize>> {
        self.check_open()?;
        self.background.retain(|task| !task.is_finished());

        let pair = Arc::clone(&self.pair);
        let cache = Arc::clone(&self.cache);
        let snapshot = self.resolver.current();
        let mode = self.mode;
        let interpolation = self.resample.interpolation;
        let fill = self.resample.fill.value(self.pair.floating_min);
        let count = pair.plane_count(orientation);

        let task = TaskHandle::spawn(
            format!("resample-{:?}-v{}", orientation, snapshot.version),
            move |token: &CancellationToken| {
                let slices: Vec<Slice2D> = (0..count)
                    .into_par_iter()
                    .map(|index| {
                        token.check()?;
                        let plane = pair.plane(orientation, index)?;
                        pair.functional(&plane, mode, &snapshot.transform, interpolation, fill)
                    })
                    .collect::<Result<_>>()?;
                token.check()?;
                for (index, slice) in slices.into_iter().enumerate() {
                    let key = ResampleKey {
                        slice_index: index,
                        orientation,
                        transform_version: snapshot.version,
                        interpolation,
                        mode,
                    };
                    cache.store(key, slice)?;
                }
                tracing::debug!("precomputed {} {:?} slices", count, orientation);
                Ok(count)
            },
        );
        self.background.push(task.clone());
        Ok(task)
    }

    fn cancel_background(&mut self) {
        for task in self.background.drain(..) {
            task.cancel();
        }
    }

    /// Cancels all background work and drops cached slices. Further
    /// requests fail with `Cancelled`.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.cancel_background();
        self.resolver.cancel();
        self.cache.clear();
        self.anatomical.clear();
        self.closed = true;
        tracing::info!("fusion session closed");
    }
}

impl Drop for FusionSession {
    fn drop(&mut self) {
        self.close();
    }
}
