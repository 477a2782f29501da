use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use crossbeam::channel::Receiver;
use crossbeam::thread;

use crate::alignment::FusionWarning;
use crate::config::FusionConfig;
use crate::fusion::FusionSession;
use crate::geometry::FrameTags;
use crate::volume::Volume;

/// One series as delivered by the loader: tags and row-major pixels per frame.
pub type TaggedSeries = Vec<(FrameTags, Vec<f32>)>;

/// Builds both volumes of a pair in parallel.
pub fn prepare_pair(fixed: TaggedSeries, floating: TaggedSeries) -> Result<(Volume, Volume)> {
    thread::scope(|s| -> Result<(Volume, Volume)> {
        let fixed_handle = s.spawn(move |_| -> Result<Volume> {
            Volume::from_tagged_frames(fixed).context("building fixed volume failed")
        });
        let floating_handle = s.spawn(move |_| -> Result<Volume> {
            Volume::from_tagged_frames(floating).context("building floating volume failed")
        });

        let fixed = fixed_handle
            .join()
            .map_err(|_| anyhow!("fixed volume thread panicked"))??;
        let floating = floating_handle
            .join()
            .map_err(|_| anyhow!("floating volume thread panicked"))??;
        tracing::info!(
            "prepared pair: fixed {} frames ({}), floating {} frames ({})",
            fixed.len(),
            fixed.reference_frame_uid(),
            floating.len(),
            floating.reference_frame_uid()
        );
        Ok((fixed, floating))
    })
    .map_err(|panic_payload| anyhow!("volume preparation threads panicked: {:?}", panic_payload))?
}

/// Prepares both series and opens a fusion session on them, resolving the
/// pair's alignment straight away.
pub fn open_session(
    fixed: TaggedSeries,
    floating: TaggedSeries,
    config: &FusionConfig,
) -> Result<(FusionSession, Receiver<FusionWarning>)> {
    let (fixed, floating) = prepare_pair(fixed, floating)?;
    let (session, warnings) = FusionSession::new(Arc::new(fixed), Arc::new(floating), config)
        .context("opening fusion session failed")?;
    let snapshot = session.align();
    tracing::info!(
        "alignment {:?} (transform v{})",
        session.alignment_state(),
        snapshot.version
    );
    Ok((session, warnings))
}
