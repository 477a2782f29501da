use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{Interpolation, Slice2D};
use crate::error::{FusionError, Result};
use crate::fusion::FusionMode;
use crate::volume::ViewOrientation;

/// Identity of one resampled slice. A change to any field is a different
/// entry; the sampling mode is part of the key so 2D and 3D results never mix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResampleKey {
    pub slice_index: usize,
    pub orientation: ViewOrientation,
    pub transform_version: u64,
    pub interpolation: Interpolation,
    pub mode: FusionMode,
}

type Cell = Arc<Mutex<Option<Arc<Slice2D>>>>;

/// Memoised, single-flight slice store.
///
/// Concurrent requests for the same key serialise on that key's cell, so the
/// slice is computed once. Entries for older transform versions are purged as
/// soon as a newer version is seen, and results for an older version are
/// refused rather than stored.
#[derive(Debug, Default)]
pub struct ResampleEngine {
    entries: Mutex<HashMap<ResampleKey, Cell>>,
    latest_version: AtomicU64,
    computations: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ResampleEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of slices actually computed so far.
    pub fn computations(&self) -> usize {
        self.computations.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        lock(&self.entries)
            .values()
            .filter(|cell| lock(cell).is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn latest_version(&self) -> u64 {
        self.latest_version.load(Ordering::SeqCst)
    }

    /// Drops every entry older than `version` and makes it the floor for
    /// future requests.
    pub fn advance_version(&self, version: u64) {
        let mut entries = lock(&self.entries);
        let previous = self.latest_version.fetch_max(version, Ordering::SeqCst);
        if version > previous {
            entries.retain(|key, _| key.transform_version >= version);
            tracing::debug!(
                "resample cache advanced to transform v{}, {} entries kept",
                version,
                entries.len()
            );
        }
    }

    fn cell_for(&self, key: &ResampleKey) -> Result<Cell> {
        self.advance_version(key.transform_version);
        let mut entries = lock(&self.entries);
        let current = self.latest_version();
        if key.transform_version < current {
            return Err(FusionError::StaleTransform {
                requested: key.transform_version,
                current,
            });
        }
        Ok(Arc::clone(entries.entry(*key).or_default()))
    }

    /// Cached slice for `key`, computing it with `compute` on a miss.
    pub fn get_or_compute<F>(&self, key: ResampleKey, compute: F) -> Result<Arc<Slice2D>>
    where
        F: FnOnce() -> Result<Slice2D>,
    {
        let cell = self.cell_for(&key)?;
        let mut slot = lock(&cell);
        if let Some(slice) = slot.as_ref() {
            return Ok(Arc::clone(slice));
        }
        let slice = Arc::new(compute()?);
        self.computations.fetch_add(1, Ordering::SeqCst);

        let current = self.latest_version();
        if key.transform_version < current {
            // a newer transform was committed while we were computing
            return Err(FusionError::StaleTransform {
                requested: key.transform_version,
                current,
            });
        }
        *slot = Some(Arc::clone(&slice));
        Ok(slice)
    }

    /// Stores precomputed slices, unless their version is already stale.
    pub fn store(&self, key: ResampleKey, slice: Slice2D) -> Result<Arc<Slice2D>> {
        let cell = self.cell_for(&key)?;
        let mut slot = lock(&cell);
        let slice = Arc::new(slice);
        *slot = Some(Arc::clone(&slice));
        Ok(slice)
    }

    pub fn get(&self, key: &ResampleKey) -> Option<Arc<Slice2D>> {
        let cell = lock(&self.entries).get(key).cloned()?;
        let slot = lock(&cell);
        slot.clone()
    }

    pub fn clear(&self) {
        lock(&self.entries).clear();
    }
}

#[cfg(test)]
mod cache_tests {
    use super::*;
    use std::sync::Barrier;

    fn key(slice_index: usize, version: u64) -> ResampleKey {
        ResampleKey {
            slice_index,
            orientation: ViewOrientation::Axial,
            transform_version: version,
            interpolation: Interpolation::Linear,
            mode: FusionMode::ThreeD,
        }
    }

    #[test]
    fn test_identical_keys_compute_once() {
        let engine = ResampleEngine::new();
        let a = engine
            .get_or_compute(key(3, 1), || Ok(Slice2D::filled(2, 2, 1.5)))
            .unwrap();
        let b = engine
            .get_or_compute(key(3, 1), || panic!("second computation"))
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.data, b.data);
        assert_eq!(engine.computations(), 1);
    }

    #[test]
    fn test_any_key_change_misses() {
        let engine = ResampleEngine::new();
        let mut k = key(0, 1);
        engine.get_or_compute(k, || Ok(Slice2D::filled(1, 1, 0.0))).unwrap();
        k.interpolation = Interpolation::Nearest;
        engine.get_or_compute(k, || Ok(Slice2D::filled(1, 1, 0.0))).unwrap();
        k.orientation = ViewOrientation::Coronal;
        engine.get_or_compute(k, || Ok(Slice2D::filled(1, 1, 0.0))).unwrap();
        k.slice_index = 1;
        engine.get_or_compute(k, || Ok(Slice2D::filled(1, 1, 0.0))).unwrap();
        assert_eq!(engine.computations(), 4);
    }

    #[test]
    fn test_version_bump_invalidates_everything() {
        let engine = ResampleEngine::new();
        for i in 0..4 {
            engine
                .get_or_compute(key(i, 1), || Ok(Slice2D::filled(1, 1, i as f32)))
                .unwrap();
        }
        assert_eq!(engine.len(), 4);
        engine.advance_version(2);
        assert_eq!(engine.len(), 0);
        assert!(engine.get(&key(0, 1)).is_none());

        // an old version can no longer be stored or computed
        let stale = engine.get_or_compute(key(0, 1), || Ok(Slice2D::filled(1, 1, 0.0)));
        assert_eq!(
            stale,
            Err(FusionError::StaleTransform {
                requested: 1,
                current: 2
            })
        );
        assert!(engine.store(key(0, 1), Slice2D::filled(1, 1, 0.0)).is_err());
    }

    #[test]
    fn test_commit_during_computation_refuses_result() {
        let engine = ResampleEngine::new();
        let late = engine.get_or_compute(key(0, 1), || {
            engine.advance_version(2);
            Ok(Slice2D::filled(1, 1, 3.0))
        });
        assert_eq!(
            late,
            Err(FusionError::StaleTransform {
                requested: 1,
                current: 2
            })
        );
        assert!(engine.get(&key(0, 1)).is_none());
        assert_eq!(engine.latest_version(), 2);

        // the newer version is still served normally
        engine
            .get_or_compute(key(0, 2), || Ok(Slice2D::filled(1, 1, 4.0)))
            .unwrap();
        assert_eq!(engine.len(), 1);
    }

    #[test]
    fn test_errors_are_not_cached() {
        let engine = ResampleEngine::new();
        let failed = engine.get_or_compute(key(0, 1), || Err(FusionError::incompatible("no grid")));
        assert!(failed.is_err());
        let ok = engine.get_or_compute(key(0, 1), || Ok(Slice2D::filled(1, 1, 2.0)));
        assert!(ok.is_ok());
        assert_eq!(engine.computations(), 1);
    }

    #[test]
    fn test_concurrent_requests_are_single_flight() {
        let engine = Arc::new(ResampleEngine::new());
        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let engine = Arc::clone(&engine);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    engine
                        .get_or_compute(key(5, 7), || {
                            std::thread::sleep(std::time::Duration::from_millis(20));
                            Ok(Slice2D::filled(4, 4, 9.0))
                        })
                        .unwrap()
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(engine.computations(), 1);
        assert!(results.iter().all(|r| Arc::ptr_eq(r, &results[0])));
    }
}
