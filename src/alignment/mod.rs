//! Decides how a volume pair is aligned and owns the resulting transform.
//!
//! ```text
//! Unaligned ──same frame of reference──▶ SameReferenceFrame
//!     │
//!     └──▶ RegistrationPending ──▶ Registered | RegistrationFailed
//! ```
//!
//! Every committed transform is published as an immutable
//! [`TransformSnapshot`] with a strictly increasing version. Results from a
//! cancelled or superseded registration are dropped before they can be
//! committed.
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crossbeam::channel::Sender;

use crate::error::{FailureReason, FusionError, Result};
use crate::registration::{register, RegistrationConfig, RegistrationMode};
use crate::task::{panic_message, CancellationToken, TaskHandle};
use crate::transform::RegistrationTransform;
use crate::volume::Volume;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlignmentState {
    Unaligned,
    SameReferenceFrame,
    RegistrationPending,
    Registered,
    RegistrationFailed,
}

/// The transform readers work with, plus where it came from.
#[derive(Debug, Clone)]
pub struct TransformSnapshot {
    pub transform: RegistrationTransform,
    pub version: u64,
    pub state: AlignmentState,
    /// Identity used only because registration failed with nothing to fall
    /// back on; the overlay may be misaligned.
    pub degraded: bool,
}

/// What a failed registration fell back to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fallback {
    LastRegistered { version: u64 },
    Identity,
}

/// Non-fatal conditions reported to the status collaborator.
#[derive(Debug, Clone, PartialEq)]
pub enum FusionWarning {
    RegistrationFailed {
        reason: FailureReason,
        fallback: Fallback,
    },
    /// 3D resampling failed; the session continues in 2D mode.
    ResampleFallback { reason: String },
}

impl std::fmt::Display for FusionWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FusionWarning::RegistrationFailed {
                reason,
                fallback: Fallback::LastRegistered { version },
            } => write!(
                f,
                "registration failed ({}), keeping transform v{}",
                reason, version
            ),
            FusionWarning::RegistrationFailed {
                reason,
                fallback: Fallback::Identity,
            } => write!(f, "registration failed ({}), fusion degraded to identity", reason),
            FusionWarning::ResampleFallback { reason } => {
                write!(f, "3D resampling failed, using 2D mode: {}", reason)
            }
        }
    }
}

/// Sends `warning` to the status channel and the log. A closed channel is
/// not an error.
pub(crate) fn emit(warnings: &Sender<FusionWarning>, warning: FusionWarning) {
    tracing::warn!("{}", warning);
    let _ = warnings.send(warning);
}

#[derive(Debug)]
struct ResolverState {
    state: AlignmentState,
    current: Arc<TransformSnapshot>,
    last_registered: Option<Arc<TransformSnapshot>>,
    task: Option<TaskHandle<Arc<TransformSnapshot>>>,
}

/// Shared between the resolver and its registration tasks.
#[derive(Debug)]
struct Shared {
    state: Mutex<ResolverState>,
    version: AtomicU64,
    /// Identifies the registration request allowed to commit.
    generation: AtomicU64,
    warnings: Sender<FusionWarning>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ResolverState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Applies a finished registration. Must only succeed for the request
    /// that is still current.
    fn commit(
        &self,
        generation: u64,
        token: &CancellationToken,
        outcome: Result<RegistrationTransform>,
    ) -> Result<Arc<TransformSnapshot>> {
        let mut inner = self.lock();
        if token.is_cancelled() || self.generation.load(Ordering::SeqCst) != generation {
            tracing::debug!("discarding registration result of request {}", generation);
            return Err(FusionError::Cancelled);
        }

        let reason = match outcome {
            Ok(transform) => {
                let snapshot = Arc::new(TransformSnapshot {
                    transform,
                    version: self.next_version(),
                    state: AlignmentState::Registered,
                    degraded: false,
                });
                tracing::info!("registration committed as transform v{}", snapshot.version);
                inner.state = AlignmentState::Registered;
                inner.current = Arc::clone(&snapshot);
                inner.last_registered = Some(Arc::clone(&snapshot));
                return Ok(snapshot);
            }
            Err(FusionError::Cancelled) => {
                inner.state = inner.current.state;
                return Err(FusionError::Cancelled);
            }
            Err(FusionError::RegistrationFailed { reason }) => reason,
            Err(FusionError::IncompatibleVolume(_)) => FailureReason::IncompatibleVolume,
            Err(other) => {
                tracing::error!("registration aborted: {}", other);
                FailureReason::SingularStep
            }
        };

        let (snapshot, fallback) = match &inner.last_registered {
            Some(last) => (
                TransformSnapshot {
                    state: AlignmentState::RegistrationFailed,
                    ..(**last).clone()
                },
                Fallback::LastRegistered {
                    version: last.version,
                },
            ),
            None => {
                // only bump when the published transform actually changes
                let version = if inner.current.transform.is_identity() {
                    inner.current.version
                } else {
                    self.next_version()
                };
                (
                    TransformSnapshot {
                        transform: RegistrationTransform::identity(),
                        version,
                        state: AlignmentState::RegistrationFailed,
                        degraded: true,
                    },
                    Fallback::Identity,
                )
            }
        };
        let snapshot = Arc::new(snapshot);
        inner.state = AlignmentState::RegistrationFailed;
        inner.current = Arc::clone(&snapshot);
        drop(inner);
        emit(&self.warnings, FusionWarning::RegistrationFailed { reason, fallback });
        Ok(snapshot)
    }
}

/// Alignment of one fixed/floating pair.
#[derive(Debug)]
pub struct AlignmentResolver {
    fixed: Arc<Volume>,
    floating: Arc<Volume>,
    config: RegistrationConfig,
    shared: Arc<Shared>,
}

impl AlignmentResolver {
    pub fn new(
        fixed: Arc<Volume>,
        floating: Arc<Volume>,
        config: RegistrationConfig,
        warnings: Sender<FusionWarning>,
    ) -> Self {
        let initial = Arc::new(TransformSnapshot {
            transform: RegistrationTransform::identity(),
            version: 0,
            state: AlignmentState::Unaligned,
            degraded: false,
        });
        Self {
            fixed,
            floating,
            config,
            shared: Arc::new(Shared {
                state: Mutex::new(ResolverState {
                    state: AlignmentState::Unaligned,
                    current: initial,
                    last_registered: None,
                    task: None,
                }),
                version: AtomicU64::new(0),
                generation: AtomicU64::new(0),
                warnings,
            }),
        }
    }

    /// True if both volumes carry the same, non-empty frame of reference.
    pub fn shares_reference_frame(&self) -> bool {
        let uid = self.fixed.reference_frame_uid();
        !uid.is_empty() && uid == self.floating.reference_frame_uid()
    }

    /// Settles an unaligned pair. A shared frame of reference resolves to
    /// identity immediately; otherwise a registration in the configured
    /// default mode is started and the current (identity) snapshot is
    /// returned until it commits.
    pub fn resolve(&self) -> Arc<TransformSnapshot> {
        {
            let mut inner = self.shared.lock();
            if inner.state != AlignmentState::Unaligned {
                return Arc::clone(&inner.current);
            }
            if self.shares_reference_frame() {
                let snapshot = Arc::new(TransformSnapshot {
                    transform: RegistrationTransform::identity(),
                    version: self.shared.next_version(),
                    state: AlignmentState::SameReferenceFrame,
                    degraded: false,
                });
                tracing::info!(
                    "volumes share frame of reference {}, using identity",
                    self.fixed.reference_frame_uid()
                );
                inner.state = AlignmentState::SameReferenceFrame;
                inner.current = Arc::clone(&snapshot);
                return snapshot;
            }
        }
        self.request_registration(self.config.default_mode);
        self.current()
    }

    /// Starts a registration, cancelling any request still in flight for
    /// this pair.
    pub fn request_registration(&self, mode: RegistrationMode) -> TaskHandle<Arc<TransformSnapshot>> {
        let mut inner = self.shared.lock();
        if let Some(previous) = inner.task.take() {
            if !previous.is_finished() {
                tracing::info!("cancelling in-flight registration '{}'", previous.name());
            }
            previous.cancel();
        }
        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        inner.state = AlignmentState::RegistrationPending;

        let fixed = Arc::clone(&self.fixed);
        let floating = Arc::clone(&self.floating);
        let config = self.config.clone();
        let shared = Arc::clone(&self.shared);
        let task = TaskHandle::spawn(format!("registration-{}", generation), move |token| {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                register(&fixed, &floating, mode, &config, token)
            }))
            .unwrap_or_else(|payload| Err(FusionError::TaskPanicked(panic_message(payload.as_ref()))))
            .map(|o| o.transform);
            shared.commit(generation, token, outcome)
        });
        inner.task = Some(task.clone());
        task
    }

    /// Cancels the in-flight registration, if any. Its result will never be
    /// committed.
    pub fn cancel(&self) {
        let mut inner = self.shared.lock();
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(task) = inner.task.take() {
            task.cancel();
        }
        if inner.state == AlignmentState::RegistrationPending {
            inner.state = inner.current.state;
        }
    }

    pub fn current(&self) -> Arc<TransformSnapshot> {
        Arc::clone(&self.shared.lock().current)
    }

    pub fn state(&self) -> AlignmentState {
        self.shared.lock().state
    }

    pub fn version(&self) -> u64 {
        self.shared.version.load(Ordering::SeqCst)
    }

    /// Handle of the registration started last, if it has not been cancelled.
    pub fn pending_task(&self) -> Option<TaskHandle<Arc<TransformSnapshot>>> {
        self.shared.lock().task.clone()
    }
}

impl Drop for AlignmentResolver {
    fn drop(&mut self) {
        self.cancel();
    }
}
