//! Error types shared by every stage of the fusion pipeline.

use thiserror::Error;

/// Why a registration run did not produce a transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// Too few sample points landed inside the floating volume.
    InsufficientOverlap,
    /// The optimiser produced a non-finite or non-invertible step.
    SingularStep,
    /// The volume data cannot be treated as a regular 3D grid.
    IncompatibleVolume,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            FailureReason::InsufficientOverlap => "insufficient overlap between volumes",
            FailureReason::SingularStep => "numerically singular optimisation step",
            FailureReason::IncompatibleVolume => "volume incompatible with 3D mode",
        };
        f.write_str(text)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FusionError {
    /// Missing or degenerate spatial metadata.
    #[error("Invalid geometry: {0}")]
    InvalidGeometry(String),

    /// The in-plane mapping cannot be inverted.
    #[error("Singular geometry: {0}")]
    SingularGeometry(String),

    #[error("Registration failed: {reason}")]
    RegistrationFailed { reason: FailureReason },

    /// Frames do not share spacing/normal, so only per-frame (2D) access works.
    #[error("Incompatible volume: {0}")]
    IncompatibleVolume(String),

    #[error("Task cancelled")]
    Cancelled,

    #[error("Background task panicked: {0}")]
    TaskPanicked(String),

    /// A result was computed against a transform version that is no longer current.
    #[error("Stale transform version {requested} (current {current})")]
    StaleTransform { requested: u64, current: u64 },

    #[error("Invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, FusionError>;

impl FusionError {
    pub fn invalid_geometry(msg: impl Into<String>) -> Self {
        Self::InvalidGeometry(msg.into())
    }

    pub fn singular(msg: impl Into<String>) -> Self {
        Self::SingularGeometry(msg.into())
    }

    pub fn incompatible(msg: impl Into<String>) -> Self {
        Self::IncompatibleVolume(msg.into())
    }

    pub fn registration(reason: FailureReason) -> Self {
        Self::RegistrationFailed { reason }
    }
}
