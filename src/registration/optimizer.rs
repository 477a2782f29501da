//! Regular-step gradient descent.
//!
//! Each iteration moves a fixed distance along the normalised gradient, in a
//! space where every parameter is multiplied by its scale so that radians
//! and millimetres are comparable. The step shrinks by `relaxation` whenever
//! the gradient reverses or a step fails to improve the cost.
use crate::error::{FailureReason, FusionError, Result};
use crate::task::CancellationToken;

use super::metric::EvalError;

#[derive(Debug, Clone, PartialEq)]
pub struct OptimizerSettings {
    pub initial_step: f64,
    pub min_step: f64,
    pub relaxation: f64,
    pub max_iterations: usize,
    pub convergence_window: usize,
    pub min_improvement: f64,
    /// Finite-difference half-width, in scaled units.
    pub fd_step: f64,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            initial_step: 2.0,
            min_step: 0.01,
            relaxation: 0.5,
            max_iterations: 100,
            convergence_window: 8,
            min_improvement: 1e-5,
            fd_step: 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Converged,
    MaxIterations,
    MinStep,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StopReason::Converged => "converged",
            StopReason::MaxIterations => "max iterations",
            StopReason::MinStep => "min step",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Optimum {
    pub params: Vec<f64>,
    pub value: f64,
    pub iterations: usize,
    pub stop: StopReason,
}

fn eval_failure(err: EvalError) -> FusionError {
    match err {
        EvalError::NoOverlap => FusionError::registration(FailureReason::InsufficientOverlap),
        EvalError::Singular => FusionError::registration(FailureReason::SingularStep),
    }
}

/// Central-difference gradient. A side that cannot be evaluated falls back
/// to a one-sided difference; a component with neither side is zero.
fn gradient<F>(f: &F, x: &[f64], value: f64, scales: &[f64], fd_step: f64) -> Vec<f64>
where
    F: Fn(&[f64]) -> std::result::Result<f64, EvalError>,
{
    let mut probe = x.to_vec();
    (0..x.len())
        .map(|i| {
            let h = fd_step / scales[i];
            probe[i] = x[i] + h;
            let plus = f(&probe).ok();
            probe[i] = x[i] - h;
            let minus = f(&probe).ok();
            probe[i] = x[i];
            match (plus, minus) {
                (Some(p), Some(m)) => (p - m) / (2.0 * h),
                (Some(p), None) => (p - value) / h,
                (None, Some(m)) => (value - m) / h,
                (None, None) => 0.0,
            }
        })
        .collect()
}

/// Minimises `f` from `start`.
///
/// Fails with `InsufficientOverlap` if the start cannot be evaluated, with
/// `SingularStep` on a non-finite gradient, and with `Cancelled` as soon as
/// `cancel` fires.
pub fn minimize<F>(
    f: F,
    start: &[f64],
    scales: &[f64],
    settings: &OptimizerSettings,
    cancel: &CancellationToken,
) -> Result<Optimum>
where
    F: Fn(&[f64]) -> std::result::Result<f64, EvalError>,
{
    assert_eq!(start.len(), scales.len());
    let mut x = start.to_vec();
    let mut value = f(&x).map_err(eval_failure)?;
    if x.is_empty() {
        return Ok(Optimum {
            params: x,
            value,
            iterations: 0,
            stop: StopReason::Converged,
        });
    }

    let mut step = settings.initial_step;
    let mut previous_direction: Option<Vec<f64>> = None;
    let mut history = vec![value];

    for iteration in 1..=settings.max_iterations {
        cancel.check()?;

        let grad = gradient(&f, &x, value, scales, settings.fd_step);
        if grad.iter().any(|g| !g.is_finite()) {
            return Err(FusionError::registration(FailureReason::SingularStep));
        }
        // gradient with respect to the scaled parameters
        let scaled: Vec<f64> = grad.iter().zip(scales).map(|(g, s)| g / s).collect();
        let norm = scaled.iter().map(|g| g * g).sum::<f64>().sqrt();
        if norm <= f64::EPSILON {
            return Ok(Optimum {
                params: x,
                value,
                iterations: iteration,
                stop: StopReason::Converged,
            });
        }
        let direction: Vec<f64> = scaled.iter().map(|g| g / norm).collect();

        if let Some(prev) = &previous_direction {
            let dot: f64 = prev.iter().zip(&direction).map(|(a, b)| a * b).sum();
            if dot < 0.0 {
                step *= settings.relaxation;
            }
        }
        if step < settings.min_step {
            return Ok(Optimum {
                params: x,
                value,
                iterations: iteration,
                stop: StopReason::MinStep,
            });
        }

        let candidate: Vec<f64> = x
            .iter()
            .zip(&direction)
            .zip(scales)
            .map(|((xi, d), s)| xi - step * d / s)
            .collect();
        match f(&candidate) {
            Ok(v) if v.is_finite() && v < value => {
                x = candidate;
                value = v;
                history.push(value);
                previous_direction = Some(direction);
            }
            Ok(v) if !v.is_finite() => {
                return Err(FusionError::registration(FailureReason::SingularStep));
            }
            _ => {
                step *= settings.relaxation;
                continue;
            }
        }

        let window = settings.convergence_window.max(1);
        if history.len() > window {
            let before = history[history.len() - 1 - window];
            if before - value < settings.min_improvement {
                return Ok(Optimum {
                    params: x,
                    value,
                    iterations: iteration,
                    stop: StopReason::Converged,
                });
            }
        }
    }

    Ok(Optimum {
        params: x,
        value,
        iterations: settings.max_iterations,
        stop: StopReason::MaxIterations,
    })
}
